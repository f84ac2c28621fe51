//! Session window and credit policy.
//!
//! Free-form messages are only accepted by the provider within the session
//! window that opens on each inbound customer message. Outside it a
//! pre-approved template is the only option, and templates cost credits.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::error::GatewayError;
use crate::store::Store;
use crate::tenant::TenantTables;
use crate::types::Template;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("template required, none available for category {}", category_label(.category))]
    NoTemplateAvailable { category: Option<String> },

    #[error("media can only be sent inside an open session window")]
    MediaRequiresSession,

    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: f64, required: f64 },
}

fn category_label(category: &Option<String>) -> &str {
    category.as_deref().unwrap_or("any")
}

impl PolicyError {
    pub fn code(&self) -> &'static str {
        match self {
            PolicyError::NoTemplateAvailable { .. } => "no_template_available",
            PolicyError::MediaRequiresSession => "media_requires_session",
            PolicyError::InsufficientCredits { .. } => "insufficient_credits",
        }
    }
}

/// Inputs to the session decision for one send request.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub last_inbound_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
    /// The caller asked for `type = template`.
    pub wants_template: bool,
    pub is_promotional: bool,
    pub has_media: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDecision {
    FreeForm,
    TemplateRequired,
    /// Window closed and the caller sent free-form content.
    NeedsFallbackTemplate,
}

#[derive(Debug, Clone)]
pub enum SendPath {
    FreeForm,
    /// The caller's own template, with the caller's parameters.
    Template,
    /// A stored template for the category, sent without parameters.
    ForcedTemplate(Template),
}

impl SendPath {
    pub fn is_template(&self) -> bool {
        !matches!(self, SendPath::FreeForm)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SendPath::FreeForm => "free_form",
            SendPath::Template => "template",
            SendPath::ForcedTemplate(_) => "forced_template",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    window: Duration,
    template_cost: f64,
}

impl SessionPolicy {
    pub fn new(window: std::time::Duration, template_cost: f64) -> Self {
        Self {
            window: Duration::from_std(window).unwrap_or_else(|_| Duration::hours(24)),
            template_cost,
        }
    }

    pub fn template_cost(&self) -> f64 {
        self.template_cost
    }

    /// A customer who never wrote to the tenant is outside the window.
    pub fn within_window(&self, last_inbound_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_inbound_at {
            Some(at) => now - at <= self.window,
            None => false,
        }
    }

    pub fn classify(&self, request: &SessionRequest) -> Result<SessionDecision, PolicyError> {
        let within = self.within_window(request.last_inbound_at, request.now);
        if request.has_media {
            if request.wants_template || request.is_promotional || !within {
                return Err(PolicyError::MediaRequiresSession);
            }
            return Ok(SessionDecision::FreeForm);
        }
        if request.wants_template || request.is_promotional {
            return Ok(SessionDecision::TemplateRequired);
        }
        if within {
            return Ok(SessionDecision::FreeForm);
        }
        Ok(SessionDecision::NeedsFallbackTemplate)
    }

    /// Classifies the request, looks up a fallback template when one is
    /// needed, and applies the credit gate to every template path.
    pub async fn resolve_path(
        &self,
        store: &dyn Store,
        tables: &TenantTables,
        agent_id: i64,
        credits: f64,
        request: &SessionRequest,
        category: Option<&str>,
    ) -> Result<SendPath, GatewayError> {
        let path = match self.classify(request)? {
            SessionDecision::FreeForm => SendPath::FreeForm,
            SessionDecision::TemplateRequired if request.wants_template => SendPath::Template,
            SessionDecision::TemplateRequired | SessionDecision::NeedsFallbackTemplate => {
                let template = store
                    .find_active_template_for_category(tables, agent_id, category)
                    .await?
                    .ok_or_else(|| PolicyError::NoTemplateAvailable {
                        category: category.map(str::to_string),
                    })?;
                SendPath::ForcedTemplate(template)
            }
        };
        if path.is_template() {
            self.check_credits(credits)?;
        }
        Ok(path)
    }

    /// Debits one template unit ahead of the provider call. The conditional
    /// debit is the authoritative gate; `check_credits` only rejects early.
    pub async fn reserve_template_credits(
        &self,
        store: &dyn Store,
        agent_id: i64,
    ) -> Result<f64, GatewayError> {
        match store.debit_credits(agent_id, self.template_cost).await? {
            Some(balance) => Ok(balance),
            None => Err(PolicyError::InsufficientCredits {
                balance: store
                    .current_credits(agent_id)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_default(),
                required: self.template_cost,
            }
            .into()),
        }
    }

    /// Returns a reservation whose unit the provider did not accept.
    pub async fn release_template_credits(&self, store: &dyn Store, agent_id: i64) {
        match store.refund_credits(agent_id, self.template_cost).await {
            Ok(Some(balance)) => debug!(agent_id, balance, "released template credit reservation"),
            Ok(None) => warn!(agent_id, "agent vanished before credit reservation was released"),
            Err(err) => error!(agent_id, error = %err, "failed to release template credit reservation"),
        }
    }

    pub fn check_credits(&self, balance: f64) -> Result<(), PolicyError> {
        if balance >= self.template_cost {
            Ok(())
        } else {
            Err(PolicyError::InsufficientCredits {
                balance,
                required: self.template_cost,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use crate::tenant::TenantPrefix;
    use serde_json::json;

    fn policy() -> SessionPolicy {
        SessionPolicy::new(std::time::Duration::from_secs(24 * 60 * 60), 0.01)
    }

    fn request(hours_ago: Option<i64>) -> SessionRequest {
        let now = Utc::now();
        SessionRequest {
            last_inbound_at: hours_ago.map(|h| now - Duration::hours(h)),
            now,
            wants_template: false,
            is_promotional: false,
            has_media: false,
        }
    }

    #[test]
    fn test_free_form_inside_window() {
        assert_eq!(
            policy().classify(&request(Some(1))).unwrap(),
            SessionDecision::FreeForm
        );
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let now = Utc::now();
        let req = SessionRequest {
            last_inbound_at: Some(now - Duration::hours(24)),
            now,
            ..request(None)
        };
        assert_eq!(policy().classify(&req).unwrap(), SessionDecision::FreeForm);
    }

    #[test]
    fn test_stale_window_needs_fallback() {
        assert_eq!(
            policy().classify(&request(Some(30))).unwrap(),
            SessionDecision::NeedsFallbackTemplate
        );
    }

    #[test]
    fn test_missing_history_is_outside_window() {
        assert_eq!(
            policy().classify(&request(None)).unwrap(),
            SessionDecision::NeedsFallbackTemplate
        );
    }

    #[test]
    fn test_explicit_template_and_promotional() {
        let mut req = request(Some(1));
        req.wants_template = true;
        assert_eq!(
            policy().classify(&req).unwrap(),
            SessionDecision::TemplateRequired
        );

        let mut req = request(Some(1));
        req.is_promotional = true;
        assert_eq!(
            policy().classify(&req).unwrap(),
            SessionDecision::TemplateRequired
        );
    }

    #[test]
    fn test_media_never_takes_template_path() {
        let mut stale = request(Some(30));
        stale.has_media = true;
        assert_eq!(
            policy().classify(&stale),
            Err(PolicyError::MediaRequiresSession)
        );

        let mut promotional = request(Some(1));
        promotional.has_media = true;
        promotional.is_promotional = true;
        assert_eq!(
            policy().classify(&promotional),
            Err(PolicyError::MediaRequiresSession)
        );

        let mut fresh = request(Some(1));
        fresh.has_media = true;
        assert_eq!(policy().classify(&fresh).unwrap(), SessionDecision::FreeForm);
    }

    #[test]
    fn test_credit_gate() {
        assert!(policy().check_credits(0.01).is_ok());
        assert!(policy().check_credits(5.0).is_ok());
        assert_eq!(
            policy().check_credits(0.0),
            Err(PolicyError::InsufficientCredits {
                balance: 0.0,
                required: 0.01
            })
        );
    }

    #[tokio::test]
    async fn test_resolve_forces_category_template() {
        let store = MemoryStore::default();
        let tables = TenantPrefix::parse("acme").unwrap().tables();
        store.add_template(
            &tables,
            7,
            "reengage",
            "utility",
            true,
            json!({ "name": "reengage_v2", "language": { "code": "en_US" } }),
        );

        let path = policy()
            .resolve_path(&store, &tables, 7, 1.0, &request(Some(30)), Some("UTILITY"))
            .await
            .unwrap();
        match path {
            SendPath::ForcedTemplate(template) => {
                assert_eq!(template.provider_name(), "reengage_v2")
            }
            other => panic!("unexpected path {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_rejects_without_template() {
        let store = MemoryStore::default();
        let tables = TenantPrefix::parse("acme").unwrap().tables();
        store.add_template(&tables, 7, "old", "utility", false, json!({}));

        let err = policy()
            .resolve_path(&store, &tables, 7, 1.0, &request(Some(30)), Some("utility"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Policy(PolicyError::NoTemplateAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_applies_credit_gate_to_templates_only() {
        let store = MemoryStore::default();
        let tables = TenantPrefix::parse("acme").unwrap().tables();

        let path = policy()
            .resolve_path(&store, &tables, 7, 0.0, &request(Some(1)), None)
            .await
            .unwrap();
        assert!(matches!(path, SendPath::FreeForm));

        let mut wants_template = request(Some(1));
        wants_template.wants_template = true;
        let err = policy()
            .resolve_path(&store, &tables, 7, 0.0, &wants_template, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Policy(PolicyError::InsufficientCredits { .. })
        ));
    }

    #[tokio::test]
    async fn test_reservation_is_conditional_and_releasable() {
        let store = MemoryStore::default();
        let agent = store.add_agent("user-7", "acme", 0.015);

        let balance = policy()
            .reserve_template_credits(&store, agent.id)
            .await
            .unwrap();
        assert!((balance - 0.005).abs() < 1e-9);

        let err = policy()
            .reserve_template_credits(&store, agent.id)
            .await
            .unwrap_err();
        match err {
            GatewayError::Policy(PolicyError::InsufficientCredits { balance, required }) => {
                assert!((balance - 0.005).abs() < 1e-9);
                assert!((required - 0.01).abs() < 1e-9);
            }
            other => panic!("unexpected error {other:?}"),
        }

        policy().release_template_credits(&store, agent.id).await;
        assert!((store.credits(agent.id) - 0.015).abs() < 1e-9);
    }
}
