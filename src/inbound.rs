//! Inbound webhook processing: subscription verification and delivery events.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::effects::{
    dispatch_callback, invalidate_conversation, message_received_event, AgentCallback, ChatCache,
    SideEffects,
};
use crate::error::{GatewayError, Result};
use crate::media::{MediaFolder, MediaRelay};
use crate::store::Store;
use crate::tenant::{TenantPrefix, TenantTables};
use crate::types::{
    Agent, Customer, DeliveryStatusUpdate, Direction, MediaType, Message, NewMessage,
    WhatsAppConfiguration,
};

pub const WEBHOOK_OBJECT: &str = "whatsapp_business_account";
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Query of the provider's subscription handshake.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerificationQuery {
    #[serde(rename = "hub.mode", default)]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token", default)]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge", default)]
    pub challenge: Option<String>,
    #[serde(default)]
    pub phone_number_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySummary {
    pub messages_stored: usize,
    pub statuses_applied: usize,
}

struct TenantContext {
    configuration: WhatsAppConfiguration,
    agent: Agent,
    prefix: TenantPrefix,
    tables: TenantTables,
}

/// Normalized content of one inbound provider message.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundContent {
    pub text: String,
    pub media_type: MediaType,
    pub media_id: Option<String>,
    pub filename: Option<String>,
    pub caption: Option<String>,
}

impl InboundContent {
    fn text(text: String) -> Self {
        Self {
            text,
            media_type: MediaType::None,
            media_id: None,
            filename: None,
            caption: None,
        }
    }
}

pub struct InboundProcessor {
    store: Arc<dyn Store>,
    media: MediaRelay,
    cache: Arc<dyn ChatCache>,
    callback: Arc<dyn AgentCallback>,
    effects: SideEffects,
    verify_token: Option<String>,
    app_secret: Option<String>,
    strict_verification: bool,
    reply_url: String,
}

impl InboundProcessor {
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        media: MediaRelay,
        cache: Arc<dyn ChatCache>,
        callback: Arc<dyn AgentCallback>,
        effects: SideEffects,
    ) -> Self {
        Self {
            store,
            media,
            cache,
            callback,
            effects,
            verify_token: config.verify_token.clone(),
            app_secret: config.app_secret.clone(),
            strict_verification: config.strict_verification,
            reply_url: config.reply_url(),
        }
    }

    /// Answers the subscription handshake with the challenge on success.
    ///
    /// The tenant's verify token (looked up by `phone_number_id`) takes
    /// precedence over the environment token. With no token configured the
    /// challenge is echoed unless strict verification is enabled.
    pub async fn verify_subscription(&self, query: &VerificationQuery) -> Result<String> {
        let mode = query.mode.as_deref().unwrap_or_default();
        let challenge = query.challenge.as_deref().unwrap_or_default();
        if mode != "subscribe" || challenge.is_empty() {
            return Err(GatewayError::Forbidden(
                "invalid webhook verification request".to_string(),
            ));
        }

        let tenant_token = match query.phone_number_id.as_deref().filter(|id| !id.is_empty()) {
            Some(phone_number_id) => self
                .store
                .find_configuration_by_phone_number_id(phone_number_id)
                .await?
                .and_then(|config| config.verify_token)
                .filter(|token| !token.trim().is_empty()),
            None => None,
        };
        let Some(expected) = tenant_token.or_else(|| self.verify_token.clone()) else {
            if self.strict_verification {
                return Err(GatewayError::Forbidden(
                    "no webhook verify token configured".to_string(),
                ));
            }
            warn!("no webhook verify token configured, accepting subscription");
            return Ok(challenge.to_string());
        };

        if query.verify_token.as_deref() == Some(expected.as_str()) {
            info!("webhook subscription verified");
            Ok(challenge.to_string())
        } else {
            Err(GatewayError::Forbidden(
                "invalid webhook verification token".to_string(),
            ))
        }
    }

    /// Processes one delivery. Succeeds once the envelope is structurally
    /// valid, even when a tenant cannot be resolved.
    pub async fn handle_delivery(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<DeliverySummary> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|_| GatewayError::invalid("body", "webhook body is not valid JSON"))?;
        let first_value = validate_envelope(&payload)?;

        let first_phone_number_id = phone_number_id_of(first_value);
        let tenant_secret = match first_phone_number_id {
            Some(id) => match self.store.find_configuration_by_phone_number_id(id).await {
                Ok(config) => config
                    .and_then(|config| config.app_secret)
                    .filter(|secret| !secret.trim().is_empty()),
                Err(err) => {
                    warn!(phone_number_id = id, error = %err, "tenant secret lookup failed, using global secret");
                    None
                }
            },
            None => None,
        };
        self.check_signature(
            tenant_secret.as_deref().or(self.app_secret.as_deref()),
            signature,
            body,
        )?;

        let mut summary = DeliverySummary::default();
        let entries = payload
            .get("entry")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in entries {
            let changes = entry
                .get("changes")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for change in changes {
                let Some(value) = change.get("value") else {
                    continue;
                };
                self.process_change(value, &mut summary).await;
            }
        }
        Ok(summary)
    }

    fn check_signature(
        &self,
        secret: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<()> {
        let Some(secret) = secret else {
            if self.strict_verification {
                return Err(GatewayError::Unauthorized(
                    "no webhook app secret configured".to_string(),
                ));
            }
            debug!("no app secret configured, webhook signature not checked");
            return Ok(());
        };
        let Some(signature) = signature else {
            if self.strict_verification {
                return Err(GatewayError::Unauthorized(
                    "missing webhook signature".to_string(),
                ));
            }
            warn!("webhook delivery without signature, continuing");
            return Ok(());
        };
        if verify_signature(secret, signature, body) {
            return Ok(());
        }
        if self.strict_verification {
            return Err(GatewayError::Unauthorized(
                "invalid webhook signature".to_string(),
            ));
        }
        warn!("webhook signature mismatch, continuing");
        Ok(())
    }

    /// Each event is isolated: a failure is logged and the rest still run,
    /// since a redelivered payload would duplicate the events that succeeded.
    async fn process_change(&self, value: &Value, summary: &mut DeliverySummary) {
        let messages = value
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        if !messages.is_empty() {
            match phone_number_id_of(value) {
                Some(phone_number_id) => match self.resolve_tenant(phone_number_id).await {
                    Ok(Some(tenant)) => {
                        let names = contact_profile_names(value);
                        for message in messages {
                            match self.ingest_message(&tenant, message, &names).await {
                                Ok(Some(_)) => summary.messages_stored += 1,
                                Ok(None) => {}
                                Err(err) => error!(
                                    agent_id = tenant.agent.id,
                                    provider_message_id = message.get("id").and_then(serde_json::Value::as_str).unwrap_or(""),
                                    error = %err,
                                    "failed to ingest inbound message"
                                ),
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(err) => error!(
                        phone_number_id,
                        error = %err,
                        "tenant resolution failed, dropping messages"
                    ),
                },
                None => warn!("webhook change without metadata.phone_number_id, skipping messages"),
            }
        }

        if let Some(statuses) = value.get("statuses").and_then(Value::as_array) {
            for status in statuses {
                if self.apply_status(status).await {
                    summary.statuses_applied += 1;
                }
            }
        }
    }

    async fn resolve_tenant(&self, phone_number_id: &str) -> Result<Option<TenantContext>> {
        let Some(configuration) = self
            .store
            .find_configuration_by_phone_number_id(phone_number_id)
            .await?
        else {
            warn!(phone_number_id, "no active configuration for phone number id");
            return Ok(None);
        };
        let Some(agent) = self
            .store
            .find_agent_by_user_id(&configuration.user_id)
            .await?
        else {
            warn!(phone_number_id, user_id = %configuration.user_id, "no agent for configuration");
            return Ok(None);
        };
        let prefix = match agent.tenant_prefix() {
            Ok(prefix) => prefix,
            Err(err) => {
                warn!(agent_id = agent.id, error = %err, "agent has unusable tenant prefix");
                return Ok(None);
            }
        };
        let tables = prefix.tables();
        Ok(Some(TenantContext {
            configuration,
            agent,
            prefix,
            tables,
        }))
    }

    async fn ingest_message(
        &self,
        tenant: &TenantContext,
        message: &Value,
        names: &HashMap<String, String>,
    ) -> Result<Option<Message>> {
        let from = message
            .get("from")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        if from.is_empty() {
            warn!(agent_id = tenant.agent.id, "inbound message without sender, skipping");
            return Ok(None);
        }
        let name = names
            .get(from)
            .cloned()
            .unwrap_or_else(|| from.to_string());

        let customer = self
            .store
            .upsert_inbound_customer(&tenant.tables, from, &name, Utc::now())
            .await?;

        let content = classify_inbound(message);
        let media_url = match content.media_id.as_deref() {
            Some(media_id) => {
                self.media
                    .mirror(
                        &tenant.prefix,
                        media_id,
                        &tenant.configuration.access_token,
                        content.filename.as_deref(),
                        MediaFolder::Incoming,
                    )
                    .await
            }
            None => None,
        };

        let stored = self
            .store
            .insert_message(
                &tenant.tables,
                &NewMessage {
                    customer_id: customer.id,
                    message: content.text,
                    direction: Direction::Inbound,
                    timestamp: provider_timestamp(message).unwrap_or_else(Utc::now),
                    is_read: false,
                    media_type: content.media_type,
                    media_url,
                    caption: content.caption,
                    provider_message_id: message
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                },
            )
            .await?;
        info!(
            agent_id = tenant.agent.id,
            customer_id = customer.id,
            message_id = stored.id,
            media_type = %stored.media_type,
            "stored inbound whatsapp message"
        );

        invalidate_conversation(&self.effects, self.cache.clone(), tenant.agent.id, customer.id);
        if let Some(url) = tenant.configuration.callback_url() {
            if customer.ai_enabled {
                let event = message_received_event(self.callback_data(tenant, &customer, &stored));
                dispatch_callback(&self.effects, self.callback.clone(), url.to_string(), event);
            }
        }
        Ok(Some(stored))
    }

    fn callback_data(&self, tenant: &TenantContext, customer: &Customer, stored: &Message) -> Value {
        let mut data = serde_json::to_value(stored).unwrap_or_else(|_| json!({}));
        if let Some(object) = data.as_object_mut() {
            object.insert("customer_phone".into(), json!(customer.phone_number));
            object.insert("customer_name".into(), json!(customer.name));
            object.insert("customer_language".into(), json!(customer.language));
            object.insert("agent_id".into(), json!(tenant.agent.id));
            object.insert("agent_prefix".into(), json!(tenant.prefix));
            object.insert("agent_user_id".into(), json!(tenant.agent.user_id));
            object.insert(
                "phone_number_id".into(),
                json!(tenant.configuration.phone_number_id),
            );
            object.insert("reply_url".into(), json!(self.reply_url));
        }
        data
    }

    async fn apply_status(&self, status: &Value) -> bool {
        let Some(update) = parse_status(status) else {
            warn!("status event without id or status, skipping");
            return false;
        };
        match self.store.update_delivery_status(&update).await {
            Ok(true) => {
                debug!(provider_message_id = %update.provider_message_id, status = %update.status, "delivery status updated");
                true
            }
            Ok(false) => {
                info!(provider_message_id = %update.provider_message_id, status = %update.status, "no delivery log for status event");
                false
            }
            Err(err) => {
                warn!(provider_message_id = %update.provider_message_id, error = %err, "failed to update delivery status");
                false
            }
        }
    }
}

/// Returns `entry[0].changes[0].value` of a provider envelope.
fn validate_envelope(payload: &Value) -> Result<&Value> {
    if payload.get("object").and_then(Value::as_str) != Some(WEBHOOK_OBJECT) {
        return Err(GatewayError::invalid(
            "object",
            format!("expected object '{WEBHOOK_OBJECT}'"),
        ));
    }
    payload
        .get("entry")
        .and_then(|entry| entry.get(0))
        .and_then(|entry| entry.get("changes"))
        .and_then(|changes| changes.get(0))
        .and_then(|change| change.get("value"))
        .filter(|value| value.is_object())
        .ok_or_else(|| GatewayError::missing("entry[0].changes[0].value"))
}

fn phone_number_id_of(value: &Value) -> Option<&str> {
    value
        .get("metadata")
        .and_then(|m| m.get("phone_number_id"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

fn contact_profile_names(value: &Value) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let contacts = value
        .get("contacts")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for contact in contacts {
        let wa_id = contact
            .get("wa_id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        let name = contact
            .get("profile")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        if !wa_id.is_empty() && !name.is_empty() {
            map.insert(wa_id.to_string(), name.to_string());
        }
    }
    map
}

/// Checks an `X-Hub-Signature-256` value (`sha256=<hex>`) against the body.
pub fn verify_signature(app_secret: &str, signature_header: &str, body: &[u8]) -> bool {
    let signature = signature_header.trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Provider timestamps are unix seconds, sent as a string or a number.
fn provider_timestamp(message: &Value) -> Option<DateTime<Utc>> {
    let raw = message.get("timestamp")?;
    let seconds = raw
        .as_i64()
        .or_else(|| raw.as_str().and_then(|s| s.trim().parse().ok()))?;
    Utc.timestamp_opt(seconds, 0).single()
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn classify_inbound(message: &Value) -> InboundContent {
    let msg_type = message
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_ascii_lowercase();

    match msg_type.as_str() {
        "text" => InboundContent::text(
            non_empty(message.get("text").and_then(|t| t.get("body"))).unwrap_or_default(),
        ),
        "button" => InboundContent::text(
            non_empty(message.get("button").and_then(|b| b.get("text"))).unwrap_or_default(),
        ),
        "interactive" => {
            let interactive = message.get("interactive");
            let title = non_empty(
                interactive
                    .and_then(|v| v.get("button_reply"))
                    .and_then(|r| r.get("title")),
            )
            .or_else(|| {
                non_empty(
                    interactive
                        .and_then(|v| v.get("list_reply"))
                        .and_then(|r| r.get("title")),
                )
            });
            InboundContent::text(title.unwrap_or_default())
        }
        "location" => {
            let location = message.get("location");
            let name = non_empty(location.and_then(|l| l.get("name")));
            let address = non_empty(location.and_then(|l| l.get("address")));
            let text = match (name, address) {
                (Some(name), _) => format!("Shared location: {name}"),
                (None, Some(address)) => format!("Shared location: {address}"),
                (None, None) => "Shared a location".to_string(),
            };
            InboundContent::text(text)
        }
        "image" | "video" | "audio" | "document" | "sticker" => {
            let body = message.get(msg_type.as_str());
            let media_type = msg_type.parse().unwrap_or(MediaType::Document);
            let caption = non_empty(body.and_then(|b| b.get("caption")));
            let filename = non_empty(body.and_then(|b| b.get("filename")));
            let text = caption
                .clone()
                .or_else(|| filename.clone())
                .unwrap_or_else(|| format!("[{msg_type}]"));
            InboundContent {
                text,
                media_type,
                media_id: non_empty(body.and_then(|b| b.get("id"))),
                filename,
                caption,
            }
        }
        "" => InboundContent::text("[unsupported message]".to_string()),
        other => InboundContent::text(format!("[unsupported message: {other}]")),
    }
}

fn parse_status(status: &Value) -> Option<DeliveryStatusUpdate> {
    let provider_message_id = non_empty(status.get("id"))?;
    let state = non_empty(status.get("status"))?;
    let error = status
        .get("errors")
        .and_then(|errors| errors.get(0))
        .and_then(|err| non_empty(err.get("title")).or_else(|| non_empty(err.get("message"))));
    Some(DeliveryStatusUpdate {
        provider_message_id,
        status: state.to_ascii_lowercase(),
        error,
        at: provider_timestamp(status).unwrap_or_else(Utc::now),
    })
}
