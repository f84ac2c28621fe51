//! Best-effort side effects: cache invalidation and AI-agent callbacks.
//!
//! Outcomes are logged and never change the result of the primary operation
//! that scheduled them.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::PgPool;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffectOutcome {
    Completed,
    Failed(String),
}

impl SideEffectOutcome {
    fn log(&self, label: &'static str) {
        match self {
            SideEffectOutcome::Completed => debug!(effect = label, "side effect completed"),
            SideEffectOutcome::Failed(err) => warn!(effect = label, error = %err, "side effect failed"),
        }
    }
}

/// Runs side effects as detached tasks and keeps their handles for draining.
#[derive(Clone, Default)]
pub struct SideEffects {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl SideEffects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, label: &'static str, effect: F)
    where
        F: Future<Output = SideEffectOutcome> + Send + 'static,
    {
        let Ok(mut tasks) = self.tasks.lock() else {
            warn!(effect = label, "side effect runner poisoned, dropping effect");
            return;
        };
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            effect.await.log(label);
        });
    }

    /// Waits for every scheduled effect, including ones scheduled meanwhile.
    pub async fn drain(&self) {
        loop {
            let mut pending = match self.tasks.lock() {
                Ok(mut tasks) => std::mem::take(&mut *tasks),
                Err(_) => return,
            };
            if pending.is_empty() {
                return;
            }
            while pending.join_next().await.is_some() {}
        }
    }
}

pub fn chat_list_key(agent_id: i64) -> String {
    format!("chat_list:{agent_id}")
}

pub fn recent_messages_key(agent_id: i64, customer_id: i64) -> String {
    format!("recent_messages:{agent_id}:{customer_id}")
}

/// Invalidation hooks of the external conversation cache.
#[async_trait]
pub trait ChatCache: Send + Sync {
    async fn invalidate_chat_list(&self, agent_id: i64) -> Result<(), String>;

    async fn invalidate_recent_messages(&self, agent_id: i64, customer_id: i64)
        -> Result<(), String>;
}

/// Publishes invalidations on a Postgres `NOTIFY` channel for cache holders.
pub struct PgNotifyCache {
    pool: PgPool,
}

pub const CACHE_CHANNEL: &str = "whatsapp_cache_invalidation";

impl PgNotifyCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn notify(&self, key: String) -> Result<(), String> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CACHE_CHANNEL)
            .bind(key)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl ChatCache for PgNotifyCache {
    async fn invalidate_chat_list(&self, agent_id: i64) -> Result<(), String> {
        self.notify(chat_list_key(agent_id)).await
    }

    async fn invalidate_recent_messages(
        &self,
        agent_id: i64,
        customer_id: i64,
    ) -> Result<(), String> {
        self.notify(recent_messages_key(agent_id, customer_id)).await
    }
}

const CACHE_ATTEMPTS: u32 = 3;

/// Schedules invalidation of the chat list and the customer's recent messages.
/// Invalidation is idempotent, so failed attempts are retried a bounded number of times.
pub fn invalidate_conversation(
    effects: &SideEffects,
    cache: Arc<dyn ChatCache>,
    agent_id: i64,
    customer_id: i64,
) {
    effects.spawn("cache_invalidation", async move {
        let mut last_error = String::new();
        for attempt in 1..=CACHE_ATTEMPTS {
            let result = match cache.invalidate_chat_list(agent_id).await {
                Ok(()) => cache.invalidate_recent_messages(agent_id, customer_id).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => return SideEffectOutcome::Completed,
                Err(err) => {
                    last_error = err;
                    if attempt < CACHE_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                    }
                }
            }
        }
        SideEffectOutcome::Failed(last_error)
    });
}

/// Delivery of normalized events to a tenant's AI agent.
#[async_trait]
pub trait AgentCallback: Send + Sync {
    async fn deliver(&self, url: &str, event: &Value) -> Result<(), String>;
}

pub struct HttpAgentCallback {
    http: reqwest::Client,
    secret: Option<String>,
}

impl HttpAgentCallback {
    pub fn new(http: reqwest::Client, secret: Option<String>) -> Self {
        Self { http, secret }
    }
}

pub const CALLBACK_SIGNATURE_HEADER: &str = "x-gateway-signature";

pub fn sign_callback_body(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[async_trait]
impl AgentCallback for HttpAgentCallback {
    async fn deliver(&self, url: &str, event: &Value) -> Result<(), String> {
        let body = serde_json::to_vec(event).map_err(|e| e.to_string())?;
        let mut request = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(signature) = self
            .secret
            .as_deref()
            .and_then(|secret| sign_callback_body(secret, &body))
        {
            request = request.header(CALLBACK_SIGNATURE_HEADER, signature);
        }
        let response = request.body(body).send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(format!("callback returned {}: {}", status.as_u16(), text))
    }
}

/// Schedules a single delivery attempt; callbacks are not assumed idempotent.
pub fn dispatch_callback(
    effects: &SideEffects,
    callback: Arc<dyn AgentCallback>,
    url: String,
    event: Value,
) {
    effects.spawn("ai_callback", async move {
        match callback.deliver(&url, &event).await {
            Ok(()) => SideEffectOutcome::Completed,
            Err(err) => SideEffectOutcome::Failed(err),
        }
    });
}

pub fn message_received_event(data: Value) -> Value {
    json!({ "event": "message_received", "data": data })
}
