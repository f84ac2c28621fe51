//! In-memory fakes of the injected dependencies.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::config::Config;
use crate::effects::{chat_list_key, recent_messages_key, AgentCallback, ChatCache, SideEffects};
use crate::error::{ProviderError, StoreError, StoreResult};
use crate::graph::{DownloadedMedia, MediaMetadata, WhatsAppApi};
use crate::inbound::InboundProcessor;
use crate::media::{MediaRelay, ObjectStore, StorageError};
use crate::outbound::OutboundDispatcher;
use crate::policy::SessionPolicy;
use crate::store::Store;
use crate::tenant::{TenantPrefix, TenantTables};
use crate::types::{
    Agent, Customer, DeliveryLog, DeliveryStatusUpdate, Message, NewMessage, Template,
    WhatsAppConfiguration,
};

#[derive(Default)]
struct TenantData {
    customers: Vec<Customer>,
    messages: Vec<Message>,
    templates: Vec<Template>,
}

#[derive(Debug, Clone)]
pub struct StoredDelivery {
    pub log: DeliveryLog,
    pub error: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    agents: Vec<Agent>,
    configs: Vec<WhatsAppConfiguration>,
    tenants: HashMap<String, TenantData>,
    deliveries: HashMap<String, StoredDelivery>,
    next_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn tenant(&mut self, tables: &TenantTables) -> &mut TenantData {
        self.tenants.entry(tables.customers.clone()).or_default()
    }
}

/// Yields to the scheduler so futures joined in one task interleave at the
/// same points a network round trip would.
async fn interleave() {
    tokio::task::yield_now().await;
}

fn unavailable() -> StoreError {
    StoreError::Sqlx(sqlx::Error::PoolTimedOut)
}

/// `Store` over a single mutex; every operation is atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    upserts_in_flight: AtomicUsize,
    peak_upserts: AtomicUsize,
    fail_configuration_lookups: AtomicBool,
    fail_insert_of: Mutex<Option<String>>,
    fail_debits: AtomicBool,
}

impl MemoryStore {
    /// Highest number of customer upserts observed in progress at once.
    pub fn peak_concurrent_upserts(&self) -> usize {
        self.peak_upserts.load(Ordering::SeqCst)
    }

    pub fn fail_configuration_lookups(&self) {
        self.fail_configuration_lookups.store(true, Ordering::SeqCst);
    }

    pub fn fail_debits(&self) {
        self.fail_debits.store(true, Ordering::SeqCst);
    }

    /// Makes inserting a message with exactly this text fail.
    pub fn fail_insert_of(&self, text: &str) {
        *self.fail_insert_of.lock().unwrap() = Some(text.to_string());
    }

    pub fn add_agent(&self, user_id: &str, prefix: &str, credits: f64) -> Agent {
        let mut state = self.state.lock().unwrap();
        let agent = Agent {
            id: state.next_id(),
            user_id: user_id.to_string(),
            prefix: prefix.to_string(),
            credits,
            business_type: None,
        };
        state.agents.push(agent.clone());
        agent
    }

    pub fn add_config(
        &self,
        user_id: &str,
        phone_number_id: &str,
        webhook_url: Option<&str>,
    ) -> WhatsAppConfiguration {
        let mut state = self.state.lock().unwrap();
        let config = WhatsAppConfiguration {
            id: state.next_id(),
            user_id: user_id.to_string(),
            access_token: format!("token-{user_id}"),
            phone_number_id: phone_number_id.to_string(),
            webhook_url: webhook_url.map(str::to_string),
            verify_token: None,
            app_secret: None,
            is_active: true,
        };
        state.configs.push(config.clone());
        config
    }

    pub fn update_config(&self, id: i64, update: impl FnOnce(&mut WhatsAppConfiguration)) {
        let mut state = self.state.lock().unwrap();
        if let Some(config) = state.configs.iter_mut().find(|c| c.id == id) {
            update(config);
        }
    }

    pub fn add_customer(
        &self,
        tables: &TenantTables,
        phone_number: &str,
        last_user_message_time: Option<DateTime<Utc>>,
    ) -> Customer {
        let mut state = self.state.lock().unwrap();
        let customer = Customer {
            id: state.next_id(),
            phone_number: phone_number.to_string(),
            name: phone_number.to_string(),
            last_user_message_time,
            ai_enabled: true,
            language: None,
        };
        state.tenant(tables).customers.push(customer.clone());
        customer
    }

    pub fn set_ai_enabled(&self, tables: &TenantTables, customer_id: i64, enabled: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(customer) = state
            .tenant(tables)
            .customers
            .iter_mut()
            .find(|c| c.id == customer_id)
        {
            customer.ai_enabled = enabled;
        }
    }

    pub fn add_template(
        &self,
        tables: &TenantTables,
        agent_id: i64,
        name: &str,
        category: &str,
        is_active: bool,
        body: Value,
    ) -> Template {
        let mut state = self.state.lock().unwrap();
        let template = Template {
            id: state.next_id(),
            agent_id,
            name: name.to_string(),
            category: category.to_string(),
            is_active,
            body,
        };
        state.tenant(tables).templates.push(template.clone());
        template
    }

    pub fn customers(&self, tables: &TenantTables) -> Vec<Customer> {
        self.state.lock().unwrap().tenant(tables).customers.clone()
    }

    pub fn messages(&self, tables: &TenantTables) -> Vec<Message> {
        self.state.lock().unwrap().tenant(tables).messages.clone()
    }

    pub fn credits(&self, agent_id: i64) -> f64 {
        let state = self.state.lock().unwrap();
        state
            .agents
            .iter()
            .find(|a| a.id == agent_id)
            .map(|a| a.credits)
            .unwrap_or_default()
    }

    pub fn delivery(&self, provider_message_id: &str) -> Option<StoredDelivery> {
        self.state
            .lock()
            .unwrap()
            .deliveries
            .get(provider_message_id)
            .cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_configuration_by_phone_number_id(
        &self,
        phone_number_id: &str,
    ) -> StoreResult<Option<WhatsAppConfiguration>> {
        if self.fail_configuration_lookups.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let state = self.state.lock().unwrap();
        Ok(state
            .configs
            .iter()
            .find(|c| c.is_active && c.phone_number_id == phone_number_id)
            .cloned())
    }

    async fn find_active_configuration(
        &self,
        user_id: &str,
    ) -> StoreResult<Option<WhatsAppConfiguration>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .configs
            .iter()
            .find(|c| c.is_active && c.user_id == user_id)
            .cloned())
    }

    async fn find_agent_by_user_id(&self, user_id: &str) -> StoreResult<Option<Agent>> {
        let state = self.state.lock().unwrap();
        Ok(state.agents.iter().find(|a| a.user_id == user_id).cloned())
    }

    async fn upsert_inbound_customer(
        &self,
        tables: &TenantTables,
        phone_number: &str,
        name: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Customer> {
        let in_flight = self.upserts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_upserts.fetch_max(in_flight, Ordering::SeqCst);
        interleave().await;
        self.upserts_in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        let tenant = state.tenant(tables);
        if let Some(existing) = tenant
            .customers
            .iter_mut()
            .find(|c| c.phone_number == phone_number)
        {
            existing.last_user_message_time = Some(at);
            return Ok(existing.clone());
        }
        let customer = Customer {
            id,
            phone_number: phone_number.to_string(),
            name: name.to_string(),
            last_user_message_time: Some(at),
            ai_enabled: true,
            language: None,
        };
        tenant.customers.push(customer.clone());
        Ok(customer)
    }

    async fn find_customer_by_phone(
        &self,
        tables: &TenantTables,
        phone_digits: &str,
    ) -> StoreResult<Option<Customer>> {
        let mut state = self.state.lock().unwrap();
        Ok(state
            .tenant(tables)
            .customers
            .iter()
            .find(|c| {
                c.phone_number
                    .chars()
                    .filter(char::is_ascii_digit)
                    .collect::<String>()
                    == phone_digits
            })
            .cloned())
    }

    async fn insert_message(
        &self,
        tables: &TenantTables,
        message: &NewMessage,
    ) -> StoreResult<Message> {
        interleave().await;
        if self.fail_insert_of.lock().unwrap().as_deref() == Some(message.message.as_str()) {
            return Err(unavailable());
        }
        let mut state = self.state.lock().unwrap();
        let stored = Message {
            id: state.next_id(),
            customer_id: message.customer_id,
            message: message.message.clone(),
            direction: message.direction,
            timestamp: message.timestamp,
            is_read: message.is_read,
            media_type: message.media_type,
            media_url: message.media_url.clone(),
            caption: message.caption.clone(),
            provider_message_id: message.provider_message_id.clone(),
        };
        state.tenant(tables).messages.push(stored.clone());
        Ok(stored)
    }

    async fn find_template_by_name(
        &self,
        tables: &TenantTables,
        agent_id: i64,
        name: &str,
    ) -> StoreResult<Option<Template>> {
        let mut state = self.state.lock().unwrap();
        Ok(state
            .tenant(tables)
            .templates
            .iter()
            .find(|t| t.agent_id == agent_id && (t.name == name || t.provider_name() == name))
            .cloned())
    }

    async fn find_active_template_for_category(
        &self,
        tables: &TenantTables,
        agent_id: i64,
        category: Option<&str>,
    ) -> StoreResult<Option<Template>> {
        let mut state = self.state.lock().unwrap();
        Ok(state
            .tenant(tables)
            .templates
            .iter()
            .find(|t| {
                t.agent_id == agent_id
                    && t.is_active
                    && category.map_or(true, |c| t.category.eq_ignore_ascii_case(c))
            })
            .cloned())
    }

    async fn debit_credits(&self, agent_id: i64, amount: f64) -> StoreResult<Option<f64>> {
        interleave().await;
        if self.fail_debits.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let mut state = self.state.lock().unwrap();
        Ok(state
            .agents
            .iter_mut()
            .find(|a| a.id == agent_id && a.credits >= amount)
            .map(|agent| {
                agent.credits -= amount;
                agent.credits
            }))
    }

    async fn current_credits(&self, agent_id: i64) -> StoreResult<Option<f64>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .agents
            .iter()
            .find(|a| a.id == agent_id)
            .map(|a| a.credits))
    }

    async fn refund_credits(&self, agent_id: i64, amount: f64) -> StoreResult<Option<f64>> {
        interleave().await;
        let mut state = self.state.lock().unwrap();
        Ok(state
            .agents
            .iter_mut()
            .find(|a| a.id == agent_id)
            .map(|agent| {
                agent.credits += amount;
                agent.credits
            }))
    }

    async fn record_delivery(&self, log: &DeliveryLog) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .deliveries
            .entry(log.provider_message_id.clone())
            .or_insert_with(|| StoredDelivery {
                log: log.clone(),
                error: None,
            });
        Ok(())
    }

    async fn update_delivery_status(&self, update: &DeliveryStatusUpdate) -> StoreResult<bool> {
        let mut state = self.state.lock().unwrap();
        match state.deliveries.get_mut(&update.provider_message_id) {
            Some(delivery) => {
                delivery.log.status = update.status.clone();
                delivery.error = update.error.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Records every Graph call and serves registered media.
#[derive(Default)]
pub struct FakeGraph {
    media: Mutex<HashMap<String, (String, Vec<u8>)>>,
    sent: Mutex<Vec<(String, Value)>>,
    uploads: Mutex<Vec<(String, String, usize)>>,
    metadata_calls: AtomicUsize,
    fail_downloads: AtomicBool,
    fail_send_at: Mutex<Option<usize>>,
}

impl FakeGraph {
    pub const CDN_HOST: &'static str = "lookaside.fbsbx.test";

    pub fn add_media(&self, media_id: &str, mime_type: &str, bytes: &[u8]) {
        self.media.lock().unwrap().insert(
            media_id.to_string(),
            (mime_type.to_string(), bytes.to_vec()),
        );
    }

    pub fn fail_downloads(&self) {
        self.fail_downloads.store(true, Ordering::SeqCst);
    }

    /// Makes the send with zero-based index `index` fail with a provider error.
    pub fn fail_send_at(&self, index: usize) {
        *self.fail_send_at.lock().unwrap() = Some(index);
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn sent_from(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(phone_number_id, _)| phone_number_id.clone())
            .collect()
    }

    pub fn uploads(&self) -> Vec<(String, String, usize)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    fn cdn_url(media_id: &str) -> String {
        format!("https://{}/v/{}?sig=abc", Self::CDN_HOST, media_id)
    }
}

#[async_trait]
impl WhatsAppApi for FakeGraph {
    async fn media_metadata(
        &self,
        media_id: &str,
        _access_token: &str,
    ) -> Result<MediaMetadata, ProviderError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        let media = self.media.lock().unwrap();
        let (mime_type, _) = media.get(media_id).ok_or_else(|| ProviderError::Status {
            status: 404,
            body: json!({ "error": { "message": "Unsupported get request" } }),
        })?;
        Ok(MediaMetadata {
            url: Self::cdn_url(media_id),
            mime_type: mime_type.clone(),
        })
    }

    async fn download_media(
        &self,
        url: &str,
        _access_token: &str,
    ) -> Result<DownloadedMedia, ProviderError> {
        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(ProviderError::Status {
                status: 500,
                body: json!({ "raw": "cdn unavailable" }),
            });
        }
        let media = self.media.lock().unwrap();
        media
            .iter()
            .find(|(id, _)| Self::cdn_url(id) == url)
            .map(|(_, (mime_type, bytes))| DownloadedMedia {
                bytes: bytes.clone(),
                content_type: mime_type.clone(),
            })
            .ok_or_else(|| ProviderError::Status {
                status: 404,
                body: json!({ "raw": "not found" }),
            })
    }

    async fn send_message(
        &self,
        phone_number_id: &str,
        _access_token: &str,
        payload: &Value,
    ) -> Result<String, ProviderError> {
        interleave().await;
        let mut sent = self.sent.lock().unwrap();
        let index = sent.len();
        sent.push((phone_number_id.to_string(), payload.clone()));
        if *self.fail_send_at.lock().unwrap() == Some(index) {
            return Err(ProviderError::Status {
                status: 400,
                body: json!({ "error": { "message": "(#131026) Message undeliverable", "code": 131026 } }),
            });
        }
        Ok(format!("wamid.fake{index}"))
    }

    async fn upload_media(
        &self,
        phone_number_id: &str,
        _access_token: &str,
        bytes: Vec<u8>,
        mime_type: &str,
        _filename: &str,
    ) -> Result<String, ProviderError> {
        let mut uploads = self.uploads.lock().unwrap();
        uploads.push((phone_number_id.to_string(), mime_type.to_string(), bytes.len()));
        Ok(format!("uploaded-{}", uploads.len()))
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub const BASE_URL: &'static str = "https://objects.test";

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<String, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        Ok(format!("{}/{}", Self::BASE_URL, key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.bytes(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

/// Records invalidated keys; the first `failures` chat-list calls fail.
#[derive(Default)]
pub struct RecordingCache {
    keys: Mutex<Vec<String>>,
    attempts: AtomicUsize,
    failures: AtomicUsize,
}

impl RecordingCache {
    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatCache for RecordingCache {
    async fn invalidate_chat_list(&self, agent_id: i64) -> Result<(), String> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err("cache unavailable".to_string());
        }
        self.keys.lock().unwrap().push(chat_list_key(agent_id));
        Ok(())
    }

    async fn invalidate_recent_messages(
        &self,
        agent_id: i64,
        customer_id: i64,
    ) -> Result<(), String> {
        self.keys
            .lock()
            .unwrap()
            .push(recent_messages_key(agent_id, customer_id));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingCallback {
    events: Mutex<Vec<(String, Value)>>,
    fail: AtomicBool,
}

impl RecordingCallback {
    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<(String, Value)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentCallback for RecordingCallback {
    async fn deliver(&self, url: &str, event: &Value) -> Result<(), String> {
        self.events
            .lock()
            .unwrap()
            .push((url.to_string(), event.clone()));
        if self.fail.load(Ordering::SeqCst) {
            return Err("agent unreachable".to_string());
        }
        Ok(())
    }
}

/// A fully wired pipeline over fakes, seeded with one tenant `acme`.
pub struct Harness {
    pub config: Config,
    pub store: Arc<MemoryStore>,
    pub graph: Arc<FakeGraph>,
    pub objects: Arc<MemoryObjectStore>,
    pub cache: Arc<RecordingCache>,
    pub callback: Arc<RecordingCallback>,
    pub effects: SideEffects,
    pub agent: Agent,
    pub configuration: WhatsAppConfiguration,
    pub tables: TenantTables,
}

pub const USER_ID: &str = "user-1";
pub const PHONE_NUMBER_ID: &str = "1098765";
pub const CALLBACK_URL: &str = "https://agent.test/hook";

impl Harness {
    pub fn new(credits: f64) -> Self {
        Self::with_config(Config::for_tests(), credits)
    }

    pub fn with_config(config: Config, credits: f64) -> Self {
        let store = Arc::new(MemoryStore::default());
        let agent = store.add_agent(USER_ID, "acme", credits);
        let configuration = store.add_config(USER_ID, PHONE_NUMBER_ID, Some(CALLBACK_URL));
        let tables = TenantPrefix::parse("acme").map(|p| p.tables()).unwrap();
        Self {
            config,
            store,
            graph: Arc::new(FakeGraph::default()),
            objects: Arc::new(MemoryObjectStore::default()),
            cache: Arc::new(RecordingCache::default()),
            callback: Arc::new(RecordingCallback::default()),
            effects: SideEffects::new(),
            agent,
            configuration,
            tables,
        }
    }

    fn relay(&self) -> MediaRelay {
        MediaRelay::new(self.graph.clone(), self.objects.clone())
    }

    pub fn inbound(&self) -> InboundProcessor {
        InboundProcessor::new(
            &self.config,
            self.store.clone(),
            self.relay(),
            self.cache.clone(),
            self.callback.clone(),
            self.effects.clone(),
        )
    }

    pub fn outbound(&self) -> OutboundDispatcher {
        OutboundDispatcher::new(
            self.store.clone(),
            self.graph.clone(),
            self.relay(),
            SessionPolicy::new(self.config.session_window, self.config.template_credit_cost),
            self.cache.clone(),
            self.effects.clone(),
        )
    }
}
