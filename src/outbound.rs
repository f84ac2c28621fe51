//! Outbound message dispatch.
//!
//! A send request is validated, resolved to a tenant and customer, run
//! through the session and credit policy, and then issued to the provider as
//! one call per logical unit. Every unit the provider accepted is persisted.

use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::effects::{invalidate_conversation, ChatCache, SideEffects};
use crate::error::{GatewayError, Result};
use crate::graph::{MediaMetadata, WhatsAppApi};
use crate::media::{
    media_content_type_from_extension, media_extension_from_filename, media_kind_from_mime,
    MediaFolder, MediaRelay,
};
use crate::policy::{SendPath, SessionPolicy, SessionRequest};
use crate::store::Store;
use crate::tenant::{TenantPrefix, TenantTables};
use crate::types::{
    Agent, Customer, DeliveryLog, Direction, MediaType, NewMessage, SendDetail, SendMessageBody,
    SendMessageResponse, Template, WhatsAppConfiguration,
};

pub const DEFAULT_TEMPLATE_LANGUAGE: &str = "en_US";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Template,
    Media(MediaType),
}

impl MessageKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(MessageKind::Text),
            "template" => Some(MessageKind::Template),
            "image" => Some(MessageKind::Media(MediaType::Image)),
            "video" => Some(MessageKind::Media(MediaType::Video)),
            "audio" => Some(MessageKind::Media(MediaType::Audio)),
            "document" => Some(MessageKind::Media(MediaType::Document)),
            _ => None,
        }
    }
}

/// A send request that passed field validation.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub user_id: String,
    pub customer_phone: String,
    pub kind: MessageKind,
    pub message: Option<String>,
    pub template_name: Option<String>,
    pub template_language: Option<String>,
    pub template_params: Vec<Value>,
    pub header_params: Vec<Value>,
    pub template_buttons: Vec<Value>,
    pub media_ids: Vec<String>,
    pub caption: Option<String>,
    pub filename: Option<String>,
    pub category: Option<String>,
    pub is_promotional: bool,
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn required(value: &Option<String>, field: &str) -> Result<String> {
    trimmed(value).ok_or_else(|| GatewayError::missing(field))
}

impl SendRequest {
    pub fn from_body(body: &SendMessageBody) -> Result<Self> {
        let user_id = required(&body.user_id, "user_id")?;
        let customer_phone = required(&body.customer_phone, "customer_phone")?;
        let raw_type = required(&body.message_type, "type")?;
        let kind = MessageKind::parse(&raw_type).ok_or_else(|| {
            GatewayError::invalid(
                "type",
                format!(
                    "unsupported message type '{raw_type}', expected one of text, template, image, video, audio, document"
                ),
            )
        })?;

        let mut media_ids: Vec<String> = body
            .media_ids
            .iter()
            .flatten()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        if let Some(id) = trimmed(&body.media_id) {
            if !media_ids.contains(&id) {
                media_ids.insert(0, id);
            }
        }

        let template_params = body.template_params.clone().unwrap_or_default();
        let header_params = body.header_params.clone().unwrap_or_default();
        let template_buttons = body.template_buttons.clone().unwrap_or_default();

        match kind {
            MessageKind::Text => {
                required(&body.message, "message")?;
            }
            MessageKind::Template => {
                required(&body.template_name, "template_name")?;
                for (index, param) in template_params.iter().enumerate() {
                    validate_parameter(&format!("template_params[{index}]"), param)?;
                }
                for (index, param) in header_params.iter().enumerate() {
                    validate_parameter(&format!("header_params[{index}]"), param)?;
                }
                for (index, button) in template_buttons.iter().enumerate() {
                    validate_button(&format!("template_buttons[{index}]"), button)?;
                }
            }
            MessageKind::Media(media_type) => {
                if media_ids.is_empty() {
                    return Err(GatewayError::missing("media_id"));
                }
                if media_ids.len() > 1 && media_type != MediaType::Image {
                    return Err(GatewayError::invalid(
                        "media_ids",
                        format!("only image messages accept more than one media item, got {media_type}"),
                    ));
                }
            }
        }

        Ok(Self {
            user_id,
            customer_phone,
            kind,
            message: trimmed(&body.message),
            template_name: trimmed(&body.template_name),
            template_language: trimmed(&body.template_language),
            template_params,
            header_params,
            template_buttons,
            media_ids,
            caption: trimmed(&body.caption),
            filename: trimmed(&body.filename),
            category: trimmed(&body.category),
            is_promotional: body.is_promotional.unwrap_or(false),
        })
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Template parameter kinds: `text`, `currency`, `date_time`.
pub fn validate_parameter(field: &str, param: &Value) -> Result<()> {
    let Some(kind) = str_field(param, "type") else {
        return Err(GatewayError::missing(format!("{field}.type")));
    };
    match kind {
        "text" => {
            if str_field(param, "text").is_none() {
                return Err(GatewayError::missing(format!("{field}.text")));
            }
        }
        "currency" => {
            let Some(currency) = param.get("currency").filter(|c| c.is_object()) else {
                return Err(GatewayError::missing(format!("{field}.currency")));
            };
            if str_field(currency, "fallback_value").is_none() {
                return Err(GatewayError::missing(format!("{field}.currency.fallback_value")));
            }
            if str_field(currency, "code").is_none() {
                return Err(GatewayError::missing(format!("{field}.currency.code")));
            }
            if !currency.get("amount_1000").is_some_and(Value::is_i64) {
                return Err(GatewayError::missing(format!("{field}.currency.amount_1000")));
            }
        }
        "date_time" => {
            let Some(date_time) = param.get("date_time").filter(|d| d.is_object()) else {
                return Err(GatewayError::missing(format!("{field}.date_time")));
            };
            if str_field(date_time, "fallback_value").is_none() {
                return Err(GatewayError::missing(format!(
                    "{field}.date_time.fallback_value"
                )));
            }
        }
        other => {
            return Err(GatewayError::invalid(
                format!("{field}.type"),
                format!("unsupported parameter type '{other}', expected text, currency or date_time"),
            ))
        }
    }
    Ok(())
}

/// Button kinds: `quick_reply` (payload), `cta_phone` (phone_number), `cta_url` (url).
pub fn validate_button(field: &str, button: &Value) -> Result<()> {
    let Some(kind) = str_field(button, "type") else {
        return Err(GatewayError::missing(format!("{field}.type")));
    };
    let required_key = match kind {
        "quick_reply" => "payload",
        "cta_phone" => "phone_number",
        "cta_url" => "url",
        other => {
            return Err(GatewayError::invalid(
                format!("{field}.type"),
                format!(
                    "unsupported button type '{other}', expected quick_reply, cta_phone or cta_url"
                ),
            ))
        }
    };
    if str_field(button, required_key).is_none() {
        return Err(GatewayError::missing(format!("{field}.{required_key}")));
    }
    Ok(())
}

/// Normalizes to `+<country code><digits>`; ten digits assume country code 1.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    let normalized = if digits.len() == 10 {
        format!("+1{digits}")
    } else {
        format!("+{digits}")
    };
    let re = Regex::new(r"^\+\d{10,15}$").ok()?;
    re.is_match(&normalized).then_some(normalized)
}

struct Recipient {
    configuration: WhatsAppConfiguration,
    agent: Agent,
    prefix: TenantPrefix,
    tables: TenantTables,
    customer: Customer,
    to: String,
}

/// One provider call and the row it produces.
#[derive(Debug, Clone)]
struct Unit {
    payload: Value,
    message_type: &'static str,
    text: String,
    media_type: MediaType,
    media_url: Option<String>,
    caption: Option<String>,
    template: Option<String>,
}

struct ResolvedMedia {
    media_id: String,
    metadata: MediaMetadata,
    kind: MediaType,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub media_id: String,
    pub mime_type: String,
}

pub struct OutboundDispatcher {
    store: Arc<dyn Store>,
    api: Arc<dyn WhatsAppApi>,
    media: MediaRelay,
    policy: SessionPolicy,
    cache: Arc<dyn ChatCache>,
    effects: SideEffects,
}

impl OutboundDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        api: Arc<dyn WhatsAppApi>,
        media: MediaRelay,
        policy: SessionPolicy,
        cache: Arc<dyn ChatCache>,
        effects: SideEffects,
    ) -> Self {
        Self {
            store,
            api,
            media,
            policy,
            cache,
            effects,
        }
    }

    pub async fn send(&self, body: &SendMessageBody) -> Result<SendMessageResponse> {
        let request = SendRequest::from_body(body)?;
        let recipient = self.resolve_recipient(&request).await?;

        let session = SessionRequest {
            last_inbound_at: recipient.customer.last_user_message_time,
            now: Utc::now(),
            wants_template: request.kind == MessageKind::Template,
            is_promotional: request.is_promotional,
            has_media: matches!(request.kind, MessageKind::Media(_)),
        };
        let path = self
            .policy
            .resolve_path(
                self.store.as_ref(),
                &recipient.tables,
                recipient.agent.id,
                recipient.agent.credits,
                &session,
                request.category.as_deref(),
            )
            .await?;

        let units = match &path {
            SendPath::FreeForm => match request.kind {
                MessageKind::Media(declared) => {
                    self.media_units(&request, &recipient, declared).await?
                }
                _ => vec![text_unit(
                    &recipient.to,
                    request.message.clone().unwrap_or_default(),
                )],
            },
            SendPath::Template => vec![self.template_unit(&request, &recipient).await?],
            SendPath::ForcedTemplate(template) => vec![forced_template_unit(&recipient.to, template)],
        };

        self.dispatch(&recipient, &path, units).await
    }

    async fn resolve_recipient(&self, request: &SendRequest) -> Result<Recipient> {
        let configuration = self
            .store
            .find_active_configuration(&request.user_id)
            .await?
            .ok_or(GatewayError::NotFound {
                entity: "whatsapp configuration",
            })?;
        let agent = self
            .store
            .find_agent_by_user_id(&request.user_id)
            .await?
            .ok_or(GatewayError::NotFound { entity: "agent" })?;
        let prefix = agent
            .tenant_prefix()
            .map_err(|err| GatewayError::Internal(err.to_string()))?;
        let tables = prefix.tables();

        let digits: String = request
            .customer_phone
            .chars()
            .filter(char::is_ascii_digit)
            .collect();
        if digits.is_empty() {
            return Err(GatewayError::invalid(
                "customer_phone",
                "customer_phone contains no digits",
            ));
        }
        let mut customer = self.store.find_customer_by_phone(&tables, &digits).await?;
        if customer.is_none() && digits.len() == 10 {
            customer = self
                .store
                .find_customer_by_phone(&tables, &format!("1{digits}"))
                .await?;
        }
        let customer = customer.ok_or(GatewayError::NotFound { entity: "customer" })?;

        let to = normalize_phone(&customer.phone_number).ok_or_else(|| {
            GatewayError::invalid(
                "customer_phone",
                format!("phone number '{}' is not a valid E.164 number", customer.phone_number),
            )
        })?;

        Ok(Recipient {
            configuration,
            agent,
            prefix,
            tables,
            customer,
            to,
        })
    }

    async fn template_unit(&self, request: &SendRequest, recipient: &Recipient) -> Result<Unit> {
        let requested = request.template_name.clone().unwrap_or_default();
        let stored = self
            .store
            .find_template_by_name(&recipient.tables, recipient.agent.id, &requested)
            .await?;
        let name = stored
            .as_ref()
            .map(|t| t.provider_name().to_string())
            .unwrap_or(requested);
        let language = request
            .template_language
            .clone()
            .or_else(|| {
                stored
                    .as_ref()
                    .and_then(|t| t.language_code().map(str::to_string))
            })
            .unwrap_or_else(|| DEFAULT_TEMPLATE_LANGUAGE.to_string());

        let mut template = json!({ "name": name, "language": { "code": language } });
        let components = template_components(
            &request.header_params,
            &request.template_params,
            &request.template_buttons,
        );
        if !components.is_empty() {
            template["components"] = Value::Array(components);
        }
        Ok(Unit {
            payload: json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": recipient.to,
                "type": "template",
                "template": template
            }),
            message_type: "template",
            text: name.clone(),
            media_type: MediaType::None,
            media_url: None,
            caption: None,
            template: Some(name),
        })
    }

    async fn media_units(
        &self,
        request: &SendRequest,
        recipient: &Recipient,
        declared: MediaType,
    ) -> Result<Vec<Unit>> {
        let token = &recipient.configuration.access_token;
        let mut resolved = Vec::with_capacity(request.media_ids.len());
        for media_id in &request.media_ids {
            let metadata = self.media.resolve(media_id, token).await?;
            let kind = media_kind_from_mime(&metadata.mime_type);
            resolved.push(ResolvedMedia {
                media_id: media_id.clone(),
                metadata,
                kind,
            });
        }

        if let Some(first) = resolved.first() {
            if resolved.iter().any(|m| m.kind != first.kind) {
                return Err(GatewayError::invalid(
                    "media_ids",
                    "media items mix different formats",
                ));
            }
            if first.kind != declared {
                return Err(GatewayError::invalid(
                    "type",
                    format!("media is {} but type is {declared}", first.kind),
                ));
            }
        }

        let mut units = Vec::with_capacity(resolved.len());
        for (index, media) in resolved.iter().enumerate() {
            let media_url = self
                .media
                .mirror_resolved(
                    &recipient.prefix,
                    &media.media_id,
                    &media.metadata,
                    token,
                    request.filename.as_deref(),
                    MediaFolder::Outgoing,
                )
                .await;
            // only the first image of a batch carries the caption to the provider
            let send_caption = if index == 0 { request.caption.as_deref() } else { None };
            units.push(Unit {
                payload: media_payload(
                    &recipient.to,
                    declared,
                    &media.media_id,
                    send_caption,
                    request.filename.as_deref(),
                ),
                message_type: declared.as_str(),
                text: request.caption.clone().unwrap_or_default(),
                media_type: declared,
                media_url,
                caption: request.caption.clone(),
                template: None,
            });
        }
        Ok(units)
    }

    async fn dispatch(
        &self,
        recipient: &Recipient,
        path: &SendPath,
        units: Vec<Unit>,
    ) -> Result<SendMessageResponse> {
        let configuration = &recipient.configuration;
        let mut message_ids = Vec::with_capacity(units.len());
        let mut details = Vec::with_capacity(units.len());
        let mut credits_charged = 0.0;
        let mut failure: Option<GatewayError> = None;

        for unit in units {
            let reserved = if path.is_template() {
                match self
                    .policy
                    .reserve_template_credits(self.store.as_ref(), recipient.agent.id)
                    .await
                {
                    Ok(balance) => {
                        info!(agent_id = recipient.agent.id, balance, "reserved template credits");
                        true
                    }
                    Err(err) => {
                        warn!(
                            agent_id = recipient.agent.id,
                            error = %err,
                            "template credit reservation failed, aborting batch"
                        );
                        failure = Some(err);
                        break;
                    }
                }
            } else {
                false
            };

            let provider_message_id = match self
                .api
                .send_message(
                    &configuration.phone_number_id,
                    &configuration.access_token,
                    &unit.payload,
                )
                .await
            {
                Ok(id) => id,
                Err(err) => {
                    warn!(
                        agent_id = recipient.agent.id,
                        customer_id = recipient.customer.id,
                        error = %err,
                        "provider rejected outbound message, aborting batch"
                    );
                    if reserved {
                        self.policy
                            .release_template_credits(self.store.as_ref(), recipient.agent.id)
                            .await;
                    }
                    failure = Some(err.into());
                    break;
                }
            };
            if reserved {
                credits_charged += self.policy.template_cost();
            }

            let stored = match self
                .store
                .insert_message(
                    &recipient.tables,
                    &NewMessage {
                        customer_id: recipient.customer.id,
                        message: unit.text.clone(),
                        direction: Direction::Outbound,
                        timestamp: Utc::now(),
                        is_read: true,
                        media_type: unit.media_type,
                        media_url: unit.media_url.clone(),
                        caption: unit.caption.clone(),
                        provider_message_id: Some(provider_message_id.clone()),
                    },
                )
                .await
            {
                Ok(stored) => stored,
                Err(err) => {
                    error!(
                        provider_message_id = %provider_message_id,
                        error = %err,
                        "failed to persist delivered outbound message, aborting batch"
                    );
                    message_ids.push(provider_message_id);
                    failure = Some(err.into());
                    break;
                }
            };
            if let Err(err) = self
                .store
                .record_delivery(&DeliveryLog {
                    provider_message_id: provider_message_id.clone(),
                    agent_id: recipient.agent.id,
                    customer_id: recipient.customer.id,
                    message_id: stored.id,
                    status: "sent".to_string(),
                })
                .await
            {
                warn!(provider_message_id = %provider_message_id, error = %err, "failed to record delivery log");
            }

            details.push(SendDetail {
                message_id: provider_message_id.clone(),
                stored_message_id: Some(stored.id),
                to: recipient.to.clone(),
                message_type: unit.message_type.to_string(),
                template: unit.template,
                media_url: unit.media_url,
            });
            message_ids.push(provider_message_id);
        }

        if !message_ids.is_empty() {
            invalidate_conversation(
                &self.effects,
                self.cache.clone(),
                recipient.agent.id,
                recipient.customer.id,
            );
        }
        if let Some(err) = failure {
            return Err(err);
        }

        info!(
            agent_id = recipient.agent.id,
            customer_id = recipient.customer.id,
            path = path.as_str(),
            sent = message_ids.len(),
            "outbound whatsapp message sent"
        );
        Ok(SendMessageResponse {
            success: true,
            stored_messages: details.len(),
            message_ids,
            details,
            path: path.as_str(),
            credits_charged,
        })
    }

    /// Uploads a file to the provider for the user's active configuration.
    pub async fn upload_media(
        &self,
        user_id: &str,
        bytes: Vec<u8>,
        mime_type: Option<&str>,
        filename: &str,
    ) -> Result<UploadResponse> {
        if user_id.trim().is_empty() {
            return Err(GatewayError::missing("user_id"));
        }
        if bytes.is_empty() {
            return Err(GatewayError::missing("file"));
        }
        let configuration = self
            .store
            .find_active_configuration(user_id.trim())
            .await?
            .ok_or(GatewayError::NotFound {
                entity: "whatsapp configuration",
            })?;
        let mime_type = mime_type
            .map(str::trim)
            .filter(|m| !m.is_empty() && *m != "application/octet-stream")
            .map(str::to_string)
            .or_else(|| {
                media_extension_from_filename(filename)
                    .map(|ext| media_content_type_from_extension(&ext).to_string())
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let media_id = self
            .api
            .upload_media(
                &configuration.phone_number_id,
                &configuration.access_token,
                bytes,
                &mime_type,
                filename,
            )
            .await?;
        info!(user_id, media_id = %media_id, "uploaded media to provider");
        Ok(UploadResponse {
            success: true,
            media_id,
            mime_type,
        })
    }
}

fn text_unit(to: &str, body: String) -> Unit {
    Unit {
        payload: json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": { "preview_url": false, "body": body }
        }),
        message_type: "text",
        text: body,
        media_type: MediaType::None,
        media_url: None,
        caption: None,
        template: None,
    }
}

/// Stored fallback template, sent without parameters.
fn forced_template_unit(to: &str, template: &Template) -> Unit {
    let name = template.provider_name().to_string();
    let language = template
        .language_code()
        .unwrap_or(DEFAULT_TEMPLATE_LANGUAGE);
    Unit {
        payload: json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "template",
            "template": { "name": name, "language": { "code": language } }
        }),
        message_type: "template",
        text: name.clone(),
        media_type: MediaType::None,
        media_url: None,
        caption: None,
        template: Some(name),
    }
}

fn media_payload(
    to: &str,
    kind: MediaType,
    media_id: &str,
    caption: Option<&str>,
    filename: Option<&str>,
) -> Value {
    let mut media = json!({ "id": media_id });
    if let Some(caption) = caption {
        if matches!(kind, MediaType::Image | MediaType::Video | MediaType::Document) {
            media["caption"] = json!(caption);
        }
    }
    if let (MediaType::Document, Some(filename)) = (kind, filename) {
        media["filename"] = json!(filename);
    }
    let mut payload = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": kind.as_str(),
    });
    payload[kind.as_str()] = media;
    payload
}

/// Header and body components carry the caller's parameters as given;
/// buttons are indexed by position unless they name an index.
pub fn template_components(header: &[Value], body: &[Value], buttons: &[Value]) -> Vec<Value> {
    let mut components = vec![];
    if !header.is_empty() {
        components.push(json!({ "type": "header", "parameters": header }));
    }
    if !body.is_empty() {
        components.push(json!({ "type": "body", "parameters": body }));
    }
    for (position, button) in buttons.iter().enumerate() {
        let index = button
            .get("index")
            .and_then(|i| i.as_u64().or_else(|| i.as_str().and_then(|s| s.parse().ok())))
            .unwrap_or(position as u64);
        let (sub_type, parameter) = match str_field(button, "type") {
            Some("quick_reply") => (
                "quick_reply",
                json!({ "type": "payload", "payload": str_field(button, "payload") }),
            ),
            Some("cta_phone") => (
                "voice_call",
                json!({ "type": "text", "text": str_field(button, "phone_number") }),
            ),
            _ => (
                "url",
                json!({ "type": "text", "text": str_field(button, "url") }),
            ),
        };
        components.push(json!({
            "type": "button",
            "sub_type": sub_type,
            "index": index.to_string(),
            "parameters": [parameter]
        }));
    }
    components
}
