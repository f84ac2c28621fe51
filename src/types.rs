use std::{fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::effects::SideEffects;
use crate::inbound::InboundProcessor;
use crate::media::ObjectStore;
use crate::outbound::OutboundDispatcher;
use crate::tenant::{InvalidPrefix, TenantPrefix};

#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    pub id: i64,
    pub user_id: String,
    pub prefix: String,
    pub credits: f64,
    pub business_type: Option<String>,
}

impl Agent {
    /// Re-validates the stored prefix; rows written by other services are not trusted.
    pub fn tenant_prefix(&self) -> Result<TenantPrefix, InvalidPrefix> {
        TenantPrefix::parse(&self.prefix)
    }
}

#[derive(Debug, Clone)]
pub struct WhatsAppConfiguration {
    pub id: i64,
    pub user_id: String,
    pub access_token: String,
    pub phone_number_id: String,
    pub webhook_url: Option<String>,
    pub verify_token: Option<String>,
    pub app_secret: Option<String>,
    pub is_active: bool,
}

impl WhatsAppConfiguration {
    pub fn callback_url(&self) -> Option<&str> {
        self.webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Customer {
    pub id: i64,
    pub phone_number: String,
    pub name: String,
    pub last_user_message_time: Option<DateTime<Utc>>,
    pub ai_enabled: bool,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    None,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::None => "none",
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Document => "document",
            MediaType::Sticker => "sticker",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(MediaType::None),
            "image" => Ok(MediaType::Image),
            "video" => Ok(MediaType::Video),
            "audio" => Ok(MediaType::Audio),
            "document" => Ok(MediaType::Document),
            "sticker" => Ok(MediaType::Sticker),
            other => Err(format!("unknown media type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: i64,
    pub customer_id: i64,
    pub message: String,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    pub media_type: MediaType,
    pub media_url: Option<String>,
    pub caption: Option<String>,
    pub provider_message_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub customer_id: i64,
    pub message: String,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    pub media_type: MediaType,
    pub media_url: Option<String>,
    pub caption: Option<String>,
    pub provider_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Template {
    pub id: i64,
    pub agent_id: i64,
    pub name: String,
    pub category: String,
    pub is_active: bool,
    pub body: Value,
}

impl Template {
    /// Name registered with the provider, which may differ from the display name.
    pub fn provider_name(&self) -> &str {
        self.body
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.name)
    }

    pub fn language_code(&self) -> Option<&str> {
        let language = self.body.get("language")?;
        language
            .as_str()
            .or_else(|| language.get("code").and_then(Value::as_str))
            .filter(|code| !code.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryLog {
    pub provider_message_id: String,
    pub agent_id: i64,
    pub customer_id: i64,
    pub message_id: i64,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct DeliveryStatusUpdate {
    pub provider_message_id: String,
    pub status: String,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendMessageBody {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
    #[serde(default, rename = "type")]
    pub message_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub template_name: Option<String>,
    #[serde(default)]
    pub template_language: Option<String>,
    #[serde(default)]
    pub template_params: Option<Vec<Value>>,
    #[serde(default)]
    pub header_params: Option<Vec<Value>>,
    #[serde(default)]
    pub template_buttons: Option<Vec<Value>>,
    #[serde(default)]
    pub media_id: Option<String>,
    #[serde(default)]
    pub media_ids: Option<Vec<String>>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub is_promotional: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendDetail {
    pub message_id: String,
    pub stored_message_id: Option<i64>,
    pub to: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendMessageResponse {
    pub success: bool,
    pub message_ids: Vec<String>,
    pub stored_messages: usize,
    pub details: Vec<SendDetail>,
    pub path: &'static str,
    pub credits_charged: f64,
}

pub struct AppState {
    pub inbound: InboundProcessor,
    pub outbound: OutboundDispatcher,
    pub objects: Arc<dyn ObjectStore>,
    pub effects: SideEffects,
}
