//! WhatsApp Cloud (Graph) API client.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::header;
use reqwest::multipart;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ProviderError;

/// Metadata returned for a provider-hosted media object.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaMetadata {
    /// Short-lived signed download URL. Never persisted.
    pub url: String,
    pub mime_type: String,
}

#[derive(Debug, Clone)]
pub struct DownloadedMedia {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// The subset of the Cloud API the pipeline talks to.
#[async_trait]
pub trait WhatsAppApi: Send + Sync {
    async fn media_metadata(
        &self,
        media_id: &str,
        access_token: &str,
    ) -> Result<MediaMetadata, ProviderError>;

    async fn download_media(
        &self,
        url: &str,
        access_token: &str,
    ) -> Result<DownloadedMedia, ProviderError>;

    /// Sends one message payload and returns the provider message id.
    async fn send_message(
        &self,
        phone_number_id: &str,
        access_token: &str,
        payload: &Value,
    ) -> Result<String, ProviderError>;

    /// Uploads bytes to the provider and returns the new media id.
    async fn upload_media(
        &self,
        phone_number_id: &str,
        access_token: &str,
        bytes: Vec<u8>,
        mime_type: &str,
        filename: &str,
    ) -> Result<String, ProviderError>;
}

#[derive(Clone)]
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    version: String,
    upload_timeout: Duration,
}

impl GraphClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        version: impl Into<String>,
        upload_timeout: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            version: version.into(),
            upload_timeout,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.version, path)
    }
}

async fn error_from_response(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let raw_body = response.text().await.unwrap_or_default();
    let body =
        serde_json::from_str::<Value>(&raw_body).unwrap_or_else(|_| json!({ "raw": raw_body }));
    ProviderError::Status { status, body }
}

fn message_id_from_response(body: &Value) -> Result<String, ProviderError> {
    body.get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| messages.first())
        .and_then(|message| message.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ProviderError::MissingField("messages[0].id"))
}

#[async_trait]
impl WhatsAppApi for GraphClient {
    async fn media_metadata(
        &self,
        media_id: &str,
        access_token: &str,
    ) -> Result<MediaMetadata, ProviderError> {
        let response = self
            .http
            .get(self.endpoint(media_id))
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let metadata = response.json::<Value>().await.unwrap_or_else(|_| json!({}));
        let url = metadata
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if url.is_empty() {
            return Err(ProviderError::MissingField("url"));
        }
        let mime_type = metadata
            .get("mime_type")
            .and_then(Value::as_str)
            .unwrap_or("application/octet-stream")
            .to_string();
        Ok(MediaMetadata { url, mime_type })
    }

    async fn download_media(
        &self,
        url: &str,
        access_token: &str,
    ) -> Result<DownloadedMedia, ProviderError> {
        let response = self.http.get(url).bearer_auth(access_token).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = response.bytes().await?;
        Ok(DownloadedMedia {
            bytes: bytes.to_vec(),
            content_type,
        })
    }

    async fn send_message(
        &self,
        phone_number_id: &str,
        access_token: &str,
        payload: &Value,
    ) -> Result<String, ProviderError> {
        let response = self
            .http
            .post(self.endpoint(&format!("{phone_number_id}/messages")))
            .bearer_auth(access_token)
            .json(payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let body = response.json::<Value>().await.unwrap_or_else(|_| json!({}));
        let message_id = message_id_from_response(&body)?;
        debug!(phone_number_id, provider_message_id = %message_id, "message accepted by provider");
        Ok(message_id)
    }

    async fn upload_media(
        &self,
        phone_number_id: &str,
        access_token: &str,
        bytes: Vec<u8>,
        mime_type: &str,
        filename: &str,
    ) -> Result<String, ProviderError> {
        let part = multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime_type)?;
        let form = multipart::Form::new()
            .text("messaging_product", "whatsapp")
            .text("type", mime_type.to_string())
            .part("file", part);

        let response = self
            .http
            .post(self.endpoint(&format!("{phone_number_id}/media")))
            .bearer_auth(access_token)
            .timeout(self.upload_timeout)
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let body = response.json::<Value>().await.unwrap_or_else(|_| json!({}));
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(ProviderError::MissingField("id"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_version() {
        let client = GraphClient::new(
            reqwest::Client::new(),
            "https://graph.facebook.com/",
            "v21.0",
            Duration::from_secs(30),
        );
        assert_eq!(
            client.endpoint("123/messages"),
            "https://graph.facebook.com/v21.0/123/messages"
        );
    }

    #[test]
    fn test_message_id_from_response() {
        let body = json!({
            "messaging_product": "whatsapp",
            "contacts": [{ "input": "+15551234567", "wa_id": "15551234567" }],
            "messages": [{ "id": "wamid.HBgL" }]
        });
        assert_eq!(message_id_from_response(&body).unwrap(), "wamid.HBgL");
        assert!(matches!(
            message_id_from_response(&json!({ "messages": [] })),
            Err(ProviderError::MissingField(_))
        ));
    }
}
