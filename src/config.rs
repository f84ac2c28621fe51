//! Configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub database_max_connections: u32,
    pub graph_base_url: String,
    pub graph_version: String,
    /// Environment-level verify token, used when the tenant has none.
    pub verify_token: Option<String>,
    /// Environment-level app secret, used when the tenant has none.
    pub app_secret: Option<String>,
    /// Reject unverifiable webhook traffic instead of logging and continuing.
    pub strict_verification: bool,
    pub template_credit_cost: f64,
    pub session_window: Duration,
    pub media_storage_dir: PathBuf,
    pub public_base_url: String,
    pub provider_timeout: Duration,
    pub media_upload_timeout: Duration,
    pub ai_callback_secret: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `PORT` | `4000` |
    /// | `DATABASE_URL` | built from `POSTGRES_*` / `PG*` |
    /// | `DATABASE_MAX_CONNECTIONS` | `10` |
    /// | `WHATSAPP_GRAPH_BASE_URL` | `https://graph.facebook.com` |
    /// | `WHATSAPP_GRAPH_VERSION` | `v21.0` |
    /// | `WHATSAPP_VERIFY_TOKEN` | unset |
    /// | `WHATSAPP_APP_SECRET` | unset |
    /// | `WHATSAPP_STRICT_VERIFICATION` | `false` |
    /// | `TEMPLATE_CREDIT_COST` | `0.01` |
    /// | `SESSION_WINDOW_HOURS` | `24` |
    /// | `MEDIA_STORAGE_DIR` | `./media_uploads` |
    /// | `API_PUBLIC_URL` | `http://localhost:{PORT}` |
    /// | `PROVIDER_TIMEOUT_SECS` | `30` |
    /// | `MEDIA_UPLOAD_TIMEOUT_SECS` | `30` |
    /// | `AI_CALLBACK_SECRET` | unset |
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_var("PORT", 4000u16)?;
        let public_base_url = optional_var("API_PUBLIC_URL")
            .unwrap_or_else(|| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();

        let template_credit_cost = parse_var("TEMPLATE_CREDIT_COST", 0.01f64)?;
        if !template_credit_cost.is_finite() || template_credit_cost < 0.0 {
            return Err(ConfigError::Invalid("TEMPLATE_CREDIT_COST"));
        }
        let window_hours = parse_var("SESSION_WINDOW_HOURS", 24u64)?;
        if window_hours == 0 {
            return Err(ConfigError::Invalid("SESSION_WINDOW_HOURS"));
        }

        Ok(Self {
            port,
            database_url: resolve_database_url(),
            database_max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 10u32)?,
            graph_base_url: optional_var("WHATSAPP_GRAPH_BASE_URL")
                .unwrap_or_else(|| "https://graph.facebook.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            graph_version: optional_var("WHATSAPP_GRAPH_VERSION")
                .unwrap_or_else(|| "v21.0".to_string()),
            verify_token: optional_var("WHATSAPP_VERIFY_TOKEN"),
            app_secret: optional_var("WHATSAPP_APP_SECRET"),
            strict_verification: parse_bool_var("WHATSAPP_STRICT_VERIFICATION")?,
            template_credit_cost,
            session_window: Duration::from_secs(window_hours * 60 * 60),
            media_storage_dir: optional_var("MEDIA_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./media_uploads")),
            public_base_url,
            provider_timeout: Duration::from_secs(parse_var("PROVIDER_TIMEOUT_SECS", 30u64)?),
            media_upload_timeout: Duration::from_secs(parse_var(
                "MEDIA_UPLOAD_TIMEOUT_SECS",
                30u64,
            )?),
            ai_callback_secret: optional_var("AI_CALLBACK_SECRET"),
        })
    }

    pub fn reply_url(&self) -> String {
        format!("{}/api/whatsapp/send", self.public_base_url)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}")]
    Invalid(&'static str),
}

fn optional_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match optional_var(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid(key)),
        None => Ok(default),
    }
}

fn parse_bool_var(key: &'static str) -> Result<bool, ConfigError> {
    match optional_var(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid(key)),
        },
    }
}

fn resolve_database_url() -> String {
    if let Some(url) = optional_var("DATABASE_URL") {
        return url;
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_default();
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "wa_gateway".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

#[cfg(test)]
impl Config {
    pub(crate) fn for_tests() -> Self {
        Self {
            port: 4000,
            database_url: "postgres://localhost/wa_gateway_test".to_string(),
            database_max_connections: 1,
            graph_base_url: "https://graph.test".to_string(),
            graph_version: "v21.0".to_string(),
            verify_token: None,
            app_secret: None,
            strict_verification: false,
            template_credit_cost: 0.01,
            session_window: Duration::from_secs(24 * 60 * 60),
            media_storage_dir: PathBuf::from("./media_uploads"),
            public_base_url: "https://gateway.test".to_string(),
            provider_timeout: Duration::from_secs(30),
            media_upload_timeout: Duration::from_secs(30),
            ai_callback_secret: None,
        }
    }
}
