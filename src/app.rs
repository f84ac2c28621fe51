use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::effects::{HttpAgentCallback, PgNotifyCache, SideEffects};
use crate::error::{GatewayError, Result};
use crate::graph::GraphClient;
use crate::inbound::{InboundProcessor, VerificationQuery, SIGNATURE_HEADER};
use crate::media::{
    is_safe_media_key, media_content_type_from_extension, LocalObjectStore, MediaRelay,
    ObjectStore, StorageError,
};
use crate::outbound::OutboundDispatcher;
use crate::policy::SessionPolicy;
use crate::store::PgStore;
use crate::types::{AppState, SendMessageBody};

pub async fn run() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    tokio::fs::create_dir_all(&config.media_storage_dir).await?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;
    let store = PgStore::new(pool.clone());
    store.migrate().await?;
    let provisioned = store.provision_all_tenants().await?;
    info!(tenants = provisioned, "tenant tables provisioned");

    let http = reqwest::Client::builder()
        .timeout(config.provider_timeout)
        .build()?;
    let graph = Arc::new(GraphClient::new(
        http.clone(),
        config.graph_base_url.clone(),
        config.graph_version.clone(),
        config.media_upload_timeout,
    ));
    let objects: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(
        config.media_storage_dir.clone(),
        config.public_base_url.clone(),
    ));
    let store = Arc::new(store);
    let cache = Arc::new(PgNotifyCache::new(pool));
    let effects = SideEffects::new();
    let relay = MediaRelay::new(graph.clone(), objects.clone());

    if !config.strict_verification {
        tracing::warn!("webhook verification is permissive; set WHATSAPP_STRICT_VERIFICATION=true to enforce");
    }

    let state = Arc::new(AppState {
        inbound: InboundProcessor::new(
            &config,
            store.clone(),
            relay.clone(),
            cache.clone(),
            Arc::new(HttpAgentCallback::new(
                http,
                config.ai_callback_secret.clone(),
            )),
            effects.clone(),
        ),
        outbound: OutboundDispatcher::new(
            store,
            graph,
            relay,
            SessionPolicy::new(config.session_window, config.template_credit_cost),
            cache,
            effects.clone(),
        ),
        objects,
        effects: effects.clone(),
    });

    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(port = config.port, "whatsapp gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("draining pending side effects");
    effects.drain().await;
    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/whatsapp/webhook",
            get(whatsapp_webhook_verify)
                .post(whatsapp_webhook_event)
                .options(whatsapp_webhook_preflight),
        )
        .route("/api/whatsapp/send", post(send_whatsapp_message))
        .route("/api/whatsapp/media", post(upload_whatsapp_media))
        .route("/api/media/{*key}", get(serve_stored_media))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}

/// Awaits work spawned off the request task, so it completes even when the
/// client disconnects.
async fn detached<T: Send + 'static>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle
        .await
        .map_err(|err| GatewayError::Internal(format!("request task failed: {err}")))?
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": Utc::now().to_rfc3339() }))
}

async fn whatsapp_webhook_verify(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VerificationQuery>,
) -> Response {
    match state.inbound.verify_subscription(&query).await {
        Ok(challenge) => (StatusCode::OK, challenge).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn whatsapp_webhook_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let task = tokio::spawn(async move {
        state
            .inbound
            .handle_delivery(signature.as_deref(), &body)
            .await
    });
    match detached(task).await {
        Ok(summary) => {
            info!(
                messages = summary.messages_stored,
                statuses = summary.statuses_applied,
                "webhook delivery processed"
            );
            (StatusCode::OK, "OK").into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn whatsapp_webhook_preflight() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, X-Hub-Signature-256"),
    );
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    response
}

async fn send_whatsapp_message(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let body: SendMessageBody = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(err) => {
            return GatewayError::invalid("body", format!("invalid JSON body: {err}"))
                .into_response()
        }
    };
    let task = tokio::spawn(async move { state.outbound.send(&body).await });
    match detached(task).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn upload_whatsapp_media(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Response {
    let mut user_id = String::new();
    let mut file: Option<(Vec<u8>, String, Option<String>)> = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                return GatewayError::invalid("file", format!("invalid multipart body: {err}"))
                    .into_response()
            }
        };
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "user_id" => {
                user_id = field.text().await.unwrap_or_default().trim().to_string();
            }
            "file" => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().map(str::to_string);
                match field.bytes().await {
                    Ok(bytes) => file = Some((bytes.to_vec(), filename, content_type)),
                    Err(err) => {
                        return GatewayError::invalid("file", format!("failed to read file: {err}"))
                            .into_response()
                    }
                }
            }
            _ => continue,
        }
    }

    let Some((bytes, filename, content_type)) = file else {
        return GatewayError::missing("file").into_response();
    };
    let task = tokio::spawn(async move {
        state
            .outbound
            .upload_media(&user_id, bytes, content_type.as_deref(), &filename)
            .await
    });
    match detached(task).await {
        Ok(uploaded) => (StatusCode::CREATED, Json(uploaded)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn serve_stored_media(
    Path(key): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if !is_safe_media_key(&key) {
        return GatewayError::invalid("key", "invalid media key").into_response();
    }
    let bytes = match state.objects.get(&key).await {
        Ok(bytes) => bytes,
        Err(StorageError::NotFound(_)) => {
            return GatewayError::NotFound {
                entity: "media file",
            }
            .into_response()
        }
        Err(err) => return GatewayError::Internal(err.to_string()).into_response(),
    };

    let ext = key.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    let mut response = Response::new(Body::from(bytes));
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(media_content_type_from_extension(&ext)),
    );
    response
}
