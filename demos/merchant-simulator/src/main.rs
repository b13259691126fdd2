//! Mock webhook endpoint used to exercise the dispatcher end to end.
//! Adapted from the teacher's merchant simulator: now verifies
//! `X-Signature` against a configured secret and records the
//! `X-Event-Id`/`X-Event-Type` headers actually sent by the dispatcher,
//! instead of trusting payload-embedded ids.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
struct AppState {
    secret: Option<Arc<Vec<u8>>>,
    received: Arc<RwLock<Vec<ReceivedWebhook>>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ReceivedWebhook {
    event_id: Option<Uuid>,
    event_type: Option<String>,
    signature_valid: Option<bool>,
    payload: serde_json::Value,
    received_at: String,
}

#[derive(Serialize)]
struct StatsResponse {
    total_received: usize,
    unique_event_ids: usize,
    webhooks: Vec<ReceivedWebhook>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let secret = std::env::var("WEBHOOK_SECRET").ok().map(|s| Arc::new(s.into_bytes()));
    let state = AppState { secret, received: Arc::new(RwLock::new(Vec::new())) };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/webhooks", post(receive_webhook))
        .route("/stats", get(get_stats))
        .route("/reset", post(reset_webhooks))
        .with_state(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "4000".to_string());
    let instance = std::env::var("INSTANCE_NAME").unwrap_or_else(|_| "merchant".to_string());

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await.unwrap();

    info!("merchant simulator ({}) listening on port {}", instance, port);

    axum::serve(listener, app).await.unwrap();
}

async fn health_check() -> &'static str {
    "OK"
}

async fn receive_webhook(State(state): State<AppState>, headers: HeaderMap, body: axum::body::Bytes) -> (StatusCode, String) {
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("invalid JSON: {e}")),
    };

    let event_id = headers.get("X-Event-Id").and_then(|v| v.to_str().ok()).and_then(|s| Uuid::parse_str(s).ok());
    let event_type = headers.get("X-Event-Type").and_then(|v| v.to_str().ok()).map(|s| s.to_string());
    let signature_valid = state.secret.as_ref().map(|secret| verify_signature(secret, &headers, &body));

    if let Some(false) = signature_valid {
        warn!(?event_id, "rejected webhook with invalid signature");
        return (StatusCode::UNAUTHORIZED, "invalid signature".to_string());
    }

    let webhook = ReceivedWebhook {
        event_id,
        event_type: event_type.clone(),
        signature_valid,
        payload,
        received_at: chrono::Utc::now().to_rfc3339(),
    };

    state.received.write().push(webhook);
    info!(?event_id, event_type = event_type.as_deref(), "webhook received");

    (StatusCode::OK, "received".to_string())
}

fn verify_signature(secret: &[u8], headers: &HeaderMap, body: &[u8]) -> bool {
    let Some(provided) = headers.get("X-Signature").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    expected == provided
}

async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let webhooks = state.received.read().clone();
    let unique_event_ids: HashSet<Uuid> = webhooks.iter().filter_map(|w| w.event_id).collect();

    Json(StatsResponse { total_received: webhooks.len(), unique_event_ids: unique_event_ids.len(), webhooks })
}

async fn reset_webhooks(State(state): State<AppState>) -> (StatusCode, String) {
    state.received.write().clear();
    info!("state reset");
    (StatusCode::OK, "reset".to_string())
}
