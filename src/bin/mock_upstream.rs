//! In-memory stand-in for the Tavily API, used for local development and
//! manual testing of the pool proxy. Keys are registered through the admin
//! endpoints; every successful call burns one credit. A forced response can
//! be armed to exercise the proxy's failure classification.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;

#[derive(Parser, Debug)]
#[command(about = "Mock Tavily upstream")]
struct Cli {
    /// Address to bind the mock upstream.
    #[arg(long, env = "MOCK_UPSTREAM_ADDR", default_value = "127.0.0.1:58088")]
    bind: SocketAddr,
}

#[derive(Clone, Debug)]
struct KeyRecord {
    limit: i64,
    usage: i64,
}

#[derive(Clone, Debug, Deserialize)]
struct ForcedResponse {
    status: u16,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    once: bool,
    #[serde(default)]
    delay_ms: Option<u64>,
}

#[derive(Default)]
struct MockState {
    keys: RwLock<HashMap<String, KeyRecord>>,
    forced: RwLock<Option<ForcedResponse>>,
}

#[derive(Deserialize)]
struct AddKeyRequest {
    secret: String,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    usage: i64,
}

fn default_limit() -> i64 {
    1_000
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let state = Arc::new(MockState::default());

    let app = Router::new()
        .route("/search", post(handle_api))
        .route("/extract", post(handle_api))
        .route("/crawl", post(handle_api))
        .route("/map", post(handle_api))
        .route("/usage", get(handle_usage))
        .route("/admin/keys", post(add_key).get(list_keys))
        .route("/admin/keys/:secret", axum::routing::delete(delete_key))
        .route(
            "/admin/force-response",
            post(set_forced).delete(clear_forced),
        )
        .with_state(state);

    println!("Mock Tavily upstream listening on http://{}", cli.bind);
    axum::serve(tokio::net::TcpListener::bind(cli.bind).await?, app).await?;
    Ok(())
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(|s| s.trim().to_owned())
}

async fn take_forced(state: &MockState) -> Option<ForcedResponse> {
    let mut forced = state.forced.write().await;
    let current = forced.clone()?;
    if current.once {
        *forced = None;
    }
    Some(current)
}

async fn handle_api(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    if let Some(forced) = take_forced(&state).await {
        if let Some(delay) = forced.delay_ms {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let body = forced
            .body
            .unwrap_or_else(|| json!({"error": "forced_response"}));
        return (
            StatusCode::from_u16(forced.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(body),
        );
    }

    let Some(secret) = bearer(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "missing bearer token"})),
        );
    };

    let mut keys = state.keys.write().await;
    let Some(record) = keys.get_mut(&secret) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unknown key"})),
        );
    };
    if record.usage >= record.limit {
        return (
            StatusCode::from_u16(433).unwrap(),
            Json(json!({"error": "quota_exhausted"})),
        );
    }
    record.usage += 1;

    let echo: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (
        StatusCode::OK,
        Json(json!({
            "request_id": format!("mock-{}", record.usage),
            "results": [],
            "echo": echo,
        })),
    )
}

async fn handle_usage(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Some(forced) = take_forced(&state).await {
        if let Some(delay) = forced.delay_ms {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let body = forced
            .body
            .unwrap_or_else(|| json!({"error": "forced_response"}));
        return (
            StatusCode::from_u16(forced.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(body),
        );
    }

    let Some(secret) = bearer(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "missing bearer token"})),
        );
    };

    let keys = state.keys.read().await;
    match keys.get(&secret) {
        Some(record) => (
            StatusCode::OK,
            Json(json!({"key": {"usage": record.usage, "limit": record.limit}})),
        ),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unknown key"})),
        ),
    }
}

async fn add_key(
    State(state): State<Arc<MockState>>,
    Json(payload): Json<AddKeyRequest>,
) -> impl IntoResponse {
    let mut keys = state.keys.write().await;
    keys.insert(
        payload.secret.clone(),
        KeyRecord {
            limit: payload.limit,
            usage: payload.usage,
        },
    );
    (StatusCode::CREATED, Json(json!({"secret": payload.secret})))
}

async fn list_keys(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    let keys = state.keys.read().await;
    let view: Vec<Value> = keys
        .iter()
        .map(|(secret, record)| {
            json!({"secret": secret, "usage": record.usage, "limit": record.limit})
        })
        .collect();
    Json(view)
}

async fn delete_key(
    State(state): State<Arc<MockState>>,
    Path(secret): Path<String>,
) -> impl IntoResponse {
    let mut keys = state.keys.write().await;
    if keys.remove(&secret).is_some() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn set_forced(
    State(state): State<Arc<MockState>>,
    Json(forced): Json<ForcedResponse>,
) -> impl IntoResponse {
    *state.forced.write().await = Some(forced);
    StatusCode::NO_CONTENT
}

async fn clear_forced(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    *state.forced.write().await = None;
    StatusCode::NO_CONTENT
}
