use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::{self, Body},
    extract::{ConnectInfo, Path, Query, State},
    http::{
        header::{CONNECTION, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING},
        HeaderMap, HeaderValue, Request, Response, StatusCode,
    },
    response::{IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::ProxyError;
use crate::master_key::MasterKey;
use crate::mcp;
use crate::proxy::{Dispatcher, ProxyRequest, ProxyResponse};
use crate::stats::StatsAggregator;
use crate::store::{
    mask_key, ApiKey, KeyPatch, KeyStore, SETTING_AUTO_SYNC_ENABLED,
    SETTING_AUTO_SYNC_INTERVAL_MINUTES, SETTING_AUTO_SYNC_LAST_ERROR,
    SETTING_AUTO_SYNC_LAST_RUN_AT, SETTING_AUTO_SYNC_LAST_SUCCESS_AT,
    SETTING_AUTO_SYNC_REQUEST_INTERVAL_SECONDS, SETTING_LOG_CLEANUP_LAST_ERROR,
    SETTING_LOG_CLEANUP_LAST_RUN_AT, SETTING_LOG_RETENTION_DAYS,
    SETTING_REQUEST_LOGGING_ENABLED,
};
use crate::sync_job::SyncJobSupervisor;

const BODY_LIMIT: usize = 16 * 1024 * 1024;

pub struct AppState {
    pub dispatcher: Dispatcher,
    pub store: KeyStore,
    pub master: Arc<MasterKey>,
    pub stats: StatsAggregator,
    pub supervisor: Arc<SyncJobSupervisor>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Transparently proxied upstream surface.
        .route("/search", post(proxy_handler))
        .route("/extract", post(proxy_handler))
        .route("/crawl", post(proxy_handler))
        .route("/map", post(proxy_handler))
        .route("/usage", get(proxy_handler))
        // Tool-server facade.
        .route("/mcp", post(mcp::handle))
        // Admin API.
        .route("/api/keys", get(list_keys).post(create_key))
        .route("/api/keys/export", get(export_keys))
        .route("/api/keys/invalid", delete(delete_invalid_keys))
        .route(
            "/api/keys/:id",
            get(get_key).put(update_key).delete(delete_key),
        )
        .route("/api/logs", get(list_logs))
        .route("/api/logs/status-codes", get(log_status_codes))
        .route("/api/stats", get(get_stats))
        .route("/api/stats/timeseries", get(get_time_series))
        .route(
            "/api/quota-sync",
            get(quota_sync_status).post(start_quota_sync),
        )
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/master-key/reset", post(reset_master_key))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> Result<(), std::io::Error> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    tracing::info!(addr = %bound, "tavily-relay listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

async fn health_check() -> &'static str {
    "ok"
}

fn unauthorized() -> Response<Body> {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "unauthorized"})),
    )
        .into_response()
}

fn internal_error(err: &ProxyError) -> Response<Body> {
    error!(error = %err, "admin handler failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal_error"})),
    )
        .into_response()
}

/// Admin endpoints accept only the bearer master key.
fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response<Body>> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or("");
    if state.master.authenticate(token) {
        Ok(())
    } else {
        Err(unauthorized())
    }
}

// ----- proxied surface -----

async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
) -> Response<Body> {
    let (parts, raw_body) = request.into_parts();

    let body = match body::to_bytes(raw_body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid_body"})),
            )
                .into_response()
        }
    };

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let client_ip = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();

    let proxy_request = ProxyRequest {
        method: parts.method.clone(),
        path: parts.uri.path().to_owned(),
        query: parts.uri.query().map(str::to_owned),
        headers: parts.headers.clone(),
        body,
        client_ip,
        content_type,
    };

    match state.dispatcher.dispatch(proxy_request).await {
        Ok(response) => build_response(response),
        Err(err) => error_response(err),
    }
}

fn error_response(err: ProxyError) -> Response<Body> {
    match err {
        ProxyError::Unauthorized => unauthorized(),
        ProxyError::NoKeysAvailable => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "no_keys_available"})),
        )
            .into_response(),
        ProxyError::UpstreamTransport(source) => {
            error!(error = %source, "upstream unreachable");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "upstream_unreachable"})),
            )
                .into_response()
        }
        other => internal_error(&other),
    }
}

/// Relay an upstream response, dropping hop-by-hop headers and recomputing
/// the content length.
fn build_response(response: ProxyResponse) -> Response<Body> {
    let mut builder = Response::builder().status(response.status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in response.headers.iter() {
            if name == TRANSFER_ENCODING || name == CONNECTION || name == CONTENT_LENGTH {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        headers.insert(CONTENT_LENGTH, content_length_value(response.body.len()));
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| Response::builder().status(500).body(Body::empty()).unwrap())
}

fn content_length_value(len: usize) -> HeaderValue {
    HeaderValue::from_str(&len.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

// ----- admin: keys -----

#[derive(Debug, Serialize)]
struct ApiKeyView {
    id: i64,
    key: String,
    alias: String,
    total_quota: i64,
    used_quota: i64,
    remaining: i64,
    is_active: bool,
    is_invalid: bool,
    last_used_at: Option<i64>,
    created_at: i64,
}

impl From<ApiKey> for ApiKeyView {
    fn from(key: ApiKey) -> Self {
        Self {
            id: key.id,
            key: mask_key(&key.key),
            alias: key.alias.clone(),
            total_quota: key.total_quota,
            used_quota: key.used_quota,
            remaining: key.remaining(),
            is_active: key.is_active,
            is_invalid: key.is_invalid,
            last_used_at: key.last_used_at,
            created_at: key.created_at,
        }
    }
}

async fn list_keys(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response<Body> {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    match state.store.list().await {
        Ok(keys) => {
            Json(keys.into_iter().map(ApiKeyView::from).collect::<Vec<_>>()).into_response()
        }
        Err(err) => internal_error(&err),
    }
}

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    key: String,
    #[serde(default)]
    alias: String,
    #[serde(default)]
    total_quota: i64,
}

async fn create_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateKeyRequest>,
) -> Response<Body> {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let key = payload.key.trim();
    if key.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing_key"})),
        )
            .into_response();
    }
    match state
        .store
        .create(key, payload.alias.trim(), payload.total_quota)
        .await
    {
        Ok(created) => (StatusCode::CREATED, Json(ApiKeyView::from(created))).into_response(),
        Err(err) => internal_error(&err),
    }
}

async fn get_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response<Body> {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    match state.store.find(id).await {
        Ok(Some(key)) => Json(ApiKeyView::from(key)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({"error": "not_found"}))).into_response(),
        Err(err) => internal_error(&err),
    }
}

async fn update_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(patch): Json<KeyPatch>,
) -> Response<Body> {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    match state.store.update(id, patch).await {
        Ok(updated) => Json(ApiKeyView::from(updated)).into_response(),
        Err(ProxyError::Database(sqlx::Error::RowNotFound)) => {
            (StatusCode::NOT_FOUND, Json(json!({"error": "not_found"}))).into_response()
        }
        Err(err) => internal_error(&err),
    }
}

async fn delete_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response<Body> {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    match state.store.delete(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => internal_error(&err),
    }
}

async fn delete_invalid_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response<Body> {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    match state.store.delete_invalid().await {
        Ok(deleted) => Json(json!({"deleted": deleted})).into_response(),
        Err(err) => internal_error(&err),
    }
}

/// Newline-separated secrets in id-descending order, invalid keys excluded.
async fn export_keys(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response<Body> {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let keys = match state.store.list().await {
        Ok(keys) => keys,
        Err(err) => return internal_error(&err),
    };

    let exported: Vec<String> = keys
        .into_iter()
        .filter(|key| !key.is_invalid)
        .map(|key| key.key)
        .collect();
    let count = exported.len();
    let body = exported.join("\n");

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(
            CONTENT_DISPOSITION,
            "attachment; filename=\"tavily-keys.txt\"",
        )
        .header("X-Exported-Count", count.to_string())
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::builder().status(500).body(Body::empty()).unwrap())
}

// ----- admin: logs -----

#[derive(Debug, Deserialize)]
struct LogsQuery {
    page: Option<i64>,
    page_size: Option<i64>,
    status_code: Option<String>,
}

async fn list_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<LogsQuery>,
) -> Response<Body> {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }

    let status_code = match params.status_code.as_deref() {
        None | Some("") => None,
        Some(raw) => match raw.parse::<i64>() {
            Ok(code) => Some(code),
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "invalid_status_code"})),
                )
                    .into_response()
            }
        },
    };

    match state
        .store
        .list_logs(
            params.page.unwrap_or(1),
            params.page_size.unwrap_or(20),
            status_code,
        )
        .await
    {
        Ok(page) => Json(page).into_response(),
        Err(err) => internal_error(&err),
    }
}

async fn log_status_codes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response<Body> {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    match state.store.status_code_counts().await {
        Ok(counts) => Json(counts).into_response(),
        Err(err) => internal_error(&err),
    }
}

// ----- admin: stats -----

async fn get_stats(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response<Body> {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    match state.stats.snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => internal_error(&err),
    }
}

#[derive(Debug, Deserialize)]
struct TimeSeriesQuery {
    granularity: Option<String>,
}

async fn get_time_series(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<TimeSeriesQuery>,
) -> Response<Body> {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    match state
        .stats
        .time_series(params.granularity.as_deref().unwrap_or(""))
        .await
    {
        Ok(series) => Json(series).into_response(),
        Err(ProxyError::InvalidGranularity) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_granularity"})),
        )
            .into_response(),
        Err(err) => internal_error(&err),
    }
}

// ----- admin: quota sync -----

#[derive(Debug, Deserialize, Default)]
struct StartSyncRequest {
    #[serde(default)]
    interval_seconds: u64,
}

async fn start_quota_sync(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<StartSyncRequest>>,
) -> Response<Body> {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let interval = Duration::from_secs(body.map(|Json(b)| b.interval_seconds).unwrap_or(0));
    match state.supervisor.start(interval).await {
        Ok((status, already_running)) => Json(json!({
            "job": status,
            "already_running": already_running,
        }))
        .into_response(),
        Err(err) => internal_error(&err),
    }
}

async fn quota_sync_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response<Body> {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    Json(state.supervisor.status()).into_response()
}

// ----- admin: settings -----

async fn get_settings(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response<Body> {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }

    let store = &state.store;
    let view: Result<Value, ProxyError> = async {
        Ok(json!({
            "request_logging_enabled":
                store.get_bool_setting(SETTING_REQUEST_LOGGING_ENABLED, true).await?,
            "auto_sync_enabled":
                store.get_bool_setting(SETTING_AUTO_SYNC_ENABLED, false).await?,
            "auto_sync_interval_minutes":
                store.get_i64_setting(SETTING_AUTO_SYNC_INTERVAL_MINUTES, 60).await?,
            "auto_sync_request_interval_seconds":
                store.get_i64_setting(SETTING_AUTO_SYNC_REQUEST_INTERVAL_SECONDS, 0).await?,
            "auto_sync_last_run_at": store.get_ts_setting(SETTING_AUTO_SYNC_LAST_RUN_AT).await?,
            "auto_sync_last_success_at":
                store.get_ts_setting(SETTING_AUTO_SYNC_LAST_SUCCESS_AT).await?,
            "auto_sync_last_error": store.get_setting(SETTING_AUTO_SYNC_LAST_ERROR).await?,
            "log_retention_days": store.get_i64_setting(SETTING_LOG_RETENTION_DAYS, 30).await?,
            "log_cleanup_last_run_at":
                store.get_ts_setting(SETTING_LOG_CLEANUP_LAST_RUN_AT).await?,
            "log_cleanup_last_error": store.get_setting(SETTING_LOG_CLEANUP_LAST_ERROR).await?,
        }))
    }
    .await;

    match view {
        Ok(view) => Json(view).into_response(),
        Err(err) => internal_error(&err),
    }
}

#[derive(Debug, Deserialize)]
struct SettingsPatch {
    request_logging_enabled: Option<bool>,
    auto_sync_enabled: Option<bool>,
    auto_sync_interval_minutes: Option<i64>,
    auto_sync_request_interval_seconds: Option<i64>,
    log_retention_days: Option<i64>,
}

async fn put_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(patch): Json<SettingsPatch>,
) -> Response<Body> {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }

    let store = &state.store;
    let outcome: Result<(), ProxyError> = async {
        if let Some(enabled) = patch.request_logging_enabled {
            store
                .set_setting(SETTING_REQUEST_LOGGING_ENABLED, bool_str(enabled))
                .await?;
        }
        if let Some(enabled) = patch.auto_sync_enabled {
            store
                .set_setting(SETTING_AUTO_SYNC_ENABLED, bool_str(enabled))
                .await?;
        }
        if let Some(minutes) = patch.auto_sync_interval_minutes {
            store
                .set_setting(
                    SETTING_AUTO_SYNC_INTERVAL_MINUTES,
                    &minutes.max(1).to_string(),
                )
                .await?;
        }
        if let Some(seconds) = patch.auto_sync_request_interval_seconds {
            store
                .set_setting(
                    SETTING_AUTO_SYNC_REQUEST_INTERVAL_SECONDS,
                    &seconds.clamp(0, 60).to_string(),
                )
                .await?;
        }
        if let Some(days) = patch.log_retention_days {
            store
                .set_setting(SETTING_LOG_RETENTION_DAYS, &days.to_string())
                .await?;
        }
        Ok(())
    }
    .await;

    match outcome {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => internal_error(&err),
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

async fn reset_master_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response<Body> {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    match state.master.reset().await {
        Ok(fresh) => Json(json!({"master_key": fresh})).into_response(),
        Err(err) => internal_error(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota_sync::QuotaReconciler;
    use crate::store::NewRequestLog;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use nanoid::nanoid;
    use tower::ServiceExt;

    async fn build_state(upstream: &str, prefix: &str) -> (Arc<AppState>, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("{}-{}.db", prefix, nanoid!(8)));
        let store = KeyStore::open(&path.to_string_lossy())
            .await
            .expect("store opened");
        let master = Arc::new(
            MasterKey::load_or_create(store.clone())
                .await
                .expect("master key"),
        );
        let stats = StatsAggregator::new(store.clone());
        let dispatcher = Dispatcher::new(
            upstream,
            Duration::from_secs(5),
            store.clone(),
            master.clone(),
            stats.clone(),
        )
        .expect("dispatcher");
        let reconciler =
            QuotaReconciler::new(upstream, Duration::from_secs(5), store.clone())
                .expect("reconciler");
        let supervisor = Arc::new(SyncJobSupervisor::new(store.clone(), reconciler));

        (
            Arc::new(AppState {
                dispatcher,
                store,
                master,
                stats,
                supervisor,
            }),
            path,
        )
    }

    async fn spawn_ok_upstream() -> String {
        async fn handle() -> (StatusCode, Json<Value>) {
            (StatusCode::OK, Json(json!({"results": []})))
        }
        let app = Router::new()
            .route("/search", post(handle))
            .route("/usage", get(handle));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    async fn body_json(response: Response<Body>) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn admin_get(state: &AppState, uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("GET")
            .uri(uri)
            .header("Authorization", format!("Bearer {}", state.master.get()))
            .body(Body::empty())
            .expect("request")
    }

    #[tokio::test]
    async fn export_excludes_invalid_keys_and_counts() {
        let upstream = spawn_ok_upstream().await;
        let (state, path) = build_state(&upstream, "server-export").await;
        let router = build_router(state.clone());

        state
            .store
            .create("tvly-active", "active", 1000)
            .await
            .expect("create");

        let exhausted = state
            .store
            .create("tvly-exhausted", "exhausted", 1000)
            .await
            .expect("create");
        state
            .store
            .mark_exhausted(exhausted.id)
            .await
            .expect("exhaust");

        let invalid = state
            .store
            .create("tvly-invalid", "invalid", 1000)
            .await
            .expect("create");
        state.store.mark_invalid(invalid.id).await.expect("invalid");

        let response = router
            .oneshot(admin_get(&state, "/api/keys/export"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("attachment"))
            .unwrap_or(false));
        assert_eq!(
            response
                .headers()
                .get("X-Exported-Count")
                .and_then(|v| v.to_str().ok()),
            Some("2")
        );

        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        // Listing is id-descending; the invalid key is filtered out.
        let body = String::from_utf8(bytes.to_vec()).expect("utf8");
        assert_eq!(body, "tvly-exhausted\ntvly-active");

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn logs_filter_by_status_code_and_reject_invalid() {
        let upstream = spawn_ok_upstream().await;
        let (state, path) = build_state(&upstream, "server-logs").await;
        let router = build_router(state.clone());

        for (request_id, endpoint, status) in [
            ("a", "/search", 200),
            ("b", "/search", 429),
            ("c", "/usage", 200),
        ] {
            state
                .store
                .insert_log(NewRequestLog {
                    request_id: request_id.to_owned(),
                    endpoint: endpoint.to_owned(),
                    status_code: status,
                    client_ip: "127.0.0.1".to_owned(),
                    api_key_id: None,
                    duration_ms: 3,
                    upstream_status: Some(status),
                })
                .await
                .expect("insert log");
        }

        let response = router
            .clone()
            .oneshot(admin_get(
                &state,
                "/api/logs?page=1&page_size=20&status_code=200",
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let page = body_json(response).await;
        assert_eq!(page["total"], 2);
        let items = page["items"].as_array().expect("items");
        assert_eq!(items.len(), 2);
        for item in items {
            assert_eq!(item["status_code"], 200);
        }

        let response = router
            .clone()
            .oneshot(admin_get(&state, "/api/logs?status_code=abc"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "invalid_status_code");

        let response = router
            .oneshot(admin_get(&state, "/api/logs/status-codes"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let counts = body_json(response).await;
        let counts = counts.as_array().expect("array");
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0]["status_code"], 200);
        assert_eq!(counts[0]["count"], 2);
        assert_eq!(counts[1]["status_code"], 429);
        assert_eq!(counts[1]["count"], 1);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn proxy_requires_some_master_credential() {
        let upstream = spawn_ok_upstream().await;
        let (state, path) = build_state(&upstream, "server-auth").await;
        let router = build_router(state.clone());

        state
            .store
            .create("tvly-pool", "pool", 1000)
            .await
            .expect("create");

        // No credential at all.
        let response = router
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/search")
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"query":"hi"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "unauthorized");

        // Legacy query parameter carrying the master key.
        let uri = format!("/usage?api_key={}&foo=bar", state.master.get());
        let response = router
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method("GET")
                    .uri(uri)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        // A foreign upstream-shaped key in the body is rejected.
        let response = router
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/search")
                    .header("Content-Type", "application/json")
                    .body(Body::from(
                        r#"{"query":"hi","api_key":"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"}"#,
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn admin_endpoints_reject_non_master_bearer() {
        let upstream = spawn_ok_upstream().await;
        let (state, path) = build_state(&upstream, "server-admin-auth").await;
        let router = build_router(state);

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .method("GET")
                    .uri("/api/keys")
                    .header("Authorization", "Bearer wrong")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn time_series_rejects_unknown_granularity_with_400() {
        let upstream = spawn_ok_upstream().await;
        let (state, path) = build_state(&upstream, "server-series").await;
        let router = build_router(state.clone());

        let response = router
            .clone()
            .oneshot(admin_get(&state, "/api/stats/timeseries?granularity=week"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "invalid_granularity");

        let response = router
            .oneshot(admin_get(&state, "/api/stats/timeseries?granularity=day"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let series = body_json(response).await;
        assert_eq!(series["labels"].as_array().expect("labels").len(), 30);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn list_keys_masks_secrets() {
        let upstream = spawn_ok_upstream().await;
        let (state, path) = build_state(&upstream, "server-mask").await;
        let router = build_router(state.clone());

        state
            .store
            .create("tvly-dev-1234567890abcd", "a", 1000)
            .await
            .expect("create");

        let response = router
            .oneshot(admin_get(&state, "/api/keys"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let keys = body_json(response).await;
        assert_eq!(keys[0]["key"], "tvly-****abcd");

        let _ = std::fs::remove_file(path);
    }
}
