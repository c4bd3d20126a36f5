use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use chrono::Local;
use nanoid::nanoid;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST},
    Client, Method, StatusCode, Url,
};
use serde_json::Value;
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::error::{classify_status, ProxyError, UpstreamFailure};
use crate::master_key::MasterKey;
use crate::stats::StatsAggregator;
use crate::store::{ApiKey, KeyStore, NewRequestLog, SETTING_REQUEST_LOGGING_ENABLED};

/// Headers that never cross the proxy in either direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// One inbound client request, already buffered by the HTTP edge.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug)]
struct SanitizedParts {
    body: Bytes,
    query: Option<String>,
}

/// The pool dispatcher. Strips client credentials, walks the candidate
/// list, debits on success, rotates on retryable failures and records one
/// request-log row per dispatch.
#[derive(Clone)]
pub struct Dispatcher {
    client: Client,
    base: Url,
    store: KeyStore,
    master: Arc<MasterKey>,
    stats: StatsAggregator,
}

impl Dispatcher {
    pub fn new(
        upstream_base: &str,
        timeout: Duration,
        store: KeyStore,
        master: Arc<MasterKey>,
        stats: StatsAggregator,
    ) -> Result<Self, ProxyError> {
        let base = Url::parse(upstream_base).map_err(|source| ProxyError::InvalidEndpoint {
            endpoint: upstream_base.to_owned(),
            source,
        })?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ProxyError::UpstreamTransport)?;
        Ok(Self {
            client,
            base,
            store,
            master,
            stats,
        })
    }

    pub fn upstream_base(&self) -> &Url {
        &self.base
    }

    /// Forward one client request through the pool.
    pub async fn dispatch(&self, request: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let started = Instant::now();
        let sanitized = self.sanitize(&request)?;

        let candidates = self.store.candidates().await?;
        if candidates.is_empty() {
            self.write_log(&request, StatusCode::SERVICE_UNAVAILABLE.as_u16(), None, None, started)
                .await;
            return Err(ProxyError::NoKeysAvailable);
        }

        let mut last_response: Option<ProxyResponse> = None;
        let mut last_transport: Option<reqwest::Error> = None;

        for candidate in candidates {
            let response = match self.forward(&request, &sanitized, &candidate).await {
                Ok(response) => response,
                Err(err) => {
                    debug!(key_id = candidate.id, error = %err, "upstream transport failure, rotating");
                    last_transport = Some(err);
                    continue;
                }
            };

            match classify_status(response.status.as_u16()) {
                None => {
                    self.store.increment_used(candidate.id).await?;
                    self.write_log(
                        &request,
                        response.status.as_u16(),
                        Some(candidate.id),
                        Some(response.status.as_u16()),
                        started,
                    )
                    .await;
                    self.tick_stats(&request.path);
                    return Ok(response);
                }
                Some(UpstreamFailure::InvalidKey) => {
                    self.store.mark_invalid(candidate.id).await?;
                    last_response = Some(response);
                }
                Some(UpstreamFailure::Exhausted) => {
                    self.store.mark_exhausted(candidate.id).await?;
                    last_response = Some(response);
                }
                Some(UpstreamFailure::RateLimit) => {
                    last_response = Some(response);
                }
                Some(UpstreamFailure::OtherStatus(code)) if code >= 500 => {
                    last_response = Some(response);
                }
                Some(UpstreamFailure::OtherStatus(_)) | Some(UpstreamFailure::Transport) => {
                    // Client-side 4xx: the caller's problem, not the key's.
                    self.write_log(
                        &request,
                        response.status.as_u16(),
                        Some(candidate.id),
                        Some(response.status.as_u16()),
                        started,
                    )
                    .await;
                    return Ok(response);
                }
            }
        }

        match last_response {
            Some(response) => {
                self.write_log(
                    &request,
                    response.status.as_u16(),
                    None,
                    Some(response.status.as_u16()),
                    started,
                )
                .await;
                Ok(response)
            }
            None => {
                self.write_log(&request, StatusCode::BAD_GATEWAY.as_u16(), None, None, started)
                    .await;
                Err(ProxyError::UpstreamTransport(
                    last_transport.expect("loop produced neither response nor error"),
                ))
            }
        }
    }

    /// Strip client credentials and decide whether the request may pass.
    /// The upstream only ever sees the pool credential.
    fn sanitize(&self, request: &ProxyRequest) -> Result<SanitizedParts, ProxyError> {
        let bearer_ok = bearer_token(&request.headers)
            .map(|token| self.master.authenticate(token))
            .unwrap_or(false);

        let mut admin_via_field = false;

        let body = match extract_body_api_key(&request.body) {
            Some((value, stripped)) => {
                if !self.master.authenticate(&value) {
                    return Err(ProxyError::Unauthorized);
                }
                admin_via_field = true;
                stripped
            }
            None => request.body.clone(),
        };

        let query = match &request.query {
            Some(raw) => {
                let (rebuilt, api_key) = split_query_api_key(raw);
                if let Some(value) = api_key {
                    if !self.master.authenticate(&value) {
                        return Err(ProxyError::Unauthorized);
                    }
                    admin_via_field = true;
                }
                rebuilt
            }
            None => None,
        };

        if !bearer_ok && !admin_via_field {
            return Err(ProxyError::Unauthorized);
        }

        Ok(SanitizedParts { body, query })
    }

    async fn forward(
        &self,
        request: &ProxyRequest,
        sanitized: &SanitizedParts,
        candidate: &ApiKey,
    ) -> Result<ProxyResponse, reqwest::Error> {
        let mut url = self.base.clone();
        url.set_path(&request.path);
        url.set_query(sanitized.query.as_deref());

        let mut builder = self.client.request(request.method.clone(), url);
        for (name, value) in request.headers.iter() {
            let lower = name.as_str().to_ascii_lowercase();
            if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            // Host/Content-Length are recomputed; the client credential is
            // replaced with the pool credential below.
            if name == HOST || name == CONTENT_LENGTH || name == AUTHORIZATION {
                continue;
            }
            builder = builder.header(name, value);
        }
        if let Some(content_type) = &request.content_type {
            if !request.headers.contains_key(CONTENT_TYPE) {
                if let Ok(value) = HeaderValue::from_str(content_type) {
                    builder = builder.header(CONTENT_TYPE, value);
                }
            }
        }
        builder = builder.bearer_auth(&candidate.key);

        let response = builder.body(sanitized.body.clone()).send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }

    async fn write_log(
        &self,
        request: &ProxyRequest,
        status_code: u16,
        api_key_id: Option<i64>,
        upstream_status: Option<u16>,
        started: Instant,
    ) {
        let enabled = match self
            .store
            .get_bool_setting(SETTING_REQUEST_LOGGING_ENABLED, true)
            .await
        {
            Ok(enabled) => enabled,
            Err(err) => {
                warn!(error = %err, "failed to read request logging setting");
                return;
            }
        };
        if !enabled {
            return;
        }

        let entry = NewRequestLog {
            request_id: nanoid!(12),
            endpoint: request.path.clone(),
            status_code: i64::from(status_code),
            client_ip: request.client_ip.clone(),
            api_key_id,
            duration_ms: started.elapsed().as_millis() as i64,
            upstream_status: upstream_status.map(i64::from),
        };
        if let Err(err) = self.store.insert_log(entry).await {
            warn!(error = %err, "failed to write request log");
        }
    }

    /// Stats are best-effort and must never hold up the client response.
    fn tick_stats(&self, endpoint: &str) {
        let stats = self.stats.clone();
        let endpoint = endpoint.to_owned();
        tokio::spawn(async move {
            if let Err(err) = stats.record(&endpoint, Local::now()).await {
                warn!(error = %err, endpoint = %endpoint, "failed to record request stats");
            }
        });
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Pull a top-level `api_key` string out of a JSON object body. Returns the
/// value together with the body re-serialized without the field; `None`
/// when the body is not a JSON object or carries no such field.
fn extract_body_api_key(body: &Bytes) -> Option<(String, Bytes)> {
    if body.is_empty() {
        return None;
    }
    let mut parsed: Value = serde_json::from_slice(body).ok()?;
    let object = parsed.as_object_mut()?;
    let value = object.remove("api_key")?;
    let value = value.as_str()?.to_owned();
    let stripped = serde_json::to_vec(&parsed).ok()?;
    Some((value, Bytes::from(stripped)))
}

/// Remove the `api_key` pair from a raw query string, keeping every other
/// parameter intact. Returns the rebuilt query (None when nothing is left)
/// and the removed value, if any.
fn split_query_api_key(raw: &str) -> (Option<String>, Option<String>) {
    let mut api_key = None;
    let mut rest = form_urlencoded::Serializer::new(String::new());
    let mut kept_any = false;

    for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
        if key == "api_key" {
            api_key = Some(value.into_owned());
        } else {
            rest.append_pair(&key, &value);
            kept_any = true;
        }
    }

    let rebuilt = kept_any.then(|| rest.finish());
    (rebuilt, api_key)
}
