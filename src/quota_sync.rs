use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::{stream, StreamExt};
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::error::{classify_status, ProxyError, UpstreamFailure};
use crate::store::{ApiKey, KeyStore};

pub const ITEM_OK: &str = "ok";
pub const ITEM_ERROR: &str = "error";
pub const ITEM_PENDING: &str = "pending";

const DEFAULT_CONCURRENCY: usize = 4;
const MAX_CONCURRENCY: usize = 32;
const MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of reconciling one key.
#[derive(Debug, Clone, Serialize)]
pub struct SyncItemResult {
    pub id: i64,
    pub alias: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_quota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_quota: Option<i64>,
}

impl SyncItemResult {
    pub fn pending(key: &ApiKey) -> Self {
        Self {
            id: key.id,
            alias: key.alias.clone(),
            status: ITEM_PENDING.to_owned(),
            error: None,
            used_quota: None,
            total_quota: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub items: Vec<SyncItemResult>,
    pub started_at: i64,
    pub ended_at: i64,
}

/// Reconciles server-side usage against the upstream's authoritative
/// `/usage` endpoint, one key at a time or across the whole pool with
/// bounded concurrency and globally paced call starts.
#[derive(Clone)]
pub struct QuotaReconciler {
    client: Client,
    base: Url,
    store: KeyStore,
}

impl QuotaReconciler {
    pub fn new(
        upstream_base: &str,
        timeout: Duration,
        store: KeyStore,
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
        })
    }

    /// Reconcile a single key by id. Errors bubble the item's failure.
    pub async fn sync_one(&self, id: i64) -> Result<SyncItemResult, ProxyError> {
        let key = self.store.get(id).await?;
        let item = self.sync_key(&key).await;
        if item.status != ITEM_OK {
            let message = item.error.clone().unwrap_or_else(|| "sync failed".to_owned());
            return Err(ProxyError::Other(message));
        }
        Ok(item)
    }

    /// Reconcile one key and classify the failure. A 401 marks the key
    /// invalid, a 432/433 marks it exhausted; anything else (including 429)
    /// leaves key state untouched.
    pub async fn sync_key(&self, key: &ApiKey) -> SyncItemResult {
        let mut item = SyncItemResult {
            id: key.id,
            alias: key.alias.clone(),
            status: ITEM_ERROR.to_owned(),
            error: None,
            used_quota: None,
            total_quota: None,
        };

        let (usage, limit) = match self.fetch_usage(&key.key).await {
            Ok(parsed) => parsed,
            Err(err) => {
                match err.upstream_status().and_then(classify_status) {
                    Some(UpstreamFailure::InvalidKey) => {
                        if let Err(mark_err) = self.store.mark_invalid(key.id).await {
                            warn!(key_id = key.id, error = %mark_err, "failed to mark key invalid");
                        }
                    }
                    Some(UpstreamFailure::Exhausted) => {
                        if let Err(mark_err) = self.store.mark_exhausted(key.id).await {
                            warn!(key_id = key.id, error = %mark_err, "failed to mark key exhausted");
                        }
                    }
                    _ => {}
                }
                item.error = Some(err.to_string());
                return item;
            }
        };

        let mut total = key.total_quota;
        if let Some(limit) = limit {
            if limit > 0 {
                total = limit;
            }
        }
        let used = if total > 0 && usage > total {
            total
        } else {
            usage
        };

        if let Err(err) = self.store.set_usage(key.id, used, Some(total)).await {
            item.error = Some(err.to_string());
            return item;
        }

        item.status = ITEM_OK.to_owned();
        item.used_quota = Some(used);
        item.total_quota = Some(total);
        item
    }

    async fn fetch_usage(&self, secret: &str) -> Result<(i64, Option<i64>), ProxyError> {
        let mut url = self.base.clone();
        url.set_path("/usage");

        let response = self
            .client
            .get(url)
            .bearer_auth(secret)
            .send()
            .await
            .map_err(ProxyError::UpstreamTransport)?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(ProxyError::UpstreamTransport)?;

        if !status.is_success() {
            return Err(ProxyError::UpstreamStatus {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        let json: Value = serde_json::from_slice(&bytes)
            .map_err(|err| ProxyError::Other(format!("invalid usage payload: {err}")))?;
        let usage = json
            .get("key")
            .and_then(|k| k.get("usage"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let limit = json
            .get("key")
            .and_then(|k| k.get("limit"))
            .and_then(Value::as_i64);

        Ok((usage, limit))
    }

    /// Reconcile every key in the pool. `concurrency` is clamped to [1, 32]
    /// and then to the key count; `interval` (clamped to [0, 60 s]) is the
    /// minimum spacing between the starts of successive upstream calls
    /// across all workers. Items come back in input order.
    pub async fn sync_all(
        &self,
        concurrency: usize,
        interval: Duration,
    ) -> Result<SyncReport, ProxyError> {
        let started_at = Utc::now().timestamp();
        let keys = self.store.list().await?;

        if keys.is_empty() {
            return Ok(SyncReport {
                total: 0,
                succeeded: 0,
                failed: 0,
                items: Vec::new(),
                started_at,
                ended_at: Utc::now().timestamp(),
            });
        }

        let concurrency = if concurrency == 0 {
            DEFAULT_CONCURRENCY
        } else {
            concurrency
        }
        .min(MAX_CONCURRENCY)
        .min(keys.len());
        let interval = interval.min(MAX_INTERVAL);

        let gate: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));

        let mut results: Vec<Option<SyncItemResult>> = vec![None; keys.len()];
        let mut completed = stream::iter(keys.iter().cloned().enumerate().map(|(idx, key)| {
            let gate = gate.clone();
            async move {
                wait_for_slot(&gate, interval).await;
                (idx, self.sync_key(&key).await)
            }
        }))
        .buffer_unordered(concurrency);

        while let Some((idx, item)) = completed.next().await {
            results[idx] = Some(item);
        }
        drop(completed);

        let items: Vec<SyncItemResult> = results
            .into_iter()
            .map(|item| item.expect("every key produces a result"))
            .collect();
        let succeeded = items.iter().filter(|item| item.status == ITEM_OK).count();

        Ok(SyncReport {
            total: items.len(),
            succeeded,
            failed: items.len() - succeeded,
            items,
            started_at,
            ended_at: Utc::now().timestamp(),
        })
    }
}

/// Global pacing gate: each caller claims the next start slot under the
/// mutex, then sleeps outside of it. Dropping the caller's future aborts
/// the wait.
async fn wait_for_slot(gate: &Mutex<Option<Instant>>, interval: Duration) {
    if interval.is_zero() {
        return;
    }
    let deadline = {
        let mut next = gate.lock().await;
        let now = Instant::now();
        match *next {
            Some(at) if at > now => {
                *next = Some(at + interval);
                at
            }
            _ => {
                *next = Some(now + interval);
                return;
            }
        }
    };
    tokio::time::sleep_until(deadline).await;
}
