use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use nanoid::nanoid;
use serde::Serialize;

use crate::error::ProxyError;
use crate::quota_sync::{QuotaReconciler, SyncItemResult, ITEM_OK};
use crate::store::KeyStore;

pub const JOB_IDLE: &str = "idle";
pub const JOB_RUNNING: &str = "running";
pub const JOB_COMPLETED: &str = "completed";
pub const JOB_ERROR: &str = "error";

const MAX_JOB_INTERVAL: Duration = Duration::from_secs(60);

/// Observable progress of the supervised reconciliation job.
#[derive(Debug, Clone, Serialize)]
pub struct SyncJobStatus {
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub interval_ms: u64,
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub items: Vec<SyncItemResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
}

impl SyncJobStatus {
    fn idle() -> Self {
        Self {
            id: String::new(),
            status: JOB_IDLE.to_owned(),
            error: None,
            interval_ms: 0,
            total: 0,
            completed: 0,
            succeeded: 0,
            failed: 0,
            items: Vec::new(),
            started_at: None,
            ended_at: None,
        }
    }
}

/// Single job slot: at most one supervised reconciliation is active at a
/// time, whatever entry point asked for it. Progress is read through deep
/// copies so callers never observe a partially updated slot.
pub struct SyncJobSupervisor {
    store: KeyStore,
    reconciler: QuotaReconciler,
    job: Arc<RwLock<Option<SyncJobStatus>>>,
}

impl SyncJobSupervisor {
    pub fn new(store: KeyStore, reconciler: QuotaReconciler) -> Self {
        Self {
            store,
            reconciler,
            job: Arc::new(RwLock::new(None)),
        }
    }

    /// Snapshot of the current job, `idle` when none was ever started.
    pub fn status(&self) -> SyncJobStatus {
        self.job
            .read()
            .expect("job slot lock poisoned")
            .clone()
            .unwrap_or_else(SyncJobStatus::idle)
    }

    /// Start a background reconciliation over a snapshot of the pool,
    /// pausing `interval` between keys. Idempotent: a second call while one
    /// is running returns the live status and `already_running = true`.
    pub async fn start(
        &self,
        interval: Duration,
    ) -> Result<(SyncJobStatus, bool), ProxyError> {
        let interval = interval.min(MAX_JOB_INTERVAL);

        if let Some(running) = self.running_snapshot() {
            return Ok((running, true));
        }

        let keys = match self.store.list().await {
            Ok(keys) => keys,
            Err(err) => {
                let mut failed = SyncJobStatus::idle();
                failed.status = JOB_ERROR.to_owned();
                failed.error = Some(err.to_string());
                *self.job.write().expect("job slot lock poisoned") = Some(failed);
                return Err(err);
            }
        };

        let job = {
            let mut slot = self.job.write().expect("job slot lock poisoned");
            // Re-check: another caller may have won the slot while the key
            // list was loading.
            if let Some(existing) = slot.as_ref() {
                if existing.status == JOB_RUNNING {
                    return Ok((existing.clone(), true));
                }
            }

            let job = SyncJobStatus {
                id: nanoid!(10),
                status: JOB_RUNNING.to_owned(),
                error: None,
                interval_ms: interval.as_millis() as u64,
                total: keys.len(),
                completed: 0,
                succeeded: 0,
                failed: 0,
                items: keys.iter().map(SyncItemResult::pending).collect(),
                started_at: Some(Utc::now().timestamp()),
                ended_at: None,
            };
            *slot = Some(job.clone());
            job
        };

        let slot = self.job.clone();
        let reconciler = self.reconciler.clone();
        let job_id = job.id.clone();
        tokio::spawn(async move {
            run_job(slot, reconciler, job_id, keys, interval).await;
        });

        Ok((job, false))
    }

    fn running_snapshot(&self) -> Option<SyncJobStatus> {
        let slot = self.job.read().expect("job slot lock poisoned");
        slot.as_ref()
            .filter(|job| job.status == JOB_RUNNING)
            .cloned()
    }
}

async fn run_job(
    slot: Arc<RwLock<Option<SyncJobStatus>>>,
    reconciler: QuotaReconciler,
    job_id: String,
    keys: Vec<crate::store::ApiKey>,
    interval: Duration,
) {
    for (idx, key) in keys.iter().enumerate() {
        if idx > 0 && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }

        let item = reconciler.sync_key(key).await;

        let mut guard = slot.write().expect("job slot lock poisoned");
        let Some(job) = guard.as_mut().filter(|job| job.id == job_id) else {
            // A newer job took the slot; this worker is stale.
            return;
        };
        if item.status == ITEM_OK {
            job.succeeded += 1;
        } else {
            job.failed += 1;
        }
        job.items[idx] = item;
        job.completed += 1;
    }

    let mut guard = slot.write().expect("job slot lock poisoned");
    if let Some(job) = guard.as_mut().filter(|job| job.id == job_id) {
        job.status = JOB_COMPLETED.to_owned();
        job.ended_at = Some(Utc::now().timestamp());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Json, Router};
    use serde_json::Value;

    async fn spawn_usage_upstream() -> String {
        async fn handle() -> (StatusCode, Json<Value>) {
            (
                StatusCode::OK,
                Json(serde_json::json!({"key": {"usage": 1, "limit": 1000}})),
            )
        }
        let app = Router::new().route("/usage", get(handle));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve upstream");
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn start_is_idempotent_and_reports_progress_to_completion() {
        let upstream = spawn_usage_upstream().await;
        let path = std::env::temp_dir().join(format!("sync-job-{}.db", nanoid!(8)));
        let store = KeyStore::open(&path.to_string_lossy())
            .await
            .expect("store opened");
        let reconciler =
            QuotaReconciler::new(&upstream, Duration::from_secs(5), store.clone())
                .expect("reconciler");
        let supervisor = SyncJobSupervisor::new(store.clone(), reconciler);

        assert_eq!(supervisor.status().status, JOB_IDLE);

        for i in 0..3 {
            store
                .create(&format!("tvly-test-{i}"), "test", 1000)
                .await
                .expect("create");
        }

        let (started, already_running) =
            supervisor.start(Duration::ZERO).await.expect("start");
        assert!(!already_running);
        assert_eq!(started.status, JOB_RUNNING);
        assert_eq!(started.total, 3);
        assert!(started.started_at.is_some());
        assert!(started.items.iter().all(|item| item.status == "pending"));

        let (again, already_running) =
            supervisor.start(Duration::ZERO).await.expect("start again");
        assert!(already_running);
        assert_eq!(again.id, started.id);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let got = supervisor.status();
            if got.status != JOB_RUNNING {
                assert_eq!(got.status, JOB_COMPLETED);
                assert_eq!(got.completed, got.total);
                assert_eq!(got.succeeded, got.total);
                assert_eq!(got.failed, 0);
                assert!(got.started_at.is_some());
                assert!(got.ended_at.is_some());
                for item in &got.items {
                    assert_eq!(item.status, ITEM_OK);
                }
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for job completion"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // The slot is free again once the job completed.
        let (rerun, already_running) =
            supervisor.start(Duration::ZERO).await.expect("restart");
        assert!(!already_running);
        assert_ne!(rerun.id, started.id);

        let _ = std::fs::remove_file(path);
    }
}
