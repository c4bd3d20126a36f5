use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Local, NaiveDate, TimeZone};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::quota_sync::QuotaReconciler;
use crate::store::{
    KeyStore, SETTING_AUTO_SYNC_ENABLED, SETTING_AUTO_SYNC_INTERVAL_MINUTES,
    SETTING_AUTO_SYNC_LAST_ERROR, SETTING_AUTO_SYNC_LAST_RUN_AT,
    SETTING_AUTO_SYNC_LAST_SUCCESS_AT, SETTING_AUTO_SYNC_REQUEST_INTERVAL_SECONDS,
    SETTING_LOG_CLEANUP_LAST_ERROR, SETTING_LOG_CLEANUP_LAST_RUN_AT, SETTING_LOG_RETENTION_DAYS,
};

const AUTO_SYNC_TICK: Duration = Duration::from_secs(30);
const LOG_CLEANUP_TICK: Duration = Duration::from_secs(30 * 60);
const LOG_CLEANUP_MIN_SPACING_SECS: i64 = 24 * 3600;
const LOG_CLEANUP_DEADLINE: Duration = Duration::from_secs(5 * 60);
const DEFAULT_LOG_RETENTION_DAYS: i64 = 30;

/// Timer-driven quota reconciliation. Reads its knobs from settings on
/// every tick, keeps a dedicated latch so at most one run is in flight,
/// and publishes its outcome through the well-known settings keys.
pub fn spawn_auto_sync(
    store: KeyStore,
    reconciler: QuotaReconciler,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let running = Arc::new(AtomicBool::new(false));
        let mut ticker = tokio::time::interval(AUTO_SYNC_TICK);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if let Err(err) = run_auto_sync_once(&store, &reconciler, &running).await {
                error!(error = %err, "auto-sync cycle failed");
            }
        }
    })
}

/// One gating pass of the auto-sync driver. Returns whether a sync was
/// actually kicked off.
pub(crate) async fn run_auto_sync_once(
    store: &KeyStore,
    reconciler: &QuotaReconciler,
    running: &Arc<AtomicBool>,
) -> Result<bool, crate::error::ProxyError> {
    if running.load(Ordering::SeqCst) {
        return Ok(false);
    }

    if !store.get_bool_setting(SETTING_AUTO_SYNC_ENABLED, false).await? {
        return Ok(false);
    }

    let interval_minutes = store
        .get_i64_setting(SETTING_AUTO_SYNC_INTERVAL_MINUTES, 60)
        .await?
        .max(1);
    let request_interval_seconds = store
        .get_i64_setting(SETTING_AUTO_SYNC_REQUEST_INTERVAL_SECONDS, 0)
        .await?
        .clamp(0, 60);

    let now = chrono::Utc::now().timestamp();
    if let Some(last_run) = store.get_ts_setting(SETTING_AUTO_SYNC_LAST_RUN_AT).await? {
        if now - last_run < interval_minutes * 60 {
            return Ok(false);
        }
    }

    if running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(false);
    }

    let store = store.clone();
    let reconciler = reconciler.clone();
    let running = running.clone();
    tokio::spawn(async move {
        let _ = store.set_ts_setting(SETTING_AUTO_SYNC_LAST_RUN_AT, now).await;

        let outcome = reconciler
            .sync_all(1, Duration::from_secs(request_interval_seconds as u64))
            .await;
        match outcome {
            Ok(report) => {
                let _ = store
                    .set_ts_setting(
                        SETTING_AUTO_SYNC_LAST_SUCCESS_AT,
                        chrono::Utc::now().timestamp(),
                    )
                    .await;
                let _ = store.set_setting(SETTING_AUTO_SYNC_LAST_ERROR, "").await;
                info!(
                    total = report.total,
                    failed = report.failed,
                    interval_seconds = request_interval_seconds,
                    "auto-sync completed"
                );
            }
            Err(err) => {
                let _ = store
                    .set_setting(SETTING_AUTO_SYNC_LAST_ERROR, &err.to_string())
                    .await;
                error!(error = %err, "auto-sync failed");
            }
        }
        running.store(false, Ordering::SeqCst);
    });

    Ok(true)
}

/// Timer-driven request-log retention.
pub fn spawn_log_cleanup(store: KeyStore, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LOG_CLEANUP_TICK);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match run_log_cleanup_once(&store).await {
                Ok(Some(deleted)) => info!(deleted, "log cleanup completed"),
                Ok(None) => {}
                Err(err) => error!(error = %err, "log cleanup cycle failed"),
            }
        }
    })
}

/// One gating pass of log cleanup. `Ok(None)` means the pass was skipped
/// (disabled or ran within the last 24 h).
pub(crate) async fn run_log_cleanup_once(
    store: &KeyStore,
) -> Result<Option<u64>, crate::error::ProxyError> {
    let retention_days = store
        .get_i64_setting(SETTING_LOG_RETENTION_DAYS, DEFAULT_LOG_RETENTION_DAYS)
        .await?;
    if retention_days <= 0 {
        return Ok(None);
    }

    let now = chrono::Utc::now().timestamp();
    if let Some(last_run) = store.get_ts_setting(SETTING_LOG_CLEANUP_LAST_RUN_AT).await? {
        if now - last_run < LOG_CLEANUP_MIN_SPACING_SECS {
            return Ok(None);
        }
    }
    store
        .set_ts_setting(SETTING_LOG_CLEANUP_LAST_RUN_AT, now)
        .await?;

    let cutoff_date = Local::now().date_naive() - ChronoDuration::days(retention_days);
    let cutoff = local_midnight_ts(cutoff_date);

    // The delete runs under its own deadline so a wedged database cannot
    // stall the driver past this tick.
    let deleted = match tokio::time::timeout(LOG_CLEANUP_DEADLINE, store.delete_logs_before(cutoff))
        .await
    {
        Ok(Ok(deleted)) => deleted,
        Ok(Err(err)) => {
            store
                .set_setting(SETTING_LOG_CLEANUP_LAST_ERROR, &err.to_string())
                .await?;
            return Err(err);
        }
        Err(_) => {
            let message = "log cleanup timed out";
            store
                .set_setting(SETTING_LOG_CLEANUP_LAST_ERROR, message)
                .await?;
            return Err(crate::error::ProxyError::Other(message.to_owned()));
        }
    };

    store.set_setting(SETTING_LOG_CLEANUP_LAST_ERROR, "").await?;
    Ok(Some(deleted))
}

/// At each local midnight, reset all usage counters when a new month began.
pub fn spawn_monthly_reset(store: KeyStore, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Local::now();
            let next_midnight = now.date_naive() + ChronoDuration::days(1);
            let until = (local_midnight_ts(next_midnight) - now.timestamp()).max(1) as u64;

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(until)) => {}
            }

            if is_first_of_month(next_midnight) {
                match store.reset_all_usage().await {
                    Ok(()) => info!("monthly quota reset completed"),
                    Err(err) => error!(error = %err, "monthly quota reset failed"),
                }
            }
        }
    })
}

fn is_first_of_month(date: NaiveDate) -> bool {
    use chrono::Datelike;
    date.day() == 1
}

/// Unix timestamp of local midnight on the given date. Falls back to the
/// earliest valid instant on DST transition days.
fn local_midnight_ts(date: NaiveDate) -> i64 {
    let naive = date.and_hms_opt(0, 0, 0).expect("valid midnight");
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
        .unwrap_or_else(|| naive.and_utc().timestamp())
}
