use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::ProxyError;

pub const DEFAULT_TOTAL_QUOTA: i64 = 1000;

/// One pooled upstream key.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ApiKey {
    pub id: i64,
    pub key: String,
    pub alias: String,
    pub total_quota: i64,
    pub used_quota: i64,
    pub is_active: bool,
    pub is_invalid: bool,
    pub last_used_at: Option<i64>,
    pub created_at: i64,
}

impl ApiKey {
    pub fn remaining(&self) -> i64 {
        (self.total_quota - self.used_quota).max(0)
    }
}

/// Admin patch for a key. Fields left `None` keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyPatch {
    pub alias: Option<String>,
    pub total_quota: Option<i64>,
    pub used_quota: Option<i64>,
    pub is_active: Option<bool>,
    pub is_invalid: Option<bool>,
    #[serde(default)]
    pub reset_quota: bool,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RequestLog {
    pub id: i64,
    pub request_id: String,
    pub endpoint: String,
    pub status_code: i64,
    pub client_ip: String,
    pub api_key_id: Option<i64>,
    pub duration_ms: i64,
    pub upstream_status: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewRequestLog {
    pub request_id: String,
    pub endpoint: String,
    pub status_code: i64,
    pub client_ip: String,
    pub api_key_id: Option<i64>,
    pub duration_ms: i64,
    pub upstream_status: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaginatedLogs {
    pub items: Vec<RequestLog>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StatusCodeCount {
    pub status_code: i64,
    pub count: i64,
}

// Well-known settings keys. Background drivers publish their outcome here
// instead of through a message bus.
pub const SETTING_MASTER_KEY: &str = "master_key";
pub const SETTING_REQUEST_LOGGING_ENABLED: &str = "request_logging_enabled";
pub const SETTING_AUTO_SYNC_ENABLED: &str = "auto_sync_enabled";
pub const SETTING_AUTO_SYNC_INTERVAL_MINUTES: &str = "auto_sync_interval_minutes";
pub const SETTING_AUTO_SYNC_REQUEST_INTERVAL_SECONDS: &str = "auto_sync_request_interval_seconds";
pub const SETTING_AUTO_SYNC_LAST_RUN_AT: &str = "auto_sync_last_run_at";
pub const SETTING_AUTO_SYNC_LAST_SUCCESS_AT: &str = "auto_sync_last_success_at";
pub const SETTING_AUTO_SYNC_LAST_ERROR: &str = "auto_sync_last_error";
pub const SETTING_LOG_RETENTION_DAYS: &str = "log_retention_days";
pub const SETTING_LOG_CLEANUP_LAST_RUN_AT: &str = "log_cleanup_last_run_at";
pub const SETTING_LOG_CLEANUP_LAST_ERROR: &str = "log_cleanup_last_error";

/// SQLite-backed store for pooled keys, request logs, settings and
/// bucketed request statistics. All mutations are single statements or
/// short transactions; row-level atomicity is the concurrency contract.
#[derive(Debug, Clone)]
pub struct KeyStore {
    pool: SqlitePool,
}

impl KeyStore {
    pub async fn open(database_path: &str) -> Result<Self, ProxyError> {
        if let Some(parent) = std::path::Path::new(database_path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<(), ProxyError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                alias TEXT NOT NULL DEFAULT '',
                total_quota INTEGER NOT NULL,
                used_quota INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_invalid INTEGER NOT NULL DEFAULT 0,
                last_used_at INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS request_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                status_code INTEGER NOT NULL,
                client_ip TEXT NOT NULL DEFAULT '',
                api_key_id INTEGER,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                upstream_status INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_request_logs_created ON request_logs(created_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_request_logs_status ON request_logs(status_code)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS request_stats (
                granularity TEXT NOT NULL,
                bucket TEXT NOT NULL,
                endpoint TEXT NOT NULL DEFAULT '',
                count INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (granularity, bucket, endpoint)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ----- api_keys -----

    pub async fn list(&self) -> Result<Vec<ApiKey>, ProxyError> {
        let keys = sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys ORDER BY id DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(keys)
    }

    pub async fn create(
        &self,
        key: &str,
        alias: &str,
        total_quota: i64,
    ) -> Result<ApiKey, ProxyError> {
        let total_quota = if total_quota <= 0 {
            DEFAULT_TOTAL_QUOTA
        } else {
            total_quota
        };
        let now = Utc::now().timestamp();
        let id = sqlx::query(
            r#"
            INSERT INTO api_keys (key, alias, total_quota, used_quota, is_active, is_invalid, created_at)
            VALUES (?, ?, ?, 0, 1, 0, ?)
            "#,
        )
        .bind(key)
        .bind(alias)
        .bind(total_quota)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> Result<ApiKey, ProxyError> {
        let key = sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(key)
    }

    pub async fn find(&self, id: i64) -> Result<Option<ApiKey>, ProxyError> {
        let key = sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(key)
    }

    /// Apply an admin patch. An invalid key always leaves with
    /// `is_active = false`, and `used_quota` never exceeds `total_quota`
    /// on the way out.
    pub async fn update(&self, id: i64, patch: KeyPatch) -> Result<ApiKey, ProxyError> {
        let mut key = self.get(id).await?;

        if let Some(alias) = patch.alias {
            key.alias = alias;
        }
        if let Some(total) = patch.total_quota {
            if total > 0 {
                key.total_quota = total;
            }
        }
        if let Some(used) = patch.used_quota {
            if used >= 0 {
                key.used_quota = used;
            }
        }
        if let Some(invalid) = patch.is_invalid {
            key.is_invalid = invalid;
        }
        if let Some(active) = patch.is_active {
            key.is_active = active;
        }
        if patch.reset_quota {
            key.used_quota = 0;
        }

        if key.is_invalid {
            key.is_active = false;
        }
        if key.used_quota > key.total_quota {
            key.used_quota = key.total_quota;
        }

        sqlx::query(
            r#"
            UPDATE api_keys
            SET alias = ?, total_quota = ?, used_quota = ?, is_active = ?, is_invalid = ?
            WHERE id = ?
            "#,
        )
        .bind(&key.alias)
        .bind(key.total_quota)
        .bind(key.used_quota)
        .bind(key.is_active)
        .bind(key.is_invalid)
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.get(id).await
    }

    pub async fn delete(&self, id: i64) -> Result<(), ProxyError> {
        sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Purge every invalid key, returning how many rows went away.
    pub async fn delete_invalid(&self) -> Result<u64, ProxyError> {
        let result = sqlx::query("DELETE FROM api_keys WHERE is_invalid = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Usable keys for one dispatch, ordered by descending remaining quota.
    /// Keys with identical remaining quota are shuffled per call so equally
    /// loaded keys share traffic fairly.
    pub async fn candidates(&self) -> Result<Vec<ApiKey>, ProxyError> {
        let keys = sqlx::query_as::<_, ApiKey>(
            r#"
            SELECT * FROM api_keys
            WHERE is_active = 1 AND is_invalid = 0 AND used_quota < total_quota
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if keys.is_empty() {
            return Ok(keys);
        }

        let mut scored: Vec<(i64, ApiKey)> = keys.into_iter().map(|k| (k.remaining(), k)).collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let mut rng = rand::thread_rng();
        let mut out = Vec::with_capacity(scored.len());
        let mut i = 0;
        while i < scored.len() {
            let mut j = i + 1;
            while j < scored.len() && scored[j].0 == scored[i].0 {
                j += 1;
            }
            scored[i..j].shuffle(&mut rng);
            out.extend(scored[i..j].iter().map(|(_, k)| k.clone()));
            i = j;
        }
        Ok(out)
    }

    pub async fn mark_inactive(&self, id: i64) -> Result<(), ProxyError> {
        sqlx::query("UPDATE api_keys SET is_active = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The upstream rejects this key outright. Terminal until an admin edit.
    pub async fn mark_invalid(&self, id: i64) -> Result<(), ProxyError> {
        sqlx::query("UPDATE api_keys SET is_active = 0, is_invalid = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_exhausted(&self, id: i64) -> Result<(), ProxyError> {
        sqlx::query("UPDATE api_keys SET used_quota = total_quota WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Saturating debit: one atomic statement, no proxy-level lock.
    pub async fn increment_used(&self, id: i64) -> Result<(), ProxyError> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE api_keys
            SET used_quota = CASE WHEN used_quota + 1 > total_quota THEN total_quota ELSE used_quota + 1 END,
                last_used_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn reset_all_usage(&self) -> Result<(), ProxyError> {
        sqlx::query("UPDATE api_keys SET used_quota = 0")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Authoritative write-back from the upstream usage endpoint. `used` is
    /// clamped to the new total when one is given, otherwise to the key's
    /// existing `total_quota`, so `used ≤ total` holds either way.
    pub async fn set_usage(
        &self,
        id: i64,
        used: i64,
        total: Option<i64>,
    ) -> Result<(), ProxyError> {
        let used = used.max(0);
        match total {
            Some(total) if total > 0 => {
                sqlx::query(
                    "UPDATE api_keys SET total_quota = ?, used_quota = MIN(?, ?) WHERE id = ?",
                )
                .bind(total)
                .bind(used)
                .bind(total)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            _ => {
                sqlx::query("UPDATE api_keys SET used_quota = MIN(?, total_quota) WHERE id = ?")
                    .bind(used)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    // ----- request_logs -----

    pub async fn insert_log(&self, entry: NewRequestLog) -> Result<(), ProxyError> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO request_logs
                (request_id, endpoint, status_code, client_ip, api_key_id, duration_ms, upstream_status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.request_id)
        .bind(&entry.endpoint)
        .bind(entry.status_code)
        .bind(&entry.client_ip)
        .bind(entry.api_key_id)
        .bind(entry.duration_ms)
        .bind(entry.upstream_status)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_logs(
        &self,
        page: i64,
        page_size: i64,
        status_code: Option<i64>,
    ) -> Result<PaginatedLogs, ProxyError> {
        let page = page.max(1);
        let page_size = if page_size <= 0 || page_size > 200 {
            20
        } else {
            page_size
        };
        let offset = (page - 1) * page_size;

        let total = match status_code {
            Some(code) => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM request_logs WHERE status_code = ?",
                )
                .bind(code)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM request_logs")
                    .fetch_one(&self.pool)
                    .await?
            }
        };

        let items = match status_code {
            Some(code) => {
                sqlx::query_as::<_, RequestLog>(
                    "SELECT * FROM request_logs WHERE status_code = ? ORDER BY id DESC LIMIT ? OFFSET ?",
                )
                .bind(code)
                .bind(page_size)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, RequestLog>(
                    "SELECT * FROM request_logs ORDER BY id DESC LIMIT ? OFFSET ?",
                )
                .bind(page_size)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(PaginatedLogs {
            items,
            total,
            page,
            page_size,
        })
    }

    pub async fn status_code_counts(&self) -> Result<Vec<StatusCodeCount>, ProxyError> {
        let counts = sqlx::query_as::<_, StatusCodeCount>(
            r#"
            SELECT status_code, COUNT(*) AS count
            FROM request_logs
            GROUP BY status_code
            ORDER BY status_code ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(counts)
    }

    pub async fn delete_logs_before(&self, cutoff: i64) -> Result<u64, ProxyError> {
        let result = sqlx::query("DELETE FROM request_logs WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_logs(&self) -> Result<i64, ProxyError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM request_logs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ----- settings -----

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, ProxyError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), ProxyError> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_bool_setting(&self, key: &str, default: bool) -> Result<bool, ProxyError> {
        Ok(self
            .get_setting(key)
            .await?
            .map(|v| matches!(v.as_str(), "true" | "1" | "yes"))
            .unwrap_or(default))
    }

    pub async fn get_i64_setting(&self, key: &str, default: i64) -> Result<i64, ProxyError> {
        Ok(self
            .get_setting(key)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(default))
    }

    /// Unix-timestamp setting, `None` when unset or unparsable.
    pub async fn get_ts_setting(&self, key: &str) -> Result<Option<i64>, ProxyError> {
        Ok(self
            .get_setting(key)
            .await?
            .and_then(|v| v.parse::<i64>().ok()))
    }

    pub async fn set_ts_setting(&self, key: &str, ts: i64) -> Result<(), ProxyError> {
        self.set_setting(key, &ts.to_string()).await
    }
}

/// Display form of a pool key: `tvly-` prefix kept, then `****` and the
/// last four characters. Short keys collapse to `****` entirely.
pub fn mask_key(key: &str) -> String {
    let key = key.trim();
    if key.is_empty() {
        return String::new();
    }
    if key.len() <= 8 {
        return "****".to_owned();
    }
    let (prefix, rest) = match key.strip_prefix("tvly-") {
        Some(rest) => ("tvly-", rest),
        None => ("", key),
    };
    if rest.len() <= 4 {
        return format!("{prefix}****");
    }
    format!("{prefix}****{}", &rest[rest.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanoid::nanoid;
    use std::path::PathBuf;

    fn temp_db_path(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{}-{}.db", prefix, nanoid!(8)))
    }

    async fn open_store(prefix: &str) -> (KeyStore, PathBuf) {
        let path = temp_db_path(prefix);
        let store = KeyStore::open(&path.to_string_lossy())
            .await
            .expect("store opened");
        (store, path)
    }

    #[tokio::test]
    async fn create_defaults_quota_when_not_positive() {
        let (store, path) = open_store("store-create").await;

        let key = store.create("tvly-a", "a", 0).await.expect("create");
        assert_eq!(key.total_quota, DEFAULT_TOTAL_QUOTA);
        assert_eq!(key.used_quota, 0);
        assert!(key.is_active);
        assert!(!key.is_invalid);
        assert!(key.last_used_at.is_none());

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn increment_used_saturates_and_touches_last_used() {
        let (store, path) = open_store("store-debit").await;

        let key = store.create("tvly-a", "a", 2).await.expect("create");
        for _ in 0..5 {
            store.increment_used(key.id).await.expect("debit");
        }

        let got = store.get(key.id).await.expect("get");
        assert_eq!(got.used_quota, 2, "debit must saturate at total_quota");
        assert!(got.last_used_at.is_some());

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn invalid_key_cannot_be_reactivated() {
        let (store, path) = open_store("store-invalid").await;

        let key = store.create("tvly-a", "a", 100).await.expect("create");
        store.mark_invalid(key.id).await.expect("mark invalid");

        let got = store
            .update(
                key.id,
                KeyPatch {
                    is_active: Some(true),
                    ..Default::default()
                },
            )
            .await
            .expect("update");
        assert!(got.is_invalid);
        assert!(!got.is_active, "is_invalid must clamp is_active to false");

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn set_usage_without_total_clamps_to_existing_total() {
        let (store, path) = open_store("store-setusage").await;

        let key = store.create("tvly-a", "a", 100).await.expect("create");
        store.set_usage(key.id, 500, None).await.expect("set usage");

        let got = store.get(key.id).await.expect("get");
        assert_eq!(got.used_quota, 100);
        assert_eq!(got.total_quota, 100);

        store
            .set_usage(key.id, 500, Some(400))
            .await
            .expect("set usage with total");
        let got = store.get(key.id).await.expect("get");
        assert_eq!(got.used_quota, 400);
        assert_eq!(got.total_quota, 400);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn candidates_filters_and_orders_by_remaining() {
        let (store, path) = open_store("store-candidates").await;

        let low = store.create("tvly-low", "low", 1000).await.expect("create");
        store.set_usage(low.id, 600, None).await.expect("usage");

        let high = store
            .create("tvly-high", "high", 1000)
            .await
            .expect("create");
        store.set_usage(high.id, 50, None).await.expect("usage");

        let exhausted = store.create("tvly-full", "full", 10).await.expect("create");
        store.mark_exhausted(exhausted.id).await.expect("exhaust");

        let invalid = store.create("tvly-bad", "bad", 1000).await.expect("create");
        store.mark_invalid(invalid.id).await.expect("invalid");

        let disabled = store.create("tvly-off", "off", 1000).await.expect("create");
        store.mark_inactive(disabled.id).await.expect("inactive");

        let candidates = store.candidates().await.expect("candidates");
        let ids: Vec<i64> = candidates.iter().map(|k| k.id).collect();
        assert_eq!(ids, vec![high.id, low.id]);
        for k in &candidates {
            assert!(k.is_active && !k.is_invalid && k.used_quota < k.total_quota);
        }

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn candidates_empty_pool_returns_empty() {
        let (store, path) = open_store("store-empty").await;
        assert!(store.candidates().await.expect("candidates").is_empty());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn reset_all_usage_zeroes_every_key() {
        let (store, path) = open_store("store-reset").await;

        let a = store.create("tvly-a", "a", 100).await.expect("create");
        let b = store.create("tvly-b", "b", 100).await.expect("create");
        store.set_usage(a.id, 40, None).await.expect("usage");
        store.mark_exhausted(b.id).await.expect("exhaust");

        store.reset_all_usage().await.expect("reset");

        for id in [a.id, b.id] {
            assert_eq!(store.get(id).await.expect("get").used_quota, 0);
        }

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn delete_invalid_purges_only_invalid_rows() {
        let (store, path) = open_store("store-purge").await;

        let keep = store.create("tvly-a", "a", 100).await.expect("create");
        let drop1 = store.create("tvly-b", "b", 100).await.expect("create");
        let drop2 = store.create("tvly-c", "c", 100).await.expect("create");
        store.mark_invalid(drop1.id).await.expect("invalid");
        store.mark_invalid(drop2.id).await.expect("invalid");

        let removed = store.delete_invalid().await.expect("purge");
        assert_eq!(removed, 2);
        assert_eq!(store.list().await.expect("list").len(), 1);
        assert!(store.find(keep.id).await.expect("find").is_some());

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn settings_round_trip_with_defaults() {
        let (store, path) = open_store("store-settings").await;

        assert!(store
            .get_bool_setting(SETTING_REQUEST_LOGGING_ENABLED, true)
            .await
            .expect("get"));

        store
            .set_setting(SETTING_REQUEST_LOGGING_ENABLED, "false")
            .await
            .expect("set");
        assert!(!store
            .get_bool_setting(SETTING_REQUEST_LOGGING_ENABLED, true)
            .await
            .expect("get"));

        store
            .set_setting(SETTING_AUTO_SYNC_INTERVAL_MINUTES, "15")
            .await
            .expect("set");
        assert_eq!(
            store
                .get_i64_setting(SETTING_AUTO_SYNC_INTERVAL_MINUTES, 60)
                .await
                .expect("get"),
            15
        );

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn mask_key_keeps_prefix_and_tail() {
        assert_eq!(mask_key("tvly-dev-1234567890abcd"), "tvly-****abcd");
        assert_eq!(mask_key("plainsecretkey"), "****tkey");
        assert_eq!(mask_key("short"), "****");
        assert_eq!(mask_key(""), "");
    }
}
