use std::collections::HashMap;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, Timelike, Utc};
use serde::Serialize;
use sqlx::QueryBuilder;

use crate::error::ProxyError;
use crate::store::KeyStore;

pub const GRANULARITY_HOUR: &str = "hour";
pub const GRANULARITY_DAY: &str = "day";
pub const GRANULARITY_MONTH: &str = "month";

/// The endpoint whose traffic gets its own series next to the all-requests
/// rollup.
const SEARCH_ENDPOINT: &str = "/search";

const BACKFILL_BATCH: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_quota: i64,
    pub total_used: i64,
    pub total_remaining: i64,
    pub key_count: i64,
    pub active_key_count: i64,
    pub today_requests: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeSeriesSeries {
    pub name: String,
    pub data: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeSeries {
    pub granularity: String,
    pub labels: Vec<String>,
    pub series: Vec<TimeSeriesSeries>,
}

/// Incremental request statistics over `(granularity, bucket, endpoint)`
/// counters, reconstructible from the raw request logs. All bucketing is in
/// the server's local time zone.
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    store: KeyStore,
}

impl StatsAggregator {
    pub fn new(store: KeyStore) -> Self {
        Self { store }
    }

    /// One observed request: upsert the three all-endpoint buckets, plus the
    /// three `/search` buckets when that is the endpoint.
    pub async fn record(
        &self,
        endpoint: &str,
        occurred_at: DateTime<Local>,
    ) -> Result<(), ProxyError> {
        let hour = occurred_at.format("%Y-%m-%d %H:00").to_string();
        let day = occurred_at.format("%Y-%m-%d").to_string();
        let month = occurred_at.format("%Y-%m").to_string();

        self.upsert_increment(GRANULARITY_HOUR, &hour, "").await?;
        self.upsert_increment(GRANULARITY_DAY, &day, "").await?;
        self.upsert_increment(GRANULARITY_MONTH, &month, "").await?;

        if endpoint == SEARCH_ENDPOINT {
            self.upsert_increment(GRANULARITY_HOUR, &hour, endpoint)
                .await?;
            self.upsert_increment(GRANULARITY_DAY, &day, endpoint)
                .await?;
            self.upsert_increment(GRANULARITY_MONTH, &month, endpoint)
                .await?;
        }

        Ok(())
    }

    async fn upsert_increment(
        &self,
        granularity: &str,
        bucket: &str,
        endpoint: &str,
    ) -> Result<(), ProxyError> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO request_stats (granularity, bucket, endpoint, count, updated_at)
            VALUES (?, ?, ?, 1, ?)
            ON CONFLICT(granularity, bucket, endpoint)
            DO UPDATE SET count = count + 1, updated_at = excluded.updated_at
            "#,
        )
        .bind(granularity)
        .bind(bucket)
        .bind(endpoint)
        .bind(now)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Dashboard aggregates over the key pool plus today's request count.
    pub async fn snapshot(&self) -> Result<StatsSnapshot, ProxyError> {
        let key_count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM api_keys")
            .fetch_one(self.store.pool())
            .await?;

        let active_key_count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM api_keys
            WHERE is_active = 1 AND is_invalid = 0 AND used_quota < total_quota
            "#,
        )
        .fetch_one(self.store.pool())
        .await?;

        let (total_quota, total_used) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COALESCE(SUM(total_quota), 0), COALESCE(SUM(used_quota), 0) FROM api_keys",
        )
        .fetch_one(self.store.pool())
        .await?;

        let today = Local::now().format("%Y-%m-%d").to_string();
        let today_requests = sqlx::query_scalar::<_, i64>(
            "SELECT count FROM request_stats WHERE granularity = ? AND bucket = ? AND endpoint = ''",
        )
        .bind(GRANULARITY_DAY)
        .bind(&today)
        .fetch_optional(self.store.pool())
        .await?
        .unwrap_or(0);

        Ok(StatsSnapshot {
            total_quota,
            total_used,
            total_remaining: (total_quota - total_used).max(0),
            key_count,
            active_key_count,
            today_requests,
        })
    }

    /// 24 hour / 30 day / 12 month window ending now, zero-filled, with an
    /// all-requests series and a `/search` series.
    pub async fn time_series(&self, granularity: &str) -> Result<TimeSeries, ProxyError> {
        let (granularity, buckets) = match granularity {
            "" | GRANULARITY_HOUR => (GRANULARITY_HOUR, hour_buckets(Local::now(), 24)),
            GRANULARITY_DAY => (GRANULARITY_DAY, day_buckets(Local::now(), 30)),
            GRANULARITY_MONTH => (GRANULARITY_MONTH, month_buckets(Local::now(), 12)),
            _ => return Err(ProxyError::InvalidGranularity),
        };

        let start_bucket = &buckets[0].0;
        let totals = self.bucket_counts(granularity, "", start_bucket).await?;
        let searches = self
            .bucket_counts(granularity, SEARCH_ENDPOINT, start_bucket)
            .await?;

        let mut labels = Vec::with_capacity(buckets.len());
        let mut total_data = Vec::with_capacity(buckets.len());
        let mut search_data = Vec::with_capacity(buckets.len());
        for (bucket, label) in &buckets {
            labels.push(label.clone());
            total_data.push(totals.get(bucket).copied().unwrap_or(0));
            search_data.push(searches.get(bucket).copied().unwrap_or(0));
        }

        Ok(TimeSeries {
            granularity: granularity.to_owned(),
            labels,
            series: vec![
                TimeSeriesSeries {
                    name: "All Requests".to_owned(),
                    data: total_data,
                },
                TimeSeriesSeries {
                    name: "Search".to_owned(),
                    data: search_data,
                },
            ],
        })
    }

    async fn bucket_counts(
        &self,
        granularity: &str,
        endpoint: &str,
        start_bucket: &str,
    ) -> Result<HashMap<String, i64>, ProxyError> {
        // Bucket strings sort lexicographically within one granularity, so a
        // plain >= comparison bounds the window.
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT bucket, count FROM request_stats
            WHERE granularity = ? AND endpoint = ? AND bucket >= ?
            ORDER BY bucket
            "#,
        )
        .bind(granularity)
        .bind(endpoint)
        .bind(start_bucket)
        .fetch_all(self.store.pool())
        .await?;

        Ok(rows.into_iter().collect())
    }

    /// Rebuild the whole stats table from the request logs. A no-op as soon
    /// as any stats row exists, so it is safe to call on every start.
    pub async fn backfill_if_empty(&self) -> Result<bool, ProxyError> {
        let existing = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM request_stats")
            .fetch_one(self.store.pool())
            .await?;
        if existing > 0 {
            return Ok(false);
        }

        let specs: [(&str, &str); 3] = [
            (GRANULARITY_HOUR, "%Y-%m-%d %H:00"),
            (GRANULARITY_DAY, "%Y-%m-%d"),
            (GRANULARITY_MONTH, "%Y-%m"),
        ];

        let now = Utc::now().timestamp();
        for (granularity, fmt) in specs {
            let all_sql = format!(
                "SELECT strftime('{fmt}', created_at, 'unixepoch', 'localtime') AS bucket, \
                 COUNT(*) AS count FROM request_logs GROUP BY bucket ORDER BY bucket"
            );
            let rows = sqlx::query_as::<_, (String, i64)>(&all_sql)
                .fetch_all(self.store.pool())
                .await?;
            self.insert_backfill_rows(granularity, "", &rows, now)
                .await?;

            let search_sql = format!(
                "SELECT strftime('{fmt}', created_at, 'unixepoch', 'localtime') AS bucket, \
                 COUNT(*) AS count FROM request_logs WHERE endpoint = ? GROUP BY bucket ORDER BY bucket"
            );
            let rows = sqlx::query_as::<_, (String, i64)>(&search_sql)
                .bind(SEARCH_ENDPOINT)
                .fetch_all(self.store.pool())
                .await?;
            self.insert_backfill_rows(granularity, SEARCH_ENDPOINT, &rows, now)
                .await?;
        }

        Ok(true)
    }

    async fn insert_backfill_rows(
        &self,
        granularity: &str,
        endpoint: &str,
        rows: &[(String, i64)],
        updated_at: i64,
    ) -> Result<(), ProxyError> {
        for chunk in rows.chunks(BACKFILL_BATCH) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO request_stats (granularity, bucket, endpoint, count, updated_at) ",
            );
            builder.push_values(chunk, |mut b, (bucket, count)| {
                b.push_bind(granularity)
                    .push_bind(bucket)
                    .push_bind(endpoint)
                    .push_bind(count)
                    .push_bind(updated_at);
            });
            builder.build().execute(self.store.pool()).await?;
        }
        Ok(())
    }
}

fn hour_buckets(now: DateTime<Local>, points: usize) -> Vec<(String, String)> {
    let end = now
        .naive_local()
        .date()
        .and_hms_opt(now.hour(), 0, 0)
        .expect("valid hour start");
    let start = end - ChronoDuration::hours(points as i64 - 1);
    (0..points)
        .map(|i| {
            let t = start + ChronoDuration::hours(i as i64);
            (
                t.format("%Y-%m-%d %H:00").to_string(),
                t.format("%m-%d %H:00").to_string(),
            )
        })
        .collect()
}

fn day_buckets(now: DateTime<Local>, points: usize) -> Vec<(String, String)> {
    let end = now.date_naive();
    let start = end - ChronoDuration::days(points as i64 - 1);
    (0..points)
        .map(|i| {
            let d = start + ChronoDuration::days(i as i64);
            (
                d.format("%Y-%m-%d").to_string(),
                d.format("%m-%d").to_string(),
            )
        })
        .collect()
}

fn month_buckets(now: DateTime<Local>, points: usize) -> Vec<(String, String)> {
    let mut year = now.year();
    let mut month = now.month() as i32;
    let mut rev = Vec::with_capacity(points);
    for _ in 0..points {
        let bucket = format!("{year:04}-{month:02}");
        rev.push((bucket.clone(), bucket));
        month -= 1;
        if month == 0 {
            month = 12;
            year -= 1;
        }
    }
    rev.reverse();
    rev
}
