//! Stats Store (C4) — append-only time-series of per-server samples, 7-day
//! retention, safe under concurrent insert+query.
//!
//! Grounded on `redb` (already a teacher dependency, used there for
//! `StateStore`/`RedbProgressStore`) as an embedded single-file KV/table
//! store. Rows are keyed by `"{serverId}\0{timestamp:020}"` so that a
//! per-server, time-ordered range scan is a plain lexicographic `range()`
//! over the key space (spec.md §6's `index (serverId, timestamp)`), with the
//! sample itself msgpack-encoded as the value.

use std::path::Path;
use std::time::Duration;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("stats");

/// 7-day retention window (spec.md §3).
pub const RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Deadline for a single stats operation (spec.md §5).
pub const OP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("stats database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("stats transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("stats table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("stats storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("stats commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("stats encoding error: {0}")]
    Encoding(String),
}

impl serde::Serialize for StatsError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// A single appended sample (spec.md §3/§6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsSample {
    pub server_id: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub uptime_sec: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub latency_ms: Option<u64>,
    pub reconnect_count: u32,
    pub disconnect_reason: Option<String>,
}

/// Aggregation period for `query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    OneHour,
    TwentyFourHours,
    SevenDays,
}

impl Period {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1h" => Some(Period::OneHour),
            "24h" => Some(Period::TwentyFourHours),
            "7d" => Some(Period::SevenDays),
            _ => None,
        }
    }

    pub fn millis(self) -> i64 {
        match self {
            Period::OneHour => 3_600_000,
            Period::TwentyFourHours => 86_400_000,
            Period::SevenDays => 604_800_000,
        }
    }
}

/// Query result: aggregate statistics over a period (spec.md §4.4).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsQueryResult {
    pub total_uptime: u64,
    pub uptime_percent: f64,
    pub avg_latency_ms: Option<u64>,
    pub reconnect_count: u32,
    pub disconnect_reasons: std::collections::HashMap<String, u32>,
    pub data_points: Vec<StatsSample>,
}

pub struct StatsStore {
    db: Database,
}

fn row_key(server_id: &str, timestamp: i64) -> String {
    // Zero-padded so the textual and numeric orderings coincide; timestamps
    // are always non-negative milliseconds-since-epoch in this process.
    format!("{server_id}\0{timestamp:020}")
}

fn range_bounds(server_id: &str) -> (String, String) {
    (format!("{server_id}\0"), format!("{server_id}\u{1}"))
}

impl StatsStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StatsError> {
        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    pub async fn insert_sample(&self, sample: StatsSample) -> Result<(), StatsError> {
        tokio::time::timeout(OP_TIMEOUT, self.insert_sample_inner(sample))
            .await
            .unwrap_or_else(|_| Err(StatsError::Encoding("insert timed out".into())))
    }

    async fn insert_sample_inner(&self, sample: StatsSample) -> Result<(), StatsError> {
        let key = row_key(&sample.server_id, sample.timestamp);
        let value = rmp_serde::to_vec_named(&sample)
            .map_err(|e| StatsError::Encoding(e.to_string()))?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE)?;
            table.insert(key.as_str(), value.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Query aggregate stats for `server_id` over `period`, ending now.
    pub async fn query(&self, server_id: &str, period: Period, now_ms: i64) -> Result<StatsQueryResult, StatsError> {
        tokio::time::timeout(OP_TIMEOUT, self.query_inner(server_id, period, now_ms))
            .await
            .unwrap_or_else(|_| Err(StatsError::Encoding("query timed out".into())))
    }

    async fn query_inner(&self, server_id: &str, period: Period, now_ms: i64) -> Result<StatsQueryResult, StatsError> {
        let cutoff = now_ms - period.millis();
        let (start, end) = range_bounds(server_id);

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE)?;

        let mut data_points = Vec::new();
        for entry in table.range(start.as_str()..end.as_str())? {
            let (_, value) = entry?;
            let sample: StatsSample = rmp_serde::from_slice(value.value())
                .map_err(|e| StatsError::Encoding(e.to_string()))?;
            if sample.timestamp >= cutoff {
                data_points.push(sample);
            }
        }

        let total_uptime: u64 = data_points.iter().map(|s| s.uptime_sec).sum();
        let period_ms = period.millis().max(1) as f64;
        let uptime_percent = (total_uptime as f64 * 1000.0 / period_ms * 100.0).clamp(0.0, 100.0);

        let latencies: Vec<u64> = data_points.iter().filter_map(|s| s.latency_ms).collect();
        let avg_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<u64>() / latencies.len() as u64)
        };

        let reconnect_count = data_points.iter().map(|s| s.reconnect_count).max().unwrap_or(0);

        let mut disconnect_reasons = std::collections::HashMap::new();
        for sample in &data_points {
            if let Some(reason) = &sample.disconnect_reason {
                *disconnect_reasons.entry(reason.clone()).or_insert(0) += 1;
            }
        }

        Ok(StatsQueryResult {
            total_uptime,
            uptime_percent,
            avg_latency_ms,
            reconnect_count,
            disconnect_reasons,
            data_points,
        })
    }

    /// Delete rows older than the 7-day retention window.
    pub async fn cleanup(&self, now_ms: i64) -> Result<u64, StatsError> {
        tokio::time::timeout(OP_TIMEOUT, self.cleanup_inner(now_ms))
            .await
            .unwrap_or_else(|_| Err(StatsError::Encoding("cleanup timed out".into())))
    }

    async fn cleanup_inner(&self, now_ms: i64) -> Result<u64, StatsError> {
        let cutoff = now_ms - RETENTION.as_millis() as i64;

        let write_txn = self.db.begin_write()?;
        let mut deleted = 0u64;
        {
            let mut table = write_txn.open_table(TABLE)?;
            let stale_keys: Vec<String> = {
                let mut keys = Vec::new();
                for entry in table.iter()? {
                    let (key, value) = entry?;
                    let sample: StatsSample = rmp_serde::from_slice(value.value())
                        .map_err(|e| StatsError::Encoding(e.to_string()))?;
                    if sample.timestamp < cutoff {
                        keys.push(key.value().to_string());
                    }
                }
                keys
            };
            for key in stale_keys {
                table.remove(key.as_str())?;
                deleted += 1;
            }
        }
        write_txn.commit()?;
        Ok(deleted)
    }

    /// Purge every row belonging to `server_id`, part of the cascade when a
    /// server is deleted (spec.md §3).
    pub async fn delete_server(&self, server_id: &str) -> Result<u64, StatsError> {
        tokio::time::timeout(OP_TIMEOUT, self.delete_server_inner(server_id))
            .await
            .unwrap_or_else(|_| Err(StatsError::Encoding("delete timed out".into())))
    }

    async fn delete_server_inner(&self, server_id: &str) -> Result<u64, StatsError> {
        let (start, end) = range_bounds(server_id);

        let write_txn = self.db.begin_write()?;
        let mut deleted = 0u64;
        {
            let mut table = write_txn.open_table(TABLE)?;
            let keys: Vec<String> = table
                .range(start.as_str()..end.as_str())?
                .map(|entry| entry.map(|(key, _)| key.value().to_string()))
                .collect::<Result<_, _>>()?;
            for key in keys {
                table.remove(key.as_str())?;
                deleted += 1;
            }
        }
        write_txn.commit()?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(server_id: &str, ts: i64, uptime: u64, reconnects: u32) -> StatsSample {
        StatsSample {
            server_id: server_id.to_string(),
            timestamp: ts,
            uptime_sec: uptime,
            bytes_in: 100,
            bytes_out: 200,
            latency_ms: Some(42),
            reconnect_count: reconnects,
            disconnect_reason: None,
        }
    }

    #[tokio::test]
    async fn insert_and_query_within_period() {
        let dir = tempdir().unwrap();
        let store = StatsStore::open(dir.path().join("stats.redb")).unwrap();
        let now = 1_700_000_000_000i64;

        // S7: one 10-minute session and one 2-minute session in the last hour.
        store.insert_sample(sample("s1", now - 1_800_000, 600, 1)).await.unwrap();
        store.insert_sample(sample("s1", now - 600_000, 120, 2)).await.unwrap();

        let result = store.query("s1", Period::OneHour, now).await.unwrap();
        assert_eq!(result.total_uptime, 720);
        assert!((result.uptime_percent - 20.0).abs() < 0.5);
        assert_eq!(result.reconnect_count, 2);
    }

    #[tokio::test]
    async fn query_excludes_other_servers_and_stale_rows() {
        let dir = tempdir().unwrap();
        let store = StatsStore::open(dir.path().join("stats.redb")).unwrap();
        let now = 1_700_000_000_000i64;

        store.insert_sample(sample("s1", now - 1000, 60, 0)).await.unwrap();
        store.insert_sample(sample("s2", now - 1000, 999, 0)).await.unwrap();
        store.insert_sample(sample("s1", now - Period::SevenDays.millis() - 1000, 500, 0)).await.unwrap();

        let result = store.query("s1", Period::OneHour, now).await.unwrap();
        assert_eq!(result.data_points.len(), 1);
        assert_eq!(result.total_uptime, 60);
    }

    #[tokio::test]
    async fn uptime_percent_never_exceeds_bounds() {
        let dir = tempdir().unwrap();
        let store = StatsStore::open(dir.path().join("stats.redb")).unwrap();
        let now = 1_700_000_000_000i64;

        // Way more uptime than the period itself — clamp must hold.
        store.insert_sample(sample("s1", now - 1000, 1_000_000, 0)).await.unwrap();

        let result = store.query("s1", Period::OneHour, now).await.unwrap();
        assert!((0.0..=100.0).contains(&result.uptime_percent));
    }

    #[tokio::test]
    async fn cleanup_deletes_rows_older_than_retention() {
        let dir = tempdir().unwrap();
        let store = StatsStore::open(dir.path().join("stats.redb")).unwrap();
        let now = 1_700_000_000_000i64;

        store.insert_sample(sample("s1", now - Period::SevenDays.millis() - 1, 1, 0)).await.unwrap();
        store.insert_sample(sample("s1", now, 1, 0)).await.unwrap();

        let deleted = store.cleanup(now).await.unwrap();
        assert_eq!(deleted, 1);

        let result = store.query("s1", Period::SevenDays, now).await.unwrap();
        assert_eq!(result.data_points.len(), 1);
    }

    #[tokio::test]
    async fn delete_server_purges_only_that_server() {
        let dir = tempdir().unwrap();
        let store = StatsStore::open(dir.path().join("stats.redb")).unwrap();
        let now = 1_700_000_000_000i64;

        store.insert_sample(sample("s1", now - 1000, 60, 0)).await.unwrap();
        store.insert_sample(sample("s1", now - 2000, 60, 1)).await.unwrap();
        store.insert_sample(sample("s2", now - 1000, 60, 0)).await.unwrap();

        let deleted = store.delete_server("s1").await.unwrap();
        assert_eq!(deleted, 2);

        let s1 = store.query("s1", Period::SevenDays, now).await.unwrap();
        assert_eq!(s1.data_points.len(), 0);
        let s2 = store.query("s2", Period::SevenDays, now).await.unwrap();
        assert_eq!(s2.data_points.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_insert_and_query() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(StatsStore::open(dir.path().join("stats.redb")).unwrap());
        let now = 1_700_000_000_000i64;

        let writer_store = store.clone();
        let writer = tokio::spawn(async move {
            for i in 0..20 {
                writer_store.insert_sample(sample("s1", now - i * 1000, 10, 0)).await.unwrap();
            }
        });

        let reader_store = store.clone();
        let reader = tokio::spawn(async move {
            for _ in 0..20 {
                let _ = reader_store.query("s1", Period::OneHour, now).await.unwrap();
            }
        });

        let _ = tokio::join!(writer, reader);
    }
}
