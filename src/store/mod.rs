use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mysql_async::prelude::Queryable;
use mysql_async::{params, Opts, OptsBuilder, Pool};
use thiserror::Error;
use tracing::info;

use crate::aggregate::AggregateRecord;
use crate::config::MysqlConfig;

/// Upsert keyed by (entity_id, window_start): redelivered input overwrites
/// the same row instead of double-counting.
const UPSERT_SQL: &str = "INSERT INTO timespent \
     (entity_id, window_start, window_end, total_seconds) \
     VALUES (:entity_id, :window_start, :window_end, :total_seconds) \
     ON DUPLICATE KEY UPDATE \
     window_end = VALUES(window_end), total_seconds = VALUES(total_seconds)";

/// Store failures, split by whether the batch is worth retrying.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection loss, deadlock, timeout. Retried with backoff.
    #[error("transient store failure: {0}")]
    Transient(#[source] mysql_async::Error),

    /// Authentication, schema, or query errors. Retrying cannot help.
    #[error("fatal store failure: {0}")]
    Fatal(#[source] mysql_async::Error),

    #[error("store writer not started")]
    NotStarted,
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Manages the MySQL connection pool and batched aggregate upserts.
pub struct MysqlWriter {
    cfg: MysqlConfig,
    pool: Option<Pool>,
}

impl MysqlWriter {
    /// Creates a new writer with the given connection settings.
    pub fn new(cfg: MysqlConfig) -> Self {
        Self { cfg, pool: None }
    }

    /// Opens the pool and verifies connectivity with a ping, so a
    /// misconfigured store target fails at startup instead of at the
    /// first flush.
    pub async fn start(&mut self) -> Result<()> {
        let pool = Pool::new(self.build_opts());

        let mut conn = pool
            .get_conn()
            .await
            .context("opening MySQL connection")?;
        conn.ping().await.context("pinging MySQL")?;
        drop(conn);

        info!(addr = %self.cfg.addr, db = %self.cfg.dbname, "MySQL writer connected");

        self.pool = Some(pool);

        Ok(())
    }

    /// Closes the connection pool.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            pool.disconnect().await.context("closing MySQL pool")?;
        }
        Ok(())
    }

    /// Persists a batch of aggregate records in one round trip.
    ///
    /// The whole batch succeeds or fails together; the caller retries
    /// transient failures and withholds broker offsets on exhaustion.
    pub async fn write_batch(&self, records: &[AggregateRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let pool = self.pool.as_ref().ok_or(StoreError::NotStarted)?;

        let mut conn = pool.get_conn().await.map_err(classify)?;

        conn.exec_batch(
            UPSERT_SQL,
            records.iter().map(|r| {
                params! {
                    "entity_id" => &r.entity_id,
                    "window_start" => format_datetime(r.window_start),
                    "window_end" => format_datetime(r.window_end),
                    "total_seconds" => r.total.as_secs(),
                }
            }),
        )
        .await
        .map_err(classify)
    }

    /// Builds connection options from the `MYSQL_*` settings.
    fn build_opts(&self) -> Opts {
        let builder = OptsBuilder::default()
            .user(Some(self.cfg.user.as_str()))
            .pass(Some(self.cfg.passwd.as_str()))
            .db_name(Some(self.cfg.dbname.as_str()));

        let builder = if self.cfg.net == "unix" {
            builder.socket(Some(self.cfg.addr.as_str()))
        } else {
            let (host, port) = split_host_port(&self.cfg.addr);
            builder.ip_or_hostname(host).tcp_port(port)
        };

        builder.into()
    }
}

/// Splits "host:port", defaulting to MySQL's 3306.
fn split_host_port(addr: &str) -> (&str, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, port),
            Err(_) => (addr, 3306),
        },
        None => (addr, 3306),
    }
}

/// MySQL DATETIME literal (UTC, second precision).
fn format_datetime(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Splits MySQL errors into transient and fatal per the retry contract.
fn classify(err: mysql_async::Error) -> StoreError {
    match &err {
        mysql_async::Error::Io(_) => StoreError::Transient(err),
        mysql_async::Error::Driver(_) => StoreError::Transient(err),
        mysql_async::Error::Server(server) => match server.code {
            // Lock wait timeout, deadlock, too many connections, server gone.
            1205 | 1213 | 1040 | 2006 => StoreError::Transient(err),
            _ => StoreError::Fatal(err),
        },
        _ => StoreError::Fatal(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("db.internal:3307"), ("db.internal", 3307));
        assert_eq!(split_host_port("db.internal"), ("db.internal", 3306));
        assert_eq!(split_host_port("db.internal:bogus"), ("db.internal:bogus", 3306));
    }

    #[test]
    fn test_format_datetime() {
        let t = DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp");
        assert_eq!(format_datetime(t), "2023-11-14 22:13:20");
    }

    #[test]
    fn test_upsert_sql_shape() {
        // The idempotency key must stay (entity_id, window_start): both
        // columns are inserted, neither is touched by the UPDATE clause.
        assert!(UPSERT_SQL.contains("ON DUPLICATE KEY UPDATE"));
        assert!(!UPSERT_SQL.contains("window_start = VALUES"));
        assert!(!UPSERT_SQL.contains("entity_id = VALUES"));
    }

    #[tokio::test]
    async fn test_writer_requires_start() {
        let writer = MysqlWriter::new(MysqlConfig::default());
        let record = AggregateRecord {
            entity_id: "u1".to_string(),
            total: std::time::Duration::from_secs(10),
            window_start: DateTime::UNIX_EPOCH,
            window_end: DateTime::UNIX_EPOCH,
        };

        let result = writer.write_batch(&[record]).await;
        assert!(matches!(result, Err(StoreError::NotStarted)));

        // Empty batches are a no-op even before start.
        writer.write_batch(&[]).await.expect("empty batch ok");
    }
}
