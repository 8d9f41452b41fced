//! Transactional backend on SQLite.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use tracing::{info, instrument, warn};

use super::{Storage, StorageError};
use crate::metric::{Metric, MetricKind, MetricValue};

const SCHEMA_VERSION: i64 = 1;

/// Takes the write lock up front so concurrent read-then-write
/// transactions queue on the lock instead of failing to upgrade.
const BEGIN_WRITE: &str = "BEGIN IMMEDIATE";

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type Row = (String, String, Option<i64>, Option<f64>);

#[derive(Debug, Clone)]
pub struct SqlStorage {
    pool: SqlitePool,
}

impl SqlStorage {
    /// Connects to `dsn` (e.g. `sqlite:///var/lib/telemetron/metrics.db`)
    /// and applies pending migrations.
    #[instrument(skip(dsn))]
    pub async fn connect(dsn: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(dsn)?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);

        // Every connection to an in-memory database is a separate database.
        let in_memory = dsn.contains(":memory:") || dsn.contains("mode=memory");
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        }
        .connect_with(options)
        .await?;

        migrate(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, StorageError> {
        Self::connect("sqlite::memory:").await
    }
}

#[instrument(skip(pool))]
async fn migrate(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)")
        .execute(pool)
        .await?;

    let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await?;
    let current = current.unwrap_or(0);

    if current >= SCHEMA_VERSION {
        return Ok(());
    }

    info!(from = current, to = SCHEMA_VERSION, "migrating metrics schema");

    let mut tx = pool.begin_with(BEGIN_WRITE).await?;

    if current < 1 {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metrics (
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                delta INTEGER,
                value REAL,
                PRIMARY KEY (name, kind)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(())
}

fn decode_value(
    name: &str,
    kind: MetricKind,
    delta: Option<i64>,
    value: Option<f64>,
) -> Result<MetricValue, StorageError> {
    let decoded = match kind {
        MetricKind::Counter => delta.map(MetricValue::Counter),
        MetricKind::Gauge => value.map(MetricValue::Gauge),
    };
    decoded.ok_or_else(|| StorageError::Corrupt {
        name: name.to_string(),
        kind,
    })
}

fn decode_row((name, kind, delta, value): Row) -> Result<Metric, StorageError> {
    let kind: MetricKind = kind.parse()?;
    let value = decode_value(&name, kind, delta, value)?;
    Ok(Metric { name, value })
}

/// Reads the current value, applies the aggregation rule and upserts the
/// result on one connection. Callers provide the transaction.
async fn apply(conn: &mut SqliteConnection, update: &Metric) -> Result<Metric, StorageError> {
    update.validate()?;
    let kind = update.kind();

    let current: Option<(Option<i64>, Option<f64>)> =
        sqlx::query_as("SELECT delta, value FROM metrics WHERE name = ? AND kind = ?")
            .bind(&update.name)
            .bind(kind.as_str())
            .fetch_optional(&mut *conn)
            .await?;

    let existing = current
        .map(|(delta, value)| decode_value(&update.name, kind, delta, value))
        .transpose()?;
    let next = update.apply(existing)?;

    let (delta, value) = match next {
        MetricValue::Counter(d) => (Some(d), None),
        MetricValue::Gauge(v) => (None, Some(v)),
    };

    sqlx::query(
        r#"
        INSERT INTO metrics (name, kind, delta, value)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (name, kind) DO UPDATE SET
            delta = excluded.delta,
            value = excluded.value
        "#,
    )
    .bind(&update.name)
    .bind(kind.as_str())
    .bind(delta)
    .bind(value)
    .execute(&mut *conn)
    .await?;

    Ok(Metric {
        name: update.name.clone(),
        value: next,
    })
}

impl Storage for SqlStorage {
    fn name(&self) -> &'static str {
        "sql"
    }

    async fn get(&self, name: &str, kind: MetricKind) -> Result<Metric, StorageError> {
        let row: Option<Row> = sqlx::query_as(
            "SELECT name, kind, delta, value FROM metrics WHERE name = ? AND kind = ?",
        )
        .bind(name)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => decode_row(row),
            None => Err(StorageError::NotFound {
                name: name.to_string(),
                kind,
            }),
        }
    }

    async fn update(&self, metric: &Metric) -> Result<Metric, StorageError> {
        let mut tx = self.pool.begin_with(BEGIN_WRITE).await?;
        let stored = apply(&mut *tx, metric).await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn add_batch(&self, batch: &[Metric]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin_with(BEGIN_WRITE).await?;

        for (index, update) in batch.iter().enumerate() {
            if let Err(e) = apply(&mut *tx, update).await {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "metrics batch rollback failed");
                }
                return Err(StorageError::RolledBack {
                    index,
                    source: Box::new(e),
                });
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Metric>, StorageError> {
        let rows: Vec<Row> =
            sqlx::query_as("SELECT name, kind, delta, value FROM metrics ORDER BY kind, name")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(decode_row).collect()
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricError;

    #[tokio::test]
    async fn test_poll_count_and_alloc_scenario() {
        let store = SqlStorage::in_memory().await.expect("connect");

        store.update(&Metric::counter("PollCount", 5)).await.expect("update");
        let stored = store.update(&Metric::counter("PollCount", 3)).await.expect("update");
        assert_eq!(stored.value, MetricValue::Counter(8));

        store.update(&Metric::gauge("Alloc", 100.5)).await.expect("update");
        store.update(&Metric::gauge("Alloc", 200.25)).await.expect("update");

        let alloc = store.get("Alloc", MetricKind::Gauge).await.expect("get");
        assert_eq!(alloc.value, MetricValue::Gauge(200.25));
        let poll = store.get("PollCount", MetricKind::Counter).await.expect("get");
        assert_eq!(poll.value, MetricValue::Counter(8));
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back_everything() {
        let store = SqlStorage::in_memory().await.expect("connect");
        store.update(&Metric::counter("big", i64::MAX)).await.expect("seed");
        store.update(&Metric::gauge("g", 1.0)).await.expect("seed");
        let before = store.list().await.expect("list");

        let err = store
            .add_batch(&[
                Metric::gauge("g", 99.0),
                Metric::counter("fresh", 4),
                Metric::counter("big", 1),
            ])
            .await
            .expect_err("overflow on last element");

        match err {
            StorageError::RolledBack { index, source } => {
                assert_eq!(index, 2);
                assert!(matches!(
                    *source,
                    StorageError::Aggregation(MetricError::Overflow { .. })
                ));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(store.list().await.expect("list"), before);
    }

    #[tokio::test]
    async fn test_batch_commits_in_order() {
        let store = SqlStorage::in_memory().await.expect("connect");
        store
            .add_batch(&[
                Metric::counter("c", 1),
                Metric::counter("c", 2),
                Metric::gauge("g", 5.0),
                Metric::gauge("g", 6.0),
            ])
            .await
            .expect("batch");

        assert_eq!(
            store.list().await.expect("list"),
            vec![Metric::counter("c", 3), Metric::gauge("g", 6.0)]
        );
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = SqlStorage::in_memory().await.expect("connect");
        let err = store.get("nope", MetricKind::Gauge).await.expect_err("missing");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_ping_and_close() {
        let store = SqlStorage::in_memory().await.expect("connect");
        store.ping().await.expect("ping");
        store.close().await.expect("close");
        assert!(store.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_file_database_persists_and_migrates_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dsn = format!("sqlite://{}", dir.path().join("metrics.db").display());

        let store = SqlStorage::connect(&dsn).await.expect("connect");
        store.update(&Metric::counter("c", 7)).await.expect("update");
        store.close().await.expect("close");

        let reopened = SqlStorage::connect(&dsn).await.expect("reconnect");
        let c = reopened.get("c", MetricKind::Counter).await.expect("get");
        assert_eq!(c.value, MetricValue::Counter(7));

        let versions: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_all(&reopened.pool)
            .await
            .expect("versions");
        assert_eq!(versions, vec![SCHEMA_VERSION]);
    }

    #[tokio::test]
    async fn test_concurrent_counter_updates_on_file_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dsn = format!("sqlite://{}", dir.path().join("metrics.db").display());
        let store = SqlStorage::connect(&dsn).await.expect("connect");

        let mut writers = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let store = store.clone();
            writers.spawn(async move {
                for _ in 0..50 {
                    store.update(&Metric::counter("hits", 1)).await?;
                }
                Ok::<_, StorageError>(())
            });
        }
        while let Some(res) = writers.join_next().await {
            res.expect("join").expect("every update succeeds");
        }

        let hits = store.get("hits", MetricKind::Counter).await.expect("get");
        assert_eq!(hits.value, MetricValue::Counter(400));
        store.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_concurrent_batches_on_file_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dsn = format!("sqlite://{}", dir.path().join("metrics.db").display());
        let store = SqlStorage::connect(&dsn).await.expect("connect");

        let mut writers = tokio::task::JoinSet::new();
        for i in 0..6u8 {
            let store = store.clone();
            writers.spawn(async move {
                store
                    .add_batch(&[
                        Metric::counter("PollCount", 2),
                        Metric::gauge("Alloc", f64::from(i)),
                    ])
                    .await
            });
        }
        while let Some(res) = writers.join_next().await {
            res.expect("join").expect("every batch commits");
        }

        let polls = store.get("PollCount", MetricKind::Counter).await.expect("get");
        assert_eq!(polls.value, MetricValue::Counter(12));
        store.close().await.expect("close");
    }
}
