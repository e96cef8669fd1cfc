//! PostgreSQL implementation of the datastore capability.

use std::time::{Duration, SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, info, warn};

use crate::config::Endpoint;
use crate::datastore::{Connection, Connector, NewRecord, Record, RecordId};

const TABLE_DDL: &str = "
    DROP TABLE IF EXISTS replication_test CASCADE;
    CREATE TABLE replication_test (
        id BIGSERIAL PRIMARY KEY,
        test_data VARCHAR(255) NOT NULL,
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        random_value INTEGER NOT NULL
    );
    CREATE INDEX idx_replication_test_created_at ON replication_test(created_at);
";

const INSERT_SQL: &str =
    "INSERT INTO replication_test (test_data, random_value) VALUES ($1, $2) RETURNING id";
const MARKER_SQL: &str = "SELECT 1 FROM replication_test WHERE test_data = $1 LIMIT 1";
const POINT_READ_SQL: &str =
    "SELECT id, test_data, random_value, created_at FROM replication_test WHERE id = $1";
const MULTI_READ_SQL: &str = "SELECT id, test_data, random_value, created_at \
                              FROM replication_test WHERE id = ANY($1) ORDER BY id";
const REPLAY_LAG_SQL: &str =
    "SELECT EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp()))::float8";

/// Row-count interval for write progress logging.
const PROGRESS_EVERY: usize = 100;

/// Opens plain-TCP `tokio_postgres` connections.
#[derive(Clone, Debug)]
pub struct PgConnector {
    connect_timeout: Duration,
}

impl PgConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for PgConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Conn = PgConnection;

    async fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<PgConnection> {
        let label = endpoint.label();
        debug!(
            "Connecting: host={} port={} user={} dbname={}",
            endpoint.host, endpoint.port, endpoint.user, endpoint.database
        );

        let mut config = tokio_postgres::Config::new();
        config
            .host(&endpoint.host)
            .port(endpoint.port)
            .user(&endpoint.user)
            .password(&endpoint.password)
            .dbname(&endpoint.database)
            .connect_timeout(self.connect_timeout);

        let (client, connection) = config
            .connect(NoTls)
            .await
            .with_context(|| format!("Failed to connect to {label}/{}", endpoint.database))?;

        // The driver task ends once `client` is dropped.
        let driver_label = label.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(endpoint = %driver_label, "Connection error: {}", e);
            }
        });

        Ok(PgConnection { client, label })
    }
}

/// One `tokio_postgres` client plus the label of the server it talks to.
pub struct PgConnection {
    client: Client,
    label: String,
}

fn record_from_row(row: &Row) -> anyhow::Result<Record> {
    Ok(Record {
        id: row.try_get("id")?,
        payload: row.try_get("test_data")?,
        tag: row.try_get("random_value")?,
        created_at: row.try_get::<_, Option<SystemTime>>("created_at")?,
    })
}

#[async_trait]
impl Connection for PgConnection {
    async fn recreate_schema(&mut self) -> anyhow::Result<()> {
        self.client
            .batch_execute(TABLE_DDL)
            .await
            .with_context(|| format!("recreate replication_test on {}", self.label))?;
        debug!(endpoint = %self.label, "replication_test recreated");
        Ok(())
    }

    async fn row_count(&mut self) -> anyhow::Result<u64> {
        let row = self
            .client
            .query_one("SELECT COUNT(*) FROM replication_test", &[])
            .await
            .context("count replication_test rows")?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    async fn in_recovery(&mut self) -> anyhow::Result<bool> {
        let row = self
            .client
            .query_one("SELECT pg_is_in_recovery()", &[])
            .await
            .context("query pg_is_in_recovery")?;
        Ok(row.try_get(0)?)
    }

    async fn replay_lag(&mut self) -> anyhow::Result<Option<Duration>> {
        let row = self
            .client
            .query_one(REPLAY_LAG_SQL, &[])
            .await
            .context("query replay lag")?;
        let secs: Option<f64> = row.try_get(0)?;
        Ok(secs
            .filter(|s| s.is_finite())
            .map(|s| Duration::from_secs_f64(s.max(0.0))))
    }

    async fn insert_batch(&mut self, records: &[NewRecord]) -> anyhow::Result<Vec<RecordId>> {
        // Dropping an uncommitted transaction rolls it back.
        let txn = self.client.transaction().await.context("begin write batch")?;
        let stmt = txn.prepare(INSERT_SQL).await.context("prepare insert")?;

        let mut ids = Vec::with_capacity(records.len());
        for (idx, record) in records.iter().enumerate() {
            let row = txn
                .query_one(&stmt, &[&record.payload, &record.tag])
                .await
                .with_context(|| format!("insert row {} of {}", idx + 1, records.len()))?;
            ids.push(row.try_get::<_, i64>(0)?);
            if (idx + 1) % PROGRESS_EVERY == 0 {
                info!(written = idx + 1, total = records.len(), "writing records");
            }
        }

        txn.commit().await.context("commit write batch")?;
        Ok(ids)
    }

    async fn marker_visible(&mut self, marker: &str) -> anyhow::Result<bool> {
        let row = self
            .client
            .query_opt(MARKER_SQL, &[&marker])
            .await
            .context("marker lookup")?;
        Ok(row.is_some())
    }

    async fn fetch_record(&mut self, id: RecordId) -> anyhow::Result<Option<Record>> {
        let row = self
            .client
            .query_opt(POINT_READ_SQL, &[&id])
            .await
            .with_context(|| format!("point read id={id}"))?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn fetch_records(&mut self, ids: &[RecordId]) -> anyhow::Result<Vec<Record>> {
        let ids = ids.to_vec();
        let rows = self
            .client
            .query(MULTI_READ_SQL, &[&ids])
            .await
            .context("multi-record read")?;
        rows.iter().map(record_from_row).collect()
    }
}
