//! Datastore capability consumed by the measurement engine.
//!
//! The engine never talks to a database directly; it goes through
//! [`Connector`] and [`Connection`]. Concrete implementations live in
//! [`crate::pg`] (PostgreSQL) and [`crate::memory`] (simulated cluster).
//!
//! A connection is released when the value is dropped, so ownership is the
//! acquisition scope: every exit path of a phase, including a panicking task,
//! closes the connections that phase opened.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::config::Endpoint;

/// Identifier assigned by the primary (`BIGSERIAL`).
pub type RecordId = i64;

/// Row to be inserted. The identifier and creation time are server-assigned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewRecord {
    /// Random fill during bulk writes, or a marker token during lag rounds.
    pub payload: String,
    pub tag: i32,
}

/// Row as read back from any endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub id: RecordId,
    pub payload: String,
    pub tag: i32,
    pub created_at: Option<SystemTime>,
}

impl Record {
    /// True when the replicated fields match. Creation time is not compared.
    pub fn same_content(&self, other: &Record) -> bool {
        self.payload == other.payload && self.tag == other.tag
    }
}

/// Opens connections to cluster endpoints.
///
/// Shared across concurrently running per-replica tasks.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    async fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<Self::Conn>;
}

/// One exclusive connection to one endpoint.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Drops and recreates the measurement table. Idempotent.
    async fn recreate_schema(&mut self) -> anyhow::Result<()>;

    /// Number of rows currently visible in the measurement table.
    async fn row_count(&mut self) -> anyhow::Result<u64>;

    /// Whether the server reports itself in recovery (read-only standby).
    async fn in_recovery(&mut self) -> anyhow::Result<bool>;

    /// Replay lag reported by a standby, if it has replayed anything yet.
    async fn replay_lag(&mut self) -> anyhow::Result<Option<Duration>>;

    /// Inserts all rows inside one transaction and returns their identifiers
    /// in insertion order. On error nothing is committed.
    async fn insert_batch(&mut self, records: &[NewRecord]) -> anyhow::Result<Vec<RecordId>>;

    /// Whether a row whose payload equals `marker` is visible.
    async fn marker_visible(&mut self, marker: &str) -> anyhow::Result<bool>;

    /// Point lookup by identifier.
    async fn fetch_record(&mut self, id: RecordId) -> anyhow::Result<Option<Record>>;

    /// Fetches the given identifiers, ordered by identifier.
    async fn fetch_records(&mut self, ids: &[RecordId]) -> anyhow::Result<Vec<Record>>;
}
