//! In-memory simulated primary/replica cluster.
//!
//! Every node shares one table owned by the primary. A replica sees a row only
//! once its replication delay has passed since the row was committed, which is
//! enough to exercise lag probing, read dispatch, and consistency checks
//! without a live database. Time comes from `tokio::time`, so tests running
//! with a paused clock observe exact, repeatable latencies.
//!
//! Fault knobs per node: unreachable, failing queries, never-replicating,
//! missing or diverged rows, writable (not in recovery), and insert failures.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::{ClusterConfig, Endpoint};
use crate::datastore::{Connection, Connector, NewRecord, Record, RecordId};

/// Behavior of one simulated node.
#[derive(Clone, Debug)]
pub struct NodeBehavior {
    /// Replication delay; `None` means rows never arrive.
    pub lag: Option<Duration>,
    /// Reported by `pg_is_in_recovery()`.
    pub in_recovery: bool,
    /// Connection attempts fail.
    pub unreachable: bool,
    /// Every query fails after connecting.
    pub failing_queries: bool,
    /// Artificial latency added to every query.
    pub query_delay: Duration,
    /// Rows never visible on this node.
    pub missing: HashSet<RecordId>,
    /// Rows whose payload differs on this node.
    pub diverged: HashMap<RecordId, String>,
    /// Reject any batch with more than this many rows.
    pub max_batch: Option<usize>,
}

impl NodeBehavior {
    pub fn primary() -> Self {
        Self {
            lag: Some(Duration::ZERO),
            in_recovery: false,
            unreachable: false,
            failing_queries: false,
            query_delay: Duration::ZERO,
            missing: HashSet::new(),
            diverged: HashMap::new(),
            max_batch: None,
        }
    }

    pub fn replica(lag: Duration) -> Self {
        Self {
            lag: Some(lag),
            in_recovery: true,
            ..Self::primary()
        }
    }

    /// A replica that never receives any row.
    pub fn stalled() -> Self {
        Self {
            lag: None,
            ..Self::replica(Duration::ZERO)
        }
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn failing_queries(mut self) -> Self {
        self.failing_queries = true;
        self
    }

    pub fn writable(mut self) -> Self {
        self.in_recovery = false;
        self
    }

    pub fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = delay;
        self
    }

    pub fn missing(mut self, id: RecordId) -> Self {
        self.missing.insert(id);
        self
    }

    pub fn diverged(mut self, id: RecordId, payload: impl Into<String>) -> Self {
        self.diverged.insert(id, payload.into());
        self
    }

    pub fn max_batch(mut self, rows: usize) -> Self {
        self.max_batch = Some(rows);
        self
    }
}

struct StoredRow {
    record: Record,
    committed_at: Instant,
}

#[derive(Default)]
struct ClusterState {
    table_exists: bool,
    next_id: RecordId,
    rows: BTreeMap<RecordId, StoredRow>,
    nodes: HashMap<String, NodeBehavior>,
    open_connections: usize,
    opened_total: usize,
}

impl ClusterState {
    fn visible(&self, behavior: &NodeBehavior, row: &StoredRow, now: Instant) -> Option<Record> {
        let lag = behavior.lag?;
        if now < row.committed_at + lag || behavior.missing.contains(&row.record.id) {
            return None;
        }
        let mut record = row.record.clone();
        if let Some(payload) = behavior.diverged.get(&record.id) {
            record.payload = payload.clone();
        }
        Some(record)
    }
}

/// Handle to a simulated cluster. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cluster matching `config`, with every replica delayed by `replica_lag`.
    /// The measurement table already exists.
    pub fn for_config(config: &ClusterConfig, replica_lag: Duration) -> Self {
        let cluster = Self::new();
        cluster.add_node(&config.primary, NodeBehavior::primary());
        for replica in &config.replicas {
            cluster.add_node(replica, NodeBehavior::replica(replica_lag));
        }
        cluster.create_table();
        cluster
    }

    pub fn add_node(&self, endpoint: &Endpoint, behavior: NodeBehavior) {
        self.lock().nodes.insert(endpoint.label(), behavior);
    }

    /// Replaces the behavior of an already registered node.
    pub fn set_behavior(&self, endpoint: &Endpoint, behavior: NodeBehavior) {
        self.add_node(endpoint, behavior);
    }

    /// Creates an empty table without going through a connection.
    pub fn create_table(&self) {
        let mut state = self.lock();
        state.table_exists = true;
        state.rows.clear();
        state.next_id = 1;
    }

    pub fn table_exists(&self) -> bool {
        self.lock().table_exists
    }

    /// Rows committed on the primary.
    pub fn row_count(&self) -> usize {
        self.lock().rows.len()
    }

    /// Connections currently held by callers.
    pub fn open_connections(&self) -> usize {
        self.lock().open_connections
    }

    /// Connections opened over the cluster's lifetime.
    pub fn opened_total(&self) -> usize {
        self.lock().opened_total
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        // A panicking test task must not wedge the other connections.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Connector for MemoryCluster {
    type Conn = MemoryConnection;

    async fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<MemoryConnection> {
        let label = endpoint.label();
        let mut state = self.lock();
        let behavior = state
            .nodes
            .get(&label)
            .ok_or_else(|| anyhow!("unknown host {label}"))?;
        if behavior.unreachable {
            bail!("connection to {label} refused");
        }
        state.open_connections += 1;
        state.opened_total += 1;
        Ok(MemoryConnection {
            cluster: self.clone(),
            node: label,
        })
    }
}

/// Connection to one simulated node. Dropping it releases the connection.
pub struct MemoryConnection {
    cluster: MemoryCluster,
    node: String,
}

impl MemoryConnection {
    /// Applies the node's query delay and failure knob, then returns its behavior.
    async fn begin_query(&self) -> anyhow::Result<NodeBehavior> {
        let behavior = self
            .cluster
            .lock()
            .nodes
            .get(&self.node)
            .cloned()
            .ok_or_else(|| anyhow!("host {} removed", self.node))?;
        if !behavior.query_delay.is_zero() {
            tokio::time::sleep(behavior.query_delay).await;
        }
        if behavior.failing_queries {
            bail!("server closed the connection unexpectedly ({})", self.node);
        }
        Ok(behavior)
    }

    fn require_table(state: &ClusterState) -> anyhow::Result<()> {
        if !state.table_exists {
            bail!("relation \"replication_test\" does not exist");
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut state = self.cluster.lock();
        state.open_connections = state.open_connections.saturating_sub(1);
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn recreate_schema(&mut self) -> anyhow::Result<()> {
        let behavior = self.begin_query().await?;
        if behavior.in_recovery {
            bail!("cannot execute DROP TABLE in a read-only transaction");
        }
        self.cluster.create_table();
        Ok(())
    }

    async fn row_count(&mut self) -> anyhow::Result<u64> {
        let behavior = self.begin_query().await?;
        let state = self.cluster.lock();
        Self::require_table(&state)?;
        let now = Instant::now();
        let count = state
            .rows
            .values()
            .filter(|row| state.visible(&behavior, row, now).is_some())
            .count();
        Ok(count as u64)
    }

    async fn in_recovery(&mut self) -> anyhow::Result<bool> {
        Ok(self.begin_query().await?.in_recovery)
    }

    async fn replay_lag(&mut self) -> anyhow::Result<Option<Duration>> {
        let behavior = self.begin_query().await?;
        Ok(if behavior.in_recovery { behavior.lag } else { None })
    }

    async fn insert_batch(&mut self, records: &[NewRecord]) -> anyhow::Result<Vec<RecordId>> {
        let behavior = self.begin_query().await?;
        if behavior.in_recovery {
            bail!("cannot execute INSERT in a read-only transaction");
        }
        if let Some(max) = behavior.max_batch {
            if records.len() > max {
                bail!("insert row {} of {} failed: disk full", max + 1, records.len());
            }
        }

        let mut state = self.cluster.lock();
        Self::require_table(&state)?;
        let committed_at = Instant::now();
        let created_at = SystemTime::now();
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let id = state.next_id;
            state.next_id += 1;
            state.rows.insert(
                id,
                StoredRow {
                    record: Record {
                        id,
                        payload: record.payload.clone(),
                        tag: record.tag,
                        created_at: Some(created_at),
                    },
                    committed_at,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn marker_visible(&mut self, marker: &str) -> anyhow::Result<bool> {
        let behavior = self.begin_query().await?;
        let state = self.cluster.lock();
        Self::require_table(&state)?;
        let now = Instant::now();
        Ok(state
            .rows
            .values()
            .filter_map(|row| state.visible(&behavior, row, now))
            .any(|record| record.payload == marker))
    }

    async fn fetch_record(&mut self, id: RecordId) -> anyhow::Result<Option<Record>> {
        let behavior = self.begin_query().await?;
        let state = self.cluster.lock();
        Self::require_table(&state)?;
        let now = Instant::now();
        Ok(state
            .rows
            .get(&id)
            .and_then(|row| state.visible(&behavior, row, now)))
    }

    async fn fetch_records(&mut self, ids: &[RecordId]) -> anyhow::Result<Vec<Record>> {
        let behavior = self.begin_query().await?;
        let state = self.cluster.lock();
        Self::require_table(&state)?;
        let wanted = ids.iter().copied().collect::<HashSet<_>>();
        let now = Instant::now();
        // BTreeMap iteration keeps identifier order.
        Ok(state
            .rows
            .values()
            .filter(|row| wanted.contains(&row.record.id))
            .filter_map(|row| state.visible(&behavior, row, now))
            .collect())
    }
}
