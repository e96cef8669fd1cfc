//! Concurrent randomized point reads across replicas.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::config::{Endpoint, ReplicaId};
use crate::datastore::{Connection, Connector, RecordId};
use crate::error::{VerifyError, VerifyResult};
use crate::fanout::map_replicas;

/// Read results for one replica.
#[derive(Clone, Debug, Serialize)]
pub struct ReadOutcome {
    pub replica: ReplicaId,
    pub label: String,
    /// Lookups issued (the per-replica share of the budget).
    pub attempted: usize,
    /// Lookups that returned the row.
    pub succeeded: usize,
    #[serde(serialize_with = "crate::report::duration_ms")]
    pub elapsed: Duration,
    /// Set when the replica could not be read at all.
    pub error: Option<String>,
}

impl ReadOutcome {
    pub fn failed(&self) -> usize {
        self.attempted - self.succeeded
    }

    /// Successful reads per second; 0 when no time elapsed.
    pub fn reads_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.succeeded as f64 / secs
        } else {
            0.0
        }
    }

    /// No lookup succeeded.
    pub fn failed_entirely(&self) -> bool {
        self.succeeded == 0
    }
}

/// Each replica gets `budget div replicas` reads; the remainder is dropped.
pub fn reads_per_replica(budget: usize, replicas: usize) -> usize {
    if replicas == 0 {
        return 0;
    }
    budget / replicas
}

/// Derives a per-replica RNG seed from the run seed.
pub fn replica_seed(seed: u64, replica: ReplicaId) -> u64 {
    seed ^ (replica.0 as u64).wrapping_mul(0x9e3779b97f4a7c15)
}

/// Draws `count` identifiers uniformly, with replacement.
pub fn pick_ids<R: Rng>(rng: &mut R, ids: &[RecordId], count: usize) -> Vec<RecordId> {
    if ids.is_empty() {
        return Vec::new();
    }
    (0..count).map(|_| ids[rng.gen_range(0..ids.len())]).collect()
}

/// Spreads `budget` point reads across `replicas`, one task and one
/// connection per replica, lookups sequential within a task.
///
/// A lookup that exceeds `op_timeout` ends that replica's reads: the rest of
/// its share counts as unsuccessful and the connection is dropped.
pub async fn dispatch_reads<C>(
    connector: &Arc<C>,
    replicas: &[Endpoint],
    ids: &[RecordId],
    budget: usize,
    seed: u64,
    op_timeout: Duration,
) -> VerifyResult<Vec<ReadOutcome>>
where
    C: Connector,
{
    if ids.is_empty() {
        return Err(VerifyError::Configuration(
            "read dispatch needs at least one written record".into(),
        ));
    }
    let per_replica = reads_per_replica(budget, replicas.len());
    info!(
        budget,
        per_replica,
        dropped = budget - per_replica * replicas.len(),
        replicas = replicas.len(),
        "dispatching concurrent reads"
    );

    // Draw every replica's workload up front so tasks only do I/O.
    let inputs = replicas
        .iter()
        .enumerate()
        .map(|(idx, endpoint)| {
            let mut rng = SmallRng::seed_from_u64(replica_seed(seed, ReplicaId(idx)));
            (endpoint.clone(), pick_ids(&mut rng, ids, per_replica))
        })
        .collect::<Vec<_>>();

    let results = map_replicas(inputs, replicas.len(), |replica, (endpoint, picks)| {
        let connector = connector.clone();
        async move { read_replica(connector.as_ref(), replica, endpoint, picks, op_timeout).await }
    })
    .await;

    let outcomes = results
        .into_iter()
        .enumerate()
        .map(|(idx, result)| {
            result.unwrap_or_else(|err| ReadOutcome {
                replica: ReplicaId(idx),
                label: replicas[idx].label(),
                attempted: per_replica,
                succeeded: 0,
                elapsed: Duration::ZERO,
                error: Some(err.to_string()),
            })
        })
        .collect::<Vec<_>>();

    for outcome in &outcomes {
        info!(
            replica = %outcome.label,
            succeeded = outcome.succeeded,
            attempted = outcome.attempted,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            reads_per_sec = outcome.reads_per_sec(),
            "replica reads done"
        );
    }
    Ok(outcomes)
}

async fn read_replica<C>(
    connector: &C,
    replica: ReplicaId,
    endpoint: Endpoint,
    picks: Vec<RecordId>,
    op_timeout: Duration,
) -> ReadOutcome
where
    C: Connector,
{
    let label = endpoint.label();
    let mut outcome = ReadOutcome {
        replica,
        label: label.clone(),
        attempted: picks.len(),
        succeeded: 0,
        elapsed: Duration::ZERO,
        error: None,
    };

    let mut conn = match time::timeout(op_timeout, connector.connect(&endpoint)).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(err)) => {
            warn!(replica = %label, error = %format!("{err:#}"), "cannot read from replica");
            outcome.error = Some(format!("connect failed: {err:#}"));
            return outcome;
        }
        Err(_) => {
            warn!(replica = %label, ?op_timeout, "connect to replica timed out");
            outcome.error = Some(format!("connect timed out after {op_timeout:?}"));
            return outcome;
        }
    };

    let started = Instant::now();
    for id in picks {
        match time::timeout(op_timeout, conn.fetch_record(id)).await {
            Ok(Ok(Some(_))) => outcome.succeeded += 1,
            Ok(Ok(None)) => debug!(replica = %label, id, "row not visible"),
            Ok(Err(err)) => {
                debug!(replica = %label, id, error = %format!("{err:#}"), "point read failed")
            }
            Err(_) => {
                // The abandoned query may still hold the connection.
                warn!(replica = %label, id, ?op_timeout, "point read timed out; stopping reads");
                outcome.error = Some(format!("point read timed out after {op_timeout:?}"));
                break;
            }
        }
    }
    outcome.elapsed = started.elapsed();
    outcome
}
