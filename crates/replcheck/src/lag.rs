//! Repeated-sample replication lag measurement.
//!
//! Each round writes one marker row on the primary, records the commit
//! instant, and then probes every replica in parallel until the marker shows
//! up or the probe times out. Rounds run strictly one after another with a
//! fixed pause in between, so a marker is never confused with a later one.
//!
//! Every replica owns one connection for the whole measurement. A replica
//! whose connection could not be opened still gets one failed sample per
//! round; the result always has `replicas × samples` entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Endpoint, LagSettings, ReplicaId};
use crate::datastore::{Connection, Connector, NewRecord};
use crate::error::{VerifyError, VerifyResult};
use crate::fanout::map_replicas;
use crate::probe::{probe_marker, ProbeConfig, ProbeOutcome};

/// Outcome of one (replica, round) pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Time from primary commit to visibility on the replica.
    Replicated(Duration),
    TimedOut,
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct LagSample {
    pub replica: ReplicaId,
    pub round: usize,
    pub outcome: SampleOutcome,
}

/// Per-replica probe connection carried from one round to the next.
enum ProbeSlot<T> {
    Ready(T),
    Unavailable(String),
}

/// Runs `settings.samples` lag rounds against every replica.
///
/// Fails only when the primary rejects a marker write; replica problems are
/// recorded as failed samples.
pub async fn measure_lag<C>(
    connector: &Arc<C>,
    primary: &mut C::Conn,
    replicas: &[Endpoint],
    settings: &LagSettings,
) -> VerifyResult<Vec<LagSample>>
where
    C: Connector,
{
    let probe = ProbeConfig {
        poll_interval: settings.poll_interval,
        timeout: settings.probe_timeout,
        error_policy: settings.error_policy,
    };
    let labels = replicas.iter().map(Endpoint::label).collect::<Vec<_>>();
    info!(
        samples = settings.samples,
        replicas = replicas.len(),
        "measuring replication lag (primary commit to replica visibility)"
    );

    let mut slots = open_probe_connections(connector, replicas).await;
    let mut samples = Vec::with_capacity(replicas.len() * settings.samples);

    for round in 0..settings.samples {
        let marker = Uuid::new_v4().to_string();
        primary
            .insert_batch(&[NewRecord {
                payload: marker.clone(),
                tag: 0,
            }])
            .await
            .map_err(VerifyError::Write)?;
        let committed = Instant::now();

        let inputs = std::mem::take(&mut slots);
        let results = map_replicas(inputs, replicas.len(), |_, slot| {
            let marker = marker.clone();
            async move {
                match slot {
                    ProbeSlot::Ready(mut conn) => {
                        let outcome = probe_marker(&mut conn, &marker, &probe).await;
                        (ProbeSlot::Ready(conn), outcome)
                    }
                    ProbeSlot::Unavailable(reason) => {
                        let outcome = ProbeOutcome::Failed(reason.clone());
                        (ProbeSlot::Unavailable(reason), outcome)
                    }
                }
            }
        })
        .await;

        for (idx, result) in results.into_iter().enumerate() {
            let (slot, outcome) = result.unwrap_or_else(|err| {
                let reason = err.to_string();
                (
                    ProbeSlot::Unavailable(reason.clone()),
                    ProbeOutcome::Failed(reason),
                )
            });
            let outcome = match outcome {
                ProbeOutcome::Detected(at) => {
                    SampleOutcome::Replicated(at.saturating_duration_since(committed))
                }
                ProbeOutcome::TimedOut => SampleOutcome::TimedOut,
                ProbeOutcome::Failed(reason) => SampleOutcome::Failed(reason),
            };
            match &outcome {
                SampleOutcome::Replicated(lag) => {
                    debug!(replica = %labels[idx], round = round + 1, lag_ms = lag.as_secs_f64() * 1000.0, "marker replicated")
                }
                SampleOutcome::TimedOut => {
                    warn!(replica = %labels[idx], round = round + 1, "marker not visible before probe timeout")
                }
                SampleOutcome::Failed(reason) => {
                    warn!(replica = %labels[idx], round = round + 1, error = %reason, "lag probe failed")
                }
            }
            samples.push(LagSample {
                replica: ReplicaId(idx),
                round,
                outcome,
            });
            slots.push(slot);
        }

        info!(round = round + 1, samples = settings.samples, "lag sample done");
        if round + 1 < settings.samples {
            time::sleep(settings.round_delay).await;
        }
    }

    Ok(samples)
}

async fn open_probe_connections<C>(
    connector: &Arc<C>,
    replicas: &[Endpoint],
) -> Vec<ProbeSlot<C::Conn>>
where
    C: Connector,
{
    let results = map_replicas(replicas.to_vec(), replicas.len(), |_, endpoint| {
        let connector = connector.clone();
        async move {
            let conn = connector.connect(&endpoint).await;
            (endpoint.label(), conn)
        }
    })
    .await;

    results
        .into_iter()
        .map(|result| match result {
            Ok((_, Ok(conn))) => ProbeSlot::Ready(conn),
            Ok((label, Err(err))) => {
                warn!(replica = %label, error = %format!("{err:#}"), "replica unreachable; its lag samples will fail");
                ProbeSlot::Unavailable(format!("connect to {label} failed: {err:#}"))
            }
            Err(err) => ProbeSlot::Unavailable(err.to_string()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::memory::{MemoryCluster, NodeBehavior};

    fn endpoint(host: &str, role: Role) -> Endpoint {
        Endpoint {
            host: host.to_string(),
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: "secret".to_string(),
            role,
        }
    }

    fn settings(samples: usize) -> LagSettings {
        LagSettings {
            samples,
            poll_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(1_000),
            round_delay: Duration::from_millis(500),
            ..LagSettings::default()
        }
    }

    async fn setup(replicas: Vec<NodeBehavior>) -> (Arc<MemoryCluster>, Vec<Endpoint>, Endpoint) {
        let cluster = MemoryCluster::new();
        let primary = endpoint("primary", Role::Primary);
        cluster.add_node(&primary, NodeBehavior::primary());
        let endpoints = replicas
            .into_iter()
            .enumerate()
            .map(|(idx, behavior)| {
                let ep = endpoint(&format!("replica{}", idx + 1), Role::Replica);
                cluster.add_node(&ep, behavior);
                ep
            })
            .collect();
        cluster.create_table();
        (Arc::new(cluster), endpoints, primary)
    }

    #[tokio::test(start_paused = true)]
    async fn one_sample_per_replica_per_round() {
        for (replica_count, rounds) in [(1usize, 1usize), (2, 3), (3, 4)] {
            let behaviors = (0..replica_count)
                .map(|i| NodeBehavior::replica(Duration::from_millis(20 * i as u64)))
                .collect();
            let (cluster, replicas, primary) = setup(behaviors).await;
            let mut primary_conn = cluster.connect(&primary).await.expect("primary");

            let samples = measure_lag(&cluster, &mut primary_conn, &replicas, &settings(rounds))
                .await
                .expect("lag run");

            assert_eq!(samples.len(), replica_count * rounds);
            for round in 0..rounds {
                for replica in 0..replica_count {
                    let count = samples
                        .iter()
                        .filter(|s| s.round == round && s.replica == ReplicaId(replica))
                        .count();
                    assert_eq!(count, 1, "round {round} replica {replica}");
                }
            }
            assert!(samples
                .iter()
                .all(|s| matches!(s.outcome, SampleOutcome::Replicated(_))));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_replica_still_yields_failed_samples() {
        let (cluster, replicas, primary) = setup(vec![
            NodeBehavior::replica(Duration::from_millis(30)),
            NodeBehavior::replica(Duration::ZERO).unreachable(),
        ])
        .await;
        let mut primary_conn = cluster.connect(&primary).await.expect("primary");

        let samples = measure_lag(&cluster, &mut primary_conn, &replicas, &settings(3))
            .await
            .expect("lag run");

        assert_eq!(samples.len(), 6);
        let (healthy, broken): (Vec<_>, Vec<_>) =
            samples.iter().partition(|s| s.replica == ReplicaId(0));
        assert!(healthy
            .iter()
            .all(|s| matches!(s.outcome, SampleOutcome::Replicated(lag) if lag >= Duration::from_millis(30))));
        assert!(broken
            .iter()
            .all(|s| matches!(&s.outcome, SampleOutcome::Failed(reason) if reason.contains("replica2"))));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_replica_times_out_each_round() {
        let (cluster, replicas, primary) = setup(vec![NodeBehavior::stalled()]).await;
        let mut primary_conn = cluster.connect(&primary).await.expect("primary");

        let samples = measure_lag(&cluster, &mut primary_conn, &replicas, &settings(2))
            .await
            .expect("lag run");

        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.outcome == SampleOutcome::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn marker_write_failure_aborts_with_write_error() {
        let (cluster, replicas, primary) =
            setup(vec![NodeBehavior::replica(Duration::ZERO)]).await;
        cluster.set_behavior(&primary, NodeBehavior::primary().max_batch(0));
        let mut primary_conn = cluster.connect(&primary).await.expect("primary");

        let err = measure_lag(&cluster, &mut primary_conn, &replicas, &settings(2))
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Write(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_connections_are_released_after_measurement() {
        let (cluster, replicas, primary) = setup(vec![
            NodeBehavior::replica(Duration::from_millis(10)),
            NodeBehavior::replica(Duration::from_millis(60)),
        ])
        .await;
        let mut primary_conn = cluster.connect(&primary).await.expect("primary");

        measure_lag(&cluster, &mut primary_conn, &replicas, &settings(2))
            .await
            .expect("lag run");

        assert_eq!(cluster.open_connections(), 1);
        drop(primary_conn);
        assert_eq!(cluster.open_connections(), 0);
    }
}
