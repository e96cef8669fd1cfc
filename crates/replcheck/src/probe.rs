//! Polls one replica until a marker row becomes visible.

use std::time::Duration;

use tokio::time::{self, Instant};
use tracing::debug;

use crate::config::ProbeErrorPolicy;
use crate::datastore::Connection;

/// Polling parameters for a single probe.
#[derive(Clone, Copy, Debug)]
pub struct ProbeConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub error_policy: ProbeErrorPolicy,
}

/// How a probe ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The marker was seen at this instant.
    Detected(Instant),
    /// The timeout elapsed without seeing the marker.
    TimedOut,
    /// A query failed and the policy said to stop.
    Failed(String),
}

/// Polls `conn` for `marker` until it is visible or `config.timeout` elapses.
///
/// The timeout clock starts when the probe is called. Each query is bounded
/// by the remaining time, so a hung server cannot stall the probe past its
/// deadline. The probe sleeps `poll_interval` between attempts.
pub async fn probe_marker<C>(conn: &mut C, marker: &str, config: &ProbeConfig) -> ProbeOutcome
where
    C: Connection + ?Sized,
{
    let deadline = Instant::now() + config.timeout;
    let poll_interval = config.poll_interval.max(Duration::from_millis(1));
    let mut attempts = 0u64;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        match time::timeout(remaining, conn.marker_visible(marker)).await {
            Ok(Ok(true)) => return ProbeOutcome::Detected(Instant::now()),
            Ok(Ok(false)) => {}
            Ok(Err(err)) => match config.error_policy {
                ProbeErrorPolicy::Abort => return ProbeOutcome::Failed(format!("{err:#}")),
                ProbeErrorPolicy::RetryUntilTimeout => {
                    debug!(attempts, error = %format!("{err:#}"), "marker poll failed; retrying");
                }
            },
            Err(_) => return ProbeOutcome::TimedOut,
        }

        let now = Instant::now();
        if now >= deadline {
            debug!(attempts, "marker not visible before timeout");
            return ProbeOutcome::TimedOut;
        }
        time::sleep(poll_interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, Role};
    use crate::datastore::{Connector, NewRecord};
    use crate::memory::{MemoryCluster, MemoryConnection, NodeBehavior};

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

    fn config(poll_ms: u64, timeout_ms: u64, error_policy: ProbeErrorPolicy) -> ProbeConfig {
        ProbeConfig {
            poll_interval: Duration::from_millis(poll_ms),
            timeout: Duration::from_millis(timeout_ms),
            error_policy,
        }
    }

    async fn cluster_with(replica: NodeBehavior) -> (MemoryCluster, MemoryConnection, MemoryConnection) {
        let cluster = MemoryCluster::new();
        let primary = endpoint("primary", Role::Primary);
        let replica_ep = endpoint("replica", Role::Replica);
        cluster.add_node(&primary, NodeBehavior::primary());
        cluster.add_node(&replica_ep, replica);
        cluster.create_table();
        let writer = cluster.connect(&primary).await.expect("primary");
        let reader = cluster.connect(&replica_ep).await.expect("replica");
        (cluster, writer, reader)
    }

    async fn write_marker(conn: &mut MemoryConnection, marker: &str) -> Instant {
        conn.insert_batch(&[NewRecord {
            payload: marker.to_string(),
            tag: 0,
        }])
        .await
        .expect("insert marker");
        Instant::now()
    }

    #[tokio::test(start_paused = true)]
    async fn detects_marker_within_one_poll_interval_of_visibility() {
        let (_cluster, mut writer, mut reader) =
            cluster_with(NodeBehavior::replica(Duration::from_millis(120))).await;
        let committed = write_marker(&mut writer, "m-120").await;

        let outcome = probe_marker(
            &mut reader,
            "m-120",
            &config(50, 10_000, ProbeErrorPolicy::Abort),
        )
        .await;

        let at = match outcome {
            ProbeOutcome::Detected(at) => at,
            other => panic!("expected detection, got {other:?}"),
        };
        let latency = at.duration_since(committed);
        assert!(latency >= Duration::from_millis(120), "{latency:?}");
        assert!(latency < Duration::from_millis(170), "{latency:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_replica_times_out_at_deadline() {
        let (_cluster, mut writer, mut reader) = cluster_with(NodeBehavior::stalled()).await;
        write_marker(&mut writer, "never").await;

        let started = Instant::now();
        let outcome = probe_marker(
            &mut reader,
            "never",
            &config(50, 1_000, ProbeErrorPolicy::Abort),
        )
        .await;

        assert_eq!(outcome, ProbeOutcome::TimedOut);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(1_000), "{waited:?}");
        assert!(waited < Duration::from_millis(1_100), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn query_error_aborts_immediately_by_default() {
        let (_cluster, mut writer, mut reader) =
            cluster_with(NodeBehavior::replica(Duration::ZERO).failing_queries()).await;
        write_marker(&mut writer, "m").await;

        let started = Instant::now();
        let outcome = probe_marker(&mut reader, "m", &config(50, 5_000, ProbeErrorPolicy::Abort)).await;

        assert!(matches!(outcome, ProbeOutcome::Failed(_)), "{outcome:?}");
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_policy_polls_until_timeout() {
        let (_cluster, mut writer, mut reader) =
            cluster_with(NodeBehavior::replica(Duration::ZERO).failing_queries()).await;
        write_marker(&mut writer, "m").await;

        let started = Instant::now();
        let outcome = probe_marker(
            &mut reader,
            "m",
            &config(50, 500, ProbeErrorPolicy::RetryUntilTimeout),
        )
        .await;

        assert_eq!(outcome, ProbeOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_queries_cannot_outlive_the_deadline() {
        let (_cluster, mut writer, mut reader) = cluster_with(
            NodeBehavior::stalled().with_query_delay(Duration::from_secs(60)),
        )
        .await;
        write_marker(&mut writer, "m").await;

        let started = Instant::now();
        let outcome = probe_marker(&mut reader, "m", &config(50, 2_000, ProbeErrorPolicy::Abort)).await;

        assert_eq!(outcome, ProbeOutcome::TimedOut);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3), "{waited:?}");
    }
}
