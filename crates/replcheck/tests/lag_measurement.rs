mod common;

use std::time::Duration;

use anyhow::Result;
use common::{quick_settings, TestCluster};
use replcheck::config::ProbeErrorPolicy;
use replcheck::memory::NodeBehavior;
use replcheck::stats::ReplicaHealth;
use replcheck::{render_text, Phase, VerifyError};

#[tokio::test(start_paused = true)]
async fn lag_only_run_reports_every_replica() -> Result<()> {
    let cluster = TestCluster::new(vec![
        NodeBehavior::replica(Duration::from_millis(30)),
        NodeBehavior::replica(Duration::from_millis(120)),
    ]);
    let mut settings = quick_settings();
    settings.lag.samples = 4;
    settings.lag.poll_interval = Duration::from_millis(50);

    let report = cluster.orchestrator(settings).run_lag_only().await?;

    let phases = report.phases.iter().map(|t| t.phase).collect::<Vec<_>>();
    assert_eq!(phases, vec![Phase::LagMeasurement, Phase::Report]);
    assert!(report.writes.is_none());
    assert!(report.reads.is_empty());
    assert_eq!(report.lag_rounds, 4);

    for (stats, floor_ms) in report.lag.iter().zip([30u64, 120]) {
        assert_eq!(stats.attempted, 4);
        assert_eq!(stats.succeeded, 4);
        let latency = stats.latency.expect("latency summary");
        assert!(latency.min >= Duration::from_millis(floor_ms), "{latency:?}");
        assert!(latency.max < Duration::from_millis(floor_ms + 50), "{latency:?}");
        assert!(latency.p95 <= latency.max && latency.p95 >= latency.min);
    }
    // Lag-only runs leave only their markers behind.
    assert_eq!(cluster.memory.row_count(), 4);
    assert_eq!(cluster.memory.open_connections(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn lag_only_run_needs_the_table() -> Result<()> {
    let cluster = TestCluster::without_table(vec![NodeBehavior::replica(Duration::ZERO)]);

    let err = cluster
        .orchestrator(quick_settings())
        .run_lag_only()
        .await
        .unwrap_err();

    assert!(matches!(err, VerifyError::Query { .. }), "{err}");
    assert!(err.to_string().contains("replication_test"), "{err}");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn one_missed_round_makes_a_replica_partial() -> Result<()> {
    // Markers get ids 1, 2, 3, 4 in an empty table; id 2 never reaches replica2.
    let cluster = TestCluster::new(vec![
        NodeBehavior::replica(Duration::from_millis(10)),
        NodeBehavior::replica(Duration::from_millis(10)).missing(2),
    ]);
    let mut settings = quick_settings();
    settings.lag.samples = 4;

    let report = cluster.orchestrator(settings).run_lag_only().await?;

    assert_eq!(report.lag[0].health, ReplicaHealth::Healthy);
    let partial = &report.lag[1];
    assert_eq!(partial.health, ReplicaHealth::Partial);
    assert_eq!((partial.succeeded, partial.timed_out, partial.failed), (3, 1, 0));
    assert!(report.failed_replicas().is_empty());

    let text = render_text(&report);
    assert!(text.contains("replica2:5432: PARTIAL 3/4 samples"), "{text}");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn probe_error_policy_decides_failed_versus_timed_out() -> Result<()> {
    for (policy, expect_failed, expect_timed_out) in [
        (ProbeErrorPolicy::Abort, 2, 0),
        (ProbeErrorPolicy::RetryUntilTimeout, 0, 2),
    ] {
        let cluster = TestCluster::new(vec![
            NodeBehavior::replica(Duration::ZERO).failing_queries(),
        ]);
        let mut settings = quick_settings();
        settings.lag.samples = 2;
        settings.lag.error_policy = policy;

        let report = cluster.orchestrator(settings).run_lag_only().await?;

        let stats = &report.lag[0];
        assert_eq!(stats.health, ReplicaHealth::Failed, "{policy:?}");
        assert_eq!(stats.failed, expect_failed, "{policy:?}");
        assert_eq!(stats.timed_out, expect_timed_out, "{policy:?}");
        assert!(stats.latency.is_none());
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rounds_do_not_overlap() -> Result<()> {
    // Each round waits for its slowest probe, then the round delay.
    let cluster = TestCluster::new(vec![
        NodeBehavior::replica(Duration::from_millis(10)),
        NodeBehavior::replica(Duration::from_millis(200)),
    ]);
    let mut settings = quick_settings();
    settings.lag.samples = 3;
    settings.lag.poll_interval = Duration::from_millis(10);
    settings.lag.round_delay = Duration::from_millis(50);

    let started = tokio::time::Instant::now();
    let report = cluster.orchestrator(settings).run_lag_only().await?;
    let elapsed = started.elapsed();

    // 3 rounds of 200ms plus 2 pauses of 50ms.
    assert!(elapsed >= Duration::from_millis(700), "{elapsed:?}");
    assert!(report.lag.iter().all(|s| s.health == ReplicaHealth::Healthy));
    Ok(())
}
