//! Per-replica reduction of lag samples.

use std::time::Duration;

use serde::Serialize;

use crate::config::ReplicaId;
use crate::lag::{LagSample, SampleOutcome};

/// How many lag rounds a replica got through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaHealth {
    /// Every round replicated.
    Healthy,
    /// Some rounds replicated.
    Partial,
    /// No round replicated.
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    #[serde(serialize_with = "crate::report::duration_ms")]
    pub mean: Duration,
    #[serde(serialize_with = "crate::report::duration_ms")]
    pub min: Duration,
    #[serde(serialize_with = "crate::report::duration_ms")]
    pub max: Duration,
    #[serde(serialize_with = "crate::report::duration_ms")]
    pub p95: Duration,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReplicaLagStats {
    pub replica: ReplicaId,
    pub label: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub timed_out: usize,
    pub failed: usize,
    pub health: ReplicaHealth,
    /// `None` when no round succeeded.
    pub latency: Option<LatencySummary>,
}

/// `sorted[floor(n * 0.95)]`, or the maximum when `n <= 1`.
///
/// `sorted` must be ascending. Returns `None` for an empty slice.
pub fn percentile_95(sorted: &[Duration]) -> Option<Duration> {
    let n = sorted.len();
    if n <= 1 {
        return sorted.last().copied();
    }
    let idx = ((n as f64) * 0.95).floor() as usize;
    sorted.get(idx.min(n - 1)).copied()
}

/// Summarizes successful latencies. `None` when there are none.
pub fn summarize(latencies: &[Duration]) -> Option<LatencySummary> {
    if latencies.is_empty() {
        return None;
    }
    let mut sorted = latencies.to_vec();
    sorted.sort_unstable();
    let total: Duration = sorted.iter().sum();
    Some(LatencySummary {
        mean: total / sorted.len() as u32,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        p95: percentile_95(&sorted)?,
    })
}

/// Groups `samples` by replica and reduces each group.
///
/// Returns one entry per label, so a replica with no samples at all still
/// shows up (as `Failed`).
pub fn aggregate(samples: &[LagSample], labels: &[String]) -> Vec<ReplicaLagStats> {
    labels
        .iter()
        .enumerate()
        .map(|(idx, label)| {
            let replica = ReplicaId(idx);
            let mut latencies = Vec::new();
            let mut attempted = 0;
            let mut timed_out = 0;
            let mut failed = 0;
            for sample in samples.iter().filter(|s| s.replica == replica) {
                attempted += 1;
                match sample.outcome {
                    SampleOutcome::Replicated(lag) => latencies.push(lag),
                    SampleOutcome::TimedOut => timed_out += 1,
                    SampleOutcome::Failed(_) => failed += 1,
                }
            }
            let succeeded = latencies.len();
            let health = if succeeded == 0 {
                ReplicaHealth::Failed
            } else if succeeded == attempted {
                ReplicaHealth::Healthy
            } else {
                ReplicaHealth::Partial
            };
            ReplicaLagStats {
                replica,
                label: label.clone(),
                attempted,
                succeeded,
                timed_out,
                failed,
                health,
                latency: summarize(&latencies),
            }
        })
        .collect()
}
