//! Run report: the structured result of a verification run, its text
//! rendering, and JSON output.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Serialize, Serializer};

use crate::config::ClusterConfig;
use crate::consistency::ConsistencyReport;
use crate::orchestrator::{PhaseTiming, RoleCheck, RoleStatus};
use crate::reads::ReadOutcome;
use crate::stats::{ReplicaHealth, ReplicaLagStats};
use crate::writer::WriteOutcome;

const RULE_WIDTH: usize = 70;

/// Serializes a duration as fractional milliseconds.
pub(crate) fn duration_ms<S: Serializer>(
    value: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(ms(*value))
}

pub(crate) fn opt_duration_ms<S: Serializer>(
    value: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(value) => serializer.serialize_some(&ms(*value)),
        None => serializer.serialize_none(),
    }
}

/// Everything one run measured.
#[derive(Clone, Debug, Serialize)]
pub struct Report {
    pub primary: String,
    pub replicas: Vec<String>,
    /// RNG seed actually used (never 0).
    pub seed: u64,
    pub phases: Vec<PhaseTiming>,
    pub roles: Vec<RoleCheck>,
    /// Role verification failed and the run continued anyway.
    pub role_override: bool,
    pub writes: Option<WriteOutcome>,
    pub reads: Vec<ReadOutcome>,
    pub consistency: Vec<ConsistencyReport>,
    /// Lag rounds requested.
    pub lag_rounds: usize,
    pub lag: Vec<ReplicaLagStats>,
}

impl Report {
    pub fn new(cluster: &ClusterConfig, seed: u64) -> Self {
        Self {
            primary: cluster.primary.label(),
            replicas: cluster.replica_labels(),
            seed,
            phases: Vec::new(),
            roles: Vec::new(),
            role_override: false,
            writes: None,
            reads: Vec::new(),
            consistency: Vec::new(),
            lag_rounds: 0,
            lag: Vec::new(),
        }
    }

    /// Every compared replica matched the primary.
    pub fn is_consistent(&self) -> bool {
        self.consistency.iter().all(ConsistencyReport::is_consistent)
    }

    /// Labels of replicas where no lag round succeeded.
    pub fn failed_replicas(&self) -> Vec<&str> {
        self.lag
            .iter()
            .filter(|stats| stats.health == ReplicaHealth::Failed)
            .map(|stats| stats.label.as_str())
            .collect()
    }
}

fn ms(value: Duration) -> f64 {
    value.as_nanos() as f64 / 1_000_000.0
}

/// Human-readable summary of `report`.
pub fn render_text(report: &Report) -> String {
    let rule = "=".repeat(RULE_WIDTH);
    let mut out = String::new();

    // Writes into a String cannot fail.
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "REPLICATION VERIFICATION REPORT");
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "Primary:  {}", report.primary);
    let _ = writeln!(out, "Replicas: {}", report.replicas.join(", "));
    let _ = writeln!(out, "Seed:     {}", report.seed);

    if !report.roles.is_empty() {
        let _ = writeln!(out, "\nReplica roles:");
        for check in &report.roles {
            let status = match &check.status {
                RoleStatus::Standby {
                    replay_lag: Some(lag),
                } => format!("in recovery (replay lag {:.2} s)", lag.as_secs_f64()),
                RoleStatus::Standby { replay_lag: None } => "in recovery".to_string(),
                RoleStatus::Writable => "NOT in recovery mode".to_string(),
                RoleStatus::Unreachable { error } => format!("unreachable: {error}"),
                RoleStatus::QueryFailed { error } => format!("status query failed: {error}"),
            };
            let _ = writeln!(out, "  {}: {status}", check.label);
        }
        if report.role_override {
            let _ = writeln!(out, "  (continued despite role verification failure)");
        }
    }

    if let Some(writes) = &report.writes {
        let _ = writeln!(
            out,
            "\nWrites: {} rows in {:.2} s ({:.2} rows/s)",
            writes.rows,
            writes.elapsed.as_secs_f64(),
            writes.rows_per_sec()
        );
    }

    if !report.reads.is_empty() {
        let _ = writeln!(out, "\nRead performance by replica:");
        for read in &report.reads {
            let _ = writeln!(out, "  {}:", read.label);
            let _ = writeln!(
                out,
                "    - Successful reads: {}/{}",
                read.succeeded, read.attempted
            );
            let _ = writeln!(out, "    - Time: {:.2} s", read.elapsed.as_secs_f64());
            let _ = writeln!(out, "    - Throughput: {:.2} reads/s", read.reads_per_sec());
            if let Some(error) = &read.error {
                let _ = writeln!(out, "    - FAILED: {error}");
            } else if read.failed_entirely() && read.attempted > 0 {
                let _ = writeln!(out, "    - FAILED: no read succeeded");
            }
        }
    }

    if !report.consistency.is_empty() {
        let verdict = if report.is_consistent() { "PASS" } else { "FAIL" };
        let _ = writeln!(out, "\nData consistency: {verdict}");
        for check in &report.consistency {
            if let Some(error) = &check.error {
                let _ = writeln!(out, "  {}: check failed: {error}", check.label);
            } else if check.count_mismatch {
                let _ = writeln!(
                    out,
                    "  {}: record count mismatch (primary {}, replica {}), {} mismatched",
                    check.label, check.expected_rows, check.observed_rows, check.mismatched_records
                );
            } else if check.mismatched_records > 0 {
                let _ = writeln!(
                    out,
                    "  {}: {} data mismatches",
                    check.label, check.mismatched_records
                );
            } else {
                let _ = writeln!(out, "  {}: consistent ({} rows)", check.label, check.observed_rows);
            }
        }
    }

    if !report.lag.is_empty() {
        let _ = writeln!(out, "\nReplication lag ({} rounds):", report.lag_rounds);
        for stats in &report.lag {
            match (&stats.health, &stats.latency) {
                (ReplicaHealth::Failed, _) | (_, None) => {
                    let _ = writeln!(
                        out,
                        "  {}: FAILED (no successful replications; {} timed out, {} failed)",
                        stats.label, stats.timed_out, stats.failed
                    );
                }
                (health, Some(latency)) => {
                    let partial = if *health == ReplicaHealth::Partial {
                        " PARTIAL"
                    } else {
                        ""
                    };
                    let _ = writeln!(
                        out,
                        "  {}:{partial} {}/{} samples",
                        stats.label, stats.succeeded, stats.attempted
                    );
                    let _ = writeln!(out, "    Average: {:.2} ms", ms(latency.mean));
                    let _ = writeln!(out, "    Min:     {:.2} ms", ms(latency.min));
                    let _ = writeln!(out, "    Max:     {:.2} ms", ms(latency.max));
                    let _ = writeln!(out, "    p95:     {:.2} ms", ms(latency.p95));
                    if stats.timed_out + stats.failed > 0 {
                        let _ = writeln!(
                            out,
                            "    Missed:  {} timed out, {} failed",
                            stats.timed_out, stats.failed
                        );
                    }
                }
            }
        }
    }

    if !report.phases.is_empty() {
        let _ = writeln!(out, "\nPhases:");
        for timing in &report.phases {
            let _ = writeln!(
                out,
                "  {:<18} {:>10.2} ms",
                timing.phase.name(),
                ms(timing.elapsed)
            );
        }
    }
    let _ = writeln!(out, "{rule}");
    out
}

/// Writes `report` as pretty JSON, creating parent directories as needed.
pub fn write_json(path: &Path, report: &Report) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(report).context("serialize report")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
