//! Replication verifier CLI.
//!
//! Reads cluster endpoints from the environment (`PRIMARY_IP`,
//! `REPLICA_1_IP`, `REPLICA_2_IP`, ..., `POSTGRES_PASSWORD`), runs the
//! requested measurement, and prints a text report. `--out` additionally
//! writes the report as JSON.

use std::io::{IsTerminal, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use replcheck::config::{
    ClusterConfig, Endpoint, LagSettings, ProbeErrorPolicy, Role, RunSettings,
};
use replcheck::datastore::Connector;
use replcheck::memory::MemoryCluster;
use replcheck::pg::PgConnector;
use replcheck::{render_text, write_json, Orchestrator, Report, RoleCheck};
use tracing::{info, warn};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "replcheck", version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Full run: schema, role check, writes, reads, consistency, lag.
    Run(RunArgs),
    /// Lag measurement only, against an existing `replication_test` table.
    Lag(LagArgs),
    /// Full run against an in-memory simulated cluster.
    Simulate(SimulateArgs),
}

/// Write/read workload shape.
#[derive(clap::Args, Debug, Clone)]
struct WorkloadOptions {
    /// Rows written to the primary.
    #[arg(long, default_value_t = 1000)]
    writes: usize,

    /// Total point reads, split evenly across replicas.
    #[arg(long, default_value_t = 1000)]
    reads: usize,

    /// Seconds to wait for replication after the writes.
    #[arg(long, default_value_t = 2)]
    wait: u64,

    /// Leading written rows compared between primary and replicas.
    #[arg(long, default_value_t = 10)]
    consistency_sample: usize,

    /// Per-query timeout for role checks, point reads, and consistency fetches.
    #[arg(long, env = "REPLCHECK_OP_TIMEOUT", default_value = "30s")]
    op_timeout: humantime::Duration,
}

/// Repeated-sample lag measurement.
#[derive(clap::Args, Debug, Clone)]
struct LagOptions {
    /// Lag rounds (one marker write per round).
    #[arg(long, default_value_t = 20)]
    samples: usize,

    /// Delay between visibility polls on a replica.
    #[arg(long, default_value = "50ms")]
    poll_interval: humantime::Duration,

    /// Give up on a marker after this long.
    #[arg(long, default_value = "10s")]
    probe_timeout: humantime::Duration,

    /// Pause between lag rounds.
    #[arg(long, default_value = "500ms")]
    round_delay: humantime::Duration,

    /// What a probe does when a poll query fails.
    #[arg(long, value_enum, default_value_t = ProbeErrors::Abort)]
    probe_errors: ProbeErrors,
}

/// Options shared by every subcommand.
#[derive(clap::Args, Debug, Clone)]
struct CommonOptions {
    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Also write the report as JSON to this path.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// CLI options for a full run against PostgreSQL.
#[derive(clap::Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    workload: WorkloadOptions,

    #[command(flatten)]
    lag: LagOptions,

    #[command(flatten)]
    common: CommonOptions,

    /// Continue without asking when a replica fails role verification.
    #[arg(long, short = 'y')]
    yes: bool,

    /// Per-connection connect timeout.
    #[arg(long, env = "REPLCHECK_CONNECT_TIMEOUT", default_value = "10s")]
    connect_timeout: humantime::Duration,
}

/// CLI options for a lag-only run against PostgreSQL.
#[derive(clap::Args, Debug, Clone)]
struct LagArgs {
    #[command(flatten)]
    lag: LagOptions,

    #[command(flatten)]
    common: CommonOptions,

    /// Per-connection connect timeout.
    #[arg(long, env = "REPLCHECK_CONNECT_TIMEOUT", default_value = "10s")]
    connect_timeout: humantime::Duration,
}

/// CLI options for a dry run against a simulated cluster.
#[derive(clap::Args, Debug, Clone)]
struct SimulateArgs {
    /// Simulated replicas.
    #[arg(long, default_value_t = 2)]
    replicas: usize,

    /// Replication delay of every simulated replica.
    #[arg(long, default_value = "25ms")]
    replica_lag: humantime::Duration,

    #[command(flatten)]
    workload: WorkloadOptions,

    #[command(flatten)]
    lag: LagOptions,

    #[command(flatten)]
    common: CommonOptions,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeErrors {
    /// Fail the sample on the first query error.
    Abort,
    /// Keep polling until the probe timeout.
    Retry,
}

impl From<ProbeErrors> for ProbeErrorPolicy {
    fn from(value: ProbeErrors) -> Self {
        match value {
            ProbeErrors::Abort => ProbeErrorPolicy::Abort,
            ProbeErrors::Retry => ProbeErrorPolicy::RetryUntilTimeout,
        }
    }
}

impl LagOptions {
    fn settings(&self) -> LagSettings {
        LagSettings {
            samples: self.samples,
            poll_interval: *self.poll_interval,
            probe_timeout: *self.probe_timeout,
            round_delay: *self.round_delay,
            error_policy: self.probe_errors.into(),
        }
    }
}

fn run_settings(
    workload: Option<&WorkloadOptions>,
    lag: &LagOptions,
    common: &CommonOptions,
) -> RunSettings {
    let mut settings = RunSettings {
        seed: common.seed,
        lag: lag.settings(),
        ..RunSettings::default()
    };
    if let Some(workload) = workload {
        settings.writes = workload.writes;
        settings.reads = workload.reads;
        settings.settle = Duration::from_secs(workload.wait);
        settings.consistency_sample = workload.consistency_sample;
        settings.op_timeout = *workload.op_timeout;
    }
    settings
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "replcheck=info,warn".into()),
        )
        .init();

    let args = Args::parse();
    // Dropping the command future on Ctrl-C closes every open connection.
    tokio::select! {
        result = dispatch(args.cmd) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; connections closed");
            anyhow::bail!("stopped by user")
        }
    }
}

async fn dispatch(cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Run(args) => run(args).await,
        Command::Lag(args) => lag(args).await,
        Command::Simulate(args) => simulate(args).await,
    }
}

/// Full verification run against the cluster named by the environment.
async fn run(args: RunArgs) -> anyhow::Result<()> {
    let cluster = ClusterConfig::from_env()?;
    let settings = run_settings(Some(&args.workload), &args.lag, &args.common);
    let connector = PgConnector::new(*args.connect_timeout);
    let report = full_run(connector, cluster, settings, args.yes).await?;
    finish(&report, args.common.out.as_deref())
}

/// Lag-only run; the table must already exist.
async fn lag(args: LagArgs) -> anyhow::Result<()> {
    let cluster = ClusterConfig::from_env()?;
    let settings = run_settings(None, &args.lag, &args.common);
    let connector = PgConnector::new(*args.connect_timeout);
    let orchestrator = Orchestrator::new(connector, cluster, settings);
    let report = orchestrator.run_lag_only().await?;
    finish(&report, args.common.out.as_deref())
}

/// Full run against an in-memory cluster with uniform replica lag.
async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.replicas > 0, "--replicas must be > 0");
    let endpoint = |host: String, role: Role| Endpoint {
        host,
        port: 5432,
        database: "postgres".to_string(),
        user: "postgres".to_string(),
        password: String::new(),
        role,
    };
    let replicas = (1..=args.replicas)
        .map(|idx| endpoint(format!("sim-replica-{idx}"), Role::Replica))
        .collect();
    let cluster = ClusterConfig::new(endpoint("sim-primary".to_string(), Role::Primary), replicas)?;
    let memory = MemoryCluster::for_config(&cluster, *args.replica_lag);
    info!(
        replicas = args.replicas,
        replica_lag = %args.replica_lag,
        "running against simulated cluster"
    );

    let settings = run_settings(Some(&args.workload), &args.lag, &args.common);
    let report = full_run(memory, cluster, settings, false).await?;
    finish(&report, args.common.out.as_deref())
}

async fn full_run<C: Connector>(
    connector: C,
    cluster: ClusterConfig,
    settings: RunSettings,
    assume_yes: bool,
) -> anyhow::Result<Report> {
    let orchestrator = Orchestrator::new(connector, cluster, settings);
    let report = orchestrator
        .run_with_override(|checks| assume_yes || confirm_override(checks))
        .await?;
    Ok(report)
}

/// Asks on the terminal whether to continue past failed role checks.
fn confirm_override(checks: &[RoleCheck]) -> bool {
    if !std::io::stdin().is_terminal() {
        warn!("stdin is not a terminal; pass --yes to continue past role verification failures");
        return false;
    }
    eprintln!("\nWarning: some replicas are not properly configured!");
    for check in checks.iter().filter(|check| !check.is_standby()) {
        eprintln!("  {}: {:?}", check.label, check.status);
    }
    eprint!("Continue anyway? (y/n): ");

    let mut answer = String::new();
    // Reading stdin blocks; keep it off the async worker's scheduler.
    let read = tokio::task::block_in_place(|| {
        let _ = std::io::stderr().flush();
        std::io::stdin().read_line(&mut answer)
    });
    match read {
        Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        Err(err) => {
            warn!(error = %err, "cannot read answer");
            false
        }
    }
}

/// Print the text report and optionally write the JSON report.
fn finish(report: &Report, out: Option<&Path>) -> anyhow::Result<()> {
    println!("{}", render_text(report));
    if let Some(path) = out {
        write_json(path, report).context("write report")?;
        eprintln!("wrote report: {}", path.display());
    }
    if !report.is_consistent() {
        warn!("data consistency check failed");
    }
    let failed = report.failed_replicas();
    if !failed.is_empty() {
        warn!(replicas = ?failed, "no lag sample succeeded on some replicas");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_follow_run_settings() {
        let args = Args::try_parse_from(["replcheck", "run"]).expect("parse");
        let Command::Run(run) = args.cmd else {
            panic!("expected run");
        };
        let settings = run_settings(Some(&run.workload), &run.lag, &run.common);
        let defaults = RunSettings::default();
        assert_eq!(settings.writes, defaults.writes);
        assert_eq!(settings.reads, defaults.reads);
        assert_eq!(settings.settle, defaults.settle);
        assert_eq!(settings.op_timeout, defaults.op_timeout);
        assert_eq!(settings.lag.samples, defaults.lag.samples);
        assert_eq!(settings.lag.poll_interval, defaults.lag.poll_interval);
        assert_eq!(settings.lag.probe_timeout, defaults.lag.probe_timeout);
        assert_eq!(settings.lag.round_delay, defaults.lag.round_delay);
        assert_eq!(settings.lag.error_policy, ProbeErrorPolicy::Abort);
        assert!(!run.yes);
    }

    #[test]
    fn parses_durations_and_policy() {
        let args = Args::try_parse_from([
            "replcheck",
            "lag",
            "--samples",
            "5",
            "--poll-interval",
            "10ms",
            "--probe-timeout",
            "2s",
            "--probe-errors",
            "retry",
            "--out",
            "lag.json",
        ])
        .expect("parse");
        let Command::Lag(lag) = args.cmd else {
            panic!("expected lag");
        };
        let settings = lag.lag.settings();
        assert_eq!(settings.samples, 5);
        assert_eq!(settings.poll_interval, Duration::from_millis(10));
        assert_eq!(settings.probe_timeout, Duration::from_secs(2));
        assert_eq!(settings.error_policy, ProbeErrorPolicy::RetryUntilTimeout);
        assert_eq!(lag.common.out, Some(PathBuf::from("lag.json")));
    }

    #[test]
    fn simulate_accepts_replica_shape() {
        let args = Args::try_parse_from([
            "replcheck",
            "simulate",
            "--replicas",
            "3",
            "--replica-lag",
            "40ms",
            "--writes",
            "50",
            "--wait",
            "0",
            "--op-timeout",
            "750ms",
        ])
        .expect("parse");
        let Command::Simulate(sim) = args.cmd else {
            panic!("expected simulate");
        };
        assert_eq!(sim.replicas, 3);
        assert_eq!(*sim.replica_lag, Duration::from_millis(40));
        assert_eq!(sim.workload.writes, 50);
        assert_eq!(sim.workload.wait, 0);
        assert_eq!(*sim.workload.op_timeout, Duration::from_millis(750));
    }
}
