//! Phase sequencing for a verification run.
//!
//! A full run walks the phases in [`Phase`] order, each one finishing before
//! the next starts:
//!
//! ```text
//! SchemaSetup -> RoleVerification -> Write -> Settle
//!     -> ConcurrentRead -> Consistency -> LagMeasurement -> Report
//! ```
//!
//! The primary connection is a local owned by the run, and every replica
//! connection is owned by the task that opened it, so an early return, a
//! panicking replica task, or a dropped run future all release them.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, Endpoint, ReplicaId, RunSettings};
use crate::consistency::check_consistency;
use crate::datastore::{Connection, Connector};
use crate::error::{VerifyError, VerifyResult};
use crate::fanout::map_replicas;
use crate::lag::measure_lag;
use crate::reads::dispatch_reads;
use crate::report::Report;
use crate::stats::aggregate;
use crate::writer::{generate_records, inject_writes};

/// Run phases in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    SchemaSetup,
    RoleVerification,
    Write,
    Settle,
    ConcurrentRead,
    Consistency,
    LagMeasurement,
    Report,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::SchemaSetup => "schema setup",
            Phase::RoleVerification => "role verification",
            Phase::Write => "write",
            Phase::Settle => "settle",
            Phase::ConcurrentRead => "concurrent read",
            Phase::Consistency => "consistency",
            Phase::LagMeasurement => "lag measurement",
            Phase::Report => "report",
        }
    }
}

/// Wall time spent in one completed phase.
#[derive(Clone, Debug, Serialize)]
pub struct PhaseTiming {
    pub phase: Phase,
    #[serde(serialize_with = "crate::report::duration_ms")]
    pub elapsed: Duration,
}

/// Records phase transitions and enforces their order.
#[derive(Debug, Default)]
struct PhaseLog {
    current: Option<(Phase, Instant)>,
    done: Vec<PhaseTiming>,
}

impl PhaseLog {
    fn enter(&mut self, phase: Phase) {
        if let Some((previous, _)) = self.current {
            debug_assert!(previous < phase, "{previous:?} -> {phase:?}");
        }
        self.finish();
        info!(phase = phase.name(), "phase started");
        self.current = Some((phase, Instant::now()));
    }

    fn finish(&mut self) {
        if let Some((phase, started)) = self.current.take() {
            self.done.push(PhaseTiming {
                phase,
                elapsed: started.elapsed(),
            });
        }
    }

    fn into_timings(mut self) -> Vec<PhaseTiming> {
        self.finish();
        self.done
    }
}

/// What a replica reported during role verification.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoleStatus {
    /// In recovery, as a streaming standby should be.
    Standby {
        /// `now() - pg_last_xact_replay_timestamp()`, when known.
        #[serde(serialize_with = "crate::report::opt_duration_ms")]
        replay_lag: Option<Duration>,
    },
    /// Accepts writes; not acting as a replica.
    Writable,
    Unreachable { error: String },
    QueryFailed { error: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct RoleCheck {
    pub replica: ReplicaId,
    pub label: String,
    #[serde(flatten)]
    pub status: RoleStatus,
}

impl RoleCheck {
    pub fn is_standby(&self) -> bool {
        matches!(self.status, RoleStatus::Standby { .. })
    }
}

/// Drives verification runs against one cluster.
pub struct Orchestrator<C: Connector> {
    connector: Arc<C>,
    cluster: ClusterConfig,
    settings: RunSettings,
}

impl<C: Connector> Orchestrator<C> {
    pub fn new(connector: C, cluster: ClusterConfig, settings: RunSettings) -> Self {
        Self {
            connector: Arc::new(connector),
            cluster,
            settings,
        }
    }

    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Full run. Aborts before writing if any replica fails role verification.
    pub async fn run(&self) -> VerifyResult<Report> {
        self.run_with_override(|_| false).await
    }

    /// Full run. When role verification fails, `decide` sees the checks and
    /// returns `true` to continue anyway.
    pub async fn run_with_override<F>(&self, decide: F) -> VerifyResult<Report>
    where
        F: FnOnce(&[RoleCheck]) -> bool + Send,
    {
        self.settings.validate()?;
        let seed = effective_seed(self.settings.seed);
        let mut report = Report::new(&self.cluster, seed);
        let mut phases = PhaseLog::default();
        info!(
            primary = %report.primary,
            replicas = ?report.replicas,
            writes = self.settings.writes,
            reads = self.settings.reads,
            seed,
            "starting replication verification"
        );

        phases.enter(Phase::SchemaSetup);
        let mut primary = self.connect_primary().await?;
        self.setup_schema(&mut primary).await?;

        phases.enter(Phase::RoleVerification);
        let roles = verify_roles(
            &self.connector,
            &self.cluster.replicas,
            self.settings.op_timeout,
        )
        .await;
        let rejected = roles
            .iter()
            .filter(|check| !check.is_standby())
            .map(|check| check.label.as_str())
            .collect::<Vec<_>>();
        if !rejected.is_empty() {
            let summary = format!(
                "{} of {} replicas are not read-only standbys: {}",
                rejected.len(),
                roles.len(),
                rejected.join(", ")
            );
            warn!("{summary}");
            if !decide(&roles) {
                return Err(VerifyError::RoleVerification(summary));
            }
            warn!("continuing despite role verification failure");
            report.role_override = true;
        }
        report.roles = roles;

        phases.enter(Phase::Write);
        let mut rng = SmallRng::seed_from_u64(seed);
        let records = generate_records(&mut rng, self.settings.writes);
        let writes = inject_writes(&mut primary, &records).await?;
        let ids = writes.ids.clone();
        report.writes = Some(writes);

        phases.enter(Phase::Settle);
        info!(
            wait_ms = self.settings.settle.as_millis() as u64,
            "waiting for replication to propagate"
        );
        time::sleep(self.settings.settle).await;

        phases.enter(Phase::ConcurrentRead);
        if self.settings.reads > 0 {
            report.reads = dispatch_reads(
                &self.connector,
                &self.cluster.replicas,
                &ids,
                self.settings.reads,
                seed,
                self.settings.op_timeout,
            )
            .await?;
        } else {
            info!("read budget is zero; skipping reads");
        }

        phases.enter(Phase::Consistency);
        if self.settings.consistency_sample > 0 && !ids.is_empty() {
            report.consistency = check_consistency(
                &self.connector,
                &mut primary,
                &report.primary,
                &self.cluster.replicas,
                &ids,
                self.settings.consistency_sample,
                self.settings.op_timeout,
            )
            .await?;
        } else {
            info!("nothing to compare; skipping consistency check");
        }

        phases.enter(Phase::LagMeasurement);
        self.lag_phase(&mut primary, &mut report).await?;

        phases.enter(Phase::Report);
        report.phases = phases.into_timings();
        Ok(report)
    }

    /// Lag measurement alone, against a table that already exists.
    pub async fn run_lag_only(&self) -> VerifyResult<Report> {
        self.settings.validate_lag()?;
        let mut report = Report::new(&self.cluster, effective_seed(self.settings.seed));
        let mut phases = PhaseLog::default();

        phases.enter(Phase::LagMeasurement);
        let mut primary = self.connect_primary().await?;
        primary
            .row_count()
            .await
            .map_err(|cause| self.primary_query_error(cause))?;
        self.lag_phase(&mut primary, &mut report).await?;

        phases.enter(Phase::Report);
        report.phases = phases.into_timings();
        Ok(report)
    }

    async fn lag_phase(&self, primary: &mut C::Conn, report: &mut Report) -> VerifyResult<()> {
        let samples = measure_lag(
            &self.connector,
            primary,
            &self.cluster.replicas,
            &self.settings.lag,
        )
        .await?;
        report.lag_rounds = self.settings.lag.samples;
        report.lag = aggregate(&samples, &self.cluster.replica_labels());
        Ok(())
    }

    async fn connect_primary(&self) -> VerifyResult<C::Conn> {
        let endpoint = &self.cluster.primary;
        self.connector
            .connect(endpoint)
            .await
            .map_err(|cause| VerifyError::Connection {
                endpoint: endpoint.label(),
                cause,
            })
    }

    async fn setup_schema(&self, primary: &mut C::Conn) -> VerifyResult<()> {
        primary
            .recreate_schema()
            .await
            .map_err(|cause| self.primary_query_error(cause))?;
        let rows = primary
            .row_count()
            .await
            .map_err(|cause| self.primary_query_error(cause))?;
        if rows != 0 {
            return Err(self.primary_query_error(anyhow::anyhow!(
                "table still holds {rows} rows after recreation"
            )));
        }
        info!("test table replication_test created");
        Ok(())
    }

    fn primary_query_error(&self, cause: anyhow::Error) -> VerifyError {
        VerifyError::Query {
            endpoint: self.cluster.primary.label(),
            cause,
        }
    }
}

fn effective_seed(seed: u64) -> u64 {
    if seed == 0 {
        rand::thread_rng().gen()
    } else {
        seed
    }
}

/// Asks every replica whether it is in recovery, in parallel.
///
/// Connecting and each status query are bounded by `op_timeout`.
pub async fn verify_roles<C>(
    connector: &Arc<C>,
    replicas: &[Endpoint],
    op_timeout: Duration,
) -> Vec<RoleCheck>
where
    C: Connector,
{
    let results = map_replicas(replicas.to_vec(), replicas.len(), |replica, endpoint| {
        let connector = connector.clone();
        async move {
            let label = endpoint.label();
            let status = check_role(connector.as_ref(), &endpoint, op_timeout).await;
            RoleCheck {
                replica,
                label,
                status,
            }
        }
    })
    .await;

    let checks = results
        .into_iter()
        .enumerate()
        .map(|(idx, result)| {
            result.unwrap_or_else(|err| RoleCheck {
                replica: ReplicaId(idx),
                label: replicas[idx].label(),
                status: RoleStatus::QueryFailed {
                    error: err.to_string(),
                },
            })
        })
        .collect::<Vec<_>>();

    for check in &checks {
        match &check.status {
            RoleStatus::Standby { replay_lag } => info!(
                replica = %check.label,
                replay_lag_ms = replay_lag.map(|lag| lag.as_millis() as u64),
                "replica is in recovery mode"
            ),
            RoleStatus::Writable => warn!(replica = %check.label, "replica is NOT in recovery mode"),
            RoleStatus::Unreachable { error } | RoleStatus::QueryFailed { error } => {
                warn!(replica = %check.label, error = %error, "cannot check replica status")
            }
        }
    }
    checks
}

async fn check_role<C: Connector>(
    connector: &C,
    endpoint: &Endpoint,
    op_timeout: Duration,
) -> RoleStatus {
    let label = endpoint.label();
    let mut conn = match time::timeout(op_timeout, connector.connect(endpoint)).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(err)) => {
            return RoleStatus::Unreachable {
                error: format!("{err:#}"),
            }
        }
        Err(_) => {
            return RoleStatus::Unreachable {
                error: format!("connect timed out after {op_timeout:?}"),
            }
        }
    };
    match time::timeout(op_timeout, conn.in_recovery()).await {
        Ok(Ok(true)) => {
            // A standby that has not replayed anything yet reports no lag.
            let replay_lag = match time::timeout(op_timeout, conn.replay_lag()).await {
                Ok(Ok(lag)) => lag,
                Ok(Err(err)) => {
                    debug!(replica = %label, error = %format!("{err:#}"), "replay lag query failed");
                    None
                }
                Err(_) => {
                    debug!(replica = %label, ?op_timeout, "replay lag query timed out");
                    None
                }
            };
            RoleStatus::Standby { replay_lag }
        }
        Ok(Ok(false)) => RoleStatus::Writable,
        Ok(Err(err)) => RoleStatus::QueryFailed {
            error: format!("{err:#}"),
        },
        Err(_) => RoleStatus::QueryFailed {
            error: format!("status query timed out after {op_timeout:?}"),
        },
    }
}
