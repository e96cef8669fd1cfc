//! Cluster endpoints and run parameters.
//!
//! Endpoints come from environment variables (`PRIMARY_IP`, `REPLICA_1_IP`,
//! `REPLICA_2_IP`, ..., `POSTGRES_PASSWORD`); run parameters come from the CLI
//! and fall back to the defaults below.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::{VerifyError, VerifyResult};

const DEFAULT_PORT: u16 = 5432;
const DEFAULT_USER: &str = "postgres";
const DEFAULT_DATABASE: &str = "postgres";

/// Role an endpoint is expected to play in the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Replica,
}

/// Position of a replica in the configured replica list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ReplicaId(pub usize);

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replica-{}", self.0 + 1)
    }
}

/// Connection target for one database server.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub role: Role,
}

impl Endpoint {
    /// `host:port`, used to label results and log lines.
    pub fn label(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Hand-written so credentials never end up in logs.
impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("role", &self.role)
            .finish()
    }
}

/// One primary plus one-or-more replicas. Immutable after load.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub primary: Endpoint,
    pub replicas: Vec<Endpoint>,
}

impl ClusterConfig {
    /// Builds a config, rejecting clusters without replicas.
    pub fn new(primary: Endpoint, replicas: Vec<Endpoint>) -> VerifyResult<Self> {
        if replicas.is_empty() {
            return Err(VerifyError::Configuration(
                "no replica endpoints configured".to_string(),
            ));
        }
        Ok(Self { primary, replicas })
    }

    /// Loads endpoints from the process environment.
    pub fn from_env() -> VerifyResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads endpoints through `lookup`, which maps a variable name to its value.
    ///
    /// Replicas are read from `REPLICA_1_IP`, `REPLICA_2_IP`, ... and the scan
    /// stops at the first unset index.
    pub fn from_lookup<F>(lookup: F) -> VerifyResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let password = get("POSTGRES_PASSWORD").ok_or_else(|| {
            VerifyError::Configuration("POSTGRES_PASSWORD environment variable not set".into())
        })?;
        let primary_host = get("PRIMARY_IP").ok_or_else(|| {
            VerifyError::Configuration("PRIMARY_IP environment variable not set".into())
        })?;
        let port = parse_port(get("POSTGRES_PORT"), DEFAULT_PORT)?;
        let user = get("POSTGRES_USER").unwrap_or_else(|| DEFAULT_USER.to_string());
        let database = get("POSTGRES_DB").unwrap_or_else(|| DEFAULT_DATABASE.to_string());

        let endpoint = |host: String, role: Role| Endpoint {
            host,
            port,
            database: database.clone(),
            user: user.clone(),
            password: password.clone(),
            role,
        };

        let primary = endpoint(primary_host, Role::Primary);
        let replicas = (1..)
            .map_while(|idx| get(&format!("REPLICA_{idx}_IP")))
            .map(|host| endpoint(host, Role::Replica))
            .collect::<Vec<_>>();

        Self::new(primary, replicas)
    }

    /// Labels of all replicas, indexed by [`ReplicaId`].
    pub fn replica_labels(&self) -> Vec<String> {
        self.replicas.iter().map(Endpoint::label).collect()
    }
}

fn parse_port(value: Option<String>, default_port: u16) -> VerifyResult<u16> {
    match value {
        Some(raw) => raw
            .parse::<u16>()
            .map_err(|_| VerifyError::Configuration(format!("invalid port value: {raw}"))),
        None => Ok(default_port),
    }
}

/// What a lag probe does when a visibility query fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorPolicy {
    /// Stop polling and record the sample as failed.
    #[default]
    Abort,
    /// Keep polling; the sample fails only when the timeout elapses.
    RetryUntilTimeout,
}

/// Parameters for the repeated-sample lag measurement.
#[derive(Clone, Debug)]
pub struct LagSettings {
    pub samples: usize,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub round_delay: Duration,
    pub error_policy: ProbeErrorPolicy,
}

impl Default for LagSettings {
    fn default() -> Self {
        Self {
            samples: 20,
            poll_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_secs(10),
            round_delay: Duration::from_millis(500),
            error_policy: ProbeErrorPolicy::Abort,
        }
    }
}

/// Parameters for one full verification run.
#[derive(Clone, Debug)]
pub struct RunSettings {
    /// Rows inserted on the primary during the write phase.
    pub writes: usize,
    /// Total point-read budget, split evenly across replicas.
    pub reads: usize,
    /// Pause between the write phase and read testing.
    pub settle: Duration,
    /// Number of leading written ids compared across the cluster.
    pub consistency_sample: usize,
    /// Base RNG seed; 0 picks a random one.
    pub seed: u64,
    /// Upper bound on each role check, point read, and consistency fetch.
    pub op_timeout: Duration,
    pub lag: LagSettings,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            writes: 1000,
            reads: 1000,
            settle: Duration::from_secs(2),
            consistency_sample: 10,
            seed: 0,
            op_timeout: Duration::from_secs(30),
            lag: LagSettings::default(),
        }
    }
}

impl RunSettings {
    pub fn validate(&self) -> VerifyResult<()> {
        self.validate_lag()?;
        if self.op_timeout.is_zero() {
            return Err(VerifyError::Configuration(
                "operation timeout must be > 0".into(),
            ));
        }
        if self.reads > 0 && self.writes == 0 {
            return Err(VerifyError::Configuration(
                "read testing needs at least one written record".into(),
            ));
        }
        Ok(())
    }

    /// Checks only the parameters the lag measurement uses.
    pub fn validate_lag(&self) -> VerifyResult<()> {
        if self.lag.samples == 0 {
            return Err(VerifyError::Configuration(
                "lag sample count must be > 0".into(),
            ));
        }
        if self.lag.poll_interval.is_zero() {
            return Err(VerifyError::Configuration(
                "probe poll interval must be > 0".into(),
            ));
        }
        if self.lag.probe_timeout.is_zero() {
            return Err(VerifyError::Configuration(
                "probe timeout must be > 0".into(),
            ));
        }
        Ok(())
    }
}
