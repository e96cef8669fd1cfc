//! Replication verifier for primary/replica PostgreSQL clusters.
//!
//! A run measures, against one primary and one-or-more streaming replicas:
//! - write throughput on the primary,
//! - per-replica lag from primary commit to replica visibility,
//! - concurrent point-read throughput across replicas,
//! - row-level consistency between the primary and every replica.
//!
//! The measurement engine only talks to a [`datastore::Connector`]. The
//! [`pg`] module backs it with `tokio-postgres`; [`memory`] backs it with a
//! simulated cluster used by the tests and the `simulate` subcommand.
//! [`orchestrator::Orchestrator`] sequences the phases and produces a
//! [`report::Report`].

pub mod config;
pub mod consistency;
pub mod datastore;
pub mod error;
pub mod fanout;
pub mod lag;
pub mod memory;
pub mod orchestrator;
pub mod pg;
pub mod probe;
pub mod reads;
pub mod report;
pub mod stats;
pub mod writer;

pub use config::{
    ClusterConfig, Endpoint, LagSettings, ProbeErrorPolicy, ReplicaId, Role, RunSettings,
};
pub use error::{VerifyError, VerifyResult};
pub use orchestrator::{Orchestrator, Phase, RoleCheck, RoleStatus};
pub use report::{render_text, write_json, Report};
