#![allow(dead_code)]

use std::time::Duration;

use replcheck::config::{ClusterConfig, Endpoint, LagSettings, Role, RunSettings};
use replcheck::memory::{MemoryCluster, NodeBehavior};
use replcheck::Orchestrator;

pub fn endpoint(host: &str, role: Role) -> Endpoint {
    Endpoint {
        host: host.to_string(),
        port: 5432,
        database: "postgres".to_string(),
        user: "postgres".to_string(),
        password: "secret".to_string(),
        role,
    }
}

/// Simulated primary plus one node per behavior, named `replica1`, `replica2`, ...
pub struct TestCluster {
    pub memory: MemoryCluster,
    pub config: ClusterConfig,
}

impl TestCluster {
    pub fn new(replicas: Vec<NodeBehavior>) -> Self {
        let cluster = Self::without_table(replicas);
        cluster.memory.create_table();
        cluster
    }

    /// Same as [`TestCluster::new`] but the measurement table does not exist.
    pub fn without_table(replicas: Vec<NodeBehavior>) -> Self {
        let memory = MemoryCluster::new();
        let primary = endpoint("primary", Role::Primary);
        memory.add_node(&primary, NodeBehavior::primary());
        let endpoints = replicas
            .into_iter()
            .enumerate()
            .map(|(idx, behavior)| {
                let ep = endpoint(&format!("replica{}", idx + 1), Role::Replica);
                memory.add_node(&ep, behavior);
                ep
            })
            .collect();
        let config = ClusterConfig::new(primary, endpoints).expect("at least one replica");
        Self { memory, config }
    }

    pub fn primary(&self) -> &Endpoint {
        &self.config.primary
    }

    pub fn replica(&self, idx: usize) -> &Endpoint {
        &self.config.replicas[idx]
    }

    pub fn orchestrator(&self, settings: RunSettings) -> Orchestrator<MemoryCluster> {
        Orchestrator::new(self.memory.clone(), self.config.clone(), settings)
    }
}

/// Small, fast settings for a paused-clock run.
pub fn quick_settings() -> RunSettings {
    RunSettings {
        writes: 50,
        reads: 60,
        settle: Duration::from_millis(100),
        consistency_sample: 10,
        seed: 7,
        op_timeout: Duration::from_secs(1),
        lag: LagSettings {
            samples: 3,
            poll_interval: Duration::from_millis(10),
            probe_timeout: Duration::from_secs(1),
            round_delay: Duration::from_millis(50),
            ..LagSettings::default()
        },
    }
}
