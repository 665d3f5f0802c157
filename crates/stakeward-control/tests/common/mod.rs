//! Common test utilities for stakeward integration tests.

#![allow(dead_code, clippy::unwrap_used)]

pub mod node;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use stakeward_control::cluster::WorkloadHandle;
use stakeward_control::config::{GroupConfig, StakewardConfig};
use stakeward_control::tunnel::{DirectTunnel, TunnelEndpoint, TunnelProvider};
use stakeward_control::ControlResult;

/// Configuration with millisecond intervals for real-time tests.
pub fn fast_config() -> StakewardConfig {
    let mut config = StakewardConfig::default();
    config.activation.tx_poll_interval = Duration::from_millis(10);
    config.activation.active_poll_interval = Duration::from_millis(20);
    config.activation.retry_interval = Duration::from_millis(10);
    config.coordinator.bootstrap_poll_interval = Duration::from_millis(10);
    config.coordinator.dispatch_stagger = Duration::from_millis(1);
    config.coordinator.run_timeout = Duration::from_secs(10);
    config.readiness.min_interval = Duration::from_millis(10);
    config.readiness.timeout = Duration::from_secs(2);
    config.node.request_timeout = Duration::from_secs(2);
    config.cluster.groups = vec![GroupConfig {
        name: "validator".to_owned(),
        replicas: 2,
    }];
    config
}

/// Write a network file with `initial` genesis stakers followed by `extra` ones.
pub fn write_network_file(dir: &Path, name: &str, initial: usize, extra: &[&str]) -> PathBuf {
    let genesis: Vec<String> = (0..initial).map(|i| format!("G{i}")).collect();
    let stakers: Vec<serde_json::Value> = genesis
        .iter()
        .map(String::as_str)
        .chain(extra.iter().copied())
        .map(|id| {
            json!({
                "NodeID": format!("NodeID-{id}"),
                "Stake": 2_000_000_000_000_u64,
                "PrivateKey": format!("PrivateKey-{id}"),
                "PublicAddress": format!("X-{name}1{}", id.to_lowercase()),
                "CertBytes": "AA==",
                "KeyBytes": "AA=="
            })
        })
        .collect();

    let network = json!({
        "Version": "0123abcd",
        "GenesisConfig": {
            "networkID": 1337,
            "initialStakers": genesis.iter().map(|id| json!({ "nodeID": format!("NodeID-{id}") })).collect::<Vec<_>>()
        },
        "Stakers": stakers
    });

    let path = dir.join(format!("{name}.json"));
    std::fs::write(&path, serde_json::to_vec_pretty(&network).unwrap()).unwrap();
    path
}

/// Direct tunnel that counts opens and closes.
#[derive(Debug)]
pub struct RecordingTunnel {
    inner: DirectTunnel,
    opened: AtomicU32,
    closed: AtomicU32,
}

impl RecordingTunnel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            inner: DirectTunnel::new(url),
            opened: AtomicU32::new(0),
            closed: AtomicU32::new(0),
        }
    }

    pub fn opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelProvider for RecordingTunnel {
    async fn open(&self, target: &WorkloadHandle, remote_port: u16) -> ControlResult<TunnelEndpoint> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.inner.open(target, remote_port).await
    }

    async fn close(&self) -> ControlResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }
}
