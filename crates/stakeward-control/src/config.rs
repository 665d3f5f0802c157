//! Configuration for stakeward-control.

use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};

/// Top-level configuration for a provisioning run.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StakewardConfig {
    /// Bootstrap node RPC configuration.
    #[serde(default)]
    pub node: NodeConfig,

    /// Per-identity activation behaviour.
    #[serde(default)]
    pub activation: ActivationConfig,

    /// Registration fan-out behaviour.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Workload readiness waiting.
    #[serde(default)]
    pub readiness: ReadinessConfig,

    /// Cluster access.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// How the bootstrap node is reached.
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

impl StakewardConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `stakeward.toml` in the current directory (if present)
    /// 3. Environment variables with `STAKEWARD_` prefix
    pub fn load() -> ControlResult<Self> {
        Self::from_file("stakeward.toml")
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("STAKEWARD_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot drive a run.
    pub fn validate(&self) -> ControlResult<()> {
        let intervals = [
            ("activation.tx_poll_interval", self.activation.tx_poll_interval),
            (
                "activation.active_poll_interval",
                self.activation.active_poll_interval,
            ),
            ("activation.retry_interval", self.activation.retry_interval),
            (
                "coordinator.bootstrap_poll_interval",
                self.coordinator.bootstrap_poll_interval,
            ),
            ("readiness.min_interval", self.readiness.min_interval),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(ControlError::Config(format!("{name} must be non-zero")));
            }
        }

        if self.activation.stake_duration.is_zero() {
            return Err(ControlError::Config(
                "activation.stake_duration must be non-zero".to_owned(),
            ));
        }

        if self.tunnel.kind == TunnelKind::Direct && self.tunnel.direct_url.is_none() {
            return Err(ControlError::Config(
                "tunnel.direct_url is required for the direct tunnel".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Bootstrap node RPC configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Remote RPC port of the bootstrap node.
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,

    /// Request timeout.
    #[serde(default = "default_request_timeout", with = "serde_duration_secs")]
    pub request_timeout: Duration,
}

const fn default_rpc_port() -> u16 {
    9650
}

const fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_port: default_rpc_port(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Per-identity activation behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivationConfig {
    /// Lead time between submission and the requested start time.
    #[serde(default = "default_pending_window", with = "serde_duration_secs")]
    pub pending_window: Duration,

    /// Extra lead time covering clock skew between us and the node.
    #[serde(default = "default_sync_bound", with = "serde_duration_secs")]
    pub sync_bound: Duration,

    /// How long each identity stakes for.
    #[serde(default = "default_stake_duration", with = "serde_duration_secs")]
    pub stake_duration: Duration,

    /// Delegation fee rate in percent.
    #[serde(default = "default_delegation_fee_rate")]
    pub delegation_fee_rate: u32,

    /// Interval between transaction status polls.
    #[serde(default = "default_tx_poll_interval", with = "serde_duration_secs")]
    pub tx_poll_interval: Duration,

    /// Interval between active-set membership polls.
    #[serde(default = "default_active_poll_interval", with = "serde_duration_secs")]
    pub active_poll_interval: Duration,

    /// Pause before retrying a refused submission.
    #[serde(default = "default_retry_interval", with = "serde_duration_secs")]
    pub retry_interval: Duration,
}

const fn default_pending_window() -> Duration {
    Duration::from_secs(2 * 60)
}

const fn default_sync_bound() -> Duration {
    Duration::from_secs(60)
}

const fn default_stake_duration() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

const fn default_delegation_fee_rate() -> u32 {
    10
}

const fn default_tx_poll_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_active_poll_interval() -> Duration {
    // a tenth of the pending window
    Duration::from_secs(12)
}

const fn default_retry_interval() -> Duration {
    Duration::from_secs(5)
}

impl ActivationConfig {
    /// Total lead time between now and a submission's start time.
    #[must_use]
    pub fn start_lead(&self) -> Duration {
        self.pending_window.saturating_add(self.sync_bound)
    }
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            pending_window: default_pending_window(),
            sync_bound: default_sync_bound(),
            stake_duration: default_stake_duration(),
            delegation_fee_rate: default_delegation_fee_rate(),
            tx_poll_interval: default_tx_poll_interval(),
            active_poll_interval: default_active_poll_interval(),
            retry_interval: default_retry_interval(),
        }
    }
}

/// Registration fan-out behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Delay between dispatching consecutive identities.
    #[serde(default = "default_dispatch_stagger", with = "serde_duration_millis")]
    pub dispatch_stagger: Duration,

    /// Retry add-validator calls the node refuses instead of failing the run.
    #[serde(default = "default_allow_submission_errors")]
    pub allow_submission_errors: bool,

    /// Chain whose bootstrap status gates registration.
    #[serde(default = "default_bootstrap_chain")]
    pub bootstrap_chain: String,

    /// Interval between bootstrap status polls.
    #[serde(default = "default_bootstrap_poll_interval", with = "serde_duration_secs")]
    pub bootstrap_poll_interval: Duration,

    /// Overall run timeout; zero means no deadline.
    #[serde(default, with = "serde_duration_secs")]
    pub run_timeout: Duration,
}

const fn default_dispatch_stagger() -> Duration {
    Duration::from_secs(1)
}

const fn default_allow_submission_errors() -> bool {
    true
}

fn default_bootstrap_chain() -> String {
    "P".to_owned()
}

const fn default_bootstrap_poll_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            dispatch_stagger: default_dispatch_stagger(),
            allow_submission_errors: default_allow_submission_errors(),
            bootstrap_chain: default_bootstrap_chain(),
            bootstrap_poll_interval: default_bootstrap_poll_interval(),
            run_timeout: Duration::ZERO,
        }
    }
}

/// Workload readiness waiting.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadinessConfig {
    /// Minimum time between two status observations.
    #[serde(default = "default_min_interval", with = "serde_duration_secs")]
    pub min_interval: Duration,

    /// How long to wait for each workload group.
    #[serde(default = "default_readiness_timeout", with = "serde_duration_secs")]
    pub timeout: Duration,
}

const fn default_min_interval() -> Duration {
    Duration::from_secs(3)
}

const fn default_readiness_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            min_interval: default_min_interval(),
            timeout: default_readiness_timeout(),
        }
    }
}

/// Cluster access.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Path to the kubectl binary.
    #[serde(default = "default_kubectl")]
    pub kubectl: PathBuf,

    /// Kubeconfig to use; kubectl's default when unset.
    pub kubeconfig: Option<PathBuf>,

    /// Namespace the network runs in; the network name when unset.
    pub namespace: Option<String>,

    /// Field manager recorded on applied objects.
    #[serde(default = "default_field_manager")]
    pub field_manager: String,

    /// Workload group hosting the bootstrap node, without the network prefix.
    #[serde(default = "default_bootstrap_group")]
    pub bootstrap_group: String,

    /// Workload group hosting the other validators, without the network prefix.
    #[serde(default = "default_validator_group")]
    pub validator_group: String,

    /// Additional workload groups to await before registering, without the
    /// network prefix. The bootstrap group is always awaited.
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

impl ClusterConfig {
    /// Groups to await before registering.
    ///
    /// The bootstrap group comes first at one replica unless it is listed
    /// explicitly, followed by the configured groups.
    #[must_use]
    pub fn groups_to_await(&self) -> Vec<GroupConfig> {
        let mut groups = Vec::with_capacity(self.groups.len() + 1);
        if !self.groups.iter().any(|g| g.name == self.bootstrap_group) {
            groups.push(GroupConfig {
                name: self.bootstrap_group.clone(),
                replicas: 1,
            });
        }
        groups.extend(self.groups.iter().cloned());
        groups
    }

    /// Await the validator group at `replicas` unless it is already listed.
    pub fn expect_validators(&mut self, replicas: u32) {
        if replicas == 0 || self.groups.iter().any(|g| g.name == self.validator_group) {
            return;
        }
        self.groups.push(GroupConfig {
            name: self.validator_group.clone(),
            replicas,
        });
    }
}

fn default_kubectl() -> PathBuf {
    PathBuf::from("kubectl")
}

fn default_field_manager() -> String {
    "stakeward".to_owned()
}

fn default_bootstrap_group() -> String {
    "root".to_owned()
}

fn default_validator_group() -> String {
    "validator".to_owned()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubectl: default_kubectl(),
            kubeconfig: None,
            namespace: None,
            field_manager: default_field_manager(),
            bootstrap_group: default_bootstrap_group(),
            validator_group: default_validator_group(),
            groups: Vec::new(),
        }
    }
}

/// A workload group that must be ready before registration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GroupConfig {
    /// Group name without the network prefix (e.g. "validator").
    pub name: String,
    /// Desired replica count.
    pub replicas: u32,
}

/// How the bootstrap node is reached.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Tunnel implementation.
    #[serde(default)]
    pub kind: TunnelKind,

    /// Node URL for the direct tunnel.
    pub direct_url: Option<String>,

    /// Local port for port forwarding; any free port when zero.
    #[serde(default)]
    pub local_port: u16,

    /// How long to wait for the port forward to come up.
    #[serde(default = "default_open_timeout", with = "serde_duration_secs")]
    pub open_timeout: Duration,
}

const fn default_open_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            kind: TunnelKind::default(),
            direct_url: None,
            local_port: 0,
            open_timeout: default_open_timeout(),
        }
    }
}

/// Type of tunnel to the bootstrap node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelKind {
    /// `kubectl port-forward` to the bootstrap pod.
    #[default]
    PortForward,

    /// The node is directly reachable.
    Direct,
}

/// Serde helper for Duration as seconds.
mod serde_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helper for Duration as milliseconds.
mod serde_duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
