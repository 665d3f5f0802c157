//! Provisioning run lifecycle.
//!
//! Wires the cluster client, readiness waiter, tunnel and node client
//! together for one run, with signal handling for cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::activation::{RegistrationCoordinator, RegistrationSummary};
use crate::cluster::{ClusterClient, KubectlCluster, ReplicaStatus, WorkloadGroupSpec, WorkloadHandle};
use crate::config::{StakewardConfig, TunnelKind};
use crate::error::{ControlError, ControlResult};
use crate::poll::RunContext;
use crate::readiness::ReadinessWaiter;
use crate::rpc::{HttpNodeClient, NodeRpc};
use crate::tunnel::{DirectTunnel, PortForwardTunnel, TunnelProvider};
use crate::types::Staker;

/// Runs provisioning steps against one network.
///
/// Every step runs under the service's cancellation token; cancelling it
/// (or receiving Ctrl+C/SIGTERM via [`shutdown_signal`]) ends the run.
pub struct RegistrationService {
    config: StakewardConfig,
    namespace: String,
    cluster: Arc<dyn ClusterClient>,
    tunnel: Arc<dyn TunnelProvider>,
    cancel: CancellationToken,
}

impl RegistrationService {
    /// Create a service from explicit collaborators.
    #[must_use]
    pub fn new(
        config: StakewardConfig,
        namespace: impl Into<String>,
        cluster: Arc<dyn ClusterClient>,
        tunnel: Arc<dyn TunnelProvider>,
    ) -> Self {
        Self {
            config,
            namespace: namespace.into(),
            cluster,
            tunnel,
            cancel: CancellationToken::new(),
        }
    }

    /// Create a service for `network` backed by kubectl and the configured tunnel.
    ///
    /// The namespace defaults to the network name.
    pub fn from_config(config: StakewardConfig, network: &str) -> ControlResult<Self> {
        config.validate()?;
        let namespace = config
            .cluster
            .namespace
            .clone()
            .unwrap_or_else(|| network.to_owned());

        let cluster = Arc::new(KubectlCluster::new(
            config.cluster.clone(),
            namespace.clone(),
            config.readiness.min_interval,
        ));

        let tunnel: Arc<dyn TunnelProvider> = match config.tunnel.kind {
            TunnelKind::PortForward => {
                Arc::new(PortForwardTunnel::new(&config.cluster, &config.tunnel))
            }
            TunnelKind::Direct => {
                let url = config.tunnel.direct_url.clone().ok_or_else(|| {
                    ControlError::Config("tunnel.direct_url is required".to_owned())
                })?;
                Arc::new(DirectTunnel::new(url))
            }
        };

        info!(%namespace, tunnel = ?config.tunnel.kind, "provisioning service configured");
        Ok(Self::new(config, namespace, cluster, tunnel))
    }

    /// Token cancelling every step of this service.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation of the current step.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn context(&self) -> RunContext {
        RunContext::with_token(self.cancel.clone())
    }

    fn handle(&self, network: &str, group: &str) -> WorkloadHandle {
        WorkloadHandle::new(self.namespace.clone(), format!("{network}-{group}"))
    }

    /// Create or update a workload group, optionally waiting for readiness.
    pub async fn apply(
        &self,
        spec: &WorkloadGroupSpec,
        wait: bool,
    ) -> ControlResult<(WorkloadHandle, Option<ReplicaStatus>)> {
        let ctx = self.context();
        let handle = ctx.run(self.cluster.create_or_update(spec)).await?;
        info!(
            group = %handle,
            replicas = spec.replicas,
            selector = ?spec.selector,
            "workload group applied"
        );

        if !wait {
            return Ok((handle, None));
        }
        let status = self
            .wait_group(&handle, spec.replicas, self.config.readiness.timeout)
            .await?;
        Ok((handle, Some(status)))
    }

    /// Wait for one group to reach `replicas` ready and updated workers.
    pub async fn wait_group(
        &self,
        handle: &WorkloadHandle,
        replicas: u32,
        timeout: Duration,
    ) -> ControlResult<ReplicaStatus> {
        let waiter = ReadinessWaiter::new(Arc::clone(&self.cluster), self.config.readiness.clone());
        let deadline = Instant::now() + timeout;
        self.context()
            .run(waiter.wait_ready(handle, replicas, deadline))
            .await
    }

    /// Wait for a group of `network` by its short name.
    pub async fn wait_network_group(
        &self,
        network: &str,
        group: &str,
        replicas: u32,
        timeout: Duration,
    ) -> ControlResult<ReplicaStatus> {
        let handle = self.handle(network, group);
        self.wait_group(&handle, replicas, timeout).await
    }

    /// Register `stakers` as validators of `network`.
    ///
    /// Waits for the bootstrap group and the configured groups, opens the tunnel to the bootstrap
    /// node, runs the coordinator and closes the tunnel however the run ends.
    pub async fn register(
        &self,
        network: &str,
        stakers: Vec<Staker>,
    ) -> ControlResult<RegistrationSummary> {
        let ctx = self
            .context()
            .with_timeout(self.config.coordinator.run_timeout);

        for group in self.config.cluster.groups_to_await() {
            let handle = self.handle(network, &group.name);
            let waiter =
                ReadinessWaiter::new(Arc::clone(&self.cluster), self.config.readiness.clone());
            let mut deadline = Instant::now() + self.config.readiness.timeout;
            if let Some(run_deadline) = ctx.deadline() {
                deadline = deadline.min(run_deadline);
            }
            ctx.run(waiter.wait_ready(&handle, group.replicas, deadline))
                .await?;
        }

        let bootstrap = self.handle(network, &self.config.cluster.bootstrap_group);
        let endpoint = ctx
            .run(self.tunnel.open(&bootstrap, self.config.node.rpc_port))
            .await?;
        info!(node = %endpoint.url, "bootstrap node reachable");

        let result = self.run_coordinator(&endpoint.url, stakers, &ctx).await;

        if let Err(e) = self.tunnel.close().await {
            warn!(error = %e, "failed to close tunnel");
        }
        result
    }

    async fn run_coordinator(
        &self,
        url: &str,
        stakers: Vec<Staker>,
        ctx: &RunContext,
    ) -> ControlResult<RegistrationSummary> {
        let node: Arc<dyn NodeRpc> = Arc::new(HttpNodeClient::new(url, &self.config.node)?);
        let coordinator = RegistrationCoordinator::new(
            node,
            self.config.activation.clone(),
            self.config.coordinator.clone(),
        );
        coordinator.register_all(stakers, ctx).await
    }
}

/// Cancel `cancel` on Ctrl+C or SIGTERM; returns early if it is cancelled elsewhere.
pub async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, cancelling run");
        }
        () = terminate => {
            info!("received SIGTERM, cancelling run");
        }
        () = cancel.cancelled() => {
            return;
        }
    }
    cancel.cancel();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cluster::MockCluster;
    use crate::config::GroupConfig;

    fn ready_root(cluster: MockCluster) -> MockCluster {
        cluster.with_watch("kopernikus-root", [ReplicaStatus::new(1, 1)])
    }

    fn service(cluster: MockCluster) -> RegistrationService {
        let mut config = StakewardConfig::default();
        config.readiness.min_interval = Duration::from_millis(10);
        config.cluster.groups = vec![GroupConfig {
            name: "validator".to_owned(),
            replicas: 2,
        }];
        RegistrationService::new(
            config,
            "kopernikus",
            Arc::new(cluster),
            Arc::new(DirectTunnel::new("http://127.0.0.1:1")),
        )
    }

    #[test]
    fn service_shutdown() {
        let service = service(MockCluster::default());
        assert!(!service.cancel_token().is_cancelled());
        service.shutdown();
        assert!(service.cancel_token().is_cancelled());
    }

    #[test]
    fn direct_tunnel_requires_url() {
        let mut config = StakewardConfig::default();
        config.tunnel.kind = TunnelKind::Direct;
        assert!(RegistrationService::from_config(config, "kopernikus").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn groups_are_awaited_by_network_name() {
        let cluster = MockCluster::new("kopernikus")
            .with_watch("kopernikus-validator", [ReplicaStatus::new(2, 2)]);
        let status = service(cluster)
            .wait_network_group("kopernikus", "validator", 2, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status, ReplicaStatus::new(2, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn register_stops_at_unready_group() {
        let cluster = ready_root(MockCluster::new("kopernikus"))
            .with_watch("kopernikus-validator", [ReplicaStatus::new(2, 1)]);
        let mut service = service(cluster);
        service.config.readiness.timeout = Duration::from_secs(5);

        let err = service.register("kopernikus", Vec::new()).await.unwrap_err();
        assert!(matches!(err, ControlError::NotReady { updated: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn default_config_waits_for_bootstrap_group() {
        let cluster = Arc::new(
            MockCluster::new("kopernikus").with_watch("kopernikus-root", [ReplicaStatus::new(0, 1)]),
        );
        let mut config = StakewardConfig::default();
        config.readiness.timeout = Duration::from_secs(5);
        let service = RegistrationService::new(
            config,
            "kopernikus",
            Arc::clone(&cluster) as _,
            Arc::new(DirectTunnel::new("http://127.0.0.1:1")),
        );

        let err = service.register("kopernikus", Vec::new()).await.unwrap_err();

        match err {
            ControlError::NotReady {
                group,
                ready,
                desired,
                ..
            } => {
                assert_eq!(group, "kopernikus-root");
                assert_eq!(ready, 0);
                assert_eq!(desired, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(cluster.watch_count("kopernikus-root").unwrap() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn apply_waits_for_applied_group() {
        let cluster = Arc::new(
            MockCluster::new("kopernikus").with_watch(
                "kopernikus-validator",
                [ReplicaStatus::new(1, 3), ReplicaStatus::new(3, 3)],
            ),
        );
        let service = RegistrationService::new(
            StakewardConfig::default(),
            "kopernikus",
            Arc::clone(&cluster) as _,
            Arc::new(DirectTunnel::new("http://127.0.0.1:1")),
        );
        let spec = WorkloadGroupSpec::from_manifest(serde_json::json!({
            "kind": "StatefulSet",
            "metadata": { "name": "kopernikus-validator" },
            "spec": {
                "replicas": 3,
                "selector": { "matchLabels": { "app": "validator" } }
            }
        }))
        .unwrap();

        let (handle, status) = service.apply(&spec, true).await.unwrap();

        assert_eq!(handle, WorkloadHandle::new("kopernikus", "kopernikus-validator"));
        assert_eq!(status, Some(ReplicaStatus::new(3, 3)));
        let applied = cluster.applied().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].replicas, 3);
        assert_eq!(applied[0].selector.get("app").map(String::as_str), Some("validator"));
    }

    #[tokio::test(start_paused = true)]
    async fn apply_without_wait_skips_readiness() {
        let cluster = Arc::new(MockCluster::new("kopernikus"));
        let service = RegistrationService::new(
            StakewardConfig::default(),
            "kopernikus",
            Arc::clone(&cluster) as _,
            Arc::new(DirectTunnel::new("http://127.0.0.1:1")),
        );
        let spec = WorkloadGroupSpec::from_manifest(serde_json::json!({
            "metadata": { "name": "kopernikus-api", "namespace": "edge" },
            "spec": { "replicas": 2 }
        }))
        .unwrap();

        let (handle, status) = service.apply(&spec, false).await.unwrap();

        assert_eq!(handle.to_string(), "edge/kopernikus-api");
        assert!(status.is_none());
        assert_eq!(cluster.watch_count("kopernikus-api").unwrap(), 0);
        assert_eq!(cluster.applied().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_service_does_not_wait() {
        let service = service(MockCluster::new("kopernikus"));
        service.shutdown();
        let err = service
            .wait_network_group("kopernikus", "validator", 2, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
