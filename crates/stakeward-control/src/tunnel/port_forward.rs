//! `kubectl port-forward` tunnel.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::cluster::WorkloadHandle;
use crate::config::{ClusterConfig, TunnelConfig};
use crate::error::{ControlError, ControlResult};

use super::{TunnelEndpoint, TunnelProvider};

/// Forwards a local port to the first worker of a group.
///
/// The forward is ready once kubectl reports "Forwarding from"; the child
/// process is killed on [`close`](TunnelProvider::close) or on drop.
#[derive(Debug)]
pub struct PortForwardTunnel {
    kubectl: PathBuf,
    kubeconfig: Option<PathBuf>,
    local_port: u16,
    open_timeout: Duration,
    child: Mutex<Option<Child>>,
}

impl PortForwardTunnel {
    /// Create a tunnel from cluster and tunnel configuration.
    #[must_use]
    pub fn new(cluster: &ClusterConfig, tunnel: &TunnelConfig) -> Self {
        Self {
            kubectl: cluster.kubectl.clone(),
            kubeconfig: cluster.kubeconfig.clone(),
            local_port: tunnel.local_port,
            open_timeout: tunnel.open_timeout,
            child: Mutex::new(None),
        }
    }

    async fn wait_forwarding(child: &mut Child) -> ControlResult<u16> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ControlError::tunnel("port-forward stdout not captured"))?;
        let mut lines = BufReader::new(stdout).lines();

        while let Some(line) = lines.next_line().await.map_err(|e| {
            ControlError::tunnel(format!("failed to read port-forward output: {e}"))
        })? {
            trace!(%line, "port-forward output");
            if let Some(port) = parse_forwarding_line(&line) {
                // kubectl blocks once either pipe fills up.
                tokio::spawn(async move {
                    while let Ok(Some(line)) = lines.next_line().await {
                        trace!(%line, "port-forward output");
                    }
                });
                if let Some(stderr) = child.stderr.take() {
                    let mut errors = BufReader::new(stderr).lines();
                    tokio::spawn(async move {
                        while let Ok(Some(line)) = errors.next_line().await {
                            warn!(%line, "port-forward error output");
                        }
                    });
                }
                return Ok(port);
            }
        }

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            pipe.read_to_string(&mut stderr).await.ok();
        }
        Err(ControlError::tunnel(format!(
            "port-forward exited before forwarding: {}",
            stderr.trim()
        )))
    }
}

/// Extract the local port from a line like `Forwarding from 127.0.0.1:41234 -> 9650`.
fn parse_forwarding_line(line: &str) -> Option<u16> {
    let rest = line.trim().strip_prefix("Forwarding from ")?;
    let (local, _) = rest.split_once(" -> ")?;
    let (_, port) = local.rsplit_once(':')?;
    port.parse().ok()
}

#[async_trait]
impl TunnelProvider for PortForwardTunnel {
    async fn open(&self, target: &WorkloadHandle, remote_port: u16) -> ControlResult<TunnelEndpoint> {
        let mut guard = self.child.lock().await;
        if guard.is_some() {
            return Err(ControlError::tunnel("tunnel is already open"));
        }

        let pod = target.pod_name(0);
        let ports = if self.local_port == 0 {
            format!(":{remote_port}")
        } else {
            format!("{}:{remote_port}", self.local_port)
        };

        let mut cmd = Command::new(&self.kubectl);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        let mut child = cmd
            .args(["port-forward", "-n", &target.namespace])
            .arg(format!("pod/{pod}"))
            .arg(&ports)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ControlError::tunnel(format!("failed to spawn kubectl: {e}")))?;

        debug!(%pod, %ports, "waiting for port-forward");

        let forwarding =
            tokio::time::timeout(self.open_timeout, Self::wait_forwarding(&mut child)).await;
        let local_port = match forwarding {
            Ok(Ok(port)) => port,
            Ok(Err(e)) => {
                child.kill().await.ok();
                return Err(e);
            }
            Err(_) => {
                child.kill().await.ok();
                return Err(ControlError::tunnel(format!(
                    "port-forward to {pod} not ready after {:?}",
                    self.open_timeout
                )));
            }
        };

        info!(%pod, local_port, remote_port, "port-forward open");
        *guard = Some(child);

        Ok(TunnelEndpoint {
            url: format!("http://127.0.0.1:{local_port}"),
        })
    }

    async fn close(&self) -> ControlResult<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        if let Err(e) = child.kill().await {
            warn!(error = %e, "failed to stop port-forward");
            return Err(ControlError::tunnel(format!("failed to stop port-forward: {e}")));
        }
        debug!("port-forward closed");
        Ok(())
    }
}
