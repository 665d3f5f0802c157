//! Network path from this process to the bootstrap node.

mod port_forward;

pub use port_forward::PortForwardTunnel;

use async_trait::async_trait;

use crate::cluster::WorkloadHandle;
use crate::error::ControlResult;

/// Local end of an open tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEndpoint {
    /// Base URL the node's RPC API is reachable at.
    pub url: String,
}

/// Opens and closes the path to a node's RPC port.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Open a tunnel to `remote_port` on the first worker of `target`.
    async fn open(&self, target: &WorkloadHandle, remote_port: u16) -> ControlResult<TunnelEndpoint>;

    /// Close the tunnel. Closing a tunnel that is not open is a no-op.
    async fn close(&self) -> ControlResult<()>;
}

/// Tunnel for a node that is already reachable.
#[derive(Debug, Clone)]
pub struct DirectTunnel {
    url: String,
}

impl DirectTunnel {
    /// Create a tunnel that always resolves to `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_owned(),
        }
    }
}

#[async_trait]
impl TunnelProvider for DirectTunnel {
    async fn open(&self, target: &WorkloadHandle, _remote_port: u16) -> ControlResult<TunnelEndpoint> {
        tracing::debug!(%target, url = %self.url, "using direct node address");
        Ok(TunnelEndpoint {
            url: self.url.clone(),
        })
    }

    async fn close(&self) -> ControlResult<()> {
        Ok(())
    }
}
