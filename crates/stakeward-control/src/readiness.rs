//! Waiting for a workload group to converge on its desired size.

use std::sync::Arc;

use futures::StreamExt;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::cluster::{ClusterClient, ReplicaStatus, WorkloadHandle};
use crate::config::ReadinessConfig;
use crate::error::{ControlError, ControlResult};

/// Blocks until a group reports ready == updated == desired.
#[derive(Clone)]
pub struct ReadinessWaiter {
    cluster: Arc<dyn ClusterClient>,
    config: ReadinessConfig,
}

impl std::fmt::Debug for ReadinessWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessWaiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReadinessWaiter {
    /// Create a new waiter.
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterClient>, config: ReadinessConfig) -> Self {
        Self { cluster, config }
    }

    /// Wait until `handle` has `desired` ready and updated replicas.
    ///
    /// Observations are consumed at most once per minimum interval. A watch
    /// that ends cleanly is reopened under the same throttle; a watch error
    /// is returned as is. Past `deadline` the result is
    /// [`ControlError::NotReady`] carrying the last observed counts.
    pub async fn wait_ready(
        &self,
        handle: &WorkloadHandle,
        desired: u32,
        deadline: Instant,
    ) -> ControlResult<ReplicaStatus> {
        let min_interval = self.config.min_interval;
        let mut last = ReplicaStatus::default();
        let mut next_open = Instant::now();

        info!(group = %handle, desired, "waiting for workload group");

        loop {
            self.pause_until(next_open, deadline, handle, desired, last)
                .await?;
            next_open = Instant::now() + min_interval;

            let mut stream = timeout_at(deadline, self.cluster.watch_status(handle))
                .await
                .map_err(|_| not_ready(handle, desired, last))??;

            let mut next_observation = Instant::now();
            loop {
                self.pause_until(next_observation, deadline, handle, desired, last)
                    .await?;

                let Ok(item) = timeout_at(deadline, stream.next()).await else {
                    return Err(not_ready(handle, desired, last));
                };
                let Some(observation) = item else {
                    debug!(group = %handle, "status watch ended, reopening");
                    break;
                };

                let status = observation?;
                last = status;
                next_observation = Instant::now() + min_interval;

                debug!(
                    group = %handle,
                    ready = status.ready_replicas,
                    updated = status.updated_replicas,
                    desired,
                    "observed workload group"
                );

                if status.is_ready(desired) {
                    info!(group = %handle, replicas = desired, "workload group ready");
                    return Ok(status);
                }
            }
        }
    }

    /// Sleep until `at`, failing with [`ControlError::NotReady`] if the deadline comes first.
    async fn pause_until(
        &self,
        at: Instant,
        deadline: Instant,
        handle: &WorkloadHandle,
        desired: u32,
        last: ReplicaStatus,
    ) -> ControlResult<()> {
        if at >= deadline {
            tokio::time::sleep_until(deadline).await;
            return Err(not_ready(handle, desired, last));
        }
        tokio::time::sleep_until(at).await;
        Ok(())
    }
}

fn not_ready(handle: &WorkloadHandle, desired: u32, last: ReplicaStatus) -> ControlError {
    ControlError::NotReady {
        group: handle.name.clone(),
        ready: last.ready_replicas,
        updated: last.updated_replicas,
        desired,
    }
}
