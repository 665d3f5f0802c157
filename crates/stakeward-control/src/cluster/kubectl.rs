//! Cluster client backed by the `kubectl` binary.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::ClusterConfig;
use crate::error::{ControlError, ControlResult};

use super::{ClusterClient, ReplicaStatus, WorkloadGroupSpec, WorkloadHandle};

/// Drives a cluster through `kubectl`.
///
/// Groups are stateful sets applied server-side under the configured field
/// manager. Status is observed by polling the stateful set.
#[derive(Debug, Clone)]
pub struct KubectlCluster {
    config: ClusterConfig,
    namespace: String,
    poll_interval: Duration,
}

impl KubectlCluster {
    /// Create a client using `namespace` for groups without one.
    #[must_use]
    pub fn new(config: ClusterConfig, namespace: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            config,
            namespace: namespace.into(),
            poll_interval,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.kubectl);
        if let Some(kubeconfig) = &self.config.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn replica_status(&self, handle: &WorkloadHandle) -> ControlResult<ReplicaStatus> {
        let output = self
            .command()
            .args(["get", "statefulset", &handle.name, "-n", &handle.namespace, "-o", "json"])
            .output()
            .await
            .map_err(|e| ControlError::cluster(format!("failed to run kubectl: {e}")))?;

        if !output.status.success() {
            return Err(ControlError::cluster(format!(
                "kubectl get statefulset {handle} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_status(&output.stdout)
    }
}

/// Pin the manifest to the namespace the group is created in.
fn prepare_manifest(spec: &WorkloadGroupSpec, namespace: &str) -> serde_json::Value {
    let mut manifest = spec.manifest.clone();
    if let Some(metadata) = manifest
        .get_mut("metadata")
        .and_then(serde_json::Value::as_object_mut)
    {
        metadata.insert("name".to_owned(), spec.name.clone().into());
        metadata.insert("namespace".to_owned(), namespace.into());
    }
    if let Some(inner) = manifest
        .get_mut("spec")
        .and_then(serde_json::Value::as_object_mut)
    {
        inner.insert("replicas".to_owned(), spec.replicas.into());
    }
    manifest
}

/// Read replica counts from a stateful-set object; missing counts are zero.
fn parse_status(body: &[u8]) -> ControlResult<ReplicaStatus> {
    let object: serde_json::Value = serde_json::from_slice(body)?;
    let count = |field: &str| -> u32 {
        object
            .pointer(&format!("/status/{field}"))
            .and_then(serde_json::Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    };
    Ok(ReplicaStatus::new(count("readyReplicas"), count("updatedReplicas")))
}

#[async_trait]
impl ClusterClient for KubectlCluster {
    async fn create_or_update(&self, spec: &WorkloadGroupSpec) -> ControlResult<WorkloadHandle> {
        let namespace = spec
            .namespace
            .clone()
            .unwrap_or_else(|| self.namespace.clone());
        let manifest = serde_json::to_vec(&prepare_manifest(spec, &namespace))?;

        let mut child = self
            .command()
            .args(["apply", "--server-side", "--field-manager"])
            .arg(&self.config.field_manager)
            .args(["-f", "-"])
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| ControlError::cluster(format!("failed to run kubectl: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&manifest).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ControlError::cluster(format!(
                "kubectl apply {} failed: {}",
                spec.name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        debug!(group = %spec.name, %namespace, "applied workload group");
        Ok(WorkloadHandle::new(namespace, spec.name.clone()))
    }

    async fn watch_status(
        &self,
        handle: &WorkloadHandle,
    ) -> ControlResult<BoxStream<'static, ControlResult<ReplicaStatus>>> {
        let client = self.clone();
        let handle = handle.clone();

        // Poll forever; stop after the first error.
        let stream = stream::unfold(Some(true), move |state| {
            let client = client.clone();
            let handle = handle.clone();
            async move {
                let first = state?;
                if !first {
                    tokio::time::sleep(client.poll_interval).await;
                }
                match client.replica_status(&handle).await {
                    Ok(status) => Some((Ok(status), Some(false))),
                    Err(e) => Some((Err(e), None)),
                }
            }
        });
        Ok(stream.boxed())
    }
}
