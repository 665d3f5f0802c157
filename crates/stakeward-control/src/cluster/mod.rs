//! Cluster orchestrator access.
//!
//! A workload group is a fixed-size set of interchangeable stateful workers.
//! The [`ClusterClient`] trait creates groups and reports their replica
//! counts; [`KubectlCluster`] drives a real cluster, [`MockCluster`] is
//! scripted for tests.

mod kubectl;

pub use kubectl::KubectlCluster;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::RwLock;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};

/// Reference to a workload group that exists in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadHandle {
    /// Namespace of the group.
    pub namespace: String,
    /// Name of the group.
    pub name: String,
}

impl WorkloadHandle {
    /// Create a new handle.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Name of the worker with the given ordinal.
    #[must_use]
    pub fn pod_name(&self, ordinal: u32) -> String {
        format!("{}-{ordinal}", self.name)
    }
}

impl fmt::Display for WorkloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Desired state of a workload group.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadGroupSpec {
    /// Group name.
    pub name: String,
    /// Namespace; the cluster client's default when unset.
    pub namespace: Option<String>,
    /// Desired replica count.
    pub replicas: u32,
    /// Labels selecting the group's workers.
    pub selector: BTreeMap<String, String>,
    /// Full object manifest sent to the orchestrator.
    pub manifest: serde_json::Value,
}

impl WorkloadGroupSpec {
    /// Build a spec from a stateful-set manifest.
    pub fn from_manifest(manifest: serde_json::Value) -> ControlResult<Self> {
        let name = manifest
            .pointer("/metadata/name")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ControlError::cluster("manifest has no metadata.name"))?
            .to_owned();
        let namespace = manifest
            .pointer("/metadata/namespace")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned);
        let replicas = manifest
            .pointer("/spec/replicas")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(1);
        let replicas = u32::try_from(replicas)
            .map_err(|_| ControlError::cluster(format!("{name}: replica count out of range")))?;
        let selector: BTreeMap<String, String> = manifest
            .pointer("/spec/selector/matchLabels")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            name,
            namespace,
            replicas,
            selector,
            manifest,
        })
    }
}

/// Replica counts reported for a workload group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    /// Workers passing their readiness check.
    pub ready_replicas: u32,
    /// Workers running the current revision.
    pub updated_replicas: u32,
}

impl ReplicaStatus {
    /// Create a new status.
    #[must_use]
    pub const fn new(ready_replicas: u32, updated_replicas: u32) -> Self {
        Self {
            ready_replicas,
            updated_replicas,
        }
    }

    /// Returns true only if both counts equal `desired`.
    #[must_use]
    pub const fn is_ready(&self, desired: u32) -> bool {
        self.ready_replicas == desired && self.updated_replicas == desired
    }
}

/// Access to the cluster orchestrator.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create the group or update it to match `spec`.
    async fn create_or_update(&self, spec: &WorkloadGroupSpec) -> ControlResult<WorkloadHandle>;

    /// Stream of status observations for a group.
    ///
    /// The stream may end; callers that need more observations reopen it.
    async fn watch_status(
        &self,
        handle: &WorkloadHandle,
    ) -> ControlResult<BoxStream<'static, ControlResult<ReplicaStatus>>>;
}

#[derive(Debug)]
enum WatchScript {
    Statuses(Vec<ReplicaStatus>),
    Error(String),
}

#[derive(Debug, Default)]
struct ClusterState {
    applied: Vec<WorkloadGroupSpec>,
    watches: HashMap<String, VecDeque<WatchScript>>,
    opened: HashMap<String, usize>,
}

/// Scripted cluster for tests.
///
/// Each `watch_status` call consumes the next scripted stream for the group.
/// Once the scripts run out, watches stay open without reporting anything.
#[derive(Debug)]
pub struct MockCluster {
    namespace: String,
    state: RwLock<ClusterState>,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new("default")
    }
}

impl MockCluster {
    /// Create a mock cluster placing unqualified groups in `namespace`.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            state: RwLock::new(ClusterState::default()),
        }
    }

    /// Script one watch stream for `group` yielding `statuses` and then ending.
    #[must_use]
    pub fn with_watch(self, group: &str, statuses: impl IntoIterator<Item = ReplicaStatus>) -> Self {
        self.push_watch(group, WatchScript::Statuses(statuses.into_iter().collect()));
        self
    }

    /// Script one watch stream for `group` that fails immediately.
    #[must_use]
    pub fn with_watch_error(self, group: &str, message: impl Into<String>) -> Self {
        self.push_watch(group, WatchScript::Error(message.into()));
        self
    }

    fn push_watch(&self, group: &str, script: WatchScript) {
        if let Ok(mut state) = self.state.write() {
            state
                .watches
                .entry(group.to_owned())
                .or_default()
                .push_back(script);
        }
    }

    /// Specs passed to `create_or_update`, oldest first.
    pub fn applied(&self) -> ControlResult<Vec<WorkloadGroupSpec>> {
        let state = self
            .state
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        Ok(state.applied.clone())
    }

    /// Number of watches opened for `group`.
    pub fn watch_count(&self, group: &str) -> ControlResult<usize> {
        let state = self
            .state
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        Ok(state.opened.get(group).copied().unwrap_or(0))
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn create_or_update(&self, spec: &WorkloadGroupSpec) -> ControlResult<WorkloadHandle> {
        let mut state = self
            .state
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        state.applied.push(spec.clone());
        let namespace = spec.namespace.clone().unwrap_or_else(|| self.namespace.clone());
        Ok(WorkloadHandle::new(namespace, spec.name.clone()))
    }

    async fn watch_status(
        &self,
        handle: &WorkloadHandle,
    ) -> ControlResult<BoxStream<'static, ControlResult<ReplicaStatus>>> {
        let mut state = self
            .state
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        *state.opened.entry(handle.name.clone()).or_default() += 1;

        let script = state
            .watches
            .get_mut(&handle.name)
            .and_then(VecDeque::pop_front);
        Ok(match script {
            Some(WatchScript::Statuses(statuses)) => stream::iter(statuses.into_iter().map(Ok)).boxed(),
            Some(WatchScript::Error(message)) => {
                stream::iter([Err(ControlError::cluster(message))]).boxed()
            }
            None => stream::pending().boxed(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ready_requires_both_counts() {
        assert!(ReplicaStatus::new(3, 3).is_ready(3));
        assert!(!ReplicaStatus::new(3, 2).is_ready(3));
        assert!(!ReplicaStatus::new(2, 3).is_ready(3));
        assert!(!ReplicaStatus::new(4, 4).is_ready(3));
    }

    #[test]
    fn spec_from_manifest() {
        let manifest = json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": { "name": "kopernikus-validator", "namespace": "kopernikus" },
            "spec": {
                "replicas": 4,
                "selector": { "matchLabels": { "app": "validator" } }
            }
        });

        let spec = WorkloadGroupSpec::from_manifest(manifest).unwrap();
        assert_eq!(spec.name, "kopernikus-validator");
        assert_eq!(spec.namespace.as_deref(), Some("kopernikus"));
        assert_eq!(spec.replicas, 4);
        assert_eq!(spec.selector.get("app").map(String::as_str), Some("validator"));

        assert!(WorkloadGroupSpec::from_manifest(json!({ "spec": {} })).is_err());
    }

    #[test]
    fn handle_names_workers_by_ordinal() {
        let handle = WorkloadHandle::new("kopernikus", "kopernikus-root");
        assert_eq!(handle.pod_name(0), "kopernikus-root-0");
        assert_eq!(handle.to_string(), "kopernikus/kopernikus-root");
    }

    #[tokio::test]
    async fn mock_watches_follow_script() {
        let cluster = MockCluster::new("ns")
            .with_watch("root", [ReplicaStatus::new(0, 1), ReplicaStatus::new(1, 1)])
            .with_watch_error("root", "connection reset");
        let handle = WorkloadHandle::new("ns", "root");

        let first: Vec<_> = cluster.watch_status(&handle).await.unwrap().collect().await;
        assert_eq!(first.len(), 2);
        assert_eq!(*first[1].as_ref().unwrap(), ReplicaStatus::new(1, 1));

        let mut second = cluster.watch_status(&handle).await.unwrap();
        assert!(matches!(second.next().await, Some(Err(ControlError::Cluster(_)))));
        assert_eq!(cluster.watch_count("root").unwrap(), 2);
    }
}
