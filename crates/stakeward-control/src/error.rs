//! Error types for stakeward-control.

use crate::state::Phase;
use crate::types::NodeId;

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur while provisioning validators.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// HTTP transport error talking to the bootstrap node.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The node answered a JSON-RPC call with an error object.
    #[error("{method} failed (code {code}): {message}")]
    Rpc {
        /// JSON-RPC method that failed.
        method: &'static str,
        /// JSON-RPC error code.
        code: i64,
        /// Message reported by the node.
        message: String,
    },

    /// The node answered with something that is not a valid response.
    #[error("unexpected response to {method}: {reason}")]
    Protocol {
        /// JSON-RPC method that was called.
        method: &'static str,
        /// What was wrong with the response.
        reason: String,
    },

    /// The node refused an add-validator submission without a transaction ID.
    #[error("add-validator rejected: {0}")]
    SubmissionRejected(String),

    /// The run was cancelled.
    #[error("run cancelled")]
    Cancelled,

    /// The run deadline passed.
    #[error("run deadline exceeded")]
    DeadlineExceeded,

    /// A workload group did not converge before its deadline.
    #[error(
        "workload group {group} not ready before deadline \
         (ready {ready}, updated {updated}, desired {desired})"
    )]
    NotReady {
        /// Workload group name.
        group: String,
        /// Last observed ready replicas.
        ready: u32,
        /// Last observed updated replicas.
        updated: u32,
        /// Desired replica count.
        desired: u32,
    },

    /// Cluster control plane error.
    #[error("cluster error: {0}")]
    Cluster(String),

    /// Tunnel setup or teardown error.
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// Invalid identity or network file.
    #[error("invalid identity: {0}")]
    Identity(String),

    /// Invalid state transition attempted.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current phase.
        from: &'static str,
        /// Attempted target phase.
        to: &'static str,
    },

    /// Activation of one identity failed.
    #[error("activation of {node_id} failed in phase {phase}: {source}")]
    Activation {
        /// Identity that failed.
        node_id: NodeId,
        /// Last phase observed before the failure.
        phase: Phase,
        /// Underlying cause.
        #[source]
        source: Box<ControlError>,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a cluster error.
    #[must_use]
    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::Cluster(msg.into())
    }

    /// Create a tunnel error.
    #[must_use]
    pub fn tunnel(msg: impl Into<String>) -> Self {
        Self::Tunnel(msg.into())
    }

    /// Create an identity error.
    #[must_use]
    pub fn identity(msg: impl Into<String>) -> Self {
        Self::Identity(msg.into())
    }

    /// Create a protocol error for a JSON-RPC method.
    #[must_use]
    pub fn protocol(method: &'static str, reason: impl Into<String>) -> Self {
        Self::Protocol {
            method,
            reason: reason.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap an error with the identity and phase it occurred in.
    #[must_use]
    pub fn activation(node_id: NodeId, phase: Phase, source: Self) -> Self {
        Self::Activation {
            node_id,
            phase,
            source: Box::new(source),
        }
    }

    /// Returns true if this error means a deadline passed.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::DeadlineExceeded | Self::NotReady { .. } => true,
            Self::Activation { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Returns true if this error means the run was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Activation { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Returns true if the error reached the node over the network at all.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Http(_) | Self::Tunnel(_) => true,
            Self::Activation { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    /// The failing identity, if this error is scoped to one.
    #[must_use]
    pub const fn node_id(&self) -> Option<&NodeId> {
        match self {
            Self::Activation { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}
