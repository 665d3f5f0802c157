//! Stakeward validator provisioning.
//!
//! This crate brings additional validator identities onto a running ledger
//! network. It waits for the network's workload groups to converge, opens a
//! tunnel to the bootstrap node and drives every identity through
//! registration until it is an active validator.
//!
//! # Architecture
//!
//! - **Cluster access** ([`cluster`]): create workload groups and observe
//!   their replica counts
//! - **Readiness** ([`readiness`]): block until ready == updated == desired
//! - **Tunnel** ([`tunnel`]): reach the bootstrap node's RPC port
//! - **Node RPC** ([`rpc`]): JSON-RPC calls into the node
//! - **Activation** ([`activation`]): the per-identity state machine and the
//!   concurrent coordinator
//!
//! # Activation phases
//!
//! ```text
//! Unregistered ──▶ Imported ──▶ Submitted ──▶ Committed ──▶ PendingValidator ──▶ ActiveValidator
//!                     │             │                             ▲
//!                     │             ▼                             │
//!                     │          Rejected ──(resubmit)────────────┤
//!                     └──────(already pending or active)──────────┘
//! ```
//!
//! Any non-terminal phase may end in `Failed` on cancellation, deadline or a
//! non-retryable error.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use stakeward_control::{
//!     activation::RegistrationCoordinator, config::StakewardConfig, poll::RunContext,
//!     rpc::HttpNodeClient, types::NetworkFile,
//! };
//!
//! let config = StakewardConfig::load()?;
//! let network = NetworkFile::load("kopernikus.json")?;
//! let stakers = network.stakers_to_register(10)?.to_vec();
//!
//! let node = Arc::new(HttpNodeClient::new("http://127.0.0.1:9650", &config.node)?);
//! let coordinator = RegistrationCoordinator::new(node, config.activation, config.coordinator);
//! let summary = coordinator.register_all(stakers, &RunContext::new()).await?;
//! ```

#![forbid(unsafe_code)]

pub mod activation;
pub mod cluster;
pub mod config;
pub mod error;
pub mod poll;
pub mod readiness;
pub mod rpc;
pub mod service;
pub mod state;
pub mod tunnel;
pub mod types;

// Re-export commonly used types at the crate root
pub use activation::{ActivationEngine, RegistrationCoordinator, RegistrationSummary};
pub use config::StakewardConfig;
pub use error::{ControlError, ControlResult};
pub use poll::RunContext;
pub use service::RegistrationService;
pub use state::{ActivationReport, Phase};
pub use types::{NetworkFile, NodeId, Staker};
