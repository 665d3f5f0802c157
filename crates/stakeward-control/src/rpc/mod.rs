//! JSON-RPC access to the bootstrap node.
//!
//! [`NodeRpc`] is the seam between the activation engine and the node. The
//! production implementation is [`HttpNodeClient`]; [`MockNode`] is an
//! in-memory node used by tests and dry runs.

mod client;
mod mock;

pub use client::HttpNodeClient;
pub use mock::MockNode;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ControlResult;
use crate::types::{KeystoreCredentials, NodeId, TxId};

/// Parameters of a `platform.addValidator` submission.
#[derive(Debug, Clone, Serialize)]
pub struct AddValidatorRequest {
    /// Identity being registered.
    #[serde(rename = "nodeID")]
    pub node_id: NodeId,
    /// Requested validation start, Unix seconds.
    #[serde(rename = "startTime")]
    pub start_time: i64,
    /// Requested validation end, Unix seconds.
    #[serde(rename = "endTime")]
    pub end_time: i64,
    /// Stake amount.
    #[serde(rename = "stakeAmount")]
    pub stake_amount: u64,
    /// Address receiving staking rewards.
    #[serde(rename = "rewardAddress")]
    pub reward_address: String,
    /// Delegation fee rate in percent.
    #[serde(rename = "delegationFeeRate")]
    pub delegation_fee_rate: u32,
    /// Keystore user that holds the staking key.
    #[serde(flatten)]
    pub credentials: KeystoreCredentials,
}

/// What the node said about an add-validator submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddValidatorOutcome {
    /// The transaction was accepted for processing.
    Accepted(TxId),
    /// The node refused the submission without a transaction reference.
    Refused(String),
}

/// Status of a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    /// Accepted by consensus.
    Committed,
    /// Being processed.
    Processing,
    /// Waiting to be processed.
    Pending,
    /// Never made it into the mempool.
    Unknown,
    /// Dropped by the node.
    Dropped,
    /// Any status this client does not know about.
    #[serde(other)]
    Other,
}

impl TxStatus {
    /// Returns true if the transaction is lost and must be resubmitted.
    #[must_use]
    pub const fn is_lost(self) -> bool {
        matches!(self, Self::Unknown | Self::Dropped)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Committed => "Committed",
            Self::Processing => "Processing",
            Self::Pending => "Pending",
            Self::Unknown => "Unknown",
            Self::Dropped => "Dropped",
            Self::Other => "Other",
        };
        f.write_str(s)
    }
}

/// Control API of the bootstrap node.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Returns true once the node has bootstrapped `chain`.
    async fn is_bootstrapped(&self, chain: &str) -> ControlResult<bool>;

    /// Create a keystore user.
    async fn create_user(&self, credentials: &KeystoreCredentials) -> ControlResult<()>;

    /// Import a private key into a keystore user, returning its address.
    async fn import_key(
        &self,
        credentials: &KeystoreCredentials,
        private_key: &str,
    ) -> ControlResult<String>;

    /// Submit an add-validator transaction.
    ///
    /// A refusal by the node is an [`AddValidatorOutcome::Refused`], not an error.
    async fn add_validator(&self, request: &AddValidatorRequest)
        -> ControlResult<AddValidatorOutcome>;

    /// Current status of a transaction.
    async fn tx_status(&self, tx: &TxId) -> ControlResult<TxStatus>;

    /// Node IDs in the current validator set.
    async fn current_validators(&self) -> ControlResult<Vec<NodeId>>;

    /// Node IDs in the pending validator set.
    async fn pending_validators(&self) -> ControlResult<Vec<NodeId>>;
}

/// JSON-RPC methods used by stakeward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// `info.isBootstrapped`
    IsBootstrapped,
    /// `keystore.createUser`
    CreateUser,
    /// `platform.importKey`
    ImportKey,
    /// `platform.addValidator`
    AddValidator,
    /// `platform.getTxStatus`
    GetTxStatus,
    /// `platform.getCurrentValidators`
    GetCurrentValidators,
    /// `platform.getPendingValidators`
    GetPendingValidators,
}

impl Method {
    /// Wire name of the method.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::IsBootstrapped => "info.isBootstrapped",
            Self::CreateUser => "keystore.createUser",
            Self::ImportKey => "platform.importKey",
            Self::AddValidator => "platform.addValidator",
            Self::GetTxStatus => "platform.getTxStatus",
            Self::GetCurrentValidators => "platform.getCurrentValidators",
            Self::GetPendingValidators => "platform.getPendingValidators",
        }
    }

    /// HTTP path serving the method.
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::IsBootstrapped => "/ext/info",
            Self::CreateUser => "/ext/keystore",
            Self::ImportKey
            | Self::AddValidator
            | Self::GetTxStatus
            | Self::GetCurrentValidators
            | Self::GetPendingValidators => "/ext/bc/P",
        }
    }
}

/// JSON-RPC 2.0 request envelope.
#[derive(Debug, Serialize)]
pub(crate) struct RpcRequest<'a, P> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    pub params: &'a P,
}

/// JSON-RPC 2.0 response envelope.
#[derive(Debug, Deserialize)]
pub(crate) struct RpcResponse<R> {
    pub result: Option<R>,
    pub error: Option<RpcErrorObject>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RpcErrorObject {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Returns true if a create-user error only says the user is already there.
#[must_use]
pub fn is_user_exists(message: &str) -> bool {
    message.to_ascii_lowercase().contains("already exists")
}
