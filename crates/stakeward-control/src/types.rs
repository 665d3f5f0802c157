//! Core types for stakeward-control.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{ControlError, ControlResult};

const NODE_ID_PREFIX: &str = "NodeID-";

/// Identifier of a ledger node, in canonical `NodeID-<cb58>` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Create a node ID, adding the `NodeID-` prefix if it is missing.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        if id.starts_with(NODE_ID_PREFIX) {
            Self(id)
        } else {
            Self(format!("{NODE_ID_PREFIX}{id}"))
        }
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Reference to a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(String);

impl TxId {
    /// Create a new transaction ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validator-to-be: node identity, staking key and stake amount.
#[derive(Clone, Serialize, Deserialize)]
pub struct Staker {
    /// Node identifier derived from the staking certificate.
    #[serde(rename = "NodeID")]
    pub node_id: NodeId,
    /// Stake amount in the chain's smallest denomination.
    #[serde(rename = "Stake")]
    pub stake: u64,
    /// Encoded staking private key (`PrivateKey-…`).
    #[serde(rename = "PrivateKey")]
    pub private_key: String,
    /// Address of the staking key on the exchange chain (`X-…`).
    #[serde(rename = "PublicAddress")]
    pub public_address: String,
}

impl Staker {
    /// Create a new staker.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        stake: u64,
        private_key: impl Into<String>,
        public_address: impl Into<String>,
    ) -> Self {
        Self {
            node_id,
            stake,
            private_key: private_key.into(),
            public_address: public_address.into(),
        }
    }

    /// Derive the keystore credential for this staker.
    ///
    /// The password is a hash of the public address and carries no secret;
    /// it only makes credential creation repeatable across runs.
    #[must_use]
    pub fn credentials(&self) -> KeystoreCredentials {
        let digest = Sha1::digest(self.public_address.as_bytes());
        KeystoreCredentials {
            username: self.public_address.clone(),
            password: hex::encode(digest),
        }
    }

    /// Derive the platform-chain reward address from the public address.
    pub fn reward_address(&self) -> ControlResult<String> {
        let (_, rest) = self.public_address.split_once('-').ok_or_else(|| {
            ControlError::identity(format!(
                "{}: address {} has no chain prefix",
                self.node_id, self.public_address
            ))
        })?;
        Ok(format!("P-{rest}"))
    }
}

impl fmt::Debug for Staker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Staker")
            .field("node_id", &self.node_id)
            .field("stake", &self.stake)
            .field("public_address", &self.public_address)
            .finish_non_exhaustive()
    }
}

/// Keystore user under which a staker's private key is imported.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct KeystoreCredentials {
    /// Keystore username.
    pub username: String,
    /// Keystore password.
    pub password: String,
}

impl fmt::Debug for KeystoreCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeystoreCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// A generated network as written by the network generator.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkFile {
    /// Generator version the file was produced with.
    #[serde(rename = "Version", default)]
    pub version: String,
    /// Genesis configuration; only the initial staker list is read.
    #[serde(rename = "GenesisConfig", default)]
    pub genesis: GenesisSummary,
    /// All stakers of the network, genesis stakers first.
    #[serde(rename = "Stakers", default)]
    pub stakers: Vec<Staker>,
}

/// The subset of the genesis configuration stakeward cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenesisSummary {
    /// Stakers that are validators from genesis.
    #[serde(rename = "initialStakers", default)]
    pub initial_stakers: Vec<serde_json::Value>,
}

impl NetworkFile {
    /// Load a network file from disk.
    pub fn load(path: impl AsRef<Path>) -> ControlResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let network: Self = serde_json::from_slice(&data)?;

        if network.version.is_empty() {
            return Err(ControlError::identity(format!(
                "{} was written by an old generator, please regenerate",
                path.display()
            )));
        }

        Ok(network)
    }

    /// Number of stakers that are validators from genesis.
    #[must_use]
    pub fn initial_staker_count(&self) -> usize {
        self.genesis.initial_stakers.len()
    }

    /// Stakers that must be registered to run `validators` validators in total.
    ///
    /// Genesis stakers are already validators and are skipped.
    pub fn stakers_to_register(&self, validators: usize) -> ControlResult<&[Staker]> {
        let initial = self.initial_staker_count();
        if validators < initial {
            return Err(ControlError::identity(format!(
                "network needs at least all initial stakers to be started: {validators} < {initial}"
            )));
        }
        if validators > self.stakers.len() {
            return Err(ControlError::identity(format!(
                "network does not contain enough stakers: {validators} > {}",
                self.stakers.len()
            )));
        }
        Ok(&self.stakers[initial..validators])
    }
}
