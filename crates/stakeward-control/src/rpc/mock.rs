//! In-memory node for tests and dry runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{ControlError, ControlResult};
use crate::types::{KeystoreCredentials, NodeId, TxId};

use super::{AddValidatorOutcome, AddValidatorRequest, Method, NodeRpc, TxStatus};

#[derive(Debug, Default)]
struct NodeState {
    bootstrap_polls_left: u32,
    users: HashSet<String>,
    tx_scripts: HashMap<NodeId, VecDeque<TxStatus>>,
    refusals: HashMap<NodeId, VecDeque<String>>,
    txs: HashMap<TxId, NodeId>,
    submissions: HashMap<NodeId, Vec<AddValidatorRequest>>,
    in_flight: HashMap<NodeId, u32>,
    max_in_flight: u32,
    /// Identities that reached the pending set and when they turn active.
    staged: HashMap<NodeId, Instant>,
    active: HashSet<NodeId>,
}

/// Scriptable in-memory node.
///
/// Transactions resolve through a per-identity script of statuses (then
/// `Committed` once the script runs out). A committed identity sits in the
/// pending set for the activation delay and then moves to the current set.
#[derive(Debug)]
pub struct MockNode {
    state: RwLock<NodeState>,
    activation_delay: Duration,
}

impl Default for MockNode {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNode {
    /// Create a bootstrapped node with no activation delay.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(NodeState::default()),
            activation_delay: Duration::ZERO,
        }
    }

    /// Keep committed identities pending for `delay` before they turn active.
    #[must_use]
    pub const fn with_activation_delay(mut self, delay: Duration) -> Self {
        self.activation_delay = delay;
        self
    }

    /// Report "not bootstrapped" for the next `polls` bootstrap checks.
    #[must_use]
    pub fn with_bootstrap_polls(self, polls: u32) -> Self {
        if let Ok(mut state) = self.state.write() {
            state.bootstrap_polls_left = polls;
        }
        self
    }

    /// Mark an identity as already in the current validator set.
    #[must_use]
    pub fn with_active(self, node_id: NodeId) -> Self {
        if let Ok(mut state) = self.state.write() {
            state.active.insert(node_id);
        }
        self
    }

    /// Mark an identity as already in the pending validator set.
    #[must_use]
    pub fn with_pending(self, node_id: NodeId) -> Self {
        let at = Instant::now() + self.activation_delay;
        if let Ok(mut state) = self.state.write() {
            state.staged.insert(node_id, at);
        }
        self
    }

    /// Statuses returned for an identity's transactions, one per status poll.
    #[must_use]
    pub fn with_tx_statuses(self, node_id: NodeId, statuses: impl IntoIterator<Item = TxStatus>) -> Self {
        if let Ok(mut state) = self.state.write() {
            state
                .tx_scripts
                .entry(node_id)
                .or_default()
                .extend(statuses);
        }
        self
    }

    /// Refuse the next add-validator submission of an identity with `message`.
    #[must_use]
    pub fn with_refusal(self, node_id: NodeId, message: impl Into<String>) -> Self {
        if let Ok(mut state) = self.state.write() {
            state
                .refusals
                .entry(node_id)
                .or_default()
                .push_back(message.into());
        }
        self
    }

    /// Number of add-validator calls made for an identity, refusals included.
    pub fn submission_count(&self, node_id: &NodeId) -> ControlResult<usize> {
        let state = self.read()?;
        Ok(state.submissions.get(node_id).map_or(0, Vec::len))
    }

    /// Every add-validator request made for an identity, oldest first.
    pub fn submissions(&self, node_id: &NodeId) -> ControlResult<Vec<AddValidatorRequest>> {
        let state = self.read()?;
        Ok(state.submissions.get(node_id).cloned().unwrap_or_default())
    }

    /// Most transactions ever in flight at once for a single identity.
    pub fn max_in_flight(&self) -> ControlResult<u32> {
        Ok(self.read()?.max_in_flight)
    }

    fn read(&self) -> ControlResult<std::sync::RwLockReadGuard<'_, NodeState>> {
        self.state
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    fn write(&self) -> ControlResult<std::sync::RwLockWriteGuard<'_, NodeState>> {
        self.state
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }
}

impl NodeState {
    /// Move staged identities whose activation time has passed into the current set.
    fn promote(&mut self, now: Instant) {
        let ready: Vec<NodeId> = self
            .staged
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ready {
            self.staged.remove(&id);
            self.active.insert(id);
        }
    }

    fn settle(&mut self, node_id: &NodeId) {
        if let Some(count) = self.in_flight.get_mut(node_id) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl NodeRpc for MockNode {
    async fn is_bootstrapped(&self, _chain: &str) -> ControlResult<bool> {
        let mut state = self.write()?;
        if state.bootstrap_polls_left > 0 {
            state.bootstrap_polls_left -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    async fn create_user(&self, credentials: &KeystoreCredentials) -> ControlResult<()> {
        let mut state = self.write()?;
        if !state.users.insert(credentials.username.clone()) {
            return Err(ControlError::Rpc {
                method: Method::CreateUser.name(),
                code: -32000,
                message: format!("user already exists: {}", credentials.username),
            });
        }
        Ok(())
    }

    async fn import_key(
        &self,
        credentials: &KeystoreCredentials,
        _private_key: &str,
    ) -> ControlResult<String> {
        let state = self.read()?;
        if !state.users.contains(&credentials.username) {
            return Err(ControlError::Rpc {
                method: Method::ImportKey.name(),
                code: -32000,
                message: format!("user {} does not exist", credentials.username),
            });
        }
        let suffix = credentials
            .username
            .split_once('-')
            .map_or(credentials.username.as_str(), |(_, rest)| rest);
        Ok(format!("P-{suffix}"))
    }

    async fn add_validator(
        &self,
        request: &AddValidatorRequest,
    ) -> ControlResult<AddValidatorOutcome> {
        let mut state = self.write()?;
        let node_id = request.node_id.clone();
        state
            .submissions
            .entry(node_id.clone())
            .or_default()
            .push(request.clone());

        if let Some(message) = state.refusals.get_mut(&node_id).and_then(VecDeque::pop_front) {
            return Ok(AddValidatorOutcome::Refused(message));
        }

        let in_flight = state.in_flight.entry(node_id.clone()).or_default();
        *in_flight += 1;
        let in_flight = *in_flight;
        state.max_in_flight = state.max_in_flight.max(in_flight);

        let tx = TxId::new(format!("tx-{}", ulid::Ulid::new()));
        state.txs.insert(tx.clone(), node_id);
        Ok(AddValidatorOutcome::Accepted(tx))
    }

    async fn tx_status(&self, tx: &TxId) -> ControlResult<TxStatus> {
        let mut state = self.write()?;
        let Some(node_id) = state.txs.get(tx).cloned() else {
            return Ok(TxStatus::Unknown);
        };

        let status = state
            .tx_scripts
            .get_mut(&node_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(TxStatus::Committed);

        match status {
            TxStatus::Committed => {
                state.txs.remove(tx);
                state.settle(&node_id);
                let at = Instant::now() + self.activation_delay;
                state.staged.insert(node_id, at);
            }
            TxStatus::Unknown | TxStatus::Dropped => {
                state.txs.remove(tx);
                state.settle(&node_id);
            }
            TxStatus::Processing | TxStatus::Pending | TxStatus::Other => {}
        }
        Ok(status)
    }

    async fn current_validators(&self) -> ControlResult<Vec<NodeId>> {
        let mut state = self.write()?;
        state.promote(Instant::now());
        Ok(state.active.iter().cloned().collect())
    }

    async fn pending_validators(&self) -> ControlResult<Vec<NodeId>> {
        let mut state = self.write()?;
        state.promote(Instant::now());
        Ok(state.staged.keys().cloned().collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request(node_id: &NodeId) -> AddValidatorRequest {
        AddValidatorRequest {
            node_id: node_id.clone(),
            start_time: 0,
            end_time: 1,
            stake_amount: 1,
            reward_address: "P-net1abc".to_owned(),
            delegation_fee_rate: 10,
            credentials: KeystoreCredentials {
                username: "X-net1abc".to_owned(),
                password: "pw".to_owned(),
            },
        }
    }

    fn accepted(outcome: AddValidatorOutcome) -> TxId {
        match outcome {
            AddValidatorOutcome::Accepted(tx) => tx,
            AddValidatorOutcome::Refused(msg) => panic!("refused: {msg}"),
        }
    }

    #[tokio::test]
    async fn duplicate_user_is_reported_like_the_node() {
        let node = MockNode::new();
        let creds = KeystoreCredentials {
            username: "X-net1abc".to_owned(),
            password: "pw".to_owned(),
        };
        node.create_user(&creds).await.unwrap();
        let err = node.create_user(&creds).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(node.import_key(&creds, "PrivateKey-x").await.unwrap(), "P-net1abc");
    }

    #[tokio::test(start_paused = true)]
    async fn committed_identity_turns_active_after_delay() {
        let id = NodeId::new("NodeID-a");
        let node = MockNode::new()
            .with_activation_delay(Duration::from_secs(12))
            .with_tx_statuses(id.clone(), [TxStatus::Processing]);

        let tx = accepted(node.add_validator(&request(&id)).await.unwrap());
        assert_eq!(node.tx_status(&tx).await.unwrap(), TxStatus::Processing);
        assert_eq!(node.tx_status(&tx).await.unwrap(), TxStatus::Committed);

        assert_eq!(node.pending_validators().await.unwrap(), vec![id.clone()]);
        assert!(node.current_validators().await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(12)).await;
        assert_eq!(node.current_validators().await.unwrap(), vec![id.clone()]);
        assert!(node.pending_validators().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lost_transactions_leave_flight() {
        let id = NodeId::new("NodeID-a");
        let node = MockNode::new().with_tx_statuses(id.clone(), [TxStatus::Unknown]);

        let first = accepted(node.add_validator(&request(&id)).await.unwrap());
        assert_eq!(node.tx_status(&first).await.unwrap(), TxStatus::Unknown);
        let second = accepted(node.add_validator(&request(&id)).await.unwrap());
        assert_eq!(node.tx_status(&second).await.unwrap(), TxStatus::Committed);

        assert_eq!(node.submission_count(&id).unwrap(), 2);
        assert_eq!(node.max_in_flight().unwrap(), 1);
    }

    #[tokio::test]
    async fn refusals_are_scripted_per_identity() {
        let id = NodeId::new("NodeID-a");
        let node = MockNode::new().with_refusal(id.clone(), "insufficient funds");

        assert_eq!(
            node.add_validator(&request(&id)).await.unwrap(),
            AddValidatorOutcome::Refused("insufficient funds".to_owned())
        );
        accepted(node.add_validator(&request(&id)).await.unwrap());
        assert_eq!(node.submission_count(&id).unwrap(), 2);
    }

    #[tokio::test]
    async fn bootstrap_polls_count_down() {
        let node = MockNode::new().with_bootstrap_polls(2);
        assert!(!node.is_bootstrapped("P").await.unwrap());
        assert!(!node.is_bootstrapped("P").await.unwrap());
        assert!(node.is_bootstrapped("P").await.unwrap());
    }
}
