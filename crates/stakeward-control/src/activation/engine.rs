//! Per-identity activation state machine.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::ActivationConfig;
use crate::error::{ControlError, ControlResult};
use crate::poll::{poll_until, Probe, RunContext};
use crate::rpc::{is_user_exists, AddValidatorOutcome, AddValidatorRequest, NodeRpc, TxStatus};
use crate::state::{ActivationAttempt, ActivationReport, Phase, StakeWindow};
use crate::types::{KeystoreCredentials, NodeId, Staker, TxId};

/// Where an identity stands on chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    Active,
    Pending,
    Absent,
}

/// Drives one identity from unregistered to active validator.
///
/// The engine is stateless between calls; each call owns its own
/// [`ActivationAttempt`].
#[derive(Clone)]
pub struct ActivationEngine {
    node: Arc<dyn NodeRpc>,
    config: ActivationConfig,
    allow_submission_errors: bool,
}

impl std::fmt::Debug for ActivationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationEngine")
            .field("config", &self.config)
            .field("allow_submission_errors", &self.allow_submission_errors)
            .finish_non_exhaustive()
    }
}

impl ActivationEngine {
    /// Create a new engine.
    #[must_use]
    pub fn new(node: Arc<dyn NodeRpc>, config: ActivationConfig, allow_submission_errors: bool) -> Self {
        Self {
            node,
            config,
            allow_submission_errors,
        }
    }

    /// Activate `staker`, returning once it is in the current validator set.
    ///
    /// Failures are wrapped in [`ControlError::Activation`] with the phase the
    /// attempt was in.
    pub async fn activate(&self, staker: &Staker, ctx: &RunContext) -> ControlResult<ActivationReport> {
        let mut attempt = ActivationAttempt::new(staker.node_id.clone());

        match self.drive(staker, &mut attempt, ctx).await {
            Ok(()) => {
                info!(
                    node_id = %staker.node_id,
                    submissions = attempt.submissions(),
                    "identity is an active validator"
                );
                Ok(attempt.into_report())
            }
            Err(e) => {
                let phase = attempt.fail();
                if e.is_cancelled() {
                    debug!(node_id = %staker.node_id, %phase, "activation cancelled");
                } else {
                    warn!(node_id = %staker.node_id, %phase, error = %e, "activation failed");
                }
                Err(ControlError::activation(staker.node_id.clone(), phase, e))
            }
        }
    }

    async fn drive(
        &self,
        staker: &Staker,
        attempt: &mut ActivationAttempt,
        ctx: &RunContext,
    ) -> ControlResult<()> {
        let credentials = staker.credentials();
        let reward_address = staker.reward_address()?;

        self.import(staker, &credentials, ctx).await?;
        attempt.advance(Phase::Imported)?;
        debug!(node_id = %staker.node_id, "staking key imported");

        loop {
            ctx.check()?;

            match self.membership(&staker.node_id, ctx).await? {
                Membership::Active => {
                    info!(node_id = %staker.node_id, "already an active validator");
                    return attempt.advance(Phase::ActiveValidator);
                }
                Membership::Pending => {
                    info!(node_id = %staker.node_id, "already a pending validator");
                    attempt.advance(Phase::PendingValidator)?;
                    self.wait_active(&staker.node_id, ctx).await?;
                    return attempt.advance(Phase::ActiveValidator);
                }
                Membership::Absent => {}
            }

            let window = StakeWindow::starting_after(
                Utc::now(),
                self.config.start_lead(),
                self.config.stake_duration,
            );
            let request = AddValidatorRequest {
                node_id: staker.node_id.clone(),
                start_time: window.start_unix(),
                end_time: window.end_unix(),
                stake_amount: staker.stake,
                reward_address: reward_address.clone(),
                delegation_fee_rate: self.config.delegation_fee_rate,
                credentials: credentials.clone(),
            };

            attempt.count_submission();
            let tx = match ctx.run(self.node.add_validator(&request)).await? {
                AddValidatorOutcome::Accepted(tx) => tx,
                AddValidatorOutcome::Refused(message) if self.allow_submission_errors => {
                    warn!(
                        node_id = %staker.node_id,
                        reason = %message,
                        "add-validator refused, retrying"
                    );
                    ctx.sleep(self.config.retry_interval).await?;
                    continue;
                }
                AddValidatorOutcome::Refused(message) => {
                    return Err(ControlError::SubmissionRejected(message));
                }
            };

            info!(
                node_id = %staker.node_id,
                tx = %tx,
                start = window.start_unix(),
                attempt = attempt.submissions(),
                "add-validator submitted"
            );
            attempt.record_submission(tx.clone(), window)?;

            let status = self.settle(&staker.node_id, &tx, ctx).await?;
            if status == TxStatus::Committed {
                attempt.advance(Phase::Committed)?;
                attempt.advance(Phase::PendingValidator)?;
                info!(node_id = %staker.node_id, tx = %tx, "add-validator committed");
                self.wait_active(&staker.node_id, ctx).await?;
                return attempt.advance(Phase::ActiveValidator);
            }

            warn!(node_id = %staker.node_id, tx = %tx, %status, "add-validator lost, resubmitting");
            attempt.advance(Phase::Rejected)?;
        }
    }

    async fn import(
        &self,
        staker: &Staker,
        credentials: &KeystoreCredentials,
        ctx: &RunContext,
    ) -> ControlResult<()> {
        match ctx.run(self.node.create_user(credentials)).await {
            Ok(()) => {}
            Err(ControlError::Rpc { ref message, .. }) if is_user_exists(message) => {
                debug!(node_id = %staker.node_id, "keystore user already exists");
            }
            Err(e) => return Err(e),
        }

        ctx.run(self.node.import_key(credentials, &staker.private_key))
            .await?;
        Ok(())
    }

    /// Check the current set, then the pending set.
    async fn membership(&self, node_id: &NodeId, ctx: &RunContext) -> ControlResult<Membership> {
        let current = ctx.run(self.node.current_validators()).await?;
        if current.contains(node_id) {
            return Ok(Membership::Active);
        }
        let pending = ctx.run(self.node.pending_validators()).await?;
        if pending.contains(node_id) {
            return Ok(Membership::Pending);
        }
        Ok(Membership::Absent)
    }

    /// Poll a transaction until it is committed or lost, starting one interval after submission.
    async fn settle(&self, node_id: &NodeId, tx: &TxId, ctx: &RunContext) -> ControlResult<TxStatus> {
        ctx.sleep(self.config.tx_poll_interval).await?;
        let node = &*self.node;
        poll_until(ctx, self.config.tx_poll_interval, move || async move {
            let status = node.tx_status(tx).await?;
            debug!(%node_id, %tx, %status, "transaction status");
            Ok(if status == TxStatus::Committed || status.is_lost() {
                Probe::Ready(status)
            } else {
                Probe::Pending
            })
        })
        .await
    }

    /// Poll the current validator set until it contains `node_id`.
    async fn wait_active(&self, node_id: &NodeId, ctx: &RunContext) -> ControlResult<()> {
        let node = &*self.node;
        poll_until(ctx, self.config.active_poll_interval, move || async move {
            let current = node.current_validators().await?;
            Ok(if current.contains(node_id) {
                Probe::Ready(())
            } else {
                debug!(%node_id, "not active yet");
                Probe::Pending
            })
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::rpc::MockNode;

    fn staker(id: &str) -> Staker {
        Staker::new(
            NodeId::new(id),
            2_000_000_000_000,
            format!("PrivateKey-{id}"),
            format!("X-kopernikus1{id}"),
        )
    }

    fn config() -> ActivationConfig {
        ActivationConfig::default()
    }

    fn engine(node: &Arc<MockNode>, allow_submission_errors: bool) -> ActivationEngine {
        ActivationEngine::new(Arc::clone(node) as Arc<dyn NodeRpc>, config(), allow_submission_errors)
    }

    #[tokio::test(start_paused = true)]
    async fn already_active_identity_is_not_resubmitted() {
        let s = staker("a");
        let node = Arc::new(MockNode::new().with_active(s.node_id.clone()));

        let report = engine(&node, true)
            .activate(&s, &RunContext::new())
            .await
            .unwrap();

        assert_eq!(report.phase, Phase::ActiveValidator);
        assert_eq!(report.submissions, 0);
        assert_eq!(node.submission_count(&s.node_id).unwrap(), 0);
        assert_eq!(
            report.trace,
            vec![Phase::Unregistered, Phase::Imported, Phase::ActiveValidator]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pending_identity_waits_without_submitting() {
        let s = staker("a");
        let node = Arc::new(
            MockNode::new()
                .with_activation_delay(Duration::from_secs(30))
                .with_pending(s.node_id.clone()),
        );

        let report = engine(&node, true)
            .activate(&s, &RunContext::new())
            .await
            .unwrap();

        assert_eq!(report.submissions, 0);
        assert_eq!(
            report.trace,
            vec![
                Phase::Unregistered,
                Phase::Imported,
                Phase::PendingValidator,
                Phase::ActiveValidator
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lost_transactions_are_resubmitted_until_committed() {
        let s = staker("a");
        let node = Arc::new(
            MockNode::new()
                .with_tx_statuses(s.node_id.clone(), [TxStatus::Unknown, TxStatus::Unknown, TxStatus::Committed]),
        );

        let report = engine(&node, true)
            .activate(&s, &RunContext::new())
            .await
            .unwrap();

        assert_eq!(report.phase, Phase::ActiveValidator);
        assert_eq!(report.submissions, 3);
        assert_eq!(node.submission_count(&s.node_id).unwrap(), 3);
        assert_eq!(node.max_in_flight().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_status_check_waits_one_interval() {
        let s = staker("a");
        let node = Arc::new(MockNode::new());
        let start = Instant::now();

        let report = engine(&node, true)
            .activate(&s, &RunContext::new())
            .await
            .unwrap();

        assert_eq!(report.submissions, 1);
        let elapsed = start.elapsed();
        assert!(elapsed >= config().tx_poll_interval);
        assert!(elapsed < config().tx_poll_interval * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn every_submission_gets_a_fresh_window() {
        let s = staker("a");
        let node = Arc::new(
            MockNode::new().with_tx_statuses(s.node_id.clone(), [TxStatus::Dropped, TxStatus::Committed]),
        );

        let before = Utc::now().timestamp();
        let report = engine(&node, true)
            .activate(&s, &RunContext::new())
            .await
            .unwrap();
        let after = Utc::now().timestamp();

        let submissions = node.submissions(&s.node_id).unwrap();
        assert_eq!(submissions.len(), 2);
        for request in &submissions {
            assert!(request.start_time >= before + 180);
            assert!(request.start_time <= after + 180);
            assert_eq!(request.end_time - request.start_time, 30 * 24 * 60 * 60);
            assert_eq!(request.reward_address, "P-kopernikus1a");
            assert_eq!(request.delegation_fee_rate, 10);
            assert_eq!(request.credentials, s.credentials());
        }
        let window = report.window.unwrap();
        assert_eq!(window.start_unix(), submissions[1].start_time);
        assert_eq!(window.end_unix(), submissions[1].end_time);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_ends_activation_with_timeout() {
        let s = staker("a");
        let node = Arc::new(
            MockNode::new().with_tx_statuses(s.node_id.clone(), std::iter::repeat(TxStatus::Processing).take(1000)),
        );
        let start = Instant::now();
        let ctx = RunContext::new().with_timeout(Duration::from_secs(60));

        let err = engine(&node, true).activate(&s, &ctx).await.unwrap_err();

        assert!(err.is_timeout());
        assert!(!matches!(err, ControlError::SubmissionRejected(_)));
        match &err {
            ControlError::Activation { phase, .. } => assert_eq!(*phase, Phase::Submitted),
            other => panic!("unexpected error: {other}"),
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(60));
        assert!(elapsed <= Duration::from_secs(60) + config().tx_poll_interval);
    }

    #[tokio::test(start_paused = true)]
    async fn refusal_is_fatal_without_allowance() {
        let s = staker("a");
        let node = Arc::new(MockNode::new().with_refusal(s.node_id.clone(), "insufficient funds"));

        let err = engine(&node, false)
            .activate(&s, &RunContext::new())
            .await
            .unwrap_err();

        match err {
            ControlError::Activation { node_id, phase, source } => {
                assert_eq!(node_id, s.node_id);
                assert_eq!(phase, Phase::Imported);
                assert!(matches!(*source, ControlError::SubmissionRejected(ref m) if m == "insufficient funds"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refusal_is_retried_with_allowance() {
        let s = staker("a");
        let node = Arc::new(MockNode::new().with_refusal(s.node_id.clone(), "start time too early"));
        let start = Instant::now();

        let report = engine(&node, true)
            .activate(&s, &RunContext::new())
            .await
            .unwrap();

        assert_eq!(report.submissions, 2);
        assert!(start.elapsed() >= config().retry_interval);
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_tolerates_existing_keystore_user() {
        let s = staker("a");
        let node = Arc::new(MockNode::new());
        let engine = engine(&node, true);

        engine.activate(&s, &RunContext::new()).await.unwrap();
        let rerun = engine.activate(&s, &RunContext::new()).await.unwrap();

        assert_eq!(rerun.submissions, 0);
        assert_eq!(node.submission_count(&s.node_id).unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_activation() {
        let s = staker("a");
        let node = Arc::new(
            MockNode::new().with_tx_statuses(s.node_id.clone(), std::iter::repeat(TxStatus::Pending).take(1000)),
        );
        let ctx = RunContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            canceller.cancel();
        });

        let err = engine(&node, true).activate(&s, &ctx).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(!err.is_timeout());
    }
}
