//! Concurrent registration of many identities.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{ActivationConfig, CoordinatorConfig};
use crate::error::{ControlError, ControlResult};
use crate::poll::{poll_until, Probe, RunContext};
use crate::rpc::NodeRpc;
use crate::state::ActivationReport;
use crate::types::Staker;

use super::ActivationEngine;

/// Outcome of a successful registration run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrationSummary {
    /// One report per identity, in dispatch order.
    pub reports: Vec<ActivationReport>,
}

impl RegistrationSummary {
    /// Add-validator calls made across all identities.
    #[must_use]
    pub fn total_submissions(&self) -> u32 {
        self.reports.iter().map(|r| r.submissions).sum()
    }
}

/// Gates on node bootstrap, then activates every identity concurrently.
#[derive(Clone)]
pub struct RegistrationCoordinator {
    node: Arc<dyn NodeRpc>,
    engine: Arc<ActivationEngine>,
    config: CoordinatorConfig,
}

impl std::fmt::Debug for RegistrationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationCoordinator")
            .field("engine", &self.engine)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RegistrationCoordinator {
    /// Create a coordinator whose engines share `node`.
    #[must_use]
    pub fn new(node: Arc<dyn NodeRpc>, activation: ActivationConfig, config: CoordinatorConfig) -> Self {
        let engine = ActivationEngine::new(
            Arc::clone(&node),
            activation,
            config.allow_submission_errors,
        );
        Self {
            node,
            engine: Arc::new(engine),
            config,
        }
    }

    /// Wait until the node reports the configured chain as bootstrapped.
    ///
    /// Only the context bounds the wait. RPC errors and `false` mean "not
    /// yet"; transport errors end the wait.
    pub async fn wait_bootstrapped(&self, ctx: &RunContext) -> ControlResult<()> {
        let node = &*self.node;
        let chain = self.config.bootstrap_chain.as_str();

        info!(chain, "waiting for node to bootstrap");
        poll_until(ctx, self.config.bootstrap_poll_interval, move || async move {
            match node.is_bootstrapped(chain).await {
                Ok(true) => Ok(Probe::Ready(())),
                Ok(false) => {
                    debug!(chain, "node not bootstrapped yet");
                    Ok(Probe::Pending)
                }
                Err(e) if e.is_transport() => Err(e),
                Err(e) => {
                    debug!(chain, error = %e, "bootstrap check failed, retrying");
                    Ok(Probe::Pending)
                }
            }
        })
        .await?;
        info!(chain, "node bootstrapped");
        Ok(())
    }

    /// Activate every staker, returning the first non-cancellation failure.
    ///
    /// Identities run concurrently with dispatches staggered by the
    /// configured delay. The first failure cancels the remaining identities;
    /// identities that already became active are left as they are.
    pub async fn register_all(
        &self,
        stakers: Vec<Staker>,
        ctx: &RunContext,
    ) -> ControlResult<RegistrationSummary> {
        self.wait_bootstrapped(ctx).await?;

        let run = ctx.child();
        let total = stakers.len();
        let mut tasks = JoinSet::new();
        let mut dispatch_error = None;

        info!(identities = total, "registering validators");

        for (index, staker) in stakers.into_iter().enumerate() {
            if index > 0 {
                if let Err(e) = run.sleep(self.config.dispatch_stagger).await {
                    dispatch_error = Some(e);
                    break;
                }
            }

            let engine = Arc::clone(&self.engine);
            let run = run.clone();
            debug!(node_id = %staker.node_id, index, "dispatching identity");
            tasks.spawn(async move {
                let result = engine.activate(&staker, &run).await;
                if let Err(e) = &result {
                    if !e.is_cancelled() {
                        run.cancel();
                    }
                }
                (index, result)
            });
        }

        let mut reports = Vec::with_capacity(total);
        let mut first_error: Option<ControlError> = None;

        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| ControlError::internal(format!("activation task failed: {e}")))
                .and_then(|(index, result)| result.map(|report| (index, report)));

            match outcome {
                Ok(report) => reports.push(report),
                Err(e) => {
                    run.cancel();
                    let replace = first_error
                        .as_ref()
                        .map_or(true, |first| first.is_cancelled() && !e.is_cancelled());
                    if replace {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error.or(dispatch_error) {
            warn!(error = %e, "registration failed");
            return Err(e);
        }

        reports.sort_by_key(|(index, _)| *index);
        let summary = RegistrationSummary {
            reports: reports.into_iter().map(|(_, report)| report).collect(),
        };
        info!(
            identities = total,
            submissions = summary.total_submissions(),
            "all validators active"
        );
        Ok(summary)
    }
}
