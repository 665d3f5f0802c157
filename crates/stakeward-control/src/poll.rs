//! Run context and the cancellation-aware poll helper.
//!
//! A [`RunContext`] is the single cancellation scope of a provisioning run:
//! a [`CancellationToken`] plus an optional deadline. Every sleep and every
//! RPC round-trip in the crate goes through it, so cancelling the token or
//! reaching the deadline makes all waiting tasks return promptly.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ControlError, ControlResult};

/// Result of a single poll probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    /// The condition holds; stop polling.
    Ready(T),
    /// Not yet; poll again after the interval.
    Pending,
}

/// Cancellation scope shared by every task of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    /// Create a context with no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Create a context driven by an existing token.
    #[must_use]
    pub const fn with_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Set an absolute deadline, keeping the earlier one if already set.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Set a deadline `timeout` from now. A zero timeout means no deadline.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            self
        } else {
            self.with_deadline(Instant::now() + timeout)
        }
    }

    /// Derive a child context: cancelled with its parent, cancellable alone.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    /// The deadline of this context, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this context and all of its children.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once the context is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with the reason the context is done, if it is.
    pub fn check(&self) -> ControlResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ControlError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(ControlError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Run a future to completion unless the context ends first.
    pub async fn run<F, T>(&self, fut: F) -> ControlResult<T>
    where
        F: Future<Output = ControlResult<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(ControlError::Cancelled),
            () = sleep_until_opt(self.deadline) => Err(ControlError::DeadlineExceeded),
            result = fut => result,
        }
    }

    /// Sleep for `duration`, returning early with an error if the context ends.
    ///
    /// The sleep never extends past the deadline.
    pub async fn sleep(&self, duration: Duration) -> ControlResult<()> {
        self.check()?;
        let wake = Instant::now() + duration;
        match self.deadline {
            Some(deadline) if deadline <= wake => {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => Err(ControlError::Cancelled),
                    () = tokio::time::sleep_until(deadline) => Err(ControlError::DeadlineExceeded),
                }
            }
            _ => {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => Err(ControlError::Cancelled),
                    () = tokio::time::sleep_until(wake) => Ok(()),
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Probe until it reports [`Probe::Ready`], sleeping `interval` between probes.
///
/// The first probe runs immediately. Probe errors end the poll; a probe that
/// wants to tolerate an error should map it to [`Probe::Pending`] itself.
/// Each probe and each sleep is bounded by the context.
pub async fn poll_until<T, F, Fut>(
    ctx: &RunContext,
    interval: Duration,
    mut probe: F,
) -> ControlResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControlResult<Probe<T>>>,
{
    loop {
        match ctx.run(probe()).await? {
            Probe::Ready(value) => return Ok(value),
            Probe::Pending => ctx.sleep(interval).await?,
        }
    }
}
