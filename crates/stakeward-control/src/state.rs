//! Activation phases and per-identity attempt state.
//!
//! Every identity moves through the same phases:
//!
//! ```text
//! Unregistered ──▶ Imported ──▶ Submitted ──▶ Committed ──▶ PendingValidator ──▶ ActiveValidator
//!                     │  ▲          │                             ▲                   ▲
//!                     │  └─ Rejected ◀┘                           │                   │
//!                     └───────────────── (already on chain) ──────┴───────────────────┘
//! ```
//!
//! Any non-terminal phase may move to `Failed`. The loop through `Rejected`
//! is how dropped transactions are resubmitted.

use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};
use crate::types::{NodeId, TxId};

/// Phase of a single identity's activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing done yet.
    Unregistered,
    /// Keystore credential created and staking key imported.
    Imported,
    /// Add-validator transaction submitted, outcome unknown.
    Submitted,
    /// Transaction accepted by consensus.
    Committed,
    /// Transaction never reached consensus (unknown or dropped).
    Rejected,
    /// Identity is in the pending validator set.
    PendingValidator,
    /// Identity is in the current validator set.
    ActiveValidator,
    /// Activation aborted.
    Failed,
}

impl Phase {
    /// Get the phase name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unregistered => "unregistered",
            Self::Imported => "imported",
            Self::Submitted => "submitted",
            Self::Committed => "committed",
            Self::Rejected => "rejected",
            Self::PendingValidator => "pending_validator",
            Self::ActiveValidator => "active_validator",
            Self::Failed => "failed",
        }
    }

    /// Check if the phase is terminal (cannot transition further).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::ActiveValidator | Self::Failed)
    }

    /// Transaction outcomes are tracked as the current phase but are not
    /// lifecycle milestones.
    #[must_use]
    pub const fn is_milestone(&self) -> bool {
        !matches!(self, Self::Committed | Self::Rejected)
    }

    /// Check whether `next` may follow this phase.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        use Phase::{
            ActiveValidator, Committed, Failed, Imported, PendingValidator, Rejected, Submitted,
            Unregistered,
        };

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed) {
            return true;
        }

        matches!(
            (*self, next),
            (Unregistered, Imported)
                | (Imported | Rejected, Submitted | PendingValidator | ActiveValidator)
                | (Submitted, Committed | Rejected)
                | (Committed, PendingValidator)
                | (PendingValidator, ActiveValidator)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unregistered" => Ok(Self::Unregistered),
            "imported" => Ok(Self::Imported),
            "submitted" => Ok(Self::Submitted),
            "committed" => Ok(Self::Committed),
            "rejected" => Ok(Self::Rejected),
            "pending_validator" => Ok(Self::PendingValidator),
            "active_validator" => Ok(Self::ActiveValidator),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown activation phase: {s}")),
        }
    }
}

/// Start and end of a staking period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StakeWindow {
    /// When validation starts.
    pub start: DateTime<Utc>,
    /// When validation ends.
    pub end: DateTime<Utc>,
}

impl StakeWindow {
    /// Compute a window starting `lead` after `now` and lasting `duration`.
    #[must_use]
    pub fn starting_after(
        now: DateTime<Utc>,
        lead: std::time::Duration,
        duration: std::time::Duration,
    ) -> Self {
        let start = offset(now, lead);
        Self {
            start,
            end: offset(start, duration),
        }
    }

    /// Start time in Unix seconds.
    #[must_use]
    pub fn start_unix(&self) -> i64 {
        self.start.timestamp()
    }

    /// End time in Unix seconds.
    #[must_use]
    pub fn end_unix(&self) -> i64 {
        self.end.timestamp()
    }
}

fn offset(at: DateTime<Utc>, by: std::time::Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(by)
        .ok()
        .and_then(|by| at.checked_add_signed(by))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Transient state of one identity's activation.
///
/// Owned by exactly one engine task; never shared.
#[derive(Debug)]
pub struct ActivationAttempt {
    node_id: NodeId,
    phase: Phase,
    trace: Vec<Phase>,
    last_tx: Option<TxId>,
    window: Option<StakeWindow>,
    submissions: u32,
}

impl ActivationAttempt {
    /// Start a new attempt in the unregistered phase.
    #[must_use]
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            phase: Phase::Unregistered,
            trace: vec![Phase::Unregistered],
            last_tx: None,
            window: None,
            submissions: 0,
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    ///
    /// Re-entering the current phase is a no-op.
    pub fn advance(&mut self, next: Phase) -> ControlResult<()> {
        if next == self.phase {
            return Ok(());
        }
        if !self.phase.can_transition_to(next) {
            return Err(ControlError::InvalidStateTransition {
                from: self.phase.as_str(),
                to: next.as_str(),
            });
        }

        self.phase = next;
        if next.is_milestone() && self.trace.last() != Some(&next) {
            self.trace.push(next);
        }
        Ok(())
    }

    /// Record a submitted transaction and move to `Submitted`.
    pub fn record_submission(&mut self, tx: TxId, window: StakeWindow) -> ControlResult<()> {
        self.advance(Phase::Submitted)?;
        self.last_tx = Some(tx);
        self.window = Some(window);
        Ok(())
    }

    /// Count a call to the add-validator endpoint, accepted or not.
    pub fn count_submission(&mut self) {
        self.submissions += 1;
    }

    /// Mark the attempt failed, returning the phase it failed in.
    pub fn fail(&mut self) -> Phase {
        let last = self.phase;
        if !self.phase.is_terminal() {
            self.phase = Phase::Failed;
            self.trace.push(Phase::Failed);
        }
        last
    }

    /// The identity this attempt belongs to.
    #[must_use]
    pub const fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Milestones visited so far.
    #[must_use]
    pub fn trace(&self) -> &[Phase] {
        &self.trace
    }

    /// Last transaction submitted.
    #[must_use]
    pub const fn last_tx(&self) -> Option<&TxId> {
        self.last_tx.as_ref()
    }

    /// Number of add-validator calls made.
    #[must_use]
    pub const fn submissions(&self) -> u32 {
        self.submissions
    }

    /// Convert a finished attempt into a report.
    #[must_use]
    pub fn into_report(self) -> ActivationReport {
        ActivationReport {
            node_id: self.node_id,
            phase: self.phase,
            trace: self.trace,
            last_tx: self.last_tx,
            window: self.window,
            submissions: self.submissions,
        }
    }
}

/// Outcome of a successful activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationReport {
    /// The activated identity.
    pub node_id: NodeId,
    /// Final phase.
    pub phase: Phase,
    /// Milestones visited.
    pub trace: Vec<Phase>,
    /// Last transaction submitted, if any.
    pub last_tx: Option<TxId>,
    /// Stake window of the last accepted submission.
    pub window: Option<StakeWindow>,
    /// Number of add-validator calls made.
    pub submissions: u32,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn attempt() -> ActivationAttempt {
        ActivationAttempt::new(NodeId::new("NodeID-test"))
    }

    #[test]
    fn happy_path_trace() {
        let mut attempt = attempt();
        attempt.advance(Phase::Imported).unwrap();
        attempt.advance(Phase::Submitted).unwrap();
        attempt.advance(Phase::Committed).unwrap();
        attempt.advance(Phase::PendingValidator).unwrap();
        attempt.advance(Phase::ActiveValidator).unwrap();

        assert_eq!(
            attempt.trace(),
            &[
                Phase::Unregistered,
                Phase::Imported,
                Phase::Submitted,
                Phase::PendingValidator,
                Phase::ActiveValidator,
            ]
        );
        assert!(attempt.phase().is_terminal());
    }

    #[test]
    fn resubmission_collapses_in_trace() {
        let mut attempt = attempt();
        attempt.advance(Phase::Imported).unwrap();
        attempt.advance(Phase::Submitted).unwrap();
        attempt.advance(Phase::Rejected).unwrap();
        assert_eq!(attempt.phase(), Phase::Rejected);
        attempt.advance(Phase::Submitted).unwrap();

        assert_eq!(
            attempt.trace(),
            &[Phase::Unregistered, Phase::Imported, Phase::Submitted]
        );
    }

    #[test]
    fn guard_can_skip_submission() {
        let mut attempt = attempt();
        attempt.advance(Phase::Imported).unwrap();
        attempt.advance(Phase::ActiveValidator).unwrap();
        assert_eq!(attempt.submissions(), 0);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut attempt = attempt();
        let err = attempt.advance(Phase::Submitted).unwrap_err();
        assert!(matches!(
            err,
            ControlError::InvalidStateTransition {
                from: "unregistered",
                to: "submitted"
            }
        ));

        attempt.advance(Phase::Imported).unwrap();
        attempt.advance(Phase::ActiveValidator).unwrap();
        assert!(attempt.advance(Phase::Failed).is_err());
    }

    #[test]
    fn fail_reports_last_phase() {
        let mut attempt = attempt();
        attempt.advance(Phase::Imported).unwrap();
        assert_eq!(attempt.fail(), Phase::Imported);
        assert_eq!(attempt.phase(), Phase::Failed);
        assert_eq!(attempt.trace().last(), Some(&Phase::Failed));
    }

    #[test]
    fn phase_roundtrips_through_strings() {
        for phase in [
            Phase::Unregistered,
            Phase::Imported,
            Phase::Submitted,
            Phase::Committed,
            Phase::Rejected,
            Phase::PendingValidator,
            Phase::ActiveValidator,
            Phase::Failed,
        ] {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
        assert!("bogus".parse::<Phase>().is_err());
    }

    #[test]
    fn stake_window_arithmetic() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let window = StakeWindow::starting_after(
            now,
            Duration::from_secs(180),
            Duration::from_secs(30 * 24 * 3600),
        );
        assert_eq!(window.start_unix(), 1_700_000_180);
        assert_eq!(window.end_unix(), 1_700_000_180 + 2_592_000);
    }
}
