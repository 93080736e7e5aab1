//! The authoritative `LoopStatus` transition table.
//!
//! Every write to `state.status` anywhere in the crate goes through
//! [`assert_valid_transition`] — there is no other place a status may
//! legally change. Keeping the table centralised here (rather than letting
//! each caller decide what's reachable from where) is what makes "one
//! source of truth for what may happen next" actually enforceable instead
//! of just documented.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Idle,
    Draft,
    Planning,
    Starting,
    Running,
    Waiting,
    Completed,
    Stopped,
    Failed,
    MaxIterations,
    ResolvingConflicts,
    Merged,
    Pushed,
    Deleted,
}

impl LoopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopStatus::Idle => "idle",
            LoopStatus::Draft => "draft",
            LoopStatus::Planning => "planning",
            LoopStatus::Starting => "starting",
            LoopStatus::Running => "running",
            LoopStatus::Waiting => "waiting",
            LoopStatus::Completed => "completed",
            LoopStatus::Stopped => "stopped",
            LoopStatus::Failed => "failed",
            LoopStatus::MaxIterations => "max_iterations",
            LoopStatus::ResolvingConflicts => "resolving_conflicts",
            LoopStatus::Merged => "merged",
            LoopStatus::Pushed => "pushed",
            LoopStatus::Deleted => "deleted",
        }
    }

    /// `starting | running | planning | resolving_conflicts` — a loop in one
    /// of these occupies a worker slot and can't be started again.
    pub fn is_active(&self) -> bool {
        matches!(self, LoopStatus::Starting | LoopStatus::Running | LoopStatus::Planning | LoopStatus::ResolvingConflicts)
    }

    fn allowed_targets(&self) -> &'static [LoopStatus] {
        use LoopStatus::*;
        match self {
            Idle => &[Starting, Planning, Draft, Deleted],
            Draft => &[Idle, Planning, Deleted],
            Planning => &[Running, Stopped, Failed, Deleted],
            Starting => &[Running, Failed, Stopped, Deleted],
            Running => &[Completed, Stopped, Failed, MaxIterations, Deleted],
            Waiting => &[Running, Completed, Stopped, Failed, MaxIterations, Deleted],
            Completed => &[Merged, Pushed, Deleted, ResolvingConflicts, Idle, Stopped, Planning],
            Stopped => &[Starting, Planning, Deleted, Stopped],
            Failed => &[Deleted, Stopped, Planning],
            MaxIterations => &[Merged, Pushed, Deleted, ResolvingConflicts, Stopped, Planning],
            ResolvingConflicts => &[Starting, Stopped, Failed, Pushed, Completed, MaxIterations, Deleted],
            Merged => &[Deleted, Idle],
            Pushed => &[Deleted, Idle, ResolvingConflicts],
            Deleted => &[],
        }
    }

    pub fn can_transition_to(&self, target: LoopStatus) -> bool {
        self.allowed_targets().contains(&target)
    }
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: LoopStatus, to: LoopStatus },
}

/// Rejects any `(from, to)` pair not present in the transition table.
/// Callers treat this as a programmer bug, not a recoverable condition —
/// the engine refuses the mutation and propagates the error up rather than
/// silently clamping to a valid state.
pub fn assert_valid_transition(from: LoopStatus, to: LoopStatus) -> Result<(), StateMachineError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StateMachineError::InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LoopStatus::*;

    #[test]
    fn idle_can_start() {
        assert!(assert_valid_transition(Idle, Starting).is_ok());
    }

    #[test]
    fn deleted_is_terminal() {
        assert!(Deleted.allowed_targets().is_empty());
        assert!(assert_valid_transition(Deleted, Idle).is_err());
    }

    #[test]
    fn running_cannot_jump_to_merged() {
        assert!(assert_valid_transition(Running, Merged).is_err());
    }

    #[test]
    fn completed_can_reach_resolving_conflicts() {
        assert!(assert_valid_transition(Completed, ResolvingConflicts).is_ok());
    }

    #[test]
    fn stopped_allows_self_loop() {
        assert!(assert_valid_transition(Stopped, Stopped).is_ok());
    }

    #[test]
    fn is_active_matches_spec_set() {
        assert!(Starting.is_active());
        assert!(Running.is_active());
        assert!(Planning.is_active());
        assert!(ResolvingConflicts.is_active());
        assert!(!Idle.is_active());
        assert!(!Waiting.is_active());
        assert!(!Completed.is_active());
    }

    #[test]
    fn every_status_reachable_or_justified_terminal() {
        for status in [
            Idle, Draft, Planning, Starting, Running, Waiting, Completed, Stopped, Failed, MaxIterations,
            ResolvingConflicts, Merged, Pushed, Deleted,
        ] {
            let _ = status.allowed_targets();
        }
    }
}
