//! Rollout state machine.
//!
//! A single pure function gates every transition. Callers never assign
//! `RolloutStatus` directly; they ask this function whether the move is
//! legal and apply whatever it returns.

use fleet_common::errors::{ApiError, ErrorCode};
use fleet_common::types::RolloutStatus;

/// Requested moves. Distinct from `RolloutStatus` itself: a transition is
/// an intent, a status is a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutTransition {
    Start,
    Pause,
    Resume,
    Cancel,
    CompleteAll,
    FailAll,
    RollbackAll,
}

/// Context the transition function needs beyond the current status: the
/// `(currentState, requestedTransition, observations)` shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionObservations {
    /// Operator's acknowledgement that the failure condition behind a
    /// `paused` rollout has been mitigated. Required to resume.
    pub failure_mitigation_acknowledged: bool,
}

/// Evaluate whether `transition` is legal from `current`, returning the
/// resulting status. Resuming from `paused` while already `running` (and
/// other same-state idempotent calls) succeed as no-ops; illegal moves
/// return `RolloutTransitionInvalid`.
pub fn apply_transition(
    current: RolloutStatus,
    transition: RolloutTransition,
    observations: TransitionObservations,
) -> Result<RolloutStatus, ApiError> {
    use RolloutStatus::*;
    use RolloutTransition::*;

    match (current, transition) {
        (Pending, Start) => Ok(Running),

        (Running, Pause) => Ok(Paused),
        (Paused, Pause) => Ok(Paused), // idempotent

        (Paused, Resume) => {
            if observations.failure_mitigation_acknowledged {
                Ok(Running)
            } else {
                Err(ApiError::new(
                    ErrorCode::RolloutTransitionInvalid,
                    "resume requires acknowledging the failure-rate mitigation",
                ))
            }
        }

        (Running, Cancel) | (Paused, Cancel) | (Pending, Cancel) => Ok(Cancelled),

        (Running, CompleteAll) => Ok(Completed),
        (Running, FailAll) | (Paused, FailAll) => Ok(Failed),

        (Running, RollbackAll) | (Paused, RollbackAll) => Ok(RolledBack),
        (RolledBack, RollbackAll) => Ok(RolledBack), // idempotent terminal

        (state, _) => Err(ApiError::new(
            ErrorCode::RolloutTransitionInvalid,
            format!("cannot apply {transition:?} from {state:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RolloutStatus::*;
    use RolloutTransition::*;

    #[test]
    fn pending_starts_into_running() {
        let result = apply_transition(Pending, Start, TransitionObservations::default());
        assert_eq!(result.unwrap(), Running);
    }

    #[test]
    fn running_pauses() {
        let result = apply_transition(Running, Pause, TransitionObservations::default());
        assert_eq!(result.unwrap(), Paused);
    }

    #[test]
    fn resume_without_acknowledgement_is_rejected() {
        let result = apply_transition(Paused, Resume, TransitionObservations::default());
        assert!(result.is_err());
    }

    #[test]
    fn resume_with_acknowledgement_succeeds() {
        let obs = TransitionObservations {
            failure_mitigation_acknowledged: true,
        };
        let result = apply_transition(Paused, Resume, obs);
        assert_eq!(result.unwrap(), Running);
    }

    #[test]
    fn cancel_is_allowed_from_any_non_terminal_state() {
        for state in [Pending, Running, Paused] {
            assert_eq!(
                apply_transition(state, Cancel, TransitionObservations::default()).unwrap(),
                Cancelled
            );
        }
    }

    #[test]
    fn cancel_from_terminal_state_is_rejected() {
        let result = apply_transition(Completed, Cancel, TransitionObservations::default());
        assert!(result.is_err());
    }

    #[test]
    fn rollback_all_from_rolled_back_is_idempotent() {
        let result = apply_transition(RolledBack, RollbackAll, TransitionObservations::default());
        assert_eq!(result.unwrap(), RolledBack);
    }

    #[test]
    fn pause_from_paused_is_idempotent() {
        let result = apply_transition(Paused, Pause, TransitionObservations::default());
        assert_eq!(result.unwrap(), Paused);
    }

    #[test]
    fn fail_all_requires_non_terminal_origin() {
        assert!(apply_transition(Running, FailAll, TransitionObservations::default()).is_ok());
        assert!(apply_transition(Cancelled, FailAll, TransitionObservations::default()).is_err());
    }
}
