//! The work chunk state machine, as one explicit table.
//!
//! Every status change the engine performs is looked up here first. Call sites
//! never encode their own rules: if a `(from, event)` pair is absent from
//! [`TRANSITIONS`] the change is illegal.
//!
//! ```text
//!              dispatch          dequeue              success
//!   READY ───────────────▶ QUEUED ───────▶ IN_PROGRESS ─────────▶ COMPLETED
//!    ▲  ▲                    │                │   │  │
//!    │  └──── gate advance ──┘     poll req.  │   │  └─ recoverable ──▶ ERRORED
//!    │                                        ▼   └─ unrecoverable ─▶ FAILED
//!    ├──── deadline expired ─────────── POLL_WAITING ── unrecoverable ──┘
//!    │
//!    └──── gate advance ─── GATE_WAITING
//! ```

use serde::{Deserialize, Serialize};

use crate::chunk::WorkChunkStatus;
use crate::error::{DomainError, DomainResult};

/// Something that happens to a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkEvent {
    /// The dispatcher hands the chunk to the message channel.
    Dispatch,
    /// A worker claims a queued chunk.
    Dequeue,
    /// The worker asks to be woken later.
    PollRequested,
    /// Maintenance observed `next_poll_time <= now`.
    PollDeadlineExpired,
    /// The worker finished the chunk.
    Succeeded,
    /// The worker hit an error that an external retry may fix.
    RecoverableError,
    /// The worker (or an operator) gave up on the chunk.
    UnrecoverableError,
    /// The job's gate moved to this chunk's step.
    GateAdvanced,
    /// The work notification for a queued chunk could not be published.
    DispatchAborted,
}

/// One row of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: WorkChunkStatus,
    pub event: ChunkEvent,
    pub to: WorkChunkStatus,
}

const fn row(from: WorkChunkStatus, event: ChunkEvent, to: WorkChunkStatus) -> Transition {
    Transition { from, event, to }
}

use ChunkEvent as E;
use WorkChunkStatus as S;

/// All legal chunk transitions. Creation is not a transition: see
/// [`WorkChunkStatus::initial`].
pub const TRANSITIONS: &[Transition] = &[
    row(S::Ready, E::Dispatch, S::Queued),
    row(S::Queued, E::Dequeue, S::InProgress),
    row(S::InProgress, E::PollRequested, S::PollWaiting),
    row(S::PollWaiting, E::PollDeadlineExpired, S::Ready),
    row(S::InProgress, E::Succeeded, S::Completed),
    row(S::InProgress, E::UnrecoverableError, S::Failed),
    row(S::PollWaiting, E::UnrecoverableError, S::Failed),
    row(S::InProgress, E::RecoverableError, S::Errored),
    row(S::GateWaiting, E::GateAdvanced, S::Ready),
    // Queue entries that predate the gate are re-validated through dispatch.
    row(S::Queued, E::GateAdvanced, S::Ready),
    row(S::Queued, E::DispatchAborted, S::Ready),
];

impl ChunkEvent {
    /// Target status for `event` applied to a chunk in `from`.
    pub fn apply(self, from: WorkChunkStatus) -> DomainResult<WorkChunkStatus> {
        TRANSITIONS
            .iter()
            .find(|t| t.from == from && t.event == self)
            .map(|t| t.to)
            .ok_or_else(|| DomainError::illegal_transition(from, self))
    }

    /// Statuses from which this event is legal, in table order.
    pub fn sources(self) -> Vec<WorkChunkStatus> {
        TRANSITIONS
            .iter()
            .filter(|t| t.event == self)
            .map(|t| t.from)
            .collect()
    }
}

/// Whether any event moves a chunk from `from` to `to`.
pub fn is_allowed(from: WorkChunkStatus, to: WorkChunkStatus) -> bool {
    TRANSITIONS.iter().any(|t| t.from == from && t.to == to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_event_has_exactly_one_target() {
        let events = [
            E::Dispatch,
            E::Dequeue,
            E::PollRequested,
            E::PollDeadlineExpired,
            E::Succeeded,
            E::RecoverableError,
            E::UnrecoverableError,
            E::GateAdvanced,
            E::DispatchAborted,
        ];
        for event in events {
            let targets: std::collections::HashSet<_> = TRANSITIONS
                .iter()
                .filter(|t| t.event == event)
                .map(|t| t.to)
                .collect();
            assert_eq!(targets.len(), 1, "{event:?} has targets {targets:?}");
            let target = targets.into_iter().next();
            for from in event.sources() {
                assert_eq!(event.apply(from).ok(), target, "{event:?} from {from}");
            }
        }
    }

    #[test]
    fn gate_advance_releases_waiting_and_queued_chunks() {
        assert_eq!(E::GateAdvanced.sources(), vec![S::GateWaiting, S::Queued]);
        assert_eq!(E::GateAdvanced.apply(S::Queued).unwrap(), S::Ready);
        assert!(E::GateAdvanced.apply(S::InProgress).is_err());
    }

    #[test]
    fn unrecoverable_error_applies_to_running_and_poll_waiting_chunks() {
        assert_eq!(E::UnrecoverableError.sources(), vec![S::InProgress, S::PollWaiting]);
    }

    #[test]
    fn illegal_pair_reports_status_and_event() {
        let err = E::Dequeue.apply(S::Ready).unwrap_err();
        assert_eq!(
            err,
            DomainError::IllegalTransition {
                from: S::Ready,
                event: E::Dequeue
            }
        );
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn any_status() -> impl Strategy<Value = WorkChunkStatus> {
            prop::sample::select(WorkChunkStatus::ALL.to_vec())
        }

        fn any_event() -> impl Strategy<Value = ChunkEvent> {
            prop::sample::select(vec![
                E::Dispatch,
                E::Dequeue,
                E::PollRequested,
                E::PollDeadlineExpired,
                E::Succeeded,
                E::RecoverableError,
                E::UnrecoverableError,
                E::GateAdvanced,
                E::DispatchAborted,
            ])
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 512,
                ..ProptestConfig::default()
            })]

            /// Property: terminal chunks never move.
            #[test]
            fn terminal_statuses_are_absorbing(status in any_status(), event in any_event()) {
                if status.is_terminal() {
                    prop_assert!(event.apply(status).is_err());
                }
            }

            /// Property: nothing ever transitions back into GATE_WAITING.
            #[test]
            fn gate_waiting_is_only_an_initial_status(status in any_status(), event in any_event()) {
                if let Ok(to) = event.apply(status) {
                    prop_assert_ne!(to, S::GateWaiting);
                    prop_assert!(is_allowed(status, to));
                }
            }

            /// Property: only maintenance (deadline expiry) or failure leaves POLL_WAITING.
            #[test]
            fn poll_waiting_exits_are_bounded(event in any_event()) {
                if let Ok(to) = event.apply(S::PollWaiting) {
                    prop_assert!(matches!(to, S::Ready | S::Failed));
                }
            }

            /// Property: a random walk through the table never reaches an illegal pair.
            #[test]
            fn random_walks_stay_inside_the_table(events in prop::collection::vec(any_event(), 0..32)) {
                let mut status = S::Ready;
                for event in events {
                    if let Ok(next) = event.apply(status) {
                        prop_assert!(is_allowed(status, next));
                        status = next;
                    }
                }
            }
        }
    }
}
