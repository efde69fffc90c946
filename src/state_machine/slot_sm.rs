//! Slot reservation state machine.
//!
//! ```text
//! Begin ─→ [Evaluating] ─→ Reserving ─→ Reserved ─┬─ horizon / late signal ─→ Unreserving ─→ Unreserved
//!                                                  └─ early signal ─→ EarlyUnreserving ─→ EarlyUnreserved ─┘
//! ```
//!
//! Every non-terminal state has an error counterpart. The error states of
//! `Reserved` and `EarlyUnreserving` still lead to `Unreserving` so the held
//! resources are always returned. All states sit under the `pilot`
//! superstate, which logs and swallows events a state does not expect.

use statig::prelude::*;
use tracing::warn;

use crate::pilot::state::ReservationState;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events dispatched by the reservation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotEvent {
    /// Start the optional evaluation phase.
    Evaluate,
    /// Start reserving.
    Reserve,
    /// `--killnine`: skip straight to unreserving.
    Recover,
    /// Every listener handled the current phase.
    Succeeded,
    /// At least one listener failed the current phase.
    Failed,
    /// The reservation ran for its full duration.
    HorizonReached,
    /// A termination signal arrived. `early` when it came before the horizon.
    Interrupted { early: bool },
    /// The early-unreserve grace window ran out before listeners finished.
    GraceExpired,
    /// Give the slot back.
    Unreserve,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

/// Shared storage for the slot state machine.
#[derive(Debug, Default)]
pub struct SlotMachine {
    /// Slot identifier, for log lines only.
    pub slot_id: String,
    /// Events no state accepted.
    pub ignored: u32,
}

impl SlotMachine {
    pub fn new(slot_id: impl Into<String>) -> Self {
        Self {
            slot_id: slot_id.into(),
            ignored: 0,
        }
    }

    /// The externally visible state for `state`.
    pub fn reservation_state(state: &State) -> ReservationState {
        match state {
            State::Begin {} => ReservationState::Begin,
            State::Evaluating {} => ReservationState::Evaluating,
            State::Reserving {} => ReservationState::Reserving,
            State::Reserved {} => ReservationState::Reserved,
            State::EarlyUnreserving {} => ReservationState::EarlyUnreserving,
            State::EarlyUnreserved {} => ReservationState::EarlyUnreserved,
            State::Unreserving {} => ReservationState::Unreserving,
            State::Unreserved {} => ReservationState::Unreserved,
            State::ErrorEvaluating {} => ReservationState::ErrorEvaluating,
            State::ErrorReserving {} => ReservationState::ErrorReserving,
            State::ErrorReserved {} => ReservationState::ErrorReserved,
            State::ErrorEarlyUnreserving {} => ReservationState::ErrorEarlyUnreserving,
            State::ErrorUnreserving {} => ReservationState::ErrorUnreserving,
        }
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::begin()",
    state(derive(Debug, Clone, PartialEq))
)]
impl SlotMachine {
    #[state(superstate = "pilot")]
    fn begin(&mut self, event: &SlotEvent) -> Outcome<State> {
        match event {
            SlotEvent::Evaluate => Transition(State::evaluating()),
            SlotEvent::Reserve => Transition(State::reserving()),
            SlotEvent::Recover => Transition(State::unreserving()),
            _ => Super,
        }
    }

    #[state(superstate = "pilot")]
    fn evaluating(&mut self, event: &SlotEvent) -> Outcome<State> {
        match event {
            SlotEvent::Reserve | SlotEvent::Succeeded => Transition(State::reserving()),
            SlotEvent::Failed => Transition(State::error_evaluating()),
            _ => Super,
        }
    }

    #[state(superstate = "pilot")]
    fn reserving(&mut self, event: &SlotEvent) -> Outcome<State> {
        match event {
            SlotEvent::Succeeded => Transition(State::reserved()),
            SlotEvent::Failed => Transition(State::error_reserving()),
            _ => Super,
        }
    }

    /// Holding the slot until the horizon or a signal.
    #[state(superstate = "pilot")]
    fn reserved(&mut self, event: &SlotEvent) -> Outcome<State> {
        match event {
            SlotEvent::HorizonReached | SlotEvent::Interrupted { early: false } => {
                Transition(State::unreserving())
            }
            SlotEvent::Interrupted { early: true } => Transition(State::early_unreserving()),
            SlotEvent::Failed => Transition(State::error_reserved()),
            _ => Super,
        }
    }

    /// Listeners get a bounded window to tear down cooperatively.
    #[state(superstate = "pilot")]
    fn early_unreserving(&mut self, event: &SlotEvent) -> Outcome<State> {
        match event {
            SlotEvent::Succeeded | SlotEvent::GraceExpired => Transition(State::early_unreserved()),
            SlotEvent::Failed => Transition(State::error_early_unreserving()),
            _ => Super,
        }
    }

    #[state(superstate = "pilot")]
    fn early_unreserved(&mut self, event: &SlotEvent) -> Outcome<State> {
        match event {
            SlotEvent::Unreserve => Transition(State::unreserving()),
            _ => Super,
        }
    }

    #[state(superstate = "pilot")]
    fn unreserving(&mut self, event: &SlotEvent) -> Outcome<State> {
        match event {
            SlotEvent::Succeeded => Transition(State::unreserved()),
            SlotEvent::Failed => Transition(State::error_unreserving()),
            _ => Super,
        }
    }

    #[state(superstate = "pilot")]
    fn unreserved(&mut self, event: &SlotEvent) -> Outcome<State> {
        let _ = event;
        Super
    }

    #[state(superstate = "pilot")]
    fn error_evaluating(&mut self, event: &SlotEvent) -> Outcome<State> {
        let _ = event;
        Super
    }

    #[state(superstate = "pilot")]
    fn error_reserving(&mut self, event: &SlotEvent) -> Outcome<State> {
        let _ = event;
        Super
    }

    #[state(superstate = "pilot")]
    fn error_reserved(&mut self, event: &SlotEvent) -> Outcome<State> {
        match event {
            SlotEvent::Unreserve => Transition(State::unreserving()),
            _ => Super,
        }
    }

    #[state(superstate = "pilot")]
    fn error_early_unreserving(&mut self, event: &SlotEvent) -> Outcome<State> {
        match event {
            SlotEvent::Unreserve => Transition(State::unreserving()),
            _ => Super,
        }
    }

    #[state(superstate = "pilot")]
    fn error_unreserving(&mut self, event: &SlotEvent) -> Outcome<State> {
        let _ = event;
        Super
    }

    #[superstate]
    fn pilot(&mut self, event: &SlotEvent) -> Outcome<State> {
        self.ignored += 1;
        warn!(slot = %self.slot_id, ?event, "event ignored in current reservation state");
        Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(events: &[SlotEvent]) -> Vec<ReservationState> {
        let mut sm = SlotMachine::new("test").state_machine();
        let mut seen = vec![SlotMachine::reservation_state(sm.state())];
        for event in events {
            sm.handle(event);
            let state = SlotMachine::reservation_state(sm.state());
            if seen.last() != Some(&state) {
                seen.push(state);
            }
        }
        seen
    }

    #[test]
    fn full_duration_path() {
        use ReservationState::*;
        let seen = drive(&[
            SlotEvent::Reserve,
            SlotEvent::Succeeded,
            SlotEvent::HorizonReached,
            SlotEvent::Succeeded,
        ]);
        assert_eq!(seen, vec![Begin, Reserving, Reserved, Unreserving, Unreserved]);
    }

    #[test]
    fn evaluation_precedes_reserving() {
        use ReservationState::*;
        let seen = drive(&[SlotEvent::Evaluate, SlotEvent::Succeeded, SlotEvent::Succeeded]);
        assert_eq!(seen, vec![Begin, Evaluating, Reserving, Reserved]);

        let seen = drive(&[SlotEvent::Evaluate, SlotEvent::Failed, SlotEvent::Reserve]);
        assert_eq!(seen, vec![Begin, Evaluating, ErrorEvaluating]);
    }

    #[test]
    fn early_signal_takes_the_grace_path() {
        use ReservationState::*;
        let seen = drive(&[
            SlotEvent::Reserve,
            SlotEvent::Succeeded,
            SlotEvent::Interrupted { early: true },
            SlotEvent::GraceExpired,
            SlotEvent::Unreserve,
            SlotEvent::Succeeded,
        ]);
        assert_eq!(
            seen,
            vec![
                Begin,
                Reserving,
                Reserved,
                EarlyUnreserving,
                EarlyUnreserved,
                Unreserving,
                Unreserved
            ]
        );
    }

    #[test]
    fn late_signal_unreserves_directly() {
        use ReservationState::*;
        let seen = drive(&[
            SlotEvent::Reserve,
            SlotEvent::Succeeded,
            SlotEvent::Interrupted { early: false },
        ]);
        assert_eq!(seen, vec![Begin, Reserving, Reserved, Unreserving]);
    }

    #[test]
    fn failures_route_to_error_states() {
        use ReservationState::*;
        assert_eq!(
            drive(&[SlotEvent::Reserve, SlotEvent::Failed]),
            vec![Begin, Reserving, ErrorReserving]
        );
        assert_eq!(
            drive(&[
                SlotEvent::Reserve,
                SlotEvent::Succeeded,
                SlotEvent::Interrupted { early: true },
                SlotEvent::Failed,
                SlotEvent::Unreserve,
                SlotEvent::Failed,
            ]),
            vec![
                Begin,
                Reserving,
                Reserved,
                EarlyUnreserving,
                ErrorEarlyUnreserving,
                Unreserving,
                ErrorUnreserving
            ]
        );
    }

    #[test]
    fn unexpected_events_are_ignored() {
        let mut sm = SlotMachine::new("test").state_machine();
        sm.handle(&SlotEvent::HorizonReached);
        sm.handle(&SlotEvent::Unreserve);
        assert_eq!(SlotMachine::reservation_state(sm.state()), ReservationState::Begin);
        assert_eq!(sm.ignored, 2);
    }

    #[test]
    fn recovery_goes_straight_to_unreserving() {
        use ReservationState::*;
        assert_eq!(
            drive(&[SlotEvent::Recover, SlotEvent::Succeeded]),
            vec![Begin, Unreserving, Unreserved]
        );
    }
}
