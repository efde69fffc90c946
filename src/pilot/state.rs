use std::fmt;

use serde::{Deserialize, Serialize};

/// Externally visible phase of a slot reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    Begin,
    Evaluating,
    Reserving,
    Reserved,
    Unreserving,
    Unreserved,
    EarlyUnreserving,
    EarlyUnreserved,
    ErrorEvaluating,
    ErrorReserving,
    ErrorReserved,
    ErrorUnreserving,
    ErrorEarlyUnreserving,
}

impl ReservationState {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ReservationState::ErrorEvaluating
                | ReservationState::ErrorReserving
                | ReservationState::ErrorReserved
                | ReservationState::ErrorUnreserving
                | ReservationState::ErrorEarlyUnreserving
        )
    }

    /// No further transition leaves this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReservationState::Unreserved
                | ReservationState::ErrorEvaluating
                | ReservationState::ErrorReserving
                | ReservationState::ErrorUnreserving
        )
    }

    /// Event name used on the notification wire.
    pub fn event_name(self) -> &'static str {
        match self {
            ReservationState::Begin => "begin",
            ReservationState::Evaluating => "evaluating",
            ReservationState::Reserving => "reserving",
            ReservationState::Reserved => "reserved",
            ReservationState::Unreserving => "unreserving",
            ReservationState::Unreserved => "unreserved",
            ReservationState::EarlyUnreserving => "earlyunreserving",
            ReservationState::EarlyUnreserved => "earlyunreserved",
            ReservationState::ErrorEvaluating => "error-evaluating",
            ReservationState::ErrorReserving => "error-reserving",
            ReservationState::ErrorReserved => "error-reserved",
            ReservationState::ErrorUnreserving => "error-unreserving",
            ReservationState::ErrorEarlyUnreserving => "error-earlyunreserving",
        }
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReservationState::Begin => "BEGIN",
            ReservationState::Evaluating => "EVALUATING",
            ReservationState::Reserving => "RESERVING",
            ReservationState::Reserved => "RESERVED",
            ReservationState::Unreserving => "UNRESERVING",
            ReservationState::Unreserved => "UNRESERVED",
            ReservationState::EarlyUnreserving => "EARLY_UNRESERVING",
            ReservationState::EarlyUnreserved => "EARLY_UNRESERVED",
            ReservationState::ErrorEvaluating => "ERROR_EVALUATING",
            ReservationState::ErrorReserving => "ERROR_RESERVING",
            ReservationState::ErrorReserved => "ERROR_RESERVED",
            ReservationState::ErrorUnreserving => "ERROR_UNRESERVING",
            ReservationState::ErrorEarlyUnreserving => "ERROR_EARLY_UNRESERVING",
        };
        f.write_str(name)
    }
}
