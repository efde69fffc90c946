//! `statig` state machines.

pub mod slot_sm;

pub use slot_sm::{SlotEvent, SlotMachine};
