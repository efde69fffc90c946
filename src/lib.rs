//! nimbus-workspace: VM lifecycle control and dom0 slot reservation for
//! Nimbus workspace nodes.
//!
//! Two binaries share this library:
//! - `workspace-control` creates, removes and controls one VM per invocation
//!   ([`controller::LifecycleController`]).
//! - `workspace-pilot` holds a time-boxed dom0 memory slot for a batch job
//!   ([`pilot::SlotReservationEngine`]).

pub mod config;
pub mod controller;
pub mod dhcp;
pub mod error;
pub mod exec;
pub mod lease;
pub mod logging;
pub mod mount;
pub mod paths;
pub mod persistence;
pub mod pilot;
pub mod request;
pub mod state_machine;
pub mod validate;
pub mod vm;
