//! Pluggable reactions to reservation state changes.
//!
//! Every handler has a no-op default, so a listener only implements the
//! transitions it cares about. Handlers that can reclaim memory by killing
//! guests report the victims in [`HandlerOutcome::killed`]; the engine routes
//! them to [`StateChangeListener::killed_vms_notification`], which returns no
//! outcome and therefore cannot report kills of its own.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Everything a listener knows about the slot being held.
#[derive(Debug, Clone)]
pub struct SlotContext {
    pub slot_id: Uuid,
    pub memory_mb: u64,
    pub duration: Duration,
    pub graceperiod: Duration,
    pub hostname: String,
    /// Overrides the configured notification URL.
    pub contact: Option<Url>,
    /// Advisory bound on how long one handler should take.
    pub listener_timeout: Duration,
    /// `--killnine` recovery rather than a normal reservation.
    pub kill_nine: bool,
}

impl SlotContext {
    /// `slotid+++hostname`, the identity used on the notification wire.
    pub fn wire_id(&self) -> String {
        format!("{}+++{}", self.slot_id, self.hostname)
    }
}

/// A guest destroyed to give memory back to dom0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KilledVm {
    pub name: String,
    pub vmm_id: Option<u32>,
    pub memory_mb: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub killed: Vec<KilledVm>,
}

impl HandlerOutcome {
    pub fn killed(killed: Vec<KilledVm>) -> Self {
        Self { killed }
    }
}

#[async_trait]
pub trait StateChangeListener: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluating(&self, _ctx: &SlotContext) -> Result<HandlerOutcome> {
        Ok(HandlerOutcome::default())
    }

    async fn reserving(&self, _ctx: &SlotContext) -> Result<HandlerOutcome> {
        Ok(HandlerOutcome::default())
    }

    async fn reserved(&self, _ctx: &SlotContext) -> Result<HandlerOutcome> {
        Ok(HandlerOutcome::default())
    }

    async fn early_unreserving(&self, _ctx: &SlotContext) -> Result<HandlerOutcome> {
        Ok(HandlerOutcome::default())
    }

    async fn unreserving(&self, _ctx: &SlotContext) -> Result<HandlerOutcome> {
        Ok(HandlerOutcome::default())
    }

    async fn unreserved(&self, _ctx: &SlotContext) -> Result<HandlerOutcome> {
        Ok(HandlerOutcome::default())
    }

    async fn error_evaluating(&self, _ctx: &SlotContext, _errors: &str) -> Result<()> {
        Ok(())
    }

    async fn error_reserving(&self, _ctx: &SlotContext, _errors: &str) -> Result<()> {
        Ok(())
    }

    async fn error_reserved(&self, _ctx: &SlotContext, _errors: &str) -> Result<()> {
        Ok(())
    }

    async fn error_early_unreserving(&self, _ctx: &SlotContext, _errors: &str) -> Result<()> {
        Ok(())
    }

    async fn error_unreserving(&self, _ctx: &SlotContext, _errors: &str) -> Result<()> {
        Ok(())
    }

    async fn killed_vms_notification(&self, _ctx: &SlotContext, _killed: &[KilledVm]) -> Result<()> {
        Ok(())
    }
}
