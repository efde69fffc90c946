//! Slot reservation engine.
//!
//! Drives one reservation through the slot state machine: reserve, hold
//! until the horizon or an interrupt, then unreserve. Every transition is
//! fanned out to the registered listeners. Killed-guest reports returned by
//! any handler are forwarded to all listeners through
//! `killed_vms_notification` before the engine moves on.

use std::sync::Arc;
use std::time::Duration;

use statig::prelude::*;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::fanout::{FanoutReport, Notification, SharedListener, fanout};
use super::listener::{KilledVm, SlotContext};
use super::signals::Interrupt;
use super::state::ReservationState;
use crate::error::{EXIT_OK, EXIT_UNEXPECTED};
use crate::state_machine::{SlotEvent, SlotMachine};

/// Exit status after a signal when teardown went cleanly.
pub const EXIT_SIGNAL_CLEAN: u8 = 5;
/// Exit status after a signal when teardown reported errors.
pub const EXIT_SIGNAL_ERRORS: u8 = 6;

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Share of the grace period granted to early-unreserve listeners.
    pub earlywaitratio: f64,
    pub evaluate: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            earlywaitratio: 0.5,
            evaluate: false,
        }
    }
}

/// What happened to one reservation.
#[derive(Debug, Clone, Default)]
pub struct EngineReport {
    /// Every state entered, in order, starting with `Begin`.
    pub history: Vec<ReservationState>,
    pub interrupt: Option<Interrupt>,
    /// Aggregated listener failures, one entry per failed phase.
    pub errors: Vec<String>,
    pub killed: Vec<KilledVm>,
}

impl EngineReport {
    pub fn final_state(&self) -> ReservationState {
        self.history.last().copied().unwrap_or(ReservationState::Begin)
    }

    pub fn succeeded(&self) -> bool {
        self.errors.is_empty() && self.final_state() == ReservationState::Unreserved
    }

    pub fn exit_code(&self) -> u8 {
        match (self.interrupt.is_some(), self.succeeded()) {
            (false, true) => EXIT_OK,
            (false, false) => EXIT_UNEXPECTED,
            (true, true) => EXIT_SIGNAL_CLEAN,
            (true, false) => EXIT_SIGNAL_ERRORS,
        }
    }
}

pub struct SlotReservationEngine {
    listeners: Vec<SharedListener>,
    settings: EngineSettings,
}

impl SlotReservationEngine {
    pub fn new(listeners: Vec<SharedListener>, settings: EngineSettings) -> Self {
        Self {
            listeners,
            settings,
        }
    }

    /// Wait granted to early-unreserve listeners.
    pub fn early_grace(&self, graceperiod: Duration) -> Duration {
        graceperiod.mul_f64(self.settings.earlywaitratio)
    }

    /// Hold a slot for `ctx.duration`, or until an interrupt arrives.
    pub async fn reserve(
        &self,
        ctx: SlotContext,
        interrupts: &mut mpsc::UnboundedReceiver<Interrupt>,
    ) -> EngineReport {
        let started = Instant::now();
        let mut run = Run::new(self, ctx);
        info!(
            slot = %run.ctx.slot_id,
            memory_mb = run.ctx.memory_mb,
            duration_secs = run.ctx.duration.as_secs_f64(),
            graceperiod_secs = run.ctx.graceperiod.as_secs_f64(),
            "reservation starting"
        );

        if self.settings.evaluate {
            run.step(SlotEvent::Evaluate);
            let outcome = run.phase(Notification::Evaluating).await;
            if !outcome.is_ok() {
                run.fail(outcome.errors).await;
                return run.finish();
            }
        }

        run.step(SlotEvent::Reserve);
        let outcome = run.phase(Notification::Reserving).await;
        if !outcome.is_ok() {
            run.fail(outcome.errors).await;
            return run.finish();
        }

        run.step(SlotEvent::Succeeded);
        let outcome = run.phase(Notification::Reserved).await;
        if !outcome.is_ok() {
            run.fail(outcome.errors).await;
            run.step(SlotEvent::Unreserve);
            run.unreserve().await;
            return run.finish();
        }

        let horizon = run.ctx.duration;
        let remaining = horizon.saturating_sub(started.elapsed());
        info!(
            setup_secs = started.elapsed().as_secs_f64(),
            hold_secs = remaining.as_secs_f64(),
            "slot reserved"
        );

        let interrupt = tokio::select! {
            _ = tokio::time::sleep(remaining) => None,
            Some(interrupt) = interrupts.recv() => Some(interrupt),
        };

        match interrupt {
            None => {
                run.step(SlotEvent::HorizonReached);
            }
            Some(interrupt) => {
                let elapsed = interrupt.received_at.saturating_duration_since(started);
                let early = elapsed < horizon;
                info!(
                    signal = interrupt.signal,
                    elapsed_secs = elapsed.as_secs_f64(),
                    horizon_secs = horizon.as_secs_f64(),
                    early,
                    "reservation interrupted"
                );
                run.report.interrupt = Some(interrupt);
                run.step(SlotEvent::Interrupted { early });
                if early {
                    run.early_unreserve().await;
                    run.step(SlotEvent::Unreserve);
                }
            }
        }

        run.unreserve().await;
        run.finish()
    }

    /// Recovery: return everything to dom0 without a prior reservation.
    pub async fn kill_nine(&self, mut ctx: SlotContext) -> EngineReport {
        ctx.kill_nine = true;
        let mut run = Run::new(self, ctx);
        warn!(slot = %run.ctx.slot_id, "killnine recovery starting");
        run.step(SlotEvent::Recover);
        run.unreserve().await;
        run.finish()
    }
}

/// One reservation in flight.
struct Run<'a> {
    engine: &'a SlotReservationEngine,
    sm: statig::blocking::StateMachine<SlotMachine>,
    ctx: Arc<SlotContext>,
    report: EngineReport,
}

impl<'a> Run<'a> {
    fn new(engine: &'a SlotReservationEngine, ctx: SlotContext) -> Self {
        let sm = SlotMachine::new(ctx.slot_id.to_string()).state_machine();
        let report = EngineReport {
            history: vec![SlotMachine::reservation_state(sm.state())],
            ..EngineReport::default()
        };
        Self {
            engine,
            sm,
            ctx: Arc::new(ctx),
            report,
        }
    }

    fn current(&self) -> ReservationState {
        SlotMachine::reservation_state(self.sm.state())
    }

    fn step(&mut self, event: SlotEvent) -> ReservationState {
        let from = self.current();
        self.sm.handle(&event);
        let to = self.current();
        if to != from {
            info!(slot = %self.ctx.slot_id, %from, %to, "reservation state changed");
            self.report.history.push(to);
        }
        to
    }

    /// Fan `notification` out and forward any killed guests.
    async fn phase(&mut self, notification: Notification) -> FanoutReport {
        let outcome = fanout(&self.engine.listeners, &self.ctx, &notification).await;
        if !outcome.killed.is_empty() {
            self.notify_killed(outcome.killed.clone()).await;
        }
        outcome
    }

    async fn notify_killed(&mut self, killed: Vec<KilledVm>) {
        warn!(count = killed.len(), "guests were killed, notifying listeners");
        self.report.killed.extend(killed.iter().cloned());
        let outcome = fanout(
            &self.engine.listeners,
            &self.ctx,
            &Notification::KilledVms(killed),
        )
        .await;
        if !outcome.is_ok() {
            error!(errors = %outcome.errors, "killed-guest notification failed");
        }
    }

    /// Enter the error state of the current phase and run its error handlers.
    async fn fail(&mut self, errors: String) {
        let state = self.step(SlotEvent::Failed);
        error!(%state, %errors, "listeners failed");
        self.report.errors.push(errors.clone());

        let handled = fanout(
            &self.engine.listeners,
            &self.ctx,
            &Notification::Error { state, errors },
        )
        .await;
        if !handled.is_ok() {
            warn!(%state, errors = %handled.errors, "error handlers failed");
        }
    }

    async fn early_unreserve(&mut self) {
        let grace = self.engine.early_grace(self.ctx.graceperiod);
        info!(grace_secs = grace.as_secs_f64(), "early unreserve, waiting for listeners");
        match tokio::time::timeout(grace, self.phase(Notification::EarlyUnreserving)).await {
            Ok(outcome) if outcome.is_ok() => {
                self.step(SlotEvent::Succeeded);
            }
            Ok(outcome) => self.fail(outcome.errors).await,
            Err(_) => {
                warn!(
                    grace_secs = grace.as_secs_f64(),
                    "listeners did not finish early unreserve in time, unreserving anyway"
                );
                self.step(SlotEvent::GraceExpired);
            }
        }
    }

    async fn unreserve(&mut self) {
        let outcome = self.phase(Notification::Unreserving).await;
        if !outcome.is_ok() {
            self.fail(outcome.errors).await;
            return;
        }
        self.step(SlotEvent::Succeeded);

        let outcome = self.phase(Notification::Unreserved).await;
        if !outcome.is_ok() {
            warn!(errors = %outcome.errors, "unreserved listeners failed");
            self.report.errors.push(outcome.errors);
        }
    }

    fn finish(self) -> EngineReport {
        info!(
            slot = %self.ctx.slot_id,
            state = %self.report.final_state(),
            errors = self.report.errors.len(),
            killed = self.report.killed.len(),
            "reservation finished"
        );
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(history: &[ReservationState], interrupted: bool, errors: bool) -> EngineReport {
        EngineReport {
            history: history.to_vec(),
            interrupt: interrupted.then(|| Interrupt::now("SIGTERM")),
            errors: if errors { vec!["x: failed".into()] } else { Vec::new() },
            killed: Vec::new(),
        }
    }

    #[tokio::test]
    async fn exit_codes_follow_outcome_and_interrupt() {
        use ReservationState::*;
        assert_eq!(report(&[Begin, Unreserved], false, false).exit_code(), 0);
        assert_eq!(report(&[Begin, ErrorReserving], false, true).exit_code(), 4);
        assert_eq!(report(&[Begin, Unreserved], true, false).exit_code(), 5);
        assert_eq!(report(&[Begin, Unreserved], true, true).exit_code(), 6);
        assert_eq!(report(&[Begin, ErrorUnreserving], true, true).exit_code(), 6);
    }

    #[test]
    fn grace_is_a_fraction_of_the_period() {
        let engine = SlotReservationEngine::new(
            Vec::new(),
            EngineSettings {
                earlywaitratio: 0.5,
                evaluate: false,
            },
        );
        assert_eq!(engine.early_grace(Duration::from_secs(1)), Duration::from_millis(500));
    }
}
