//! Parallel delivery of one notification to every listener.
//!
//! Each listener runs in its own tokio task; all tasks are joined before the
//! report is returned. A failing or panicking listener never stops its
//! siblings.

use std::sync::Arc;

use anyhow::Result;
use futures_util::future::join_all;
use tracing::{debug, error, warn};

use super::listener::{HandlerOutcome, KilledVm, SlotContext, StateChangeListener};
use super::state::ReservationState;

pub type SharedListener = Arc<dyn StateChangeListener>;

/// Which handler to invoke.
#[derive(Debug, Clone)]
pub enum Notification {
    Evaluating,
    Reserving,
    Reserved,
    EarlyUnreserving,
    Unreserving,
    Unreserved,
    /// The error handler of `state` with the aggregated failure text.
    Error {
        state: ReservationState,
        errors: String,
    },
    KilledVms(Vec<KilledVm>),
}

impl Notification {
    pub fn label(&self) -> &'static str {
        match self {
            Notification::Evaluating => "evaluating",
            Notification::Reserving => "reserving",
            Notification::Reserved => "reserved",
            Notification::EarlyUnreserving => "early_unreserving",
            Notification::Unreserving => "unreserving",
            Notification::Unreserved => "unreserved",
            Notification::Error { .. } => "error",
            Notification::KilledVms(_) => "killed_vms_notification",
        }
    }

    async fn deliver(
        &self,
        listener: &dyn StateChangeListener,
        ctx: &SlotContext,
    ) -> Result<HandlerOutcome> {
        match self {
            Notification::Evaluating => listener.evaluating(ctx).await,
            Notification::Reserving => listener.reserving(ctx).await,
            Notification::Reserved => listener.reserved(ctx).await,
            Notification::EarlyUnreserving => listener.early_unreserving(ctx).await,
            Notification::Unreserving => listener.unreserving(ctx).await,
            Notification::Unreserved => listener.unreserved(ctx).await,
            Notification::Error { state, errors } => {
                match state {
                    ReservationState::ErrorEvaluating => listener.error_evaluating(ctx, errors).await,
                    ReservationState::ErrorReserving => listener.error_reserving(ctx, errors).await,
                    ReservationState::ErrorReserved => listener.error_reserved(ctx, errors).await,
                    ReservationState::ErrorEarlyUnreserving => {
                        listener.error_early_unreserving(ctx, errors).await
                    }
                    ReservationState::ErrorUnreserving => {
                        listener.error_unreserving(ctx, errors).await
                    }
                    other => anyhow::bail!("{other} has no error handler"),
                }?;
                Ok(HandlerOutcome::default())
            }
            Notification::KilledVms(killed) => {
                listener.killed_vms_notification(ctx, killed).await?;
                Ok(HandlerOutcome::default())
            }
        }
    }
}

/// Aggregated result of one fanout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Empty when every listener succeeded, else each failure on its own line.
    pub errors: String,
    pub killed: Vec<KilledVm>,
}

impl FanoutReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Deliver `notification` to every listener concurrently and wait for all.
pub async fn fanout(
    listeners: &[SharedListener],
    ctx: &Arc<SlotContext>,
    notification: &Notification,
) -> FanoutReport {
    let handles: Vec<_> = listeners
        .iter()
        .map(|listener| {
            let listener = Arc::clone(listener);
            let ctx = Arc::clone(ctx);
            let notification = notification.clone();
            tokio::spawn(async move {
                let result = notification.deliver(listener.as_ref(), &ctx).await;
                (listener.name().to_string(), result)
            })
        })
        .collect();

    let names: Vec<String> = listeners.iter().map(|l| l.name().to_string()).collect();
    let mut failures = Vec::new();
    let mut killed = Vec::new();

    for (i, joined) in join_all(handles).await.into_iter().enumerate() {
        match joined {
            Ok((name, Ok(outcome))) => {
                debug!(listener = %name, handler = notification.label(), "listener finished");
                killed.extend(outcome.killed);
            }
            Ok((name, Err(e))) => {
                warn!(listener = %name, handler = notification.label(), error = %format!("{e:#}"), "listener failed");
                failures.push(format!("{name}: {e:#}"));
            }
            Err(join_err) => {
                let name = names.get(i).map(String::as_str).unwrap_or("?");
                error!(listener = name, handler = notification.label(), error = %join_err, "listener task panicked");
                failures.push(format!("{name}: listener task panicked: {join_err}"));
            }
        }
    }

    FanoutReport {
        errors: failures.join("\n"),
        killed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    fn ctx() -> Arc<SlotContext> {
        Arc::new(SlotContext {
            slot_id: Uuid::nil(),
            memory_mb: 128,
            duration: Duration::from_secs(2),
            graceperiod: Duration::from_secs(1),
            hostname: "node1".into(),
            contact: None,
            listener_timeout: Duration::from_secs(5),
            kill_nine: false,
        })
    }

    struct Recorder(Mutex<Vec<&'static str>>);

    #[async_trait]
    impl StateChangeListener for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        async fn reserving(&self, _ctx: &SlotContext) -> Result<HandlerOutcome> {
            self.0.lock().unwrap().push("reserving");
            Ok(HandlerOutcome::default())
        }
        async fn killed_vms_notification(&self, _ctx: &SlotContext, killed: &[KilledVm]) -> Result<()> {
            assert_eq!(killed.len(), 1);
            self.0.lock().unwrap().push("killed");
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl StateChangeListener for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        async fn reserving(&self, _ctx: &SlotContext) -> Result<HandlerOutcome> {
            anyhow::bail!("no memory")
        }
    }

    struct Panicking;

    #[async_trait]
    impl StateChangeListener for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }
        async fn reserving(&self, _ctx: &SlotContext) -> Result<HandlerOutcome> {
            panic!("listener bug")
        }
    }

    struct Killer;

    #[async_trait]
    impl StateChangeListener for Killer {
        fn name(&self) -> &str {
            "killer"
        }
        async fn unreserving(&self, _ctx: &SlotContext) -> Result<HandlerOutcome> {
            Ok(HandlerOutcome::killed(vec![KilledVm {
                name: "guest".into(),
                vmm_id: Some(4),
                memory_mb: 256,
            }]))
        }
    }

    #[tokio::test]
    async fn all_succeed_gives_empty_errors() {
        let ok = Arc::new(Recorder(Mutex::new(Vec::new())));
        let listeners: Vec<SharedListener> = vec![ok.clone(), ok.clone()];
        let report = fanout(&listeners, &ctx(), &Notification::Reserving).await;
        assert!(report.is_ok());
        assert_eq!(ok.0.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failures_are_isolated_and_concatenated() {
        let ok = Arc::new(Recorder(Mutex::new(Vec::new())));
        let listeners: Vec<SharedListener> = vec![
            Arc::new(Failing),
            ok.clone(),
            Arc::new(Panicking),
        ];
        let report = fanout(&listeners, &ctx(), &Notification::Reserving).await;
        assert!(report.errors.contains("failing: no memory"));
        assert!(report.errors.contains("panicking: listener task panicked"));
        assert_eq!(report.errors.lines().count(), 2);
        assert_eq!(*ok.0.lock().unwrap(), vec!["reserving"]);
    }

    #[tokio::test]
    async fn killed_vms_are_collected_not_errors() {
        let ok = Arc::new(Recorder(Mutex::new(Vec::new())));
        let listeners: Vec<SharedListener> = vec![Arc::new(Killer), ok.clone()];
        let report = fanout(&listeners, &ctx(), &Notification::Unreserving).await;
        assert!(report.is_ok());
        assert_eq!(report.killed.len(), 1);

        let report = fanout(&listeners, &ctx(), &Notification::KilledVms(report.killed)).await;
        assert!(report.is_ok());
        assert!(report.killed.is_empty());
        assert_eq!(*ok.0.lock().unwrap(), vec!["killed"]);
    }
}
