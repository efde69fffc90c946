//! SIGTERM/SIGINT handling for the pilot.
//!
//! The signal task only records which signal arrived and when, then hands an
//! [`Interrupt`] to the engine over a channel. Only the first signal is
//! forwarded; later ones are logged and ignored while teardown runs.

use std::io;

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupt {
    pub signal: &'static str,
    pub received_at: Instant,
}

impl Interrupt {
    pub fn now(signal: &'static str) -> Self {
        Self {
            signal,
            received_at: Instant::now(),
        }
    }
}

/// Install the handlers and return the receiving end of the interrupt channel.
pub fn forward_termination_signals() -> io::Result<mpsc::UnboundedReceiver<Interrupt>> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut forwarded = false;
        loop {
            let name = tokio::select! {
                Some(()) = term.recv() => "SIGTERM",
                Some(()) = int.recv() => "SIGINT",
                else => break,
            };
            if forwarded {
                warn!(signal = name, "signal ignored, teardown already in progress");
                continue;
            }
            info!(signal = name, "termination signal received");
            forwarded = true;
            if tx.send(Interrupt::now(name)).is_err() {
                warn!(signal = name, "engine is gone, signal dropped");
            }
        }
    });

    Ok(rx)
}
