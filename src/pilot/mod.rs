//! `workspace-pilot`: holds a time-boxed dom0 memory slot for a batch job.

pub mod config;
pub mod engine;
pub mod fanout;
pub mod listener;
pub mod notifier;
pub mod signals;
pub mod state;
pub mod xen_memory;

use std::sync::Arc;

use tracing::{info, warn};

pub use config::PilotConfig;
pub use engine::{EngineReport, EngineSettings, SlotReservationEngine};
pub use fanout::SharedListener;
pub use listener::{HandlerOutcome, KilledVm, SlotContext, StateChangeListener};
pub use signals::Interrupt;
pub use state::ReservationState;

use crate::exec::CommandRunner;
use crate::vm::xen::XenCliDriver;

/// The listeners enabled by `config`, dom0 memory first.
pub fn build_listeners(config: &PilotConfig) -> Vec<SharedListener> {
    let mut listeners: Vec<SharedListener> = Vec::new();

    if config.xen.enabled {
        let runner = CommandRunner::new(config.xen.sudo.clone(), config.xen.command_timeout());
        let xm = XenCliDriver::new(runner, config.xen.xm.clone(), "file".into());
        listeners.push(Arc::new(xen_memory::XenMemoryListener::new(
            xm,
            config.xen.dom0_min_mb,
            config.xen.dom0_max_mb,
        )));
    } else {
        warn!("xen memory adjustment is disabled");
    }

    if config.notify.is_configured() {
        let runner = CommandRunner::direct(config.pilot.listener_timeout());
        listeners.push(Arc::new(notifier::RemoteNotifier::new(
            runner,
            config.notify.clone(),
        )));
    }

    info!(
        listeners = ?listeners.iter().map(|l| l.name().to_string()).collect::<Vec<_>>(),
        "pilot listeners configured"
    );
    listeners
}

/// This host's name, as reported in notifications.
pub fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        warn!(error = %std::io::Error::last_os_error(), "gethostname failed");
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_follow_config() {
        let mut config = PilotConfig::default();
        assert_eq!(build_listeners(&config).len(), 1);

        config.xen.enabled = false;
        assert!(build_listeners(&config).is_empty());

        config.notify.http_url = Some("http://svc/pilot".into());
        let listeners = build_listeners(&config);
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].name(), "remote-notifier");
    }

    #[test]
    fn hostname_is_not_empty() {
        assert!(!local_hostname().is_empty());
    }
}
