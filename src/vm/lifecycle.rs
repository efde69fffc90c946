//! Graceful-then-forced domain teardown.
//!
//! ```text
//! graceful_then_forced(driver, name, policy)
//!     ├─► shutdown(name)
//!     ├─► info(name) every 0.5 s until down or `pause` elapses
//!     └─► destroy(name)          (only if still up)
//! ```

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use super::{DomainStatus, VmmDriver};

pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How a teardown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// The domain was not present to begin with.
    NotRunning,
    /// The guest shut down on its own after the request.
    Graceful,
    /// The guest was destroyed.
    Forced,
}

#[derive(Debug, Clone, Copy)]
pub struct ShutdownPolicy {
    /// Try `shutdown` before `destroy`.
    pub graceful: bool,
    /// How long to wait for a graceful shutdown.
    pub pause: Duration,
}

/// Stop `name`, escalating to `destroy` when the guest ignores `shutdown`.
pub async fn graceful_then_forced(
    driver: &dyn VmmDriver,
    name: &str,
    policy: ShutdownPolicy,
) -> Result<Teardown> {
    match driver.info(name).await? {
        Some(vm) if !vm.state.is_down() => {}
        _ => {
            debug!(vm = name, "domain not running, nothing to tear down");
            return Ok(Teardown::NotRunning);
        }
    }

    if policy.graceful {
        if driver.shutdown(name).await? == DomainStatus::NotFound {
            return Ok(Teardown::NotRunning);
        }
        info!(vm = name, pause = ?policy.pause, "shutdown requested, waiting");

        let deadline = tokio::time::Instant::now() + policy.pause;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            let down = driver.info(name).await?.is_none_or(|vm| vm.state.is_down());
            if down {
                info!(vm = name, "domain shut down gracefully");
                return Ok(Teardown::Graceful);
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(vm = name, pause = ?policy.pause, "domain ignored shutdown, destroying");
                break;
            }
        }
    }

    match driver.destroy(name).await? {
        DomainStatus::Done => {
            info!(vm = name, "domain destroyed");
            Ok(Teardown::Forced)
        }
        // Went away between the last poll and the destroy.
        DomainStatus::NotFound => Ok(Teardown::Graceful),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::request::{RunningVm, VmRunState, VmSpec};

    /// Domain that goes down after `polls_until_down` info calls following a
    /// shutdown request, or never when `None`.
    struct Stubborn {
        polls_until_down: Option<usize>,
        state: Mutex<(bool, usize, Vec<&'static str>)>,
    }

    impl Stubborn {
        fn new(polls_until_down: Option<usize>) -> Self {
            Self {
                polls_until_down,
                state: Mutex::new((true, 0, Vec::new())),
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.state.lock().unwrap().2.clone()
        }
    }

    #[async_trait]
    impl VmmDriver for Stubborn {
        fn name(&self) -> &'static str {
            "stub"
        }
        async fn create(&self, _spec: &VmSpec) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&self, _name: &str) -> Result<DomainStatus> {
            self.state.lock().unwrap().2.push("shutdown");
            Ok(DomainStatus::Done)
        }
        async fn destroy(&self, _name: &str) -> Result<DomainStatus> {
            let mut state = self.state.lock().unwrap();
            state.0 = false;
            state.2.push("destroy");
            Ok(DomainStatus::Done)
        }
        async fn reboot(&self, _name: &str) -> Result<DomainStatus> {
            Ok(DomainStatus::Done)
        }
        async fn pause(&self, _name: &str) -> Result<DomainStatus> {
            Ok(DomainStatus::Done)
        }
        async fn unpause(&self, _name: &str) -> Result<DomainStatus> {
            Ok(DomainStatus::Done)
        }
        async fn info(&self, name: &str) -> Result<Option<RunningVm>> {
            let mut state = self.state.lock().unwrap();
            if state.2.contains(&"shutdown") {
                state.1 += 1;
                if self.polls_until_down.is_some_and(|n| state.1 >= n) {
                    state.0 = false;
                }
            }
            Ok(state.0.then(|| RunningVm {
                handle: name.to_string(),
                vmm_id: Some(1),
                vmm_uuid: None,
                mem_mb: 128,
                vcpus: 1,
                cputime_secs: 0.0,
                state: VmRunState::Running,
            }))
        }
        async fn max_available_memory_mb(&self) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_shutdown_skips_destroy() {
        let driver = Stubborn::new(Some(2));
        let policy = ShutdownPolicy {
            graceful: true,
            pause: Duration::from_secs(20),
        };
        let outcome = graceful_then_forced(&driver, "vm1", policy).await.unwrap();
        assert_eq!(outcome, Teardown::Graceful);
        assert_eq!(driver.calls(), vec!["shutdown"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_guest_is_destroyed_after_pause() {
        let driver = Stubborn::new(None);
        let policy = ShutdownPolicy {
            graceful: true,
            pause: Duration::from_secs(3),
        };
        let started = tokio::time::Instant::now();
        let outcome = graceful_then_forced(&driver, "vm1", policy).await.unwrap();
        assert_eq!(outcome, Teardown::Forced);
        assert_eq!(driver.calls(), vec!["shutdown", "destroy"]);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn without_checkshutdown_destroys_immediately() {
        let driver = Stubborn::new(None);
        let policy = ShutdownPolicy {
            graceful: false,
            pause: Duration::from_secs(20),
        };
        let outcome = graceful_then_forced(&driver, "vm1", policy).await.unwrap();
        assert_eq!(outcome, Teardown::Forced);
        assert_eq!(driver.calls(), vec!["destroy"]);
    }

    #[tokio::test]
    async fn absent_domain_is_not_running() {
        let driver = Stubborn::new(None);
        driver.state.lock().unwrap().0 = false;
        let policy = ShutdownPolicy {
            graceful: true,
            pause: Duration::from_secs(1),
        };
        let outcome = graceful_then_forced(&driver, "vm1", policy).await.unwrap();
        assert_eq!(outcome, Teardown::NotRunning);
        assert!(driver.calls().is_empty());
    }
}
