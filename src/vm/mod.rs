//! Hypervisor access.
//!
//! [`VmmDriver`] is the capability surface the lifecycle controller needs.
//! Two adapters implement it by shelling out to the hypervisor CLI:
//! [`xen::XenCliDriver`] (`xm`) and [`libvirt::LibvirtDriver`] (`virsh` with a
//! generated XML descriptor). The adapter is picked from `[vmm] driver`.

use async_trait::async_trait;

use crate::config::{DriverKind, VmmConfig};
use crate::exec::CommandRunner;
use crate::request::{RunningVm, VmSpec};

pub mod filesystem;
pub mod libvirt;
pub mod lifecycle;
pub mod propagation;
pub mod xen;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Result of a per-domain control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainStatus {
    Done,
    /// The hypervisor does not know the domain.
    NotFound,
}

#[async_trait]
pub trait VmmDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Boot a domain for `spec`. Fails unless the hypervisor confirms it started.
    async fn create(&self, spec: &VmSpec) -> anyhow::Result<()>;

    /// Ask the guest to shut down; returns without waiting.
    async fn shutdown(&self, name: &str) -> anyhow::Result<DomainStatus>;

    async fn destroy(&self, name: &str) -> anyhow::Result<DomainStatus>;

    async fn reboot(&self, name: &str) -> anyhow::Result<DomainStatus>;

    async fn pause(&self, name: &str) -> anyhow::Result<DomainStatus>;

    async fn unpause(&self, name: &str) -> anyhow::Result<DomainStatus>;

    /// `None` when the domain is absent or reports no state.
    async fn info(&self, name: &str) -> anyhow::Result<Option<RunningVm>>;

    /// Memory the hypervisor could give a new guest right now.
    async fn max_available_memory_mb(&self) -> anyhow::Result<u64>;
}

/// Build the adapter selected by `config.driver`.
pub fn build_driver(config: &VmmConfig) -> Box<dyn VmmDriver> {
    let runner = CommandRunner::new(
        config.sudo.clone(),
        std::time::Duration::from_secs(config.command_timeout_secs),
    );
    match config.driver {
        DriverKind::Xen => Box::new(xen::XenCliDriver::new(
            runner,
            config.xm.clone(),
            config.disk_backend.clone(),
        )),
        DriverKind::Libvirt => Box::new(libvirt::LibvirtDriver::new(
            runner,
            config.virsh.clone(),
            config.libvirt_uri.clone(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use lifecycle::graceful_then_forced;
pub use xen::XenCliDriver;
pub use libvirt::LibvirtDriver;
