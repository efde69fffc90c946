//! Filesystem layout for workspace-control and the pilot.
//!
//! - Config:       `/etc/nimbus/workspace-control.toml`, `/etc/nimbus/workspace-pilot.toml`
//! - Persistence:  configured `[persistence] dir` (one file per VM / tracker)
//! - Instances:    `<images.instance_dir>/<vm-name>/` (propagated and blank images)
//! - Logs:         configured `[logging] log_dir`, else `~/.local/share/nimbus-workspace/logs`
//!
//! Every directory that is handed to us from configuration is checked for `..`
//! components before use.

use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use tracing::info;

const APP_NAME: &str = "nimbus-workspace";

/// Default configuration file for `workspace-control`.
pub const DEFAULT_CONTROL_CONF: &str = "/etc/nimbus/workspace-control.toml";

/// Default configuration file for `workspace-pilot`.
pub const DEFAULT_PILOT_CONF: &str = "/etc/nimbus/workspace-pilot.toml";

/// Reject any path containing a `..` component.
pub fn ensure_no_traversal(path: &Path) -> Result<()> {
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        bail!("path must not contain '..': {}", path.display());
    }
    Ok(())
}

/// Reject paths that are relative or contain `..`.
pub fn ensure_absolute_clean(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        bail!("path must be absolute: {}", path.display());
    }
    ensure_no_traversal(path)
}

/// Per-VM working directory under the configured instance root.
#[derive(Debug, Clone)]
pub struct InstancePaths {
    root: PathBuf,
}

impl InstancePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<vm-name>`. The name has already passed name validation, so it
    /// cannot contain separators.
    pub fn vm_dir(&self, vm_name: &str) -> PathBuf {
        self.root.join(vm_name)
    }

    /// Create the VM directory if it does not exist yet.
    pub fn ensure_vm_dir(&self, vm_name: &str) -> std::io::Result<PathBuf> {
        let dir = self.vm_dir(vm_name);
        if !dir.is_dir() {
            std::fs::create_dir_all(&dir)?;
            info!(dir = %dir.display(), "created instance directory");
        }
        Ok(dir)
    }

    /// Whether `path` lives inside this VM's directory.
    pub fn owns(&self, vm_name: &str, path: &Path) -> bool {
        path.starts_with(self.vm_dir(vm_name))
    }
}

/// Fallback log directory when `[logging] log_dir` is not configured.
pub fn default_log_dir() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return Some(PathBuf::from(xdg).join(APP_NAME).join("logs"));
    }
    let home = std::env::var("HOME").ok()?;
    Some(
        PathBuf::from(home)
            .join(".local")
            .join("share")
            .join(APP_NAME)
            .join("logs"),
    )
}
