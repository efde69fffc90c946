use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::WorkspaceError;
use crate::lease::parse_mac_prefix;
use crate::paths::ensure_absolute_clean;

/// Top-level configuration for `workspace-control`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub persistence: PersistenceConfig,
    pub vmm: VmmConfig,
    pub behavior: BehaviorConfig,
    pub images: ImagesConfig,
    pub kernels: KernelsConfig,
    /// Network associations keyed by association name (e.g. "public").
    pub networks: BTreeMap<String, AssociationConfig>,
    pub dhcp: DhcpConfig,
    pub mount: MountConfig,
    pub transfer: TransferConfig,
    pub logging: LoggingConfig,
}

impl ControlConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, WorkspaceError> {
        let config: ControlConfig = read_toml(path)?;
        config
            .validate()
            .map_err(|e| WorkspaceError::InvalidConfig(format!("{}: {e:#}", path.display())))?;
        Ok(config)
    }

    /// Parse configuration from TOML text (used by tests and `load`).
    pub fn from_toml(text: &str) -> Result<Self, WorkspaceError> {
        let config: ControlConfig =
            toml::from_str(text).map_err(|e| WorkspaceError::InvalidConfig(e.to_string()))?;
        config
            .validate()
            .map_err(|e| WorkspaceError::InvalidConfig(format!("{e:#}")))?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure_absolute_clean(&self.persistence.dir).context("persistence.dir")?;
        ensure_absolute_clean(&self.images.instance_dir).context("images.instance_dir")?;
        ensure_absolute_clean(&self.images.repo_dir).context("images.repo_dir")?;
        ensure_absolute_clean(&self.kernels.dir).context("kernels.dir")?;

        anyhow::ensure!(self.behavior.max_vcpus >= 1, "behavior.max_vcpus must be >= 1");
        anyhow::ensure!(
            self.behavior.default_memory_mb >= 1,
            "behavior.default_memory_mb must be >= 1"
        );
        if self.behavior.checkshutdown {
            anyhow::ensure!(
                self.behavior.checkshutdownpause_secs >= 1,
                "behavior.checkshutdownpause_secs must be >= 1 when checkshutdown is on"
            );
        }
        anyhow::ensure!(
            self.vmm.command_timeout_secs >= 1,
            "vmm.command_timeout_secs must be >= 1"
        );

        if let Some(default) = &self.kernels.default {
            anyhow::ensure!(
                self.kernels.allowed.iter().any(|k| k == default),
                "kernels.default '{default}' is not listed in kernels.allowed"
            );
        }

        for (name, assoc) in &self.networks {
            anyhow::ensure!(
                !assoc.bridge.trim().is_empty(),
                "networks.{name}.bridge must not be empty"
            );
            parse_mac_prefix(&assoc.mac_prefix)
                .with_context(|| format!("networks.{name}.mac_prefix"))?;
            if let Some(range) = &assoc.ip_range {
                anyhow::ensure!(
                    u32::from(range.start) <= u32::from(range.end),
                    "networks.{name}.ip_range start {} is after end {}",
                    range.start,
                    range.end
                );
            }
        }

        if self.mount.enabled {
            ensure_absolute_clean(&self.mount.mount_dir).context("mount.mount_dir")?;
        }
        Ok(())
    }

    pub fn association(&self, name: &str) -> Option<&AssociationConfig> {
        self.networks.get(name)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.vmm.command_timeout_secs)
    }
}

/// Read and deserialize a TOML file, mapping every failure to `InvalidConfig`.
pub fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, WorkspaceError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        WorkspaceError::InvalidConfig(format!("reading config {}: {e}", path.display()))
    })?;
    toml::from_str(&content).map_err(|e| {
        WorkspaceError::InvalidConfig(format!("parsing config {}: {e}", path.display()))
    })
}

/// Persistence directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Directory holding one record per VM plus the MAC/IP trackers.
    pub dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/nimbus/persistence"),
        }
    }
}

/// Which hypervisor adapter to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Xen,
    Libvirt,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverKind::Xen => write!(f, "xen"),
            DriverKind::Libvirt => write!(f, "libvirt"),
        }
    }
}

/// Hypervisor adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmmConfig {
    pub driver: DriverKind,
    /// Path to `xm` (Xen adapter).
    pub xm: PathBuf,
    /// Path to `virsh` (libvirt adapter).
    pub virsh: PathBuf,
    /// Connection URI passed as `virsh -c <uri>`.
    pub libvirt_uri: Option<String>,
    /// Optional privilege-escalation prefix, e.g. `/usr/bin/sudo`.
    pub sudo: Option<PathBuf>,
    /// Timeout for each hypervisor command.
    pub command_timeout_secs: u64,
    /// Xen disk backend prefix (`file`, `tap:aio`, `phy`).
    pub disk_backend: String,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::Xen,
            xm: PathBuf::from("/usr/sbin/xm"),
            virsh: PathBuf::from("/usr/bin/virsh"),
            libvirt_uri: None,
            sudo: None,
            command_timeout_secs: 60,
            disk_backend: "file".into(),
        }
    }
}

/// Behaviour switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Try a graceful shutdown before destroying on remove.
    pub checkshutdown: bool,
    /// How long to wait for a graceful shutdown before escalating.
    pub checkshutdownpause_secs: u64,
    /// Reject memory requests above what the hypervisor reports as free.
    pub find_maxvmram: bool,
    pub default_memory_mb: u64,
    pub max_vcpus: u32,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            checkshutdown: true,
            checkshutdownpause_secs: 20,
            find_maxvmram: false,
            default_memory_mb: 256,
            max_vcpus: 4,
        }
    }
}

impl BehaviorConfig {
    pub fn shutdown_pause(&self) -> Duration {
        Duration::from_secs(self.checkshutdownpause_secs)
    }
}

/// Image locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    /// Root of the per-VM instance directories (propagated and blank images).
    pub instance_dir: PathBuf,
    /// Read-only repository of canonical images.
    pub repo_dir: PathBuf,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            instance_dir: PathBuf::from("/opt/nimbus/secureimages"),
            repo_dir: PathBuf::from("/opt/nimbus/images"),
        }
    }
}

/// Guest kernels that requests may name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelsConfig {
    pub dir: PathBuf,
    /// Basenames of kernels (and ramdisks) under `dir` that may be requested.
    pub allowed: Vec<String>,
    pub default: Option<String>,
    /// Kernel command line used when the request does not give one.
    pub default_args: Option<String>,
}

impl Default for KernelsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/opt/nimbus/kernels"),
            allowed: Vec::new(),
            default: None,
            default_args: None,
        }
    }
}

/// Inclusive IPv4 range leased out to one association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

/// Network policy bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationConfig {
    /// Bridge the NIC's vif is attached to.
    pub bridge: String,
    /// Locally-administered MAC prefix used for generated MACs.
    pub mac_prefix: String,
    /// Pool for STATIC NICs requesting `ANY` as their address.
    pub ip_range: Option<IpRange>,
    pub gateway: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub broadcast: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    /// Register STATIC NICs of this association with the DHCP collaborator.
    pub dhcp: bool,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            bridge: String::new(),
            mac_prefix: "A2:AA:BB".into(),
            ip_range: None,
            gateway: None,
            netmask: None,
            broadcast: None,
            dns: None,
            dhcp: false,
        }
    }
}

/// `dhcp-conf-alter` collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhcpConfig {
    pub enabled: bool,
    pub conf_alter: PathBuf,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            conf_alter: PathBuf::from("/opt/nimbus/libexec/dhcp-conf-alter"),
        }
    }
}

/// `mount-alter.sh` collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub enabled: bool,
    pub mount_alter: PathBuf,
    /// Scratch directory where the root image is loop-mounted.
    pub mount_dir: PathBuf,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mount_alter: PathBuf::from("/opt/nimbus/libexec/mount-alter.sh"),
            mount_dir: PathBuf::from("/opt/nimbus/mnt"),
        }
    }
}

/// Image transfer programs used for propagation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub scp: PathBuf,
    pub globus_url_copy: PathBuf,
    pub gzip: PathBuf,
    pub timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            scp: PathBuf::from("/usr/bin/scp"),
            globus_url_copy: PathBuf::from("/usr/bin/globus-url-copy"),
            gzip: PathBuf::from("/bin/gzip"),
            timeout_secs: 3600,
        }
    }
}

/// Shared logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ControlConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn parses_networks_and_ranges() {
        let config = ControlConfig::from_toml(
            r#"
            [persistence]
            dir = "/tmp/persist"

            [networks.public]
            bridge = "xenbr0"
            ip_range = { start = "10.0.0.2", end = "10.0.0.50" }
            gateway = "10.0.0.1"
            dhcp = true

            [networks.private]
            bridge = "xenbr1"
            mac_prefix = "A2:00:01"
            "#,
        )
        .expect("config should parse");

        let public = config.association("public").unwrap();
        assert_eq!(public.bridge, "xenbr0");
        assert_eq!(public.ip_range.unwrap().end, Ipv4Addr::new(10, 0, 0, 50));
        assert!(public.dhcp);
        assert_eq!(config.association("private").unwrap().mac_prefix, "A2:00:01");
        assert!(config.association("nope").is_none());
    }

    #[test]
    fn rejects_traversal_in_persistence_dir() {
        let err = ControlConfig::from_toml(
            r#"
            [persistence]
            dir = "/var/lib/../persist"
            "#,
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_INVALID_CONFIG);
    }

    #[test]
    fn rejects_inverted_ip_range() {
        let err = ControlConfig::from_toml(
            r#"
            [networks.public]
            bridge = "xenbr0"
            ip_range = { start = "10.0.0.9", end = "10.0.0.2" }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("ip_range"), "got: {err}");
    }

    #[test]
    fn missing_file_is_invalid_config() {
        let err = ControlConfig::load(Path::new("/nonexistent/workspace.toml")).unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_INVALID_CONFIG);
    }
}
