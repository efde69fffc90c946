use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::{LoggingConfig, read_toml};
use crate::error::WorkspaceError;

/// Top-level configuration for `workspace-pilot`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    pub pilot: PilotSection,
    pub xen: XenSection,
    pub notify: NotifySection,
    pub logging: LoggingConfig,
}

impl PilotConfig {
    pub fn load(path: &Path) -> Result<Self, WorkspaceError> {
        let config: PilotConfig = read_toml(path)?;
        config
            .validate()
            .map_err(|e| WorkspaceError::InvalidConfig(format!("{}: {e:#}", path.display())))?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, WorkspaceError> {
        let config: PilotConfig =
            toml::from_str(text).map_err(|e| WorkspaceError::InvalidConfig(e.to_string()))?;
        config
            .validate()
            .map_err(|e| WorkspaceError::InvalidConfig(format!("{e:#}")))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let ratio = self.pilot.earlywaitratio;
        anyhow::ensure!(
            (0.0..1.0).contains(&ratio),
            "pilot.earlywaitratio must be in [0, 1), got {ratio}"
        );
        anyhow::ensure!(
            self.pilot.listener_timeout_secs >= 1,
            "pilot.listener_timeout_secs must be >= 1"
        );
        if let Some(max) = self.xen.dom0_max_mb {
            anyhow::ensure!(
                max >= self.xen.dom0_min_mb,
                "xen.dom0_max_mb ({max}) is below xen.dom0_min_mb ({})",
                self.xen.dom0_min_mb
            );
        }
        if let Some(url) = &self.notify.http_url {
            let parsed = Url::parse(url).with_context(|| format!("notify.http_url '{url}'"))?;
            anyhow::ensure!(
                matches!(parsed.scheme(), "http" | "https"),
                "notify.http_url must be http or https"
            );
        }
        if self.notify.ssh_target.is_some() {
            anyhow::ensure!(
                self.notify.ssh_remote_exe.is_some(),
                "notify.ssh_remote_exe is required with notify.ssh_target"
            );
        }
        Ok(())
    }
}

/// Engine behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotSection {
    /// Fraction of the grace period granted to early-unreserve listeners.
    pub earlywaitratio: f64,
    /// Run the evaluation phase before reserving.
    pub evaluate: bool,
    /// Advisory per-listener timeout handed to listeners.
    pub listener_timeout_secs: u64,
}

impl Default for PilotSection {
    fn default() -> Self {
        Self {
            earlywaitratio: 0.5,
            evaluate: false,
            listener_timeout_secs: 30,
        }
    }
}

impl PilotSection {
    pub fn listener_timeout(&self) -> Duration {
        Duration::from_secs(self.listener_timeout_secs)
    }
}

/// dom0 memory adjustment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XenSection {
    /// Disable to run the pilot without touching dom0 (testing, non-Xen hosts).
    pub enabled: bool,
    pub xm: PathBuf,
    pub sudo: Option<PathBuf>,
    /// dom0 is never shrunk below this.
    pub dom0_min_mb: u64,
    /// dom0 allocation restored by `--killnine`.
    pub dom0_max_mb: Option<u64>,
    pub command_timeout_secs: u64,
}

impl Default for XenSection {
    fn default() -> Self {
        Self {
            enabled: true,
            xm: PathBuf::from("/usr/sbin/xm"),
            sudo: Some(PathBuf::from("/usr/bin/sudo")),
            dom0_min_mb: 256,
            dom0_max_mb: None,
            command_timeout_secs: 60,
        }
    }
}

impl XenSection {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Remote notification of reservation events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySection {
    pub http_url: Option<String>,
    pub http_user: Option<String>,
    pub http_password: Option<String>,
    /// `user@host` reached over SSH when HTTP fails.
    pub ssh_target: Option<String>,
    /// Program run on `ssh_target`, invoked as `<exe> write ...`.
    pub ssh_remote_exe: Option<String>,
    pub curl: PathBuf,
    pub ssh: PathBuf,
    /// Hostname reported in notifications. Defaults to the local hostname.
    pub hostname: Option<String>,
}

impl Default for NotifySection {
    fn default() -> Self {
        Self {
            http_url: None,
            http_user: None,
            http_password: None,
            ssh_target: None,
            ssh_remote_exe: None,
            curl: PathBuf::from("/usr/bin/curl"),
            ssh: PathBuf::from("/usr/bin/ssh"),
            hostname: None,
        }
    }
}

impl NotifySection {
    pub fn is_configured(&self) -> bool {
        self.http_url.is_some() || self.ssh_target.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        PilotConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn ratio_must_stay_below_one() {
        let err = PilotConfig::from_toml("[pilot]\nearlywaitratio = 1.0\n").unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_INVALID_CONFIG);

        let config = PilotConfig::from_toml("[pilot]\nearlywaitratio = 0.0\n").unwrap();
        assert_eq!(config.pilot.earlywaitratio, 0.0);
    }

    #[test]
    fn notify_section_parses() {
        let config = PilotConfig::from_toml(
            r#"
            [xen]
            dom0_min_mb = 512
            dom0_max_mb = 2048

            [notify]
            http_url = "https://service.example.org/pilot"
            http_user = "pilot"
            ssh_target = "nimbus@service"
            ssh_remote_exe = "/opt/nimbus/bin/pilot-notifications"
            "#,
        )
        .unwrap();
        assert!(config.notify.is_configured());
        assert_eq!(config.xen.dom0_max_mb, Some(2048));

        let err = PilotConfig::from_toml("[notify]\nhttp_url = \"ftp://x\"\n").unwrap_err();
        assert!(err.to_string().contains("http or https"));
    }
}
