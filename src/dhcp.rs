//! `dhcp-conf-alter` collaborator: registers STATIC NICs with the node's DHCP
//! server so the guest receives the address it was assigned.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use crate::exec::CommandRunner;
use crate::request::Nic;

pub struct DhcpConfAlter {
    runner: CommandRunner,
    program: PathBuf,
}

impl DhcpConfAlter {
    pub fn new(runner: CommandRunner, program: PathBuf) -> Self {
        Self { runner, program }
    }

    /// `--add` arguments for `nic`. The NIC must have a MAC and an IP.
    pub fn add_args(nic: &Nic) -> Result<Vec<String>> {
        let mac = nic
            .mac_value()
            .with_context(|| format!("NIC {} has no MAC", nic.name))?;
        let ip = nic
            .ip_value()
            .with_context(|| format!("NIC {} has no IP", nic.name))?;

        let mut args = vec![
            "--add".to_string(),
            "--name".to_string(),
            nic.dhcp_vif_name.clone(),
            "--mac".to_string(),
            mac.to_string(),
            "--ip".to_string(),
            ip.to_string(),
        ];
        let hostname = nic.hostname.clone().unwrap_or_else(|| nic.dhcp_vif_name.clone());
        args.extend(["--hostname".to_string(), hostname]);

        let optional = [
            ("--gateway", nic.gateway),
            ("--broadcast", nic.broadcast),
            ("--netmask", nic.netmask),
            ("--dns", nic.dns),
        ];
        for (flag, value) in optional {
            if let Some(value) = value {
                args.extend([flag.to_string(), value.to_string()]);
            }
        }
        Ok(args)
    }

    pub async fn add(&self, nic: &Nic) -> Result<()> {
        let args = Self::add_args(nic)?;
        self.runner.run_checked(&self.program, &args, "dhcp registration").await?;
        info!(vif = %nic.dhcp_vif_name, ip = ?nic.ip_value(), "NIC registered with DHCP");
        Ok(())
    }

    pub async fn remove(&self, nic: &Nic) -> Result<()> {
        let mut args = vec![
            "--remove".to_string(),
            "--name".to_string(),
            nic.dhcp_vif_name.clone(),
        ];
        if let Some(mac) = nic.mac_value() {
            args.extend(["--mac".to_string(), mac.to_string()]);
        }
        self.runner.run_checked(&self.program, &args, "dhcp removal").await?;
        info!(vif = %nic.dhcp_vif_name, "NIC removed from DHCP");
        Ok(())
    }
}
