//! Xen adapter driving the `xm` toolstack CLI.
//!
//! ```text
//! xm create name=<vm> vcpus=<n> memory=<mb> on_crash=restart \
//!     disk=<backend>:<path>,<dev>,<w|r> ... \
//!     vif=mac=<mac>,bridge=<br>,vifname=<vif> ... \
//!     [kernel=<path>] [ramdisk=<path>] [root=/dev/<dev>] [extra=<args>] \
//!     -f /dev/null
//! ```
//!
//! `create` succeeds only when the output carries [`STARTED_MARKER`]. Control
//! commands whose output mentions an unknown domain map to
//! [`DomainStatus::NotFound`].

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{DomainStatus, VmmDriver};
use crate::exec::{CommandOutput, CommandRunner};
use crate::request::{RunningVm, VmRunState, VmSpec};

pub const STARTED_MARKER: &str = "Started domain";

const NOT_FOUND_MARKERS: &[&str] = &["invalid domain", "does not exist"];

pub struct XenCliDriver {
    runner: CommandRunner,
    xm: PathBuf,
    disk_backend: String,
}

impl XenCliDriver {
    pub fn new(runner: CommandRunner, xm: PathBuf, disk_backend: String) -> Self {
        Self {
            runner,
            xm,
            disk_backend,
        }
    }

    /// Run `xm <args>` and return the captured output.
    pub async fn xm(&self, args: &[String]) -> Result<CommandOutput> {
        self.runner.run(&self.xm, args).await
    }

    async fn control(&self, verb: &str, name: &str) -> Result<DomainStatus> {
        let output = self.xm(&[verb.to_string(), name.to_string()]).await?;
        let status = domain_status(&output)
            .with_context(|| format!("xm {verb} {name} failed ({})", output.describe()))?;
        info!(vm = name, verb, ?status, "xm control command finished");
        Ok(status)
    }
}

fn domain_status(output: &CommandOutput) -> Result<DomainStatus> {
    let text = output.combined();
    if NOT_FOUND_MARKERS.iter().any(|m| text.contains(m)) {
        return Ok(DomainStatus::NotFound);
    }
    if !output.success() {
        bail!("unexpected xm failure");
    }
    Ok(DomainStatus::Done)
}

/// Arguments of `xm create` for `spec`.
pub fn create_args(spec: &VmSpec, disk_backend: &str) -> Result<Vec<String>> {
    let mut args = vec![
        "create".to_string(),
        format!("name={}", spec.name),
        format!("vcpus={}", spec.vcpus),
        format!("memory={}", spec.memory_mb),
        "on_crash=restart".to_string(),
    ];

    for partition in &spec.partitions {
        let mode = if partition.is_readonly { "r" } else { "w" };
        args.push(format!(
            "disk={disk_backend}:{},{},{mode}",
            partition.path.display(),
            partition.mountpoint
        ));
    }

    for nic in &spec.nics {
        let mac = nic
            .mac_value()
            .with_context(|| format!("NIC {} has no MAC assigned", nic.name))?;
        args.push(format!(
            "vif=mac={mac},bridge={},vifname={}",
            nic.bridge, nic.vif_name
        ));
    }

    if let Some(kernel) = &spec.kernel {
        args.push(format!("kernel={}", kernel.display()));
        if let Some(root) = spec.root_partition() {
            args.push(format!("root=/dev/{}", root.mountpoint));
        }
    }
    if let Some(ramdisk) = &spec.ramdisk {
        args.push(format!("ramdisk={}", ramdisk.display()));
    }
    if let Some(extra) = &spec.kernel_args {
        args.push(format!("extra={extra}"));
    }

    args.push("-f".to_string());
    args.push("/dev/null".to_string());
    Ok(args)
}

/// Parse the rows of `xm list` output, skipping the header.
///
/// ```text
/// Name                ID   Mem VCPUs      State   Time(s)
/// Domain-0             0  1024     2     r-----   1234.5
/// vm1                  3   256     1     -b----     10.2
/// ```
///
/// A domain whose state flags are all dashes reports no state and is dropped.
pub fn parse_xm_list(text: &str) -> Vec<RunningVm> {
    text.lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 6 || cols[0] == "Name" {
                return None;
            }
            let state = parse_state_flags(cols[4])?;
            Some(RunningVm {
                handle: cols[0].to_string(),
                vmm_id: cols[1].parse().ok(),
                vmm_uuid: None,
                mem_mb: cols[2].parse().ok()?,
                vcpus: cols[3].parse().ok()?,
                cputime_secs: cols[5].parse().unwrap_or(0.0),
                state,
            })
        })
        .collect()
}

fn parse_state_flags(flags: &str) -> Option<VmRunState> {
    let state = match flags.chars().find(|c| *c != '-')? {
        'r' => VmRunState::Running,
        'b' => VmRunState::Blocked,
        'p' => VmRunState::Paused,
        's' | 'd' => VmRunState::ShuttingDown,
        'c' => VmRunState::Crashed,
        _ => return None,
    };
    Some(state)
}

/// `free_memory` from `xm info`, in MB.
pub fn parse_free_memory(text: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() != "free_memory" {
            return None;
        }
        value.trim().parse().ok()
    })
}

#[async_trait]
impl VmmDriver for XenCliDriver {
    fn name(&self) -> &'static str {
        "xen"
    }

    async fn create(&self, spec: &VmSpec) -> Result<()> {
        let args = create_args(spec, &self.disk_backend)?;
        let output = self.xm(&args).await?;
        if !output.combined().contains(STARTED_MARKER) {
            bail!(
                "xm create {} did not report '{STARTED_MARKER}' ({})",
                spec.name,
                output.describe()
            );
        }
        info!(vm = %spec.name, "domain started");
        Ok(())
    }

    async fn shutdown(&self, name: &str) -> Result<DomainStatus> {
        self.control("shutdown", name).await
    }

    async fn destroy(&self, name: &str) -> Result<DomainStatus> {
        self.control("destroy", name).await
    }

    async fn reboot(&self, name: &str) -> Result<DomainStatus> {
        self.control("reboot", name).await
    }

    async fn pause(&self, name: &str) -> Result<DomainStatus> {
        self.control("pause", name).await
    }

    async fn unpause(&self, name: &str) -> Result<DomainStatus> {
        self.control("unpause", name).await
    }

    async fn info(&self, name: &str) -> Result<Option<RunningVm>> {
        let output = self.xm(&["list".to_string(), name.to_string()]).await?;
        if domain_status(&output).is_ok_and(|s| s == DomainStatus::NotFound) {
            return Ok(None);
        }
        if !output.success() {
            bail!("xm list {name} failed ({})", output.describe());
        }
        let vm = parse_xm_list(&output.stdout)
            .into_iter()
            .find(|vm| vm.handle == name);
        if vm.is_none() {
            debug!(vm = name, "xm list reports no state");
        }
        Ok(vm)
    }

    async fn max_available_memory_mb(&self) -> Result<u64> {
        let output = self
            .runner
            .run_checked(&self.xm, &["info".to_string()], "xm info")
            .await?;
        let free = parse_free_memory(&output.stdout);
        if free.is_none() {
            warn!(output = %output.stdout.trim(), "xm info output carried no free_memory line");
        }
        free.context("could not find free_memory in xm info output")
    }
}
