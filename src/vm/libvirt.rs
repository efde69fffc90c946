//! libvirt adapter driven through the `virsh` CLI.
//!
//! Domains are started with `virsh create /dev/stdin`, the XML descriptor
//! produced by [`domain_xml`] being fed on stdin. Runtime state comes from
//! `virsh dominfo`, free memory from `virsh freecell`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::info;

use super::{DomainStatus, VmmDriver};
use crate::exec::{CommandOutput, CommandRunner};
use crate::request::{RunningVm, VmRunState, VmSpec};

const NOT_FOUND_MARKERS: &[&str] = &["failed to get domain", "Domain not found"];

pub struct LibvirtDriver {
    runner: CommandRunner,
    virsh: PathBuf,
    uri: Option<String>,
}

impl LibvirtDriver {
    pub fn new(runner: CommandRunner, virsh: PathBuf, uri: Option<String>) -> Self {
        Self { runner, virsh, uri }
    }

    fn args<I, S>(&self, rest: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = Vec::new();
        if let Some(uri) = &self.uri {
            args.push("-c".to_string());
            args.push(uri.clone());
        }
        args.extend(rest.into_iter().map(Into::into));
        args
    }

    fn domain_type(&self) -> &'static str {
        match &self.uri {
            Some(uri) if uri.starts_with("qemu") => "kvm",
            _ => "xen",
        }
    }

    async fn control(&self, verb: &str, name: &str) -> Result<DomainStatus> {
        let output = self.runner.run(&self.virsh, &self.args([verb, name])).await?;
        let text = output.combined();
        let status = if NOT_FOUND_MARKERS.iter().any(|m| text.contains(m)) {
            DomainStatus::NotFound
        } else if output.success() {
            DomainStatus::Done
        } else {
            bail!("virsh {verb} {name} failed ({})", output.describe());
        };
        info!(vm = name, verb, ?status, "virsh control command finished");
        Ok(status)
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

fn path_text(path: &Path) -> String {
    escape(&path.display().to_string())
}

/// libvirt domain descriptor for `spec`.
pub fn domain_xml(spec: &VmSpec, domain_type: &str) -> Result<String> {
    let mut xml = String::new();
    writeln!(xml, "<domain type='{domain_type}'>")?;
    writeln!(xml, "  <name>{}</name>", escape(&spec.name))?;
    writeln!(xml, "  <memory unit='MiB'>{}</memory>", spec.memory_mb)?;
    writeln!(xml, "  <vcpu>{}</vcpu>", spec.vcpus)?;

    writeln!(xml, "  <os>")?;
    writeln!(xml, "    <type>linux</type>")?;
    if let Some(kernel) = &spec.kernel {
        writeln!(xml, "    <kernel>{}</kernel>", path_text(kernel))?;
    }
    if let Some(ramdisk) = &spec.ramdisk {
        writeln!(xml, "    <initrd>{}</initrd>", path_text(ramdisk))?;
    }
    let mut cmdline = Vec::new();
    if spec.kernel.is_some() {
        if let Some(root) = spec.root_partition() {
            cmdline.push(format!("root=/dev/{}", root.mountpoint));
        }
    }
    if let Some(extra) = &spec.kernel_args {
        cmdline.push(extra.clone());
    }
    if !cmdline.is_empty() {
        writeln!(xml, "    <cmdline>{}</cmdline>", escape(&cmdline.join(" ")))?;
    }
    writeln!(xml, "  </os>")?;
    writeln!(xml, "  <on_crash>restart</on_crash>")?;

    writeln!(xml, "  <devices>")?;
    for partition in &spec.partitions {
        writeln!(xml, "    <disk type='file' device='disk'>")?;
        writeln!(xml, "      <source file='{}'/>", path_text(&partition.path))?;
        writeln!(xml, "      <target dev='{}'/>", escape(&partition.mountpoint))?;
        if partition.is_readonly {
            writeln!(xml, "      <readonly/>")?;
        }
        writeln!(xml, "    </disk>")?;
    }
    for nic in &spec.nics {
        let mac = nic
            .mac_value()
            .with_context(|| format!("NIC {} has no MAC assigned", nic.name))?;
        writeln!(xml, "    <interface type='bridge'>")?;
        writeln!(xml, "      <source bridge='{}'/>", escape(&nic.bridge))?;
        writeln!(xml, "      <mac address='{}'/>", escape(mac))?;
        writeln!(xml, "      <target dev='{}'/>", escape(&nic.vif_name))?;
        writeln!(xml, "    </interface>")?;
    }
    writeln!(xml, "  </devices>")?;
    writeln!(xml, "</domain>")?;
    Ok(xml)
}

/// Parse `virsh dominfo` output. `None` when the domain reports no state.
pub fn parse_dominfo(name: &str, text: &str) -> Option<RunningVm> {
    let field = |key: &str| {
        text.lines().find_map(|line| {
            let (k, v) = line.split_once(':')?;
            (k.trim() == key).then(|| v.trim().to_string())
        })
    };

    let state = match field("State")?.as_str() {
        "running" => VmRunState::Running,
        "idle" | "blocked" => VmRunState::Blocked,
        "paused" => VmRunState::Paused,
        "in shutdown" => VmRunState::ShuttingDown,
        "shut off" => VmRunState::Shutoff,
        "crashed" => VmRunState::Crashed,
        _ => return None,
    };
    let kib = |key: &str| {
        field(key)
            .and_then(|v| v.split_whitespace().next().map(str::to_string))
            .and_then(|v| v.parse::<u64>().ok())
    };
    let mem_kib = kib("Used memory").or_else(|| kib("Max memory")).unwrap_or(0);

    Some(RunningVm {
        handle: field("Name").unwrap_or_else(|| name.to_string()),
        vmm_id: field("Id").and_then(|v| v.parse().ok()),
        vmm_uuid: field("UUID"),
        mem_mb: mem_kib / 1024,
        vcpus: field("CPU(s)").and_then(|v| v.parse().ok()).unwrap_or(0),
        cputime_secs: field("CPU time")
            .and_then(|v| v.trim_end_matches('s').parse().ok())
            .unwrap_or(0.0),
        state,
    })
}

/// Free memory in MB from `virsh freecell` (`Total:` line, or the single cell).
pub fn parse_freecell(text: &str) -> Option<u64> {
    let line = text
        .lines()
        .find(|l| l.trim_start().starts_with("Total:"))
        .or_else(|| text.lines().find(|l| l.contains("KiB")))?;
    let kib: u64 = line
        .split_whitespace()
        .rev()
        .nth(1)?
        .parse()
        .ok()?;
    Some(kib / 1024)
}

#[async_trait]
impl VmmDriver for LibvirtDriver {
    fn name(&self) -> &'static str {
        "libvirt"
    }

    async fn create(&self, spec: &VmSpec) -> Result<()> {
        let xml = domain_xml(spec, self.domain_type())?;
        let output: CommandOutput = self
            .runner
            .run_with_stdin(&self.virsh, &self.args(["create", "/dev/stdin"]), &xml)
            .await?;
        if !output.success() {
            bail!("virsh create {} failed ({})", spec.name, output.describe());
        }
        info!(vm = %spec.name, "domain created through libvirt");
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
        self.control("suspend", name).await
    }

    async fn unpause(&self, name: &str) -> Result<DomainStatus> {
        self.control("resume", name).await
    }

    async fn info(&self, name: &str) -> Result<Option<RunningVm>> {
        let output = self.runner.run(&self.virsh, &self.args(["dominfo", name])).await?;
        let text = output.combined();
        if NOT_FOUND_MARKERS.iter().any(|m| text.contains(m)) {
            return Ok(None);
        }
        if !output.success() {
            bail!("virsh dominfo {name} failed ({})", output.describe());
        }
        Ok(parse_dominfo(name, &output.stdout))
    }

    async fn max_available_memory_mb(&self) -> Result<u64> {
        let output = self
            .runner
            .run_checked(&self.virsh, &self.args(["freecell"]), "virsh freecell")
            .await?;
        parse_freecell(&output.stdout).context("could not parse virsh freecell output")
    }
}
