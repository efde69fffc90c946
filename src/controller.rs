//! The `workspace-control` orchestration layer.
//!
//! [`LifecycleController`] sequences validation, lease allocation, the
//! hypervisor driver and persistence for one action on one VM. Every action
//! holds the persistence lock for its whole duration. Outside an in-flight
//! action no leases are held for a VM without a record, and no record exists
//! without its leases.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::Context;
use tracing::{error, info, warn};

use crate::config::ControlConfig;
use crate::dhcp::DhcpConfAlter;
use crate::error::{
    EXIT_ALREADY_REMOVED, EXIT_OK, EXIT_SELF_SHUTDOWN, Result, WorkspaceError,
};
use crate::exec::CommandRunner;
use crate::lease::{LeaseKind, LeaseTracker, ip_candidates, mac_candidates, parse_mac_prefix};
use crate::mount::MountAlter;
use crate::paths::InstancePaths;
use crate::persistence::PersistenceStore;
use crate::request::{ConfigurationMode, CreateRecord, CreateRequest, Nic, Requested, RunningVm, VmSpec};
use crate::validate::{ResourceValidator, apply_address_defaults, split_list, validate_name};
use crate::vm::filesystem;
use crate::vm::lifecycle::{ShutdownPolicy, Teardown};
use crate::vm::propagation::{CommandTransfer, ImageTransfer};
use crate::vm::{DomainStatus, VmmDriver, build_driver, graceful_then_forced};

/// How a remove ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// Neither a record nor a domain existed.
    AlreadyRemoved,
    /// A record existed but the domain had already gone away on its own.
    SelfShutdown,
}

impl RemoveOutcome {
    pub fn exit_code(self) -> u8 {
        match self {
            RemoveOutcome::Removed => EXIT_OK,
            RemoveOutcome::AlreadyRemoved => EXIT_ALREADY_REMOVED,
            RemoveOutcome::SelfShutdown => EXIT_SELF_SHUTDOWN,
        }
    }
}

/// What a failed create has to undo.
#[derive(Debug, Default)]
struct Undo {
    /// (kind, association, value)
    leases: Vec<(LeaseKind, String, String)>,
    files: Vec<PathBuf>,
    dhcp: Vec<Nic>,
}

pub struct LifecycleController {
    config: ControlConfig,
    store: PersistenceStore,
    driver: Box<dyn VmmDriver>,
    transfer: Box<dyn ImageTransfer>,
    dhcp: Option<DhcpConfAlter>,
    mount: Option<MountAlter>,
    paths: InstancePaths,
}

impl LifecycleController {
    pub fn new(
        config: ControlConfig,
        store: PersistenceStore,
        driver: Box<dyn VmmDriver>,
        transfer: Box<dyn ImageTransfer>,
    ) -> Self {
        let paths = InstancePaths::new(config.images.instance_dir.clone());
        Self {
            config,
            store,
            driver,
            transfer,
            dhcp: None,
            mount: None,
            paths,
        }
    }

    pub fn with_dhcp(mut self, dhcp: DhcpConfAlter) -> Self {
        self.dhcp = Some(dhcp);
        self
    }

    pub fn with_mount(mut self, mount: MountAlter) -> Self {
        self.mount = Some(mount);
        self
    }

    /// Wire up the production collaborators described by `config`.
    pub fn from_config(config: ControlConfig) -> Result<Self> {
        let store = PersistenceStore::open(config.persistence.dir.clone())?;
        let runner = CommandRunner::new(config.vmm.sudo.clone(), config.command_timeout());
        let driver = build_driver(&config.vmm);
        let transfer = Box::new(CommandTransfer::new(&runner, config.transfer.clone()));

        let dhcp = config
            .dhcp
            .enabled
            .then(|| DhcpConfAlter::new(runner.clone(), config.dhcp.conf_alter.clone()));
        let mount = config.mount.enabled.then(|| {
            MountAlter::new(
                runner.clone(),
                config.mount.mount_alter.clone(),
                config.mount.mount_dir.clone(),
            )
        });

        info!(driver = driver.name(), dhcp = dhcp.is_some(), mount = mount.is_some(), "controller ready");
        let mut controller = Self::new(config, store, driver, transfer);
        controller.dhcp = dhcp;
        controller.mount = mount;
        Ok(controller)
    }

    pub fn store(&self) -> &PersistenceStore {
        &self.store
    }

    fn shutdown_policy(&self) -> ShutdownPolicy {
        ShutdownPolicy {
            graceful: self.config.behavior.checkshutdown,
            pause: self.config.behavior.shutdown_pause(),
        }
    }

    /// Load both trackers, retiring leases of associations no longer configured.
    fn load_trackers(&self) -> Result<(LeaseTracker, LeaseTracker)> {
        Ok((self.load_tracker(LeaseKind::Mac)?, self.load_tracker(LeaseKind::Ip)?))
    }

    fn load_tracker(&self, kind: LeaseKind) -> Result<LeaseTracker> {
        let mut tracker = self.store.load_tracker(kind)?;
        let known = self.config.networks.keys().map(String::as_str);
        let stale = tracker.retire_unknown_associations(known);
        if !stale.is_empty() {
            warn!(kind = %kind, associations = ?stale, "retired leases of unconfigured associations");
            self.store.save_tracker(&tracker)?;
        }
        Ok(tracker)
    }

    async fn require_absent(&self, name: &str, action: &str) -> Result<()> {
        if let Some(vm) = self.driver.info(name).await? {
            if !vm.state.is_down() {
                return Err(WorkspaceError::InvalidInput(format!(
                    "cannot {action} '{name}' while it is running ({:?})",
                    vm.state
                )));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // CREATE
    // -----------------------------------------------------------------------

    pub async fn create(&self, request: &CreateRequest) -> Result<VmSpec> {
        validate_name(&request.name)?;
        let _lock = self.store.lock_async().await?;

        if self.store.exists(&request.name)? {
            return Err(WorkspaceError::InvalidInput(format!(
                "a workspace named '{}' already exists",
                request.name
            )));
        }

        let (mut macs, mut ips) = self.load_trackers()?;

        let max_available = if self.config.behavior.find_maxvmram {
            let max = self
                .driver
                .max_available_memory_mb()
                .await
                .context("querying available hypervisor memory")?;
            Some(max)
        } else {
            None
        };

        let spec = ResourceValidator::new(&self.config, &macs, &ips)
            .with_max_available(max_available)
            .validate(request)?;

        let mut undo = Undo::default();
        let spec = match self.create_steps(spec, &mut macs, &mut ips, &mut undo).await {
            Ok(spec) => spec,
            Err(e) => {
                error!(vm = %request.name, error = %e, "create failed, rolling back");
                self.rollback(&request.name, undo, &mut macs, &mut ips).await;
                return Err(e);
            }
        };

        if let Err(e) = self.store.save(&spec.name, &CreateRecord::new(spec.clone())) {
            error!(vm = %spec.name, error = %e, "domain is running but its record was not saved");
            return Err(WorkspaceError::CreatedNotPersisted {
                name: spec.name.clone(),
                cause: e.to_string(),
            });
        }
        info!(vm = %spec.name, "workspace created");
        Ok(spec)
    }

    async fn create_steps(
        &self,
        mut spec: VmSpec,
        macs: &mut LeaseTracker,
        ips: &mut LeaseTracker,
        undo: &mut Undo,
    ) -> Result<VmSpec> {
        for nic in &mut spec.nics {
            self.allocate(nic, macs, ips, undo)?;
        }

        filesystem::materialize_blank_partitions(&spec, &self.paths, &mut undo.files)?;

        if !spec.mount_tasks.is_empty() {
            let mount = self.mount.as_ref().ok_or_else(|| {
                WorkspaceError::Programming("mount tasks validated without a mount collaborator".into())
            })?;
            let root = spec
                .root_partition()
                .ok_or_else(|| WorkspaceError::Programming("spec has no root partition".into()))?;
            mount
                .apply(&root.path, &spec.mount_tasks)
                .await
                .context("applying mount tasks")?;
        }

        if let Some(dhcp) = &self.dhcp {
            for nic in &spec.nics {
                let wants_dhcp = nic.configuration_mode == ConfigurationMode::Static
                    && self.config.association(&nic.association).is_some_and(|a| a.dhcp);
                if !wants_dhcp {
                    continue;
                }
                match dhcp.add(nic).await {
                    Ok(()) => undo.dhcp.push(nic.clone()),
                    Err(e) => warn!(vm = %spec.name, vif = %nic.dhcp_vif_name, error = %e, "dhcp registration failed"),
                }
            }
        }

        self.driver
            .create(&spec)
            .await
            .with_context(|| format!("creating domain '{}'", spec.name))?;
        Ok(spec)
    }

    /// Lease the NIC's MAC (and IP, for STATIC NICs), persisting each tracker
    /// right after it changes.
    fn allocate(
        &self,
        nic: &mut Nic,
        macs: &mut LeaseTracker,
        ips: &mut LeaseTracker,
        undo: &mut Undo,
    ) -> Result<()> {
        let assoc = self.config.association(&nic.association).ok_or_else(|| {
            WorkspaceError::Programming(format!("association '{}' vanished", nic.association))
        })?;

        let mac = match &nic.mac {
            Requested::Any => {
                let prefix = parse_mac_prefix(&assoc.mac_prefix)
                    .map_err(|e| WorkspaceError::InvalidConfig(format!("{e:#}")))?;
                macs.new_value(&nic.association, mac_candidates(prefix))
                    .ok_or_else(|| {
                        WorkspaceError::unexpected(format!(
                            "no free MAC found under prefix {} for association '{}'",
                            assoc.mac_prefix, nic.association
                        ))
                    })?
            }
            Requested::Value(mac) => {
                if !macs.add_value(&nic.association, mac) {
                    return Err(WorkspaceError::unexpected(format!("MAC {mac} was leased concurrently")));
                }
                mac.clone()
            }
        };
        undo.leases.push((LeaseKind::Mac, nic.association.clone(), mac.clone()));
        self.store.save_tracker(macs)?;
        nic.mac = Requested::Value(mac);

        let ip = match &nic.ip {
            None => return Ok(()),
            Some(Requested::Any) => {
                let range = assoc.ip_range.ok_or_else(|| {
                    WorkspaceError::Programming(format!("association '{}' has no ip_range", nic.association))
                })?;
                ips.new_value(&nic.association, ip_candidates(range))
                    .ok_or_else(|| {
                        WorkspaceError::unexpected(format!(
                            "address pool of association '{}' is exhausted",
                            nic.association
                        ))
                    })?
            }
            Some(Requested::Value(ip)) => {
                let ip = ip.to_string();
                if !ips.add_value(&nic.association, &ip) {
                    return Err(WorkspaceError::unexpected(format!("IP {ip} was leased concurrently")));
                }
                ip
            }
        };
        undo.leases.push((LeaseKind::Ip, nic.association.clone(), ip.clone()));
        self.store.save_tracker(ips)?;

        let addr = ip
            .parse::<Ipv4Addr>()
            .map_err(|_| WorkspaceError::Programming(format!("tracker produced bad address {ip}")))?;
        nic.ip = Some(Requested::Value(addr));
        apply_address_defaults(nic, assoc);
        info!(nic = %nic.name, mac = ?nic.mac_value(), ip = %ip, "addresses leased");
        Ok(())
    }

    /// Best effort: failures are logged so the original error surfaces.
    async fn rollback(&self, name: &str, undo: Undo, macs: &mut LeaseTracker, ips: &mut LeaseTracker) {
        for nic in &undo.dhcp {
            if let Some(dhcp) = &self.dhcp {
                if let Err(e) = dhcp.remove(nic).await {
                    warn!(vm = name, vif = %nic.dhcp_vif_name, error = %e, "rollback: dhcp removal failed");
                }
            }
        }

        filesystem::remove_owned_files(&self.paths, name, &undo.files);

        let mut touched = (false, false);
        for (kind, association, value) in &undo.leases {
            let tracker = match kind {
                LeaseKind::Mac => {
                    touched.0 = true;
                    &mut *macs
                }
                LeaseKind::Ip => {
                    touched.1 = true;
                    &mut *ips
                }
            };
            tracker.retire_value(association, value);
        }
        for (changed, tracker) in [(touched.0, &*macs), (touched.1, &*ips)] {
            if changed {
                if let Err(e) = self.store.save_tracker(tracker) {
                    error!(vm = name, kind = %tracker.kind(), error = %e, "rollback: could not persist tracker");
                }
            }
        }
        info!(vm = name, leases = undo.leases.len(), files = undo.files.len(), "rollback finished");
    }

    // -----------------------------------------------------------------------
    // REMOVE
    // -----------------------------------------------------------------------

    pub async fn remove(&self, name: &str, deleteall: bool) -> Result<RemoveOutcome> {
        validate_name(name)?;
        let _lock = self.store.lock_async().await?;

        let record = self.store.load_record::<CreateRecord>(name)?;
        let teardown = graceful_then_forced(self.driver.as_ref(), name, self.shutdown_policy())
            .await
            .with_context(|| format!("shutting down '{name}'"))?;

        let Some(record) = record else {
            if teardown == Teardown::NotRunning {
                info!(vm = name, "nothing to remove");
                if deleteall {
                    filesystem::remove_instance_dir(&self.paths, name)?;
                }
                return Ok(RemoveOutcome::AlreadyRemoved);
            }
            warn!(vm = name, ?teardown, "removed a domain that had no record");
            return Ok(RemoveOutcome::Removed);
        };

        let (mut macs, mut ips) = self.load_trackers()?;
        for nic in &record.spec.nics {
            if let Some(mac) = nic.mac_value() {
                if !macs.retire_value(&nic.association, mac) {
                    warn!(vm = name, mac, "MAC lease was not tracked");
                }
            }
            if let Some(ip) = nic.ip_value() {
                if !ips.retire_value(&nic.association, &ip.to_string()) {
                    warn!(vm = name, ip = %ip, "IP lease was not tracked");
                }
            }
            if let Some(dhcp) = &self.dhcp {
                let registered = nic.configuration_mode == ConfigurationMode::Static
                    && self.config.association(&nic.association).is_some_and(|a| a.dhcp);
                if registered {
                    if let Err(e) = dhcp.remove(nic).await {
                        warn!(vm = name, vif = %nic.dhcp_vif_name, error = %e, "dhcp removal failed");
                    }
                }
            }
        }
        self.store.save_tracker(&macs)?;
        self.store.save_tracker(&ips)?;
        self.store.remove(name)?;

        if deleteall {
            filesystem::remove_instance_dir(&self.paths, name)?;
        } else {
            let blanks: Vec<PathBuf> = record
                .spec
                .partitions
                .iter()
                .filter(|p| p.blankspace_mb.is_some())
                .map(|p| p.path.clone())
                .collect();
            filesystem::remove_owned_files(&self.paths, name, &blanks);
        }

        let outcome = if teardown == Teardown::NotRunning {
            RemoveOutcome::SelfShutdown
        } else {
            RemoveOutcome::Removed
        };
        info!(vm = name, ?outcome, ?teardown, deleteall, "workspace removed");
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // REBOOT / PAUSE / UNPAUSE / INFO
    // -----------------------------------------------------------------------

    async fn control(&self, name: &str, verb: &str) -> Result<()> {
        validate_name(name)?;
        let _lock = self.store.lock_async().await?;
        if self.driver.info(name).await?.is_none() {
            return Err(WorkspaceError::unexpected(format!("'{name}' not found")));
        }
        let status = match verb {
            "reboot" => self.driver.reboot(name).await?,
            "pause" => self.driver.pause(name).await?,
            "unpause" => self.driver.unpause(name).await?,
            other => return Err(WorkspaceError::Programming(format!("unknown control verb {other}"))),
        };
        if status == DomainStatus::NotFound {
            return Err(WorkspaceError::unexpected(format!("'{name}' not found")));
        }
        info!(vm = name, verb, "control action done");
        Ok(())
    }

    pub async fn reboot(&self, name: &str) -> Result<()> {
        self.control(name, "reboot").await
    }

    pub async fn pause(&self, name: &str) -> Result<()> {
        self.control(name, "pause").await
    }

    pub async fn unpause(&self, name: &str) -> Result<()> {
        self.control(name, "unpause").await
    }

    pub async fn info(&self, name: &str) -> Result<Option<RunningVm>> {
        validate_name(name)?;
        Ok(self.driver.info(name).await?)
    }

    // -----------------------------------------------------------------------
    // PROPAGATE / UNPROPAGATE
    // -----------------------------------------------------------------------

    /// Fetch the remote images of `request` into the instance directory.
    /// Returns how many images were transferred.
    pub async fn propagate(&self, request: &CreateRequest) -> Result<usize> {
        validate_name(&request.name)?;
        let _lock = self.store.lock_async().await?;
        self.require_absent(&request.name, "propagate").await?;

        let macs = LeaseTracker::new(LeaseKind::Mac);
        let ips = LeaseTracker::new(LeaseKind::Ip);
        let partitions = ResourceValidator::new(&self.config, &macs, &ips)
            .require_local_images(false)
            .resolve_partitions(request)?;

        self.paths
            .ensure_vm_dir(&request.name)
            .map_err(|e| WorkspaceError::storage("creating instance directory", e))?;

        let mut count = 0;
        for partition in partitions.iter().filter(|p| p.needs_propagation) {
            self.transfer
                .fetch(partition)
                .await
                .with_context(|| format!("propagating {}", partition.source))?;
            count += 1;
        }
        info!(vm = %request.name, images = count, "propagation done");
        Ok(count)
    }

    /// Copy the local images of `request` back to their sources, or to the
    /// `;;`-separated `targets` (one per remote image, in order).
    pub async fn unpropagate(&self, request: &CreateRequest, targets: Option<&str>) -> Result<usize> {
        validate_name(&request.name)?;
        let _lock = self.store.lock_async().await?;
        self.require_absent(&request.name, "unpropagate").await?;

        let macs = LeaseTracker::new(LeaseKind::Mac);
        let ips = LeaseTracker::new(LeaseKind::Ip);
        let partitions = ResourceValidator::new(&self.config, &macs, &ips)
            .require_local_images(true)
            .resolve_partitions(request)?;
        let remote: Vec<_> = partitions.iter().filter(|p| p.needs_propagation).collect();

        let targets: Vec<String> = match targets.map(split_list) {
            Some(list) if !list.is_empty() => {
                if list.len() != remote.len() {
                    return Err(WorkspaceError::InvalidInput(format!(
                        "{} unpropagation target(s) for {} remote image(s)",
                        list.len(),
                        remote.len()
                    )));
                }
                list.into_iter().map(str::to_string).collect()
            }
            _ => remote
                .iter()
                .map(|p| p.source.clone())
                .collect(),
        };

        for (partition, target) in remote.iter().zip(&targets) {
            self.transfer
                .push(partition, target)
                .await
                .with_context(|| format!("unpropagating {} to {target}", partition.path.display()))?;
        }
        info!(vm = %request.name, images = remote.len(), "unpropagation done");
        Ok(remote.len())
    }
}
