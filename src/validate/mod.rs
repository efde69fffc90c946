//! Request validation.
//!
//! [`ResourceValidator`] turns a raw [`CreateRequest`] plus configuration and
//! current lease state into a resolved [`VmSpec`], or fails with a
//! [`ValidationReport`] listing every problem found. Nothing here touches the
//! hypervisor or mutates state.
//!
//! Independent checks all run even when earlier ones fail, so the operator
//! sees every problem at once. Checks with a real data dependency short
//! circuit: when the image and mountpoint counts differ, no per-image checks
//! are attempted.

mod nics;
mod partitions;

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::ControlConfig;
use crate::error::{Result, ValidationReport, WorkspaceError};
use crate::lease::LeaseTracker;
use crate::paths::ensure_absolute_clean;
use crate::request::{CreateRequest, MountTask, Partition, VmSpec};

pub use nics::{apply_address_defaults, class_defaults};

/// Longest accepted VM name. Keeps `<name>-<n>` within IFNAMSIZ.
pub const MAX_NAME_LEN: usize = 13;

/// Split a `;;`-separated list, dropping empty items.
pub(crate) fn split_list(text: &str) -> Vec<&str> {
    text.split(";;")
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect()
}

/// `^[a-z][a-z0-9-]*$`, at most [`MAX_NAME_LEN`] characters.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !first_ok || !rest_ok {
        return Err(WorkspaceError::InvalidInput(format!(
            "name '{name}' must start with a lowercase letter and contain only \
             lowercase letters, digits and '-'"
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(WorkspaceError::InvalidInput(format!(
            "name '{name}' is longer than {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

pub struct ResourceValidator<'a> {
    config: &'a ControlConfig,
    macs: &'a LeaseTracker,
    ips: &'a LeaseTracker,
    max_available_mb: Option<u64>,
    require_local_images: bool,
}

impl<'a> ResourceValidator<'a> {
    pub fn new(config: &'a ControlConfig, macs: &'a LeaseTracker, ips: &'a LeaseTracker) -> Self {
        Self {
            config,
            macs,
            ips,
            max_available_mb: None,
            require_local_images: true,
        }
    }

    /// Upper bound for `memory_mb`, as reported live by the hypervisor.
    pub fn with_max_available(mut self, max_available_mb: Option<u64>) -> Self {
        self.max_available_mb = max_available_mb;
        self
    }

    /// When set (the default), remote images must already have been
    /// propagated into the instance directory.
    pub fn require_local_images(mut self, require: bool) -> Self {
        self.require_local_images = require;
        self
    }

    /// Validate `request` and return the resolved specification.
    pub fn validate(&self, request: &CreateRequest) -> Result<VmSpec> {
        validate_name(&request.name)?;

        let mut report = ValidationReport::new();
        report.ok(format!("name '{}' is valid", request.name));

        let partitions = partitions::resolve(
            &request.images,
            &request.imagemounts,
            &request.name,
            &self.config.images,
            self.require_local_images,
            &mut report,
        );

        let nics = nics::resolve(
            request.networking.as_deref(),
            &request.name,
            self.config,
            self.macs,
            self.ips,
            &mut report,
        );

        let memory_mb = self.check_memory(request.memory_mb, &mut report);
        let vcpus = self.check_vcpus(request.vcpus, &mut report);

        let kernel_name = request
            .kernel
            .clone()
            .or_else(|| self.config.kernels.default.clone());
        let kernel = self.check_boot_file("kernel", kernel_name.as_deref(), &mut report);
        let ramdisk = self.check_boot_file("ramdisk", request.ramdisk.as_deref(), &mut report);
        let kernel_args = self.check_kernel_args(request.kernel_args.as_deref(), &mut report);

        let mount_tasks = self.check_mount_tasks(request.mount_tasks.as_deref(), &mut report);

        if report.tripped {
            debug!(name = %request.name, errors = report.errors.len(), "validation tripped");
            return Err(WorkspaceError::Validation(report));
        }

        info!(
            name = %request.name,
            partitions = partitions.len(),
            nics = nics.len(),
            memory_mb,
            vcpus,
            "request validated"
        );

        Ok(VmSpec {
            name: request.name.clone(),
            memory_mb,
            vcpus,
            kernel,
            kernel_args,
            ramdisk,
            partitions,
            nics,
            mount_tasks,
        })
    }

    /// Resolve only the images of `request`, for propagation actions.
    pub fn resolve_partitions(&self, request: &CreateRequest) -> Result<Vec<Partition>> {
        validate_name(&request.name)?;
        let mut report = ValidationReport::new();
        let partitions = partitions::resolve(
            &request.images,
            &request.imagemounts,
            &request.name,
            &self.config.images,
            self.require_local_images,
            &mut report,
        );
        if report.tripped {
            return Err(WorkspaceError::Validation(report));
        }
        Ok(partitions)
    }

    fn check_memory(&self, requested: Option<u64>, report: &mut ValidationReport) -> u64 {
        let memory_mb = requested.unwrap_or(self.config.behavior.default_memory_mb);
        if memory_mb == 0 {
            report.error("memory must be greater than 0 MB");
            return 0;
        }
        match self.max_available_mb {
            Some(max) if memory_mb > max => {
                report.error(format!(
                    "requested {memory_mb} MB of memory but the hypervisor reports only {max} MB available"
                ));
            }
            Some(max) => report.ok(format!("memory {memory_mb} MB (of {max} MB available)")),
            None => report.ok(format!("memory {memory_mb} MB")),
        }
        memory_mb
    }

    fn check_vcpus(&self, requested: Option<u32>, report: &mut ValidationReport) -> u32 {
        let vcpus = requested.unwrap_or(1);
        let max = self.config.behavior.max_vcpus;
        if vcpus == 0 || vcpus > max {
            report.error(format!("vcpus must be between 1 and {max}, got {vcpus}"));
        } else {
            report.ok(format!("{vcpus} vcpu(s)"));
        }
        vcpus
    }

    /// Kernels and ramdisks are named by basename from the allow-list and
    /// resolved under the kernel directory.
    fn check_boot_file(
        &self,
        what: &str,
        name: Option<&str>,
        report: &mut ValidationReport,
    ) -> Option<PathBuf> {
        let name = match name {
            Some(name) => name,
            None => {
                report.ok(format!("no {what} requested"));
                return None;
            }
        };
        if name.contains('/') || name == ".." || name == "." {
            report.error(format!("{what} '{name}' must be a bare file name"));
            return None;
        }
        if !self.config.kernels.allowed.iter().any(|k| k == name) {
            report.error(format!("{what} '{name}' is not an allowed choice"));
            return None;
        }
        let path = self.config.kernels.dir.join(name);
        if !path.is_file() {
            report.error(format!("{what} '{name}' not found at {}", path.display()));
            return None;
        }
        report.ok(format!("{what} {}", path.display()));
        Some(path)
    }

    fn check_kernel_args(
        &self,
        requested: Option<&str>,
        report: &mut ValidationReport,
    ) -> Option<String> {
        let args = requested
            .map(str::to_string)
            .or_else(|| self.config.kernels.default_args.clone())?;
        if args.contains(['\n', '\r', '\'']) {
            report.error("kernel arguments must not contain quotes or newlines");
            return None;
        }
        report.ok(format!("kernel arguments '{args}'"));
        Some(args)
    }

    fn check_mount_tasks(&self, text: Option<&str>, report: &mut ValidationReport) -> Vec<MountTask> {
        let items = match text {
            Some(text) => split_list(text),
            None => return Vec::new(),
        };
        if items.is_empty() {
            return Vec::new();
        }
        if !self.config.mount.enabled {
            report.error("mount tasks were requested but mount-alter is not enabled");
            return Vec::new();
        }

        let mut tasks = Vec::new();
        for (i, item) in items.iter().enumerate() {
            let fields: Vec<&str> = item.split(';').collect();
            if fields.len() != 2 {
                report.error(format!("mount task #{i}: expected 'src;dst', got '{item}'"));
                continue;
            }
            let source = PathBuf::from(fields[0]);
            let guest_path = fields[1].to_string();

            let mut ok = true;
            if let Err(e) = ensure_absolute_clean(&source) {
                report.error(format!("mount task #{i}: source {e}"));
                ok = false;
            } else if !source.is_file() {
                report.error(format!(
                    "mount task #{i}: source {} is not a readable file",
                    source.display()
                ));
                ok = false;
            }
            if let Err(e) = ensure_absolute_clean(Path::new(&guest_path)) {
                report.error(format!("mount task #{i}: destination {e}"));
                ok = false;
            }
            if ok {
                report.ok(format!(
                    "mount task #{i}: {} -> {guest_path}",
                    source.display()
                ));
                tasks.push(MountTask { source, guest_path });
            }
        }
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseKind;

    #[test]
    fn name_boundaries() {
        assert!(validate_name("a").is_ok());
        assert!(validate_name(&"a".repeat(13)).is_ok());
        assert!(validate_name("vm-01").is_ok());

        for bad in ["1abc", "Abc", "a/b", "", "a_b", "-ab"] {
            let err = validate_name(bad).unwrap_err();
            assert!(matches!(err, WorkspaceError::InvalidInput(_)), "{bad:?}");
        }
        let err = validate_name(&"a".repeat(14)).unwrap_err();
        assert!(matches!(err, WorkspaceError::InvalidInput(_)));
    }

    #[test]
    fn split_list_drops_empty_items() {
        assert_eq!(split_list("a;;b;; ;;c"), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }

    fn fixture() -> (tempfile::TempDir, ControlConfig) {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = ControlConfig::default();
        config.images.instance_dir = tmp.path().join("instances");
        config.images.repo_dir = tmp.path().join("repo");
        config.kernels.dir = tmp.path().join("kernels");
        std::fs::create_dir_all(&config.images.repo_dir).unwrap();
        std::fs::create_dir_all(&config.kernels.dir).unwrap();
        std::fs::write(config.images.repo_dir.join("root.img"), b"img").unwrap();
        std::fs::write(config.kernels.dir.join("vmlinuz-xen"), b"k").unwrap();
        config.kernels.allowed = vec!["vmlinuz-xen".into()];
        (tmp, config)
    }

    fn request(name: &str) -> CreateRequest {
        CreateRequest {
            name: name.into(),
            images: "file://root.img".into(),
            imagemounts: "sda1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn minimal_request_resolves() {
        let (_tmp, config) = fixture();
        let macs = LeaseTracker::new(LeaseKind::Mac);
        let ips = LeaseTracker::new(LeaseKind::Ip);
        let spec = ResourceValidator::new(&config, &macs, &ips)
            .validate(&request("vm1"))
            .unwrap();
        assert_eq!(spec.memory_mb, config.behavior.default_memory_mb);
        assert_eq!(spec.vcpus, 1);
        assert_eq!(spec.partitions.len(), 1);
        assert!(spec.partitions[0].is_root);
        assert!(spec.kernel.is_none());
    }

    #[test]
    fn errors_are_aggregated() {
        let (_tmp, config) = fixture();
        let macs = LeaseTracker::new(LeaseKind::Mac);
        let ips = LeaseTracker::new(LeaseKind::Ip);
        let mut req = request("vm1");
        req.memory_mb = Some(0);
        req.vcpus = Some(99);
        req.kernel = Some("bzImage".into());

        let err = ResourceValidator::new(&config, &macs, &ips)
            .validate(&req)
            .unwrap_err();
        let WorkspaceError::Validation(report) = err else {
            panic!("expected validation error");
        };
        assert!(report.has_error_containing("memory"));
        assert!(report.has_error_containing("vcpus"));
        assert!(report.has_error_containing("bzImage"));
        assert_eq!(report.errors.len(), 3);
    }

    #[test]
    fn max_available_memory_is_enforced() {
        let (_tmp, config) = fixture();
        let macs = LeaseTracker::new(LeaseKind::Mac);
        let ips = LeaseTracker::new(LeaseKind::Ip);
        let mut req = request("vm1");
        req.memory_mb = Some(2048);

        let err = ResourceValidator::new(&config, &macs, &ips)
            .with_max_available(Some(1024))
            .validate(&req)
            .unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_INVALID_CONFIG);
    }

    #[test]
    fn allowed_kernel_is_resolved() {
        let (_tmp, config) = fixture();
        let macs = LeaseTracker::new(LeaseKind::Mac);
        let ips = LeaseTracker::new(LeaseKind::Ip);
        let mut req = request("vm1");
        req.kernel = Some("vmlinuz-xen".into());
        let spec = ResourceValidator::new(&config, &macs, &ips)
            .validate(&req)
            .unwrap();
        assert_eq!(spec.kernel, Some(config.kernels.dir.join("vmlinuz-xen")));
    }

    #[test]
    fn mount_tasks_require_collaborator() {
        let (tmp, mut config) = fixture();
        let macs = LeaseTracker::new(LeaseKind::Mac);
        let ips = LeaseTracker::new(LeaseKind::Ip);
        let src = tmp.path().join("authorized_keys");
        std::fs::write(&src, b"ssh-rsa AAAA").unwrap();
        let mut req = request("vm1");
        req.mount_tasks = Some(format!("{};/root/.ssh/authorized_keys", src.display()));

        let err = ResourceValidator::new(&config, &macs, &ips)
            .validate(&req)
            .unwrap_err();
        assert!(err.to_string().contains("mount-alter"), "got: {err}");

        config.mount.enabled = true;
        let spec = ResourceValidator::new(&config, &macs, &ips)
            .validate(&req)
            .unwrap();
        assert_eq!(spec.mount_tasks.len(), 1);
        assert_eq!(spec.mount_tasks[0].guest_path, "/root/.ssh/authorized_keys");
    }
}
