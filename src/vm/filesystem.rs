//! Node-local disk files: blank partitions and instance directory cleanup.
//!
//! Only files under a VM's instance directory are ever created or removed
//! here; canonical repository images are never touched.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::paths::InstancePaths;
use crate::request::{ImageScheme, VmSpec};

// ---------------------------------------------------------------------------
// Blank partitions
// ---------------------------------------------------------------------------

/// Create a sparse file of `size_mb` megabytes at `path`. An existing file is
/// an error.
pub fn create_blank_partition(path: &Path, size_mb: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create parent directory {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("create blank partition {}", path.display()))?;
    file.set_len(size_mb * 1024 * 1024)
        .with_context(|| format!("size blank partition {}", path.display()))?;
    info!(path = %path.display(), size_mb, "blank partition created");
    Ok(())
}

/// Create every blankcreate partition of `spec`. Returns the files created so
/// far even on failure, so the caller can roll them back.
pub fn materialize_blank_partitions(
    spec: &VmSpec,
    paths: &InstancePaths,
    created: &mut Vec<PathBuf>,
) -> Result<()> {
    for partition in &spec.partitions {
        if partition.scheme != ImageScheme::BlankCreate {
            continue;
        }
        if !paths.owns(&spec.name, &partition.path) {
            bail!(
                "blank partition {} is outside the instance directory",
                partition.path.display()
            );
        }
        let size_mb = partition.blankspace_mb.unwrap_or_default();
        create_blank_partition(&partition.path, size_mb)?;
        created.push(partition.path.clone());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Cleanup
// ---------------------------------------------------------------------------

/// Remove `files` that live under the VM's instance directory. Failures are
/// logged, never returned.
pub fn remove_owned_files(paths: &InstancePaths, vm_name: &str, files: &[PathBuf]) {
    for file in files {
        if !paths.owns(vm_name, file) {
            warn!(vm = vm_name, path = %file.display(), "refusing to remove file outside instance directory");
            continue;
        }
        match std::fs::remove_file(file) {
            Ok(()) => info!(vm = vm_name, path = %file.display(), "removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(vm = vm_name, path = %file.display(), error = %e, "could not remove"),
        }
    }
}

/// Delete the whole instance directory of `vm_name`. Absent is fine.
pub fn remove_instance_dir(paths: &InstancePaths, vm_name: &str) -> Result<bool> {
    let dir = paths.vm_dir(vm_name);
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => {
            info!(vm = vm_name, dir = %dir.display(), "instance directory removed");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("remove instance directory {}", dir.display())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_partition_is_sized_and_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vm1").join("scratch");

        create_blank_partition(&path, 4).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * 1024 * 1024);
        assert!(create_blank_partition(&path, 4).is_err());
    }

    #[test]
    fn cleanup_stays_inside_instance_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = InstancePaths::new(tmp.path().join("instances"));
        let dir = paths.ensure_vm_dir("vm1").unwrap();
        let inside = dir.join("scratch");
        let outside = tmp.path().join("repo.img");
        std::fs::write(&inside, b"x").unwrap();
        std::fs::write(&outside, b"x").unwrap();

        remove_owned_files(&paths, "vm1", &[inside.clone(), outside.clone()]);
        assert!(!inside.exists());
        assert!(outside.exists());

        assert!(remove_instance_dir(&paths, "vm1").unwrap());
        assert!(!dir.exists());
        assert!(!remove_instance_dir(&paths, "vm1").unwrap());
    }
}
