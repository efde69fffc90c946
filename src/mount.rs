//! `mount-alter.sh` collaborator: copies files into a VM's root image before
//! it boots.
//!
//! Invocation: `mount-alter.sh one <image> <mount-dir> <source> <guest-path>`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::info;

use crate::exec::CommandRunner;
use crate::request::MountTask;

pub struct MountAlter {
    runner: CommandRunner,
    program: PathBuf,
    mount_dir: PathBuf,
}

impl MountAlter {
    pub fn new(runner: CommandRunner, program: PathBuf, mount_dir: PathBuf) -> Self {
        Self {
            runner,
            program,
            mount_dir,
        }
    }

    pub fn args(&self, image: &Path, task: &MountTask) -> Vec<String> {
        vec![
            "one".to_string(),
            image.display().to_string(),
            self.mount_dir.display().to_string(),
            task.source.display().to_string(),
            task.guest_path.clone(),
        ]
    }

    /// Apply `tasks` to `image` in order, stopping at the first failure.
    pub async fn apply(&self, image: &Path, tasks: &[MountTask]) -> Result<()> {
        for task in tasks {
            self.runner
                .run_checked(&self.program, &self.args(image, task), "mount task")
                .await?;
            info!(
                image = %image.display(),
                source = %task.source.display(),
                guest_path = %task.guest_path,
                "mount task applied"
            );
        }
        Ok(())
    }
}
