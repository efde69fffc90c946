//! Moving images between remote repositories and node-local storage.
//!
//! Propagation copies `scp://` and `gsiftp://` images into the VM's instance
//! directory before boot; unpropagation copies them back (to the original
//! location or an explicit target) after the VM is gone. Images whose remote
//! name ends in `.gz` are decompressed with `gzip -d` after the copy, and
//! recompressed before being pushed back to a `.gz` target.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{info, warn};
use url::Url;

use crate::config::TransferConfig;
use crate::exec::CommandRunner;
use crate::request::{ImageScheme, Partition};

#[async_trait]
pub trait ImageTransfer: Send + Sync {
    /// Copy the remote image of `partition` to `partition.path`.
    async fn fetch(&self, partition: &Partition) -> Result<()>;

    /// Copy `partition.path` to `target` (a `scp://` or `gsiftp://` URL).
    async fn push(&self, partition: &Partition, target: &str) -> Result<()>;
}

/// `scp://[user@]host/path` to the `[user@]host:/path` form scp expects.
pub fn scp_location(url: &str) -> Result<String> {
    let parsed = Url::parse(url).with_context(|| format!("invalid scp url '{url}'"))?;
    if parsed.scheme() != "scp" {
        bail!("'{url}' is not an scp:// url");
    }
    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .with_context(|| format!("scp url '{url}' has no host"))?;
    let user = match parsed.username() {
        "" => String::new(),
        user => format!("{user}@"),
    };
    Ok(format!("{user}{host}:{}", parsed.path()))
}

fn gz_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".gz");
    PathBuf::from(name)
}

/// Where a fetched image lands before decompression.
fn download_path(partition: &Partition) -> PathBuf {
    if partition.source.ends_with(".gz") {
        gz_sibling(&partition.path)
    } else {
        partition.path.clone()
    }
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// [`ImageTransfer`] backed by `scp`, `globus-url-copy` and `gzip`.
pub struct CommandTransfer {
    runner: CommandRunner,
    config: TransferConfig,
}

impl CommandTransfer {
    pub fn new(runner: &CommandRunner, config: TransferConfig) -> Self {
        Self {
            runner: runner.with_timeout(std::time::Duration::from_secs(config.timeout_secs)),
            config,
        }
    }

    async fn copy(&self, scheme: ImageScheme, from: String, to: String) -> Result<()> {
        let (program, args) = match scheme {
            ImageScheme::Scp => (&self.config.scp, vec!["-q".to_string(), "-B".to_string(), from, to]),
            ImageScheme::Gsiftp => (&self.config.globus_url_copy, vec![from, to]),
            other => bail!("{} images are not transferred", other.as_str()),
        };
        self.runner.run_checked(program, &args, "image transfer").await?;
        Ok(())
    }

    /// `gzip -k` the local image next to itself, keeping the original.
    async fn compress(&self, path: &Path) -> Result<PathBuf> {
        let args = vec!["-k".to_string(), "-f".to_string(), path.display().to_string()];
        self.runner
            .run_checked(&self.config.gzip, &args, "image compression")
            .await?;
        Ok(gz_sibling(path))
    }
}

#[async_trait]
impl ImageTransfer for CommandTransfer {
    async fn fetch(&self, partition: &Partition) -> Result<()> {
        let download = download_path(partition);
        if let Some(parent) = download.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }

        let (from, to) = match partition.scheme {
            ImageScheme::Scp => (scp_location(&partition.source)?, download.display().to_string()),
            ImageScheme::Gsiftp => (partition.source.clone(), file_url(&download)),
            other => bail!("{} images are not propagated", other.as_str()),
        };
        self.copy(partition.scheme, from, to).await?;

        if download != partition.path {
            let args = vec!["-d".to_string(), "-f".to_string(), download.display().to_string()];
            self.runner
                .run_checked(&self.config.gzip, &args, "image decompression")
                .await?;
        }
        info!(source = %partition.source, path = %partition.path.display(), "image propagated");
        Ok(())
    }

    async fn push(&self, partition: &Partition, target: &str) -> Result<()> {
        let scheme = target
            .split_once("://")
            .and_then(|(s, _)| ImageScheme::parse(s))
            .filter(|s| s.is_remote())
            .with_context(|| format!("unpropagation target '{target}' is not scp:// or gsiftp://"))?;

        let staged = if target.ends_with(".gz") {
            Some(self.compress(&partition.path).await?)
        } else {
            None
        };
        let local = staged.as_deref().unwrap_or(partition.path.as_path());

        let (from, to) = match scheme {
            ImageScheme::Scp => (local.display().to_string(), scp_location(target)?),
            _ => (file_url(local), target.to_string()),
        };
        let copied = self.copy(scheme, from, to).await;

        if let Some(staged) = &staged {
            if let Err(e) = tokio::fs::remove_file(staged).await {
                warn!(path = %staged.display(), error = %e, "could not remove compressed copy");
            }
        }
        copied?;
        info!(path = %partition.path.display(), target, compressed = staged.is_some(), "image unpropagated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(source: &str, path: &str) -> Partition {
        Partition {
            scheme: ImageScheme::Scp,
            source: source.into(),
            path: PathBuf::from(path),
            mountpoint: "sda1".into(),
            is_readonly: false,
            is_root: true,
            needs_propagation: true,
            blankspace_mb: None,
        }
    }

    #[test]
    fn scp_urls_become_host_paths() {
        assert_eq!(
            scp_location("scp://repo.example.org/images/root.img").unwrap(),
            "repo.example.org:/images/root.img"
        );
        assert_eq!(
            scp_location("scp://nimbus@repo/images/root.img").unwrap(),
            "nimbus@repo:/images/root.img"
        );
        assert!(scp_location("gsiftp://repo/images/root.img").is_err());
    }

    #[test]
    fn gzipped_images_download_beside_target() {
        let p = partition("scp://repo/images/root.img.gz", "/inst/vm1/root.img");
        assert_eq!(download_path(&p), PathBuf::from("/inst/vm1/root.img.gz"));
        let p = partition("scp://repo/images/root.img", "/inst/vm1/root.img");
        assert_eq!(download_path(&p), PathBuf::from("/inst/vm1/root.img"));
    }

    #[tokio::test]
    async fn fetch_runs_configured_program() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("args");
        let script = tmp.path().join("fake-scp");
        std::fs::write(&script, format!("echo \"$@\" > {}\n", log.display())).unwrap();

        let config = TransferConfig {
            scp: script,
            ..TransferConfig::default()
        };
        let runner = CommandRunner::new(Some(PathBuf::from("/bin/sh")), std::time::Duration::from_secs(5));
        let transfer = CommandTransfer::new(&runner, config);

        let target = tmp.path().join("vm1").join("root.img");
        let p = partition("scp://repo/images/root.img", target.to_str().unwrap());
        transfer.fetch(&p).await.unwrap();

        let args = std::fs::read_to_string(&log).unwrap();
        assert_eq!(args.trim(), format!("-q -B repo:/images/root.img {}", target.display()));
        assert!(target.parent().unwrap().is_dir());
    }

    #[tokio::test]
    async fn push_rejects_non_remote_targets() {
        let transfer = CommandTransfer::new(
            &CommandRunner::direct(std::time::Duration::from_secs(1)),
            TransferConfig::default(),
        );
        let p = partition("scp://repo/images/root.img", "/inst/vm1/root.img");
        let err = transfer.push(&p, "file:///tmp/x").await.unwrap_err();
        assert!(err.to_string().contains("not scp:// or gsiftp://"));
    }

    #[tokio::test]
    async fn push_to_gz_target_sends_a_compressed_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let scp = dir.join("fake-scp");
        let gzip = dir.join("fake-gzip");
        std::fs::write(&scp, format!("echo \"$@\" > {}\n", dir.join("scp.args").display())).unwrap();
        std::fs::write(
            &gzip,
            format!(
                "echo \"$@\" > {}\nfor a in \"$@\"; do last=\"$a\"; done\ncp \"$last\" \"$last.gz\"\n",
                dir.join("gzip.args").display()
            ),
        )
        .unwrap();

        let config = TransferConfig {
            scp,
            gzip,
            ..TransferConfig::default()
        };
        let runner = CommandRunner::new(Some(PathBuf::from("/bin/sh")), std::time::Duration::from_secs(5));
        let transfer = CommandTransfer::new(&runner, config);

        let image = dir.join("root.img");
        std::fs::write(&image, b"raw image").unwrap();
        let p = partition("scp://repo/images/root.img.gz", image.to_str().unwrap());

        transfer.push(&p, "scp://repo/images/root.img.gz").await.unwrap();
        let gzip_args = std::fs::read_to_string(dir.join("gzip.args")).unwrap();
        assert_eq!(gzip_args.trim(), format!("-k -f {}", image.display()));
        let scp_args = std::fs::read_to_string(dir.join("scp.args")).unwrap();
        assert_eq!(
            scp_args.trim(),
            format!("-q -B {}.gz repo:/images/root.img.gz", image.display())
        );
        assert!(image.is_file());
        assert!(!dir.join("root.img.gz").exists());

        // A plain target gets the raw image.
        std::fs::remove_file(dir.join("gzip.args")).unwrap();
        transfer.push(&p, "scp://repo/images/saved.img").await.unwrap();
        let scp_args = std::fs::read_to_string(dir.join("scp.args")).unwrap();
        assert_eq!(scp_args.trim(), format!("-q -B {} repo:/images/saved.img", image.display()));
        assert!(!dir.join("gzip.args").exists());
    }
}
