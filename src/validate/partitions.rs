use std::path::{Path, PathBuf};

use crate::config::ImagesConfig;
use crate::error::ValidationReport;
use crate::paths::ensure_no_traversal;
use crate::request::{ImageScheme, Partition};

use super::split_list;

const BLANK_SIZE_TOKEN: &str = "-size-";

/// Resolve `images`/`imagemounts` into partitions. The first image is root.
pub(super) fn resolve(
    images: &str,
    imagemounts: &str,
    vm_name: &str,
    config: &ImagesConfig,
    require_local: bool,
    report: &mut ValidationReport,
) -> Vec<Partition> {
    let images = split_list(images);
    let mounts = split_list(imagemounts);

    if images.is_empty() {
        report.error("no images were given");
        return Vec::new();
    }
    if images.len() != mounts.len() {
        report.error(format!(
            "{} image(s) but {} mountpoint(s) were given; the counts must match",
            images.len(),
            mounts.len()
        ));
        return Vec::new();
    }
    report.ok(format!(
        "{} image(s) matched with {} mountpoint(s)",
        images.len(),
        mounts.len()
    ));

    for (i, mount) in mounts.iter().enumerate() {
        if mounts[..i].contains(mount) {
            report.error(format!("mountpoint '{mount}' is used more than once"));
        }
    }

    let instance_dir = config.instance_dir.join(vm_name);
    images
        .iter()
        .zip(mounts.iter())
        .enumerate()
        .filter_map(|(i, (image, mount))| {
            resolve_one(
                i,
                image,
                mount,
                &instance_dir,
                &config.repo_dir,
                require_local,
                report,
            )
        })
        .collect()
}

fn valid_mountpoint(mount: &str) -> bool {
    let letters = mount.trim_end_matches(|c: char| c.is_ascii_digit());
    !letters.is_empty()
        && letters.len() <= 6
        && mount.len() <= 8
        && letters.chars().all(|c| c.is_ascii_lowercase())
}

fn resolve_one(
    index: usize,
    image: &str,
    mount: &str,
    instance_dir: &Path,
    repo_dir: &Path,
    require_local: bool,
    report: &mut ValidationReport,
) -> Option<Partition> {
    let is_root = index == 0;
    let mut fields = image.split(';');
    let locator = fields.next().unwrap_or_default();

    let mut is_readonly = false;
    let mut ok = true;
    for option in fields {
        match option.trim() {
            "ro" => is_readonly = true,
            "" => {}
            other => {
                report.error(format!("image #{index}: unknown option '{other}'"));
                ok = false;
            }
        }
    }

    if !valid_mountpoint(mount) {
        report.error(format!("image #{index}: invalid mountpoint '{mount}'"));
        ok = false;
    }

    let Some((scheme_text, path)) = locator.split_once("://") else {
        report.error(format!("image #{index}: '{locator}' has no scheme (expected scheme://path)"));
        return None;
    };
    let Some(scheme) = ImageScheme::parse(scheme_text) else {
        report.error(format!("image #{index}: unsupported scheme '{scheme_text}'"));
        return None;
    };
    if path.is_empty() {
        report.error(format!("image #{index}: empty path"));
        return None;
    }
    if let Err(e) = ensure_no_traversal(Path::new(path)) {
        report.error(format!("image #{index}: {e}"));
        return None;
    }

    let mut blankspace_mb = None;
    let resolved: Option<PathBuf> = match scheme {
        ImageScheme::File => resolve_file(index, path, instance_dir, repo_dir, report),
        ImageScheme::Gsiftp | ImageScheme::Scp => {
            // Compressed images are stored decompressed.
            let basename = Path::new(path)
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| instance_dir.join(n.strip_suffix(".gz").unwrap_or(n)));
            match basename {
                None => {
                    report.error(format!("image #{index}: '{locator}' names no file"));
                    None
                }
                Some(local) if require_local && !local.is_file() => {
                    report.error(format!(
                        "image #{index}: '{locator}' has not been propagated to {}",
                        local.display()
                    ));
                    None
                }
                Some(local) => Some(local),
            }
        }
        ImageScheme::BlankCreate => {
            if is_root {
                report.error("the root image cannot be a blankcreate partition");
                ok = false;
            }
            if is_readonly {
                report.error(format!("image #{index}: a blank partition cannot be read-only"));
                ok = false;
            }
            match parse_blank(path) {
                Some((name, size)) => {
                    blankspace_mb = Some(size);
                    Some(instance_dir.join(name))
                }
                None => {
                    report.error(format!(
                        "image #{index}: blankcreate expects '<name>{BLANK_SIZE_TOKEN}<MB>', got '{path}'"
                    ));
                    None
                }
            }
        }
    };

    let path = resolved?;
    if !ok {
        return None;
    }

    report.ok(format!(
        "image #{index}: {locator} -> {} as {mount}{}{}",
        path.display(),
        if is_readonly { " (ro)" } else { "" },
        if is_root { " [root]" } else { "" }
    ));

    Some(Partition {
        scheme,
        source: locator.to_string(),
        path,
        mountpoint: mount.to_string(),
        is_readonly,
        is_root,
        needs_propagation: scheme.is_remote(),
        blankspace_mb,
    })
}

/// Absolute paths must exist as given. Relative paths are looked up in the
/// VM's instance directory, then in the image repository.
fn resolve_file(
    index: usize,
    path: &str,
    instance_dir: &Path,
    repo_dir: &Path,
    report: &mut ValidationReport,
) -> Option<PathBuf> {
    let path = Path::new(path);
    if path.is_absolute() {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        report.error(format!("image #{index}: {} does not exist", path.display()));
        return None;
    }

    let candidates = [instance_dir.join(path), repo_dir.join(path)];
    if let Some(found) = candidates.iter().find(|c| c.is_file()) {
        return Some(found.clone());
    }
    report.error(format!(
        "image #{index}: {} not found in {} or {}",
        path.display(),
        instance_dir.display(),
        repo_dir.display()
    ));
    None
}

/// `scratch-size-512` -> `("scratch", 512)`.
fn parse_blank(path: &str) -> Option<(&str, u64)> {
    let (name, size) = path.rsplit_once(BLANK_SIZE_TOKEN)?;
    let size: u64 = size.parse().ok()?;
    let name_ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    (name_ok && size > 0).then_some((name, size))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tmp: &Path) -> ImagesConfig {
        let config = ImagesConfig {
            instance_dir: tmp.join("instances"),
            repo_dir: tmp.join("repo"),
        };
        std::fs::create_dir_all(config.instance_dir.join("vm1")).unwrap();
        std::fs::create_dir_all(&config.repo_dir).unwrap();
        std::fs::write(config.repo_dir.join("root.img"), b"repo").unwrap();
        std::fs::write(config.repo_dir.join("data.img"), b"repo").unwrap();
        config
    }

    #[test]
    fn count_mismatch_short_circuits() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());

        let mut report = ValidationReport::new();
        let parts = resolve("file://root.img;;file://data.img", "sda1", "vm1", &config, true, &mut report);
        assert!(parts.is_empty());
        assert!(report.tripped);
        assert_eq!(report.errors.len(), 1);
        assert!(report.has_error_containing("2 image(s) but 1 mountpoint(s)"));

        let mut report = ValidationReport::new();
        resolve("file://root.img", "sda1;;sda2", "vm1", &config, true, &mut report);
        assert!(report.has_error_containing("1 image(s) but 2 mountpoint(s)"));
    }

    #[test]
    fn matching_counts_resolve() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());

        let mut report = ValidationReport::new();
        let parts = resolve(
            "file://root.img;;file://data.img;ro",
            "sda1;;sda2",
            "vm1",
            &config,
            true,
            &mut report,
        );
        assert!(!report.tripped, "{report}");
        assert_eq!(parts.len(), 2);
        assert!(parts[0].is_root);
        assert!(!parts[1].is_root);
        assert!(parts[1].is_readonly);
        assert_eq!(parts[1].path, config.repo_dir.join("data.img"));
    }

    #[test]
    fn instance_dir_wins_over_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let local = config.instance_dir.join("vm1").join("root.img");
        std::fs::write(&local, b"instance").unwrap();

        let mut report = ValidationReport::new();
        let parts = resolve("file://root.img", "sda1", "vm1", &config, true, &mut report);
        assert_eq!(parts[0].path, local);
    }

    #[test]
    fn blankcreate_size_is_parsed() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());

        let mut report = ValidationReport::new();
        let parts = resolve(
            "file://root.img;;blankcreate://scratch-size-512",
            "sda1;;sdb1",
            "vm1",
            &config,
            true,
            &mut report,
        );
        assert!(!report.tripped, "{report}");
        assert_eq!(parts[1].blankspace_mb, Some(512));
        assert_eq!(parts[1].path, config.instance_dir.join("vm1").join("scratch"));
        assert_eq!(parse_blank("my-disk-size-10"), Some(("my-disk", 10)));
        assert_eq!(parse_blank("scratch-size-0"), None);
        assert_eq!(parse_blank("scratch"), None);
    }

    #[test]
    fn root_cannot_be_blank() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let mut report = ValidationReport::new();
        resolve("blankcreate://scratch-size-5", "sda1", "vm1", &config, true, &mut report);
        assert!(report.has_error_containing("root image cannot be a blankcreate"));
    }

    #[test]
    fn remote_images_need_propagation() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());

        let mut report = ValidationReport::new();
        resolve("scp://host/images/remote.img", "sda1", "vm1", &config, true, &mut report);
        assert!(report.has_error_containing("has not been propagated"));

        let mut report = ValidationReport::new();
        let parts = resolve("scp://host/images/remote.img", "sda1", "vm1", &config, false, &mut report);
        assert!(!report.tripped, "{report}");
        assert!(parts[0].needs_propagation);
        assert_eq!(parts[0].path, config.instance_dir.join("vm1").join("remote.img"));

        let mut report = ValidationReport::new();
        let parts = resolve("gsiftp://host/images/remote.img.gz", "sda1", "vm1", &config, false, &mut report);
        assert_eq!(parts[0].path, config.instance_dir.join("vm1").join("remote.img"));
    }

    #[test]
    fn every_bad_image_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let mut report = ValidationReport::new();
        resolve(
            "ftp://x/y;;root.img;;file://../etc/passwd",
            "sda1;;sda2;;sda2",
            "vm1",
            &config,
            true,
            &mut report,
        );
        assert!(report.has_error_containing("unsupported scheme 'ftp'"));
        assert!(report.has_error_containing("has no scheme"));
        assert!(report.has_error_containing("'..'"));
        assert!(report.has_error_containing("used more than once"));
    }
}
