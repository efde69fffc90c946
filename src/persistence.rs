//! Crash-safe, single-record file persistence.
//!
//! Each key maps to exactly one file, `<dir>/<key>`, holding one JSON record.
//! Writes go to a hidden temporary sibling which is fsynced and renamed over
//! the target, so readers only ever observe a complete old or new record.
//! A missing file means "no record".
//!
//! Mutual exclusion between concurrent `workspace-control` invocations is
//! provided by [`StoreLock`], an advisory exclusive `flock(2)` on
//! `<dir>/.lock` that callers hold across the whole read-modify-write cycle.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use crate::error::{Result, WorkspaceError};
use crate::lease::{LeaseKind, LeaseTracker, TrackerRecord};
use crate::paths::ensure_no_traversal;

const LOCK_FILE: &str = ".lock";

/// Outcome of reading a record.
#[derive(Debug)]
pub enum Loaded<T> {
    Present(T),
    Absent,
    /// The file exists but could not be decoded.
    Corrupt(String),
}

#[derive(Debug, Clone)]
pub struct PersistenceStore {
    dir: PathBuf,
}

impl PersistenceStore {
    /// Open (creating if needed) the persistence directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        ensure_no_traversal(&dir)
            .map_err(|e| WorkspaceError::InvalidConfig(format!("persistence directory: {e}")))?;
        std::fs::create_dir_all(&dir).map_err(|e| {
            WorkspaceError::storage(format!("creating persistence dir {}", dir.display()), e)
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && !key.contains('/')
            && !key.contains('\\');
        if !valid {
            return Err(WorkspaceError::Programming(format!(
                "invalid persistence key '{key}'"
            )));
        }
        Ok(self.dir.join(key))
    }

    /// Take the advisory directory lock, blocking until it is available.
    pub fn lock(&self) -> Result<StoreLock> {
        StoreLock::acquire(&self.dir.join(LOCK_FILE))
    }

    /// [`lock`](Self::lock) on the blocking pool, for async callers.
    pub async fn lock_async(&self) -> Result<StoreLock> {
        let path = self.dir.join(LOCK_FILE);
        tokio::task::spawn_blocking(move || StoreLock::acquire(&path))
            .await
            .map_err(|e| WorkspaceError::Programming(format!("lock task failed: {e}")))?
    }

    /// Serialize `record` to `<dir>/<key>`, replacing any previous record.
    pub fn save<T: Serialize>(&self, key: &str, record: &T) -> Result<()> {
        let path = self.path_for(key)?;
        let data = serde_json::to_vec_pretty(record).map_err(|e| {
            WorkspaceError::Programming(format!("serializing record '{key}': {e}"))
        })?;

        let tmp_path = self.dir.join(format!(".{key}.tmp"));
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
            std::fs::rename(&tmp_path, &path)?;
            Ok(())
        };
        write().map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            WorkspaceError::storage(format!("writing record {}", path.display()), e)
        })?;

        debug!(key, path = %path.display(), "record saved");
        Ok(())
    }

    /// Read `<dir>/<key>`, distinguishing absent from undecodable.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Loaded<T>> {
        let path = self.path_for(key)?;
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Loaded::Absent),
            Err(e) => {
                return Err(WorkspaceError::storage(
                    format!("reading record {}", path.display()),
                    e,
                ));
            }
        };
        match serde_json::from_slice(&data) {
            Ok(record) => Ok(Loaded::Present(record)),
            Err(e) => Ok(Loaded::Corrupt(e.to_string())),
        }
    }

    /// Like [`PersistenceStore::load`] but a corrupt record is an error.
    pub fn load_record<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.load(key)? {
            Loaded::Present(record) => Ok(Some(record)),
            Loaded::Absent => Ok(None),
            Loaded::Corrupt(cause) => Err(WorkspaceError::unexpected(format!(
                "record '{key}' in {} is corrupt: {cause}",
                self.dir.display()
            ))),
        }
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key)?.exists())
    }

    /// Delete `<dir>/<key>`. An already-absent record is not an error.
    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(key, "record removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkspaceError::storage(
                format!("removing record {}", path.display()),
                e,
            )),
        }
    }

    /// Load the tracker for `kind`.
    ///
    /// A missing file yields an empty tracker. A file that cannot be decoded
    /// is replaced by a new, persisted, empty tracker: this is the
    /// disaster-recovery path and risks double allocation until the leases
    /// are reconciled by an administrator.
    pub fn load_tracker(&self, kind: LeaseKind) -> Result<LeaseTracker> {
        let decoded = match self.load::<TrackerRecord>(kind.key())? {
            Loaded::Present(record) => {
                LeaseTracker::from_record(kind, record).map_err(|e| format!("{e:#}"))
            }
            Loaded::Absent => return Ok(LeaseTracker::new(kind)),
            Loaded::Corrupt(cause) => Err(cause),
        };

        match decoded {
            Ok(tracker) => Ok(tracker),
            Err(cause) => {
                error!(
                    kind = %kind,
                    key = kind.key(),
                    cause = %cause,
                    "DISASTER RECOVERY: lease tracker is corrupt, resetting to empty; \
                     leases held by running VMs may be handed out twice until reconciled"
                );
                let tracker = LeaseTracker::new(kind);
                self.save_tracker(&tracker)?;
                Ok(tracker)
            }
        }
    }

    pub fn save_tracker(&self, tracker: &LeaseTracker) -> Result<()> {
        self.save(tracker.kind().key(), &tracker.to_record())
    }
}

// ---------------------------------------------------------------------------
// Advisory lock
// ---------------------------------------------------------------------------

/// Exclusive `flock` on the store's lock file, released on drop.
#[derive(Debug)]
pub struct StoreLock {
    _file: File,
    path: PathBuf,
}

impl StoreLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| WorkspaceError::storage(format!("opening lock {}", path.display()), e))?;

        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        loop {
            let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
            if result == 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(WorkspaceError::storage(
                    format!("locking {}", path.display()),
                    err,
                ));
            }
        }
        info!(path = %path.display(), "persistence lock acquired");
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the flock.
        debug!(path = %self.path.display(), "persistence lock released");
    }
}
