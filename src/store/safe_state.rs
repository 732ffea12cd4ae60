//! Crash-safe state files with advisory locking
//!
//! Every state file write goes temp-file -> fsync -> rename so readers only
//! ever observe the old file or the new file, never a partial one. A `.bak`
//! sibling keeps the last known-good copy and a `.lock` sibling provides
//! mutual exclusion across processes (supervisor, bot, monitors).

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// Locks older than this are considered abandoned by a dead process
const STALE_LOCK_SECS: u64 = 60;

/// Polling step while waiting on a contended lock
const LOCK_POLL_MS: u64 = 50;

/// Thread/process-safe JSON state file
pub struct SafeState {
    path: PathBuf,
    lock_path: PathBuf,
    bak_path: PathBuf,
    tmp_path: PathBuf,
    lock_timeout: Duration,
    // Intra-process writers serialise here; the .lock file covers processes
    local: Mutex<()>,
}

/// Held advisory lock; removing the lock file on drop releases it
pub struct StateLockGuard<'a> {
    state: &'a SafeState,
    _local: std::sync::MutexGuard<'a, ()>,
}

impl Drop for StateLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.state.lock_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove lock file {:?}: {}", self.state.lock_path, e);
            }
        }
    }
}

impl SafeState {
    pub fn new<P: AsRef<Path>>(path: P, lock_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let ext = |suffix: &str| {
            let mut p = path.clone();
            let name = format!(
                "{}{}",
                p.file_name().and_then(|n| n.to_str()).unwrap_or("state"),
                suffix
            );
            p.set_file_name(name);
            p
        };

        Ok(Self {
            lock_path: ext(".lock"),
            bak_path: ext(".bak"),
            tmp_path: ext(".tmp"),
            path,
            lock_timeout,
            local: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the advisory lock, breaking stale locks left by dead processes
    pub fn lock(&self) -> Result<StateLockGuard<'_>> {
        let local = self
            .local
            .lock()
            .map_err(|_| Error::StateLock(self.path.display().to_string()))?;

        let start = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut f) => {
                    let _ = write!(f, "{}", std::process::id());
                    return Ok(StateLockGuard {
                        state: self,
                        _local: local,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.break_stale_lock() {
                        continue;
                    }
                    if start.elapsed() >= self.lock_timeout {
                        return Err(Error::StateLock(self.path.display().to_string()));
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_POLL_MS));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn break_stale_lock(&self) -> bool {
        let age = fs::metadata(&self.lock_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| SystemTime::now().duration_since(t).ok());

        match age {
            Some(age) if age.as_secs() > STALE_LOCK_SECS => {
                warn!(
                    "Removing stale lock file {:?} (age: {}s)",
                    self.lock_path,
                    age.as_secs()
                );
                fs::remove_file(&self.lock_path).is_ok()
            }
            _ => false,
        }
    }

    /// Read the file, falling back to `.bak` on corruption, then to `default`
    pub fn read<T: DeserializeOwned>(&self, default: T) -> T {
        let _guard = match self.lock() {
            Ok(g) => g,
            Err(e) => {
                error!("Could not lock {:?} for read: {}", self.path, e);
                return default;
            }
        };
        self.read_unlocked(default)
    }

    /// Read while the caller already holds the lock guard
    pub fn read_unlocked<T: DeserializeOwned>(&self, default: T) -> T {
        match self.try_parse(&self.path) {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(e) => {
                warn!("Corrupt state file {:?} ({}), trying backup", self.path, e);
                match self.try_parse(&self.bak_path) {
                    Ok(Some(value)) => value,
                    _ => {
                        warn!("No usable backup for {:?}; using default", self.path);
                        default
                    }
                }
            }
        }
    }

    fn try_parse<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Atomically replace the file: back up current, write temp, fsync, rename
    pub fn write<T: Serialize>(&self, value: &T) -> Result<()> {
        let _guard = self.lock()?;
        self.write_unlocked(value)
    }

    /// Write while the caller already holds the lock guard
    pub fn write_unlocked<T: Serialize>(&self, value: &T) -> Result<()> {
        if self.path.exists() {
            if let Err(e) = fs::copy(&self.path, &self.bak_path) {
                warn!("Failed to write backup for {:?}: {}", self.path, e);
            }
        }

        let data = serde_json::to_string_pretty(value)?;
        {
            let mut f = File::create(&self.tmp_path)?;
            f.write_all(data.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&self.tmp_path, &self.path)?;
        debug!("Wrote {} bytes to {:?}", data.len(), self.path);
        Ok(())
    }

    /// Lock, read, transform, write as one critical section
    pub fn update<T, F>(&self, default: T, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> T,
    {
        let _guard = self.lock()?;
        let current = self.read_unlocked(default);
        let next = f(current);
        self.write_unlocked(&next)?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
    struct Sample {
        count: u32,
        label: String,
    }

    fn state_in(dir: &tempfile::TempDir) -> SafeState {
        SafeState::new(dir.path().join("state.json"), Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_read_missing_returns_default() {
        let dir = tempdir().unwrap();
        let state = state_in(&dir);
        let value: Sample = state.read(Sample::default());
        assert_eq!(value, Sample::default());
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let dir = tempdir().unwrap();
        let state = state_in(&dir);
        let value = Sample {
            count: 7,
            label: "open".into(),
        };
        state.write(&value).unwrap();
        let read: Sample = state.read(Sample::default());
        assert_eq!(read, value);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_backup() {
        let dir = tempdir().unwrap();
        let state = state_in(&dir);
        let good = Sample {
            count: 1,
            label: "good".into(),
        };
        state.write(&good).unwrap();
        // Second write creates the .bak from the first
        state
            .write(&Sample {
                count: 2,
                label: "newer".into(),
            })
            .unwrap();

        // Corrupt the primary
        fs::write(state.path(), "{not json").unwrap();

        let read: Sample = state.read(Sample::default());
        assert_eq!(read.label, "good");
    }

    #[test]
    fn test_corrupt_without_backup_returns_default() {
        let dir = tempdir().unwrap();
        let state = state_in(&dir);
        fs::write(state.path(), "garbage").unwrap();
        let read: Sample = state.read(Sample::default());
        assert_eq!(read, Sample::default());
    }

    #[test]
    fn test_update_is_read_modify_write() {
        let dir = tempdir().unwrap();
        let state = state_in(&dir);
        state
            .write(&Sample {
                count: 1,
                label: "x".into(),
            })
            .unwrap();

        let next = state
            .update(Sample::default(), |mut s| {
                s.count += 1;
                s
            })
            .unwrap();
        assert_eq!(next.count, 2);

        let read: Sample = state.read(Sample::default());
        assert_eq!(read.count, 2);
    }

    #[test]
    fn test_lock_file_released_after_guard_drop() {
        let dir = tempdir().unwrap();
        let state = state_in(&dir);
        {
            let _guard = state.lock().unwrap();
            assert!(dir.path().join("state.json.lock").exists());
        }
        assert!(!dir.path().join("state.json.lock").exists());
    }

    #[test]
    fn test_stale_lock_is_broken() {
        let dir = tempdir().unwrap();
        let state = state_in(&dir);
        let lock_path = dir.path().join("state.json.lock");
        fs::write(&lock_path, "12345").unwrap();
        // Backdate the lock file so it reads as stale
        let stale = SystemTime::now() - Duration::from_secs(STALE_LOCK_SECS + 10);
        let f = File::options().write(true).open(&lock_path).unwrap();
        f.set_modified(stale).unwrap();
        drop(f);

        let guard = state.lock();
        assert!(guard.is_ok());
    }
}
