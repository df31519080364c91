//! Per-key build locks.
//!
//! Mutual exclusion between processes sharing a physical cache directory
//! is a lock file next to the entry, created atomically (`create_new`)
//! and holding a serialized owner record. A waiting process can detect a
//! lock left behind by a crashed builder — owner process gone on this
//! host, or record older than the configured staleness bound — and
//! reclaim it. Reclamation renames the file aside before removing it, so
//! only one contender wins and a freshly re-created lock is never
//! deleted by a racing reclaimer.
//!
//! The lock is advisory: at most one holder per (key, physical directory)
//! at any instant, released on drop on every exit path.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lock result type.
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock timeout after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Identity of the process holding a lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockOwner {
    fn current(host: &str) -> Self {
        Self {
            pid: std::process::id(),
            host: host.to_string(),
            acquired_at: Utc::now(),
        }
    }

    fn age(&self) -> Duration {
        (Utc::now() - self.acquired_at).to_std().unwrap_or_default()
    }
}

/// Exclusive per-key build lock, released when dropped.
pub struct KeyLock {
    lock_path: PathBuf,
}

impl KeyLock {
    /// Lock file name, kept alongside the entry it guards.
    pub const LOCK_FILENAME: &'static str = ".build.lock";

    /// Acquire the lock for the entry at `entry_dir`.
    ///
    /// Creates the directory if needed and waits up to `timeout`,
    /// reclaiming locks that look abandoned under the `stale_after`
    /// bound. Callers must re-check the entry's status after acquisition:
    /// another builder may have published while this process waited or
    /// reclaimed.
    pub fn acquire(
        entry_dir: &Path,
        host: &str,
        timeout: Duration,
        stale_after: Duration,
    ) -> LockResult<Self> {
        fs::create_dir_all(entry_dir)?;

        let lock_path = entry_dir.join(Self::LOCK_FILENAME);
        let start = Instant::now();
        let poll_interval = Duration::from_millis(50);
        let mut warned = false;

        loop {
            match Self::try_create(&lock_path, host) {
                Ok(lock) => {
                    if warned {
                        eprintln!(
                            "[lock] acquired after {:.1}s contention: {}",
                            start.elapsed().as_secs_f64(),
                            lock_path.display()
                        );
                    }
                    return Ok(lock);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match Self::read_owner(&lock_path) {
                        Some(owner) if Self::is_stale(&owner, host, stale_after) => {
                            Self::reclaim(&lock_path, Some(&owner))?;
                            continue;
                        }
                        None if Self::mtime_age(&lock_path)
                            .map_or(false, |age| age >= stale_after) =>
                        {
                            // Unreadable record, e.g. a crash mid-write.
                            Self::reclaim(&lock_path, None)?;
                            continue;
                        }
                        _ => {}
                    }
                    if !warned && start.elapsed() > Duration::from_millis(500) {
                        eprintln!(
                            "[lock] WARNING: contention on {}, waiting...",
                            lock_path.display()
                        );
                        warned = true;
                    }
                }
                Err(e) => return Err(LockError::Io(e)),
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout(timeout));
            }
            std::thread::sleep(poll_interval);
        }
    }

    /// Atomically create the lock file with this process's owner record.
    fn try_create(lock_path: &Path, host: &str) -> io::Result<KeyLock> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)?;
        let owner = LockOwner::current(host);
        let record = serde_json::to_vec(&owner)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        file.write_all(&record)?;
        file.sync_all()?;
        Ok(KeyLock {
            lock_path: lock_path.to_path_buf(),
        })
    }

    fn read_owner(lock_path: &Path) -> Option<LockOwner> {
        let bytes = fs::read(lock_path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn mtime_age(lock_path: &Path) -> Option<Duration> {
        fs::metadata(lock_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| mtime.elapsed().ok())
    }

    /// A lock is stale when its owner is a dead process on this host, or
    /// when the record has outlived the staleness bound.
    fn is_stale(owner: &LockOwner, host: &str, stale_after: Duration) -> bool {
        if owner.host == host && !process_alive(owner.pid) {
            return true;
        }
        owner.age() >= stale_after
    }

    /// Remove a stale lock so acquisition can proceed.
    ///
    /// The record is re-read and compared to the stale observation, then
    /// the file is renamed aside and removed. The rename is the atomic
    /// step: exactly one contender wins it, and a lock that changed hands
    /// since the observation is left alone.
    fn reclaim(lock_path: &Path, observed: Option<&LockOwner>) -> LockResult<()> {
        let current = Self::read_owner(lock_path);
        match (observed, &current) {
            (Some(observed), Some(current)) if current == observed => {}
            (None, None) if lock_path.exists() => {}
            _ => return Ok(()), // changed hands since we looked
        }

        let side = lock_path.with_extension(format!("reclaim.{}", std::process::id()));
        match fs::rename(lock_path, &side) {
            Ok(()) => {
                match observed {
                    Some(owner) => eprintln!(
                        "[lock] reclaimed stale lock held by pid {} on {}: {}",
                        owner.pid,
                        owner.host,
                        lock_path.display()
                    ),
                    None => eprintln!(
                        "[lock] reclaimed unreadable stale lock: {}",
                        lock_path.display()
                    ),
                }
                let _ = fs::remove_file(&side);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()), // lost the race
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

/// Best-effort name of this host, for lock owner records.
#[cfg(unix)]
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|s| s.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(not(unix))]
pub fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No cheap liveness probe; the age bound alone decides staleness.
    true
}
