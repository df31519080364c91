//! Content-addressed disk cache for compiled libraries.
//!
//! One entry per cache key, laid out as `<root>/<key[0..2]>/<key>/` with
//! fixed file names inside. Entry status is derived from which files
//! exist, never held in memory — the processes sharing a cache directory
//! share no memory. The compiled binary is renamed into place last, so
//! its presence is the publication barrier: readers never observe a
//! partial artifact, and no lock is needed to read a ready entry.

mod lock;

pub use lock::{hostname, KeyLock, LockError, LockOwner, LockResult};

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compiler::CompileOutput;
use crate::config::SourceStorage;
use crate::key::CacheKey;

/// Store result type.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cache entry {key} is not ready")]
    NotReady { key: String },

    #[error("cache metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Entry status derived from marker files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// No trace of the key on disk.
    Missing,
    /// A builder holds the key's lock.
    Building,
    /// The compiled binary is published and complete.
    Ready,
    /// The last build attempt failed; a record of why is kept.
    Failed,
}

/// Record of a failed build attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub signature: String,
    pub detail: String,
    pub failed_at: DateTime<Utc>,
}

/// Metadata written alongside a published entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMeta {
    pub signature: String,
    pub published_at: DateTime<Utc>,
    pub binary_size: u64,
    pub source_size: u64,
}

pub const LIB_FILENAME: &str = "lib.so";
pub const SOURCE_FILENAME: &str = "source.cpp";
pub const SOURCE_GZ_FILENAME: &str = "source.cpp.gz";
pub const LOG_FILENAME: &str = "build.log";
pub const FAILED_FILENAME: &str = "failed.json";
pub const META_FILENAME: &str = "meta.json";

/// Signature-keyed disk store shared between processes.
///
/// The root path is always injected; many independent stores can coexist
/// in one process (and do, in tests).
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    source_storage: SourceStorage,
}

impl Store {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// Verifies the directory is writable up front so misconfiguration
    /// surfaces here rather than mid-build.
    pub fn open(root: impl AsRef<Path>, source_storage: SourceStorage) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        // Unique name: concurrent opens of a shared root must not race
        // on each other's probe.
        let probe = root.join(format!(".store_probe.{}", uuid::Uuid::new_v4()));
        File::create(&probe)?;
        fs::remove_file(&probe)?;

        Ok(Self {
            root,
            source_storage,
        })
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one key's entry files (and its lock).
    pub fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.fanout_prefix()).join(key.as_str())
    }

    /// Path of the key's compiled binary.
    pub fn library_path(&self, key: &CacheKey) -> PathBuf {
        self.entry_dir(key).join(LIB_FILENAME)
    }

    /// Path of the key's build log.
    pub fn log_path(&self, key: &CacheKey) -> PathBuf {
        self.entry_dir(key).join(LOG_FILENAME)
    }

    /// Derive the entry's status from the files on disk.
    ///
    /// `Ready` wins over everything: once the binary is in place the
    /// entry is complete no matter what else is lying around.
    pub fn lookup(&self, key: &CacheKey) -> EntryStatus {
        let dir = self.entry_dir(key);
        if dir.join(LIB_FILENAME).exists() {
            return EntryStatus::Ready;
        }
        if dir.join(FAILED_FILENAME).exists() {
            return EntryStatus::Failed;
        }
        if dir.join(KeyLock::LOCK_FILENAME).exists() {
            return EntryStatus::Building;
        }
        EntryStatus::Missing
    }

    /// Paths to the binary and (if retained) source of a ready entry.
    pub fn open_for_read(&self, key: &CacheKey) -> StoreResult<(PathBuf, Option<PathBuf>)> {
        if self.lookup(key) != EntryStatus::Ready {
            return Err(StoreError::NotReady {
                key: key.as_str().to_string(),
            });
        }
        let dir = self.entry_dir(key);
        let source = [SOURCE_FILENAME, SOURCE_GZ_FILENAME]
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists());
        Ok((dir.join(LIB_FILENAME), source))
    }

    /// Publish a completed build atomically.
    ///
    /// Ancillary files (log, source, metadata) land first; the binary is
    /// written to a temporary name and renamed into place as the final
    /// step. Concurrent readers see either the previous state or the
    /// complete new one, never a mix.
    pub fn publish(
        &self,
        key: &CacheKey,
        signature: &str,
        source: &str,
        output: &CompileOutput,
    ) -> StoreResult<PathBuf> {
        let dir = self.entry_dir(key);
        fs::create_dir_all(&dir)?;

        fs::write(dir.join(LOG_FILENAME), &output.log)?;
        self.write_source(&dir, source)?;

        let meta = EntryMeta {
            signature: signature.to_string(),
            published_at: Utc::now(),
            binary_size: output.binary.len() as u64,
            source_size: source.len() as u64,
        };
        atomic_write(&dir, META_FILENAME, &serde_json::to_vec_pretty(&meta)?)?;

        let lib_path = dir.join(LIB_FILENAME);
        let tmp = dir.join(format!("{}.tmp.{}", LIB_FILENAME, std::process::id()));
        let committed = (|| -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&output.binary)?;
            file.sync_all()?;
            fs::rename(&tmp, &lib_path)
        })();
        if let Err(e) = committed {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        // A failure marker from an earlier attempt is superseded; lookup
        // already prefers the binary, so ordering after the rename keeps
        // the visible state monotone.
        remove_if_present(&dir.join(FAILED_FILENAME))?;

        Ok(lib_path)
    }

    fn write_source(&self, dir: &Path, source: &str) -> StoreResult<()> {
        match self.source_storage {
            SourceStorage::Keep => {
                atomic_write(dir, SOURCE_FILENAME, source.as_bytes())?;
                remove_if_present(&dir.join(SOURCE_GZ_FILENAME))?;
            }
            SourceStorage::Compress => {
                let tmp = dir.join(format!("{}.tmp.{}", SOURCE_GZ_FILENAME, std::process::id()));
                let committed = (|| -> io::Result<()> {
                    let file = File::create(&tmp)?;
                    let mut encoder = GzEncoder::new(file, Compression::default());
                    encoder.write_all(source.as_bytes())?;
                    encoder.finish()?.sync_all()?;
                    fs::rename(&tmp, dir.join(SOURCE_GZ_FILENAME))
                })();
                if let Err(e) = committed {
                    let _ = fs::remove_file(&tmp);
                    return Err(e.into());
                }
                remove_if_present(&dir.join(SOURCE_FILENAME))?;
            }
            SourceStorage::Delete => {
                remove_if_present(&dir.join(SOURCE_FILENAME))?;
                remove_if_present(&dir.join(SOURCE_GZ_FILENAME))?;
            }
        }
        Ok(())
    }

    /// Read back the stored source, decompressing when needed.
    ///
    /// Off the hot load path; only used when the source is inspected or
    /// redistributed.
    pub fn read_source(&self, key: &CacheKey) -> StoreResult<Option<String>> {
        let dir = self.entry_dir(key);

        let plain = dir.join(SOURCE_FILENAME);
        if plain.exists() {
            return Ok(Some(fs::read_to_string(&plain)?));
        }

        let gz = dir.join(SOURCE_GZ_FILENAME);
        if gz.exists() {
            let mut text = String::new();
            GzDecoder::new(File::open(&gz)?).read_to_string(&mut text)?;
            return Ok(Some(text));
        }

        Ok(None)
    }

    /// Record a failed build attempt.
    ///
    /// Never leaves a ready-looking entry: only the failure marker and
    /// the log are written.
    pub fn mark_failed(
        &self,
        key: &CacheKey,
        signature: &str,
        detail: &str,
        log: Option<&str>,
    ) -> StoreResult<()> {
        let dir = self.entry_dir(key);
        fs::create_dir_all(&dir)?;

        if let Some(log) = log {
            fs::write(dir.join(LOG_FILENAME), log)?;
        }
        let record = FailureRecord {
            signature: signature.to_string(),
            detail: detail.to_string(),
            failed_at: Utc::now(),
        };
        atomic_write(&dir, FAILED_FILENAME, &serde_json::to_vec_pretty(&record)?)?;
        Ok(())
    }

    /// The failure record for the key, if one exists and parses.
    pub fn read_failure(&self, key: &CacheKey) -> Option<FailureRecord> {
        let bytes = fs::read(self.entry_dir(key).join(FAILED_FILENAME)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Clear a failure marker so the next attempt treats the entry as
    /// missing.
    pub fn clear_failed(&self, key: &CacheKey) -> StoreResult<()> {
        remove_if_present(&self.entry_dir(key).join(FAILED_FILENAME))?;
        Ok(())
    }

    /// The published entry metadata, if present and parseable.
    pub fn read_meta(&self, key: &CacheKey) -> Option<EntryMeta> {
        let bytes = fs::read(self.entry_dir(key).join(META_FILENAME)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

/// Write-to-temp-then-rename within `dir`; rename on one filesystem is
/// the atomicity primitive.
fn atomic_write(dir: &Path, filename: &str, content: &[u8]) -> io::Result<()> {
    let final_path = dir.join(filename);
    let tmp = dir.join(format!(".{}.tmp", filename));
    fs::write(&tmp, content)?;
    fs::rename(&tmp, &final_path)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
