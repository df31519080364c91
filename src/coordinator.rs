//! Build coordination.
//!
//! One acquisition is a small state machine: check the store, elect a
//! role under the configured policy, and either build inside the per-key
//! lock or wait for a peer's publish. The builder re-checks the store
//! after acquiring the lock (another process may have finished first),
//! generates, compiles, and publishes atomically; the lock guard releases
//! on every exit path, including failures.
//!
//! Under the `root` policy the node roots additionally run one collective
//! exchange per acquisition so the broadcast set stays uniform even when
//! their cache directories disagree about the entry's state.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::compiler::{CompileError, CompileOutput, Compiler};
use crate::config::{BuildPolicy, CacheConfig};
use crate::distribute::{decode_frame, encode_frame, BuildFrame};
use crate::error::{CoordinatorError, GeneratorError, JitError};
use crate::group::{resolve_role, BuilderRole, GroupContext};
use crate::key::CacheKey;
use crate::store::{hostname, EntryStatus, KeyLock, LockError, Store};

use kiln_comm::Communicator;

/// How often waiters and reads of a contended entry re-poll the store.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A ready cache entry: the key plus the path to the compiled library.
///
/// The path always points at a complete artifact; loading it into the
/// process is the caller's concern.
#[derive(Debug, Clone)]
pub struct CachedLibrary {
    pub key: CacheKey,
    pub path: PathBuf,
}

/// Drives cache lookups and coordinated builds against one store.
pub struct BuildCoordinator<C> {
    store: Store,
    compiler: C,
    config: CacheConfig,
    host: String,
}

impl<C: Compiler> BuildCoordinator<C> {
    /// Open the configured cache root and wrap it with `compiler`.
    pub fn open(compiler: C, config: CacheConfig) -> Result<Self, JitError> {
        let store = Store::open(&config.cache_root, config.source_storage)?;
        Ok(Self::new(store, compiler, config))
    }

    /// Wrap an already opened store. The store's root should match
    /// `config.cache_root`; tests use this to share a store between
    /// coordinators.
    pub fn new(store: Store, compiler: C, config: CacheConfig) -> Self {
        let host = hostname();
        Self {
            store,
            compiler,
            config,
            host,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Return the compiled library for `signature`, building on demand.
    ///
    /// On a hit the generator is never invoked; that laziness is part of
    /// the contract, since generation may be expensive or side-effecting.
    /// On a miss the configured policy decides whether this process
    /// builds, receives the binary from the global builder, or waits for
    /// its node root. Every blocking step is bounded by the configured
    /// timeouts.
    ///
    /// `group` carries the per-communicator context established by
    /// [`GroupContext::establish`]; `None` means this process coordinates
    /// with nobody and always builds. Under `root` and `node` policies
    /// the call is collective: every member of the communicator must call
    /// it with the same signature.
    pub fn acquire<F>(
        &self,
        signature: &str,
        generate: F,
        group: Option<&GroupContext<'_>>,
    ) -> Result<CachedLibrary, JitError>
    where
        F: FnOnce(&str) -> Result<String, GeneratorError>,
    {
        let key = CacheKey::from_signature(signature);

        // Root-policy node roots coordinate before any early return, so
        // the collective set stays uniform across differing cache states.
        if let Some(ctx) = group {
            if self.config.policy == BuildPolicy::Root {
                let role = resolve_role(self.config.policy, ctx.topology())?;
                if role != BuilderRole::Waiter {
                    if let Some(roots) = ctx.roots_comm() {
                        return self.acquire_via_roots(&key, signature, generate, roots, role);
                    }
                }
            }
        }

        // CHECK: the hit path touches neither generator nor compiler.
        if self.store.lookup(&key) == EntryStatus::Ready {
            return self.hit(&key);
        }

        // ELECT
        let role = match group {
            Some(ctx) => resolve_role(self.config.policy, ctx.topology())?,
            None => BuilderRole::Builder,
        };

        match role {
            BuilderRole::Builder => {
                // Only the elected builder touches a leftover failure
                // marker; non-builders never mutate the shared entry.
                if self.store.lookup(&key) == EntryStatus::Failed {
                    self.handle_failed(&key, signature)?;
                }
                let (library, _) = self.build_locally(&key, signature, generate)?;
                Ok(library)
            }
            // Receivers only arise under `root` policy, handled above.
            BuilderRole::Receiver | BuilderRole::Waiter => self.wait_for_peer(&key, signature),
        }
    }

    fn hit(&self, key: &CacheKey) -> Result<CachedLibrary, JitError> {
        let (path, _) = self.store.open_for_read(key)?;
        Ok(CachedLibrary {
            key: key.clone(),
            path,
        })
    }

    /// A FAILED entry is either cleared for retry or surfaced, per
    /// configuration.
    fn handle_failed(&self, key: &CacheKey, signature: &str) -> Result<(), JitError> {
        if self.config.retry_failed {
            self.store.clear_failed(key)?;
            Ok(())
        } else {
            let detail = self
                .store
                .read_failure(key)
                .map(|f| f.detail)
                .unwrap_or_else(|| "unrecorded failure".to_string());
            Err(CoordinatorError::PriorFailure {
                signature: signature.to_string(),
                detail,
            }
            .into())
        }
    }

    /// The builder's critical section: LOCK, double-checked CHECK,
    /// GENERATE, COMPILE, PUBLISH, with the lock released on every path.
    ///
    /// Returns the published entry plus, when this process actually
    /// built, the in-memory result for distribution.
    fn build_locally<F>(
        &self,
        key: &CacheKey,
        signature: &str,
        generate: F,
    ) -> Result<(CachedLibrary, Option<(String, CompileOutput)>), JitError>
    where
        F: FnOnce(&str) -> Result<String, GeneratorError>,
    {
        let entry_dir = self.store.entry_dir(key);

        // LOCK, with bounded internal retry: a timeout usually means the
        // holder is still building, so re-check before trying again.
        let mut attempts = 0;
        let _lock = loop {
            match KeyLock::acquire(
                &entry_dir,
                &self.host,
                self.config.lock_timeout,
                self.config.stale_lock_timeout,
            ) {
                Ok(lock) => break lock,
                Err(LockError::Timeout(_)) if attempts < self.config.lock_retries => {
                    attempts += 1;
                    if self.store.lookup(key) == EntryStatus::Ready {
                        return Ok((self.hit(key)?, None));
                    }
                    eprintln!(
                        "[build] lock contention on {key} (attempt {attempts}), retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        };

        // Double-checked: a peer, or the previous holder of a reclaimed
        // lock, may have published while we contended.
        if self.store.lookup(key) == EntryStatus::Ready {
            return Ok((self.hit(key)?, None));
        }

        // GENERATE
        let source = match generate(signature) {
            Ok(source) => source,
            Err(e) => {
                self.record_failure(key, signature, &format!("generator failed: {e}"), None);
                return Err(JitError::Generator {
                    signature: signature.to_string(),
                    source: e,
                });
            }
        };

        // COMPILE
        let output = match self.compiler.compile(&source) {
            Ok(output) => output,
            Err(e) => {
                let log = match &e {
                    CompileError::CommandFailed { log, .. } => Some(log.as_str()),
                    _ => None,
                };
                self.record_failure(key, signature, &format!("compilation failed: {e}"), log);
                return Err(JitError::Compile {
                    signature: signature.to_string(),
                    source: e,
                });
            }
        };

        // PUBLISH
        let path = self.store.publish(key, signature, &source, &output)?;
        Ok((
            CachedLibrary {
                key: key.clone(),
                path,
            },
            Some((source, output)),
        ))
    }

    fn record_failure(&self, key: &CacheKey, signature: &str, detail: &str, log: Option<&str>) {
        if let Err(e) = self.store.mark_failed(key, signature, detail, log) {
            eprintln!("[build] could not record failure for {key}: {e}");
        }
    }

    /// WAIT: poll the store until a peer's build lands, fails, or the
    /// bound expires.
    fn wait_for_peer(&self, key: &CacheKey, signature: &str) -> Result<CachedLibrary, JitError> {
        let start = Instant::now();
        let started_at = Utc::now();
        let leftover_age = chrono::Duration::from_std(self.config.stale_lock_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        loop {
            match self.store.lookup(key) {
                EntryStatus::Ready => return self.hit(key),
                EntryStatus::Failed => {
                    // A marker substantially older than this call is a
                    // leftover from an earlier run that the elected
                    // builder clears before rebuilding; anything recent
                    // is this round's verdict.
                    let record = self.store.read_failure(key);
                    let leftover = record
                        .as_ref()
                        .is_some_and(|f| started_at - f.failed_at > leftover_age);
                    if !leftover || !self.config.retry_failed {
                        let detail = record
                            .map(|f| f.detail)
                            .unwrap_or_else(|| "unrecorded failure".to_string());
                        return Err(CoordinatorError::PeerBuildFailed {
                            signature: signature.to_string(),
                            detail,
                        }
                        .into());
                    }
                }
                EntryStatus::Missing | EntryStatus::Building => {}
            }

            if start.elapsed() >= self.config.wait_timeout {
                return Err(CoordinatorError::BuildTimeout {
                    signature: signature.to_string(),
                    waited: self.config.wait_timeout,
                }
                .into());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Root-policy path for node roots: agree on whether anyone needs a
    /// build, then move the result over the roots' broadcast.
    ///
    /// The vote keeps collective participation uniform: a root whose
    /// directory already has the entry still joins the broadcast when a
    /// sibling directory needs the bytes.
    fn acquire_via_roots<F>(
        &self,
        key: &CacheKey,
        signature: &str,
        generate: F,
        roots: &dyn Communicator,
        role: BuilderRole,
    ) -> Result<CachedLibrary, JitError>
    where
        F: FnOnce(&str) -> Result<String, GeneratorError>,
    {
        let local_ready = self.store.lookup(key) == EntryStatus::Ready;
        let votes = roots.allgather(u64::from(!local_ready)).map_err(JitError::Comm)?;
        let any_need = votes.iter().any(|&v| v != 0);

        if !any_need {
            return self.hit(key);
        }

        match role {
            BuilderRole::Builder => self.build_and_distribute(key, signature, generate, roots),
            BuilderRole::Receiver => self.receive_and_republish(key, signature, roots),
            // resolve_role never elects a waiter onto the roots path.
            BuilderRole::Waiter => self.wait_for_peer(key, signature),
        }
    }

    /// Global builder under `root` policy. Always completes the
    /// broadcast, shipping a failure frame when the build failed, so
    /// receivers fail fast instead of deadlocking.
    fn build_and_distribute<F>(
        &self,
        key: &CacheKey,
        signature: &str,
        generate: F,
        roots: &dyn Communicator,
    ) -> Result<CachedLibrary, JitError>
    where
        F: FnOnce(&str) -> Result<String, GeneratorError>,
    {
        let outcome: Result<(CachedLibrary, BuildFrame), JitError> = (|| {
            if self.store.lookup(key) == EntryStatus::Ready {
                // Another directory needs the bytes; serve them from the
                // local entry without rebuilding.
                return Ok((self.hit(key)?, self.frame_from_store(key)?));
            }
            if self.store.lookup(key) == EntryStatus::Failed {
                self.handle_failed(key, signature)?;
            }
            let (library, built) = self.build_locally(key, signature, generate)?;
            let frame = match built {
                Some((source, output)) => BuildFrame::built(source, output),
                None => self.frame_from_store(key)?,
            };
            Ok((library, frame))
        })();

        let frame = match &outcome {
            Ok((_, frame)) => frame.clone(),
            Err(e) => BuildFrame::Failed {
                detail: e.to_string(),
            },
        };
        // The builder is the lowest global rank, hence rank 0 here.
        roots
            .broadcast(0, Some(encode_frame(&frame)))
            .map_err(JitError::Comm)?;

        outcome.map(|(library, _)| library)
    }

    /// Non-builder node root under `root` policy: take the frame from
    /// the broadcast and fold it into the local store, republication
    /// happening strictly after the collective returns.
    fn receive_and_republish(
        &self,
        key: &CacheKey,
        signature: &str,
        roots: &dyn Communicator,
    ) -> Result<CachedLibrary, JitError> {
        let bytes = roots.broadcast(0, None).map_err(JitError::Comm)?;

        match decode_frame(&bytes)? {
            BuildFrame::Built {
                source,
                binary,
                log,
            } => {
                if self.store.lookup(key) != EntryStatus::Ready {
                    // Serialize against any local mutator; the double
                    // check inside keeps the publish idempotent.
                    let _lock = KeyLock::acquire(
                        &self.store.entry_dir(key),
                        &self.host,
                        self.config.lock_timeout,
                        self.config.stale_lock_timeout,
                    )?;
                    if self.store.lookup(key) != EntryStatus::Ready {
                        self.store
                            .publish(key, signature, &source, &CompileOutput { binary, log })?;
                    }
                }
                self.hit(key)
            }
            BuildFrame::Failed { detail } => {
                // Record locally so this group's waiters fail fast too.
                self.record_failure(key, signature, &detail, None);
                Err(CoordinatorError::PeerBuildFailed {
                    signature: signature.to_string(),
                    detail,
                }
                .into())
            }
        }
    }

    /// Reconstruct a distribution frame from an already published entry.
    fn frame_from_store(&self, key: &CacheKey) -> Result<BuildFrame, JitError> {
        let (lib_path, _) = self.store.open_for_read(key)?;
        let binary = std::fs::read(&lib_path).map_err(|e| JitError::Store(e.into()))?;
        let source = self.store.read_source(key)?.unwrap_or_default();
        let log = std::fs::read_to_string(self.store.log_path(key)).unwrap_or_default();
        Ok(BuildFrame::Built {
            source,
            binary,
            log,
        })
    }
}
