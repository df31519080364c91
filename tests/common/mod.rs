//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kiln::{BuildPolicy, CacheConfig, CompileError, CompileOutput, Compiler, SourceStorage};

/// Compiler stub that fabricates a deterministic "binary" from the
/// source text and counts invocations. Clones share the counter, so one
/// stub can be handed to many coordinators and still report a group-wide
/// total.
#[derive(Clone)]
pub struct RecordingCompiler {
    invocations: Arc<AtomicUsize>,
    fail_with: Option<String>,
}

impl RecordingCompiler {
    pub fn new() -> Self {
        Self {
            invocations: Arc::new(AtomicUsize::new(0)),
            fail_with: None,
        }
    }

    /// A stub whose every invocation fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            invocations: Arc::new(AtomicUsize::new(0)),
            fail_with: Some(message.to_string()),
        }
    }

    pub fn count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl Compiler for RecordingCompiler {
    fn compile(&self, source: &str) -> Result<CompileOutput, CompileError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_with {
            return Err(CompileError::CommandFailed {
                code: Some(1),
                excerpt: message.clone(),
                log: format!("$ recording-cc\n{message}\n"),
            });
        }
        Ok(CompileOutput {
            binary: fake_binary(source),
            log: format!("compiled {} bytes of source\n", source.len()),
        })
    }
}

/// Deterministic stand-in for compiled bytes.
pub fn fake_binary(source: &str) -> Vec<u8> {
    let mut bytes = b"\x7fELF\x02\x01\x01\x00".to_vec();
    bytes.extend_from_slice(source.as_bytes());
    bytes
}

/// Config with short timeouts suitable for tests.
pub fn test_config(cache_root: &Path, policy: BuildPolicy) -> CacheConfig {
    CacheConfig {
        cache_root: cache_root.to_path_buf(),
        policy,
        source_storage: SourceStorage::Compress,
        lock_timeout: Duration::from_secs(5),
        stale_lock_timeout: Duration::from_secs(60),
        wait_timeout: Duration::from_secs(5),
        lock_retries: 2,
        retry_failed: true,
    }
}
