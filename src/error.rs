//! Error taxonomy for library acquisition.
//!
//! Each module owns the errors of its own layer; this module adds the
//! generator and coordination errors and the [`JitError`] aggregate the
//! public entry point returns. Errors always carry enough context —
//! signature, path, underlying message — to diagnose without re-running.

use std::time::Duration;

use thiserror::Error;

use crate::compiler::CompileError;
use crate::distribute::FrameError;
use crate::group::GroupError;
use crate::store::{LockError, StoreError};
use kiln_comm::CommError;

/// Failure reported by the caller's source generator.
///
/// Not retried automatically; the callback's detail is carried to the
/// caller verbatim.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct GeneratorError(String);

impl GeneratorError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}

impl From<String> for GeneratorError {
    fn from(detail: String) -> Self {
        Self(detail)
    }
}

impl From<&str> for GeneratorError {
    fn from(detail: &str) -> Self {
        Self(detail.to_string())
    }
}

/// Coordination failures distinct from the underlying store and lock
/// errors.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// A non-builder waited past its bound for a builder that never
    /// finished. Retryable.
    #[error("timed out after {waited:?} waiting for a peer to build signature {signature:?}")]
    BuildTimeout { signature: String, waited: Duration },

    /// The entry carries a failure marker and retrying is disabled.
    #[error("build of signature {signature:?} previously failed: {detail}")]
    PriorFailure { signature: String, detail: String },

    /// The elected builder reported a failure for this attempt.
    #[error("peer build of signature {signature:?} failed: {detail}")]
    PeerBuildFailed { signature: String, detail: String },
}

/// Top-level error returned by the coordinator.
#[derive(Debug, Error)]
pub enum JitError {
    #[error("generator failed for signature {signature:?}: {source}")]
    Generator {
        signature: String,
        #[source]
        source: GeneratorError,
    },

    #[error("compilation failed for signature {signature:?}: {source}")]
    Compile {
        signature: String,
        #[source]
        source: CompileError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Group(#[from] GroupError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Comm(#[from] CommError),

    #[error("malformed distribution payload: {0}")]
    Distribution(#[from] FrameError),
}
