//! Process-group communication interface for kiln.
//!
//! The engine coordinates builds across independent processes that share
//! no memory. All it needs from the transport is membership, rank
//! identity, and a handful of blocking collectives; this crate pins down
//! that narrow surface so the engine never depends on a concrete
//! transport.
//!
//! [`LocalComm`] is an in-process implementation over threads, used by
//! embedders that simulate a process group and by the test suites.

mod local;

pub use local::LocalComm;

use std::time::Duration;

use thiserror::Error;

/// Result type for communicator operations.
pub type CommResult<T> = Result<T, CommError>;

/// Errors from collective operations.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("collective timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid root rank {root} for group of size {size}")]
    InvalidRoot { root: usize, size: usize },

    #[error("broadcast root did not supply a payload")]
    MissingPayload,

    #[error("non-root rank {0} supplied a broadcast payload")]
    UnexpectedPayload(usize),
}

/// Blocking group-communication capability.
///
/// Every method except [`rank`](Communicator::rank) and
/// [`size`](Communicator::size) is a collective: all members of the group
/// must call it, in the same order, for it to complete. Implementations
/// bound each internal wait by a configured operation timeout and surface
/// [`CommError::Timeout`] instead of hanging the process.
pub trait Communicator: Send + Sync {
    /// This member's rank within the group, in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of members in the group.
    fn size(&self) -> usize;

    /// Block until every member has entered the barrier.
    fn barrier(&self) -> CommResult<()>;

    /// Broadcast a byte payload from `root` to every member.
    ///
    /// The root passes `Some(payload)`, everyone else `None`; the payload
    /// is returned on every member. Payload size is bounded only by
    /// memory.
    fn broadcast(&self, root: usize, payload: Option<Vec<u8>>) -> CommResult<Vec<u8>>;

    /// Gather one value from every member; returned in rank order on all
    /// members.
    fn allgather(&self, value: u64) -> CommResult<Vec<u64>>;

    /// Partition the group into disjoint sub-groups by `color`.
    ///
    /// Members passing equal colors land in the same sub-group, ranked by
    /// their rank in the parent group.
    fn split(&self, color: u64) -> CommResult<Box<dyn Communicator>>;
}
