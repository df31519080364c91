//! kiln — a distributed, signature-keyed cache for on-demand compilation
//! of native shared libraries.
//!
//! A caller supplies a content signature for the artifact it wants and a
//! callback that can produce its source on demand. kiln hashes the
//! signature into a cache key, looks it up in a disk store shared by any
//! number of cooperating processes, and on a miss elects exactly one
//! builder per physical cache directory to generate, compile, and publish
//! the artifact atomically. Under the `root` policy a single process
//! builds for the whole group and the binary travels to the other node
//! groups' roots over the group's broadcast primitive.
//!
//! Coordination uses only the shared filesystem plus an optional
//! [`kiln_comm::Communicator`]: per-key lock files with stale-owner
//! reclamation, rename-as-publication-barrier, and empirical probe-file
//! detection of which processes actually share a directory.

pub mod compiler;
pub mod config;
pub mod coordinator;
pub mod distribute;
pub mod error;
pub mod group;
pub mod key;
pub mod store;

pub use compiler::{
    BuildParams, CommandCompiler, CompileError, CompileOutput, CompileResult, Compiler,
};
pub use config::{BuildPolicy, CacheConfig, SourceStorage};
pub use coordinator::{BuildCoordinator, CachedLibrary};
pub use error::{CoordinatorError, GeneratorError, JitError};
pub use group::{
    detect_node_groups, partition_from_leaders, resolve_role, BuilderRole, GroupContext,
    GroupError, NodeGroup, Topology,
};
pub use key::CacheKey;
pub use store::{EntryStatus, KeyLock, LockError, LockOwner, Store, StoreError};
