//! Node-group detection and builder-role election.
//!
//! Which processes share a physical cache directory cannot be decided by
//! comparing path strings: the same string may name a process-local
//! directory on one host and a network mount on another. Detection is
//! empirical. Every member writes a probe file carrying a run-unique
//! token and its own rank into its cache root, then reads back which
//! ranks it can see; members that observe one another share a directory.
//! One collective exchange of the observed group leaders yields the same
//! deterministic partition on every member.
//!
//! Detection runs once per communicator; [`GroupContext`] caches the
//! result and the sub-communicator used for root-policy distribution.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;
use uuid::Uuid;

use crate::config::BuildPolicy;
use kiln_comm::{CommError, Communicator};

/// Group detection result type.
pub type GroupResult<T> = Result<T, GroupError>;

/// Errors from group detection and role election.
#[derive(Debug, Error)]
pub enum GroupError {
    #[error(transparent)]
    Comm(#[from] CommError),

    #[error(
        "`process` build policy requires per-process cache directories, \
         but {group_size} processes share this one"
    )]
    SharedCacheDir { group_size: usize },
}

/// Processes sharing one physical cache directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeGroup {
    /// Designated root: the lowest-ranked member.
    pub root: usize,
    /// Members, sorted by rank.
    pub members: Vec<usize>,
}

/// Partition of a communicator into node groups, computed once per
/// communicator and immutable for its lifetime.
#[derive(Debug, Clone)]
pub struct Topology {
    rank: usize,
    groups: Vec<NodeGroup>,
    local_index: usize,
    warnings: Vec<String>,
}

impl Topology {
    /// This process's rank in the full communicator.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// All node groups, ordered by group root.
    pub fn groups(&self) -> &[NodeGroup] {
        &self.groups
    }

    /// The group this process belongs to.
    pub fn local_group(&self) -> &NodeGroup {
        &self.groups[self.local_index]
    }

    /// Whether this process is its group's designated root.
    pub fn is_node_root(&self) -> bool {
        self.local_group().root == self.rank
    }

    /// Designated roots of every group, in group order.
    pub fn node_roots(&self) -> Vec<usize> {
        self.groups.iter().map(|g| g.root).collect()
    }

    /// Non-fatal conditions observed during detection, e.g. an unwritable
    /// cache root that degraded a member to a singleton group.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

/// Role a process plays for one acquisition, resolved once per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderRole {
    /// Runs the generator and the compiler.
    Builder,
    /// Node root that receives the built artifact over the distribution
    /// channel and republishes it locally (`root` policy only).
    Receiver,
    /// Waits for its node root to publish into the shared directory.
    Waiter,
}

/// Discover which communicator members share this process's cache root.
///
/// Collective: every member must call it with its own configured root.
/// A member whose probe file cannot be written or read is degraded to a
/// singleton group with a warning rather than failing the run.
pub fn detect_node_groups(
    comm: &dyn Communicator,
    cache_root: &Path,
) -> GroupResult<Topology> {
    let rank = comm.rank();
    let mut warnings = Vec::new();

    // Run-unique token so leftover probe files from a crashed run, or a
    // concurrently running program, cannot pollute the discovery.
    let token = bcast_token(comm)?;
    let basename = format!("probe.{token:016x}.");
    let own_probe = cache_root.join(format!("{basename}{rank}"));

    let wrote = match fs::write(&own_probe, b"") {
        Ok(()) => true,
        Err(e) => {
            let warning = format!(
                "cannot write probe file {}: {e}; treating rank {rank} as its own node group",
                own_probe.display()
            );
            eprintln!("[group] WARNING: {warning}");
            warnings.push(warning);
            false
        }
    };

    comm.barrier()?;

    let observed = if wrote {
        match scan_probe_ranks(cache_root, &basename) {
            Ok(mut ranks) => {
                if !ranks.contains(&rank) {
                    ranks.push(rank);
                    ranks.sort_unstable();
                }
                ranks
            }
            Err(e) => {
                let warning = format!(
                    "cannot scan probe files in {}: {e}; treating rank {rank} as its own node group",
                    cache_root.display()
                );
                eprintln!("[group] WARNING: {warning}");
                warnings.push(warning);
                vec![rank]
            }
        }
    } else {
        vec![rank]
    };

    // Everyone finishes scanning before anyone removes their probe.
    comm.barrier()?;
    if wrote {
        let _ = fs::remove_file(&own_probe);
    }

    let leader = observed.first().copied().unwrap_or(rank) as u64;
    let leaders = comm.allgather(leader)?;
    let groups = partition_from_leaders(&leaders);
    // The partition covers every rank, so this lookup always succeeds.
    let local_index = groups
        .iter()
        .position(|g| g.members.contains(&rank))
        .unwrap_or(0);

    Ok(Topology {
        rank,
        groups,
        local_index,
        warnings,
    })
}

/// Deterministic partition from each rank's observed leader label.
///
/// Ranks reporting the same label form one group. The group root is the
/// lowest member rank; under symmetric observation that equals the label,
/// and under degraded (asymmetric) observation it still names a real
/// member, so every group stays self-rooted.
pub fn partition_from_leaders(leaders: &[u64]) -> Vec<NodeGroup> {
    let mut by_label: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
    for (rank, &label) in leaders.iter().enumerate() {
        by_label.entry(label).or_default().push(rank);
    }
    let mut groups: Vec<NodeGroup> = by_label
        .into_values()
        .map(|members| NodeGroup {
            root: members[0],
            members,
        })
        .collect();
    groups.sort_by_key(|g| g.root);
    groups
}

/// Decide this process's role for one acquisition under `policy`.
pub fn resolve_role(policy: BuildPolicy, topology: &Topology) -> GroupResult<BuilderRole> {
    match policy {
        BuildPolicy::Process => {
            let group_size = topology.local_group().members.len();
            if group_size > 1 {
                return Err(GroupError::SharedCacheDir { group_size });
            }
            Ok(BuilderRole::Builder)
        }
        BuildPolicy::Node => {
            if topology.is_node_root() {
                Ok(BuilderRole::Builder)
            } else {
                Ok(BuilderRole::Waiter)
            }
        }
        BuildPolicy::Root => {
            // Rank 0 is the lowest rank of its group, hence always a node
            // root; it doubles as the global builder.
            if topology.rank() == 0 {
                Ok(BuilderRole::Builder)
            } else if topology.is_node_root() {
                Ok(BuilderRole::Receiver)
            } else {
                Ok(BuilderRole::Waiter)
            }
        }
    }
}

/// Per-communicator context: the detected topology plus the
/// sub-communicator used for root-policy distribution.
///
/// Establish once per communicator and reuse across acquisitions;
/// recompute only if the communicator changes.
pub struct GroupContext<'a> {
    comm: &'a dyn Communicator,
    topology: Topology,
    roots_comm: Option<Box<dyn Communicator>>,
}

impl<'a> GroupContext<'a> {
    /// Detect node groups and, under `root` policy, split off the
    /// node-roots sub-communicator.
    ///
    /// Collective: every member of `comm` must call this, whatever role
    /// it will end up with.
    pub fn establish(
        comm: &'a dyn Communicator,
        cache_root: &Path,
        policy: BuildPolicy,
    ) -> GroupResult<Self> {
        let topology = detect_node_groups(comm, cache_root)?;
        let roots_comm = match policy {
            BuildPolicy::Root => {
                // Node roots take color 0 and keep their global rank
                // order, so the global builder is rank 0 of the
                // sub-communicator. Non-roots get a sub-communicator of
                // their own that is never used.
                let color = if topology.is_node_root() { 0 } else { 1 };
                Some(comm.split(color)?)
            }
            BuildPolicy::Node | BuildPolicy::Process => None,
        };
        Ok(Self {
            comm,
            topology,
            roots_comm,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn comm(&self) -> &dyn Communicator {
        self.comm
    }

    /// The node-roots sub-communicator, present under `root` policy for
    /// node roots (and unused for everyone else).
    pub(crate) fn roots_comm(&self) -> Option<&dyn Communicator> {
        self.roots_comm.as_deref()
    }
}

/// Broadcast a fresh probe token from rank 0.
fn bcast_token(comm: &dyn Communicator) -> GroupResult<u64> {
    let payload = if comm.rank() == 0 {
        Some(Uuid::new_v4().as_u64_pair().0.to_le_bytes().to_vec())
    } else {
        None
    };
    let bytes = comm.broadcast(0, payload)?;
    let mut buf = [0u8; 8];
    for (slot, byte) in buf.iter_mut().zip(bytes.iter()) {
        *slot = *byte;
    }
    Ok(u64::from_le_bytes(buf))
}

fn scan_probe_ranks(cache_root: &Path, basename: &str) -> io::Result<Vec<usize>> {
    let mut ranks = Vec::new();
    for entry in fs::read_dir(cache_root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(rest) = name.strip_prefix(basename) {
            if let Ok(rank) = rest.parse::<usize>() {
                ranks.push(rank);
            }
        }
    }
    ranks.sort_unstable();
    ranks.dedup();
    Ok(ranks)
}
