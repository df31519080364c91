//! In-process communicator.
//!
//! `LocalComm` gives a group of threads the same collective surface an
//! inter-process transport would provide. Collectives are matched by a
//! per-member round counter: the Nth broadcast on one member pairs with
//! the Nth broadcast on every other member, which is exactly the calling
//! contract of [`Communicator`]. Every wait is bounded by the operation
//! timeout passed to [`LocalComm::create`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::{CommError, CommResult, Communicator};

/// In-process implementation of [`Communicator`] over shared state.
pub struct LocalComm {
    rank: usize,
    timeout: Duration,
    shared: Arc<Shared>,
    bcast_round: AtomicU64,
    gather_round: AtomicU64,
    split_round: AtomicU64,
}

struct Shared {
    size: usize,
    barrier: Mutex<BarrierState>,
    barrier_cv: Condvar,
    ops: Mutex<OpState>,
    ops_cv: Condvar,
}

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

#[derive(Default)]
struct OpState {
    bcasts: HashMap<u64, BcastSlot>,
    gathers: HashMap<u64, GatherSlot>,
    splits: HashMap<(u64, u64), SplitSlot>,
}

struct BcastSlot {
    data: Vec<u8>,
    fetched: usize,
}

struct GatherSlot {
    values: Vec<Option<u64>>,
    present: usize,
    fetched: usize,
}

struct SplitSlot {
    shared: Arc<Shared>,
    fetched: usize,
}

/// Lock a mutex, recovering the guard if a peer thread panicked while
/// holding it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LocalComm {
    /// Create a connected group of `size` members.
    ///
    /// Returns one communicator per rank, in rank order; hand each to its
    /// own thread. Every collective wait is bounded by `timeout`.
    pub fn create(size: usize, timeout: Duration) -> Vec<LocalComm> {
        let shared = Arc::new(Shared {
            size,
            barrier: Mutex::new(BarrierState::default()),
            barrier_cv: Condvar::new(),
            ops: Mutex::new(OpState::default()),
            ops_cv: Condvar::new(),
        });
        (0..size)
            .map(|rank| LocalComm::attach(rank, timeout, Arc::clone(&shared)))
            .collect()
    }

    fn attach(rank: usize, timeout: Duration, shared: Arc<Shared>) -> LocalComm {
        LocalComm {
            rank,
            timeout,
            shared,
            bcast_round: AtomicU64::new(0),
            gather_round: AtomicU64::new(0),
            split_round: AtomicU64::new(0),
        }
    }

    /// Wait on the shared op table until `ready` yields a value.
    fn wait_ops<T>(
        &self,
        deadline: Instant,
        mut ready: impl FnMut(&mut OpState) -> Option<T>,
    ) -> CommResult<T> {
        let mut state = lock(&self.shared.ops);
        loop {
            if let Some(value) = ready(&mut state) {
                self.shared.ops_cv.notify_all();
                return Ok(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CommError::Timeout(self.timeout));
            }
            let (guard, _) = self
                .shared
                .ops_cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
    }

    fn check_root(&self, root: usize) -> CommResult<()> {
        if root >= self.shared.size {
            return Err(CommError::InvalidRoot {
                root,
                size: self.shared.size,
            });
        }
        Ok(())
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) -> CommResult<()> {
        let deadline = Instant::now() + self.timeout;
        let mut state = lock(&self.shared.barrier);
        state.arrived += 1;
        if state.arrived == self.shared.size {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.shared.barrier_cv.notify_all();
            return Ok(());
        }
        let generation = state.generation;
        while state.generation == generation {
            let now = Instant::now();
            if now >= deadline {
                // Withdraw so a later barrier round is not corrupted.
                state.arrived -= 1;
                return Err(CommError::Timeout(self.timeout));
            }
            let (guard, _) = self
                .shared
                .barrier_cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
        Ok(())
    }

    fn broadcast(&self, root: usize, payload: Option<Vec<u8>>) -> CommResult<Vec<u8>> {
        self.check_root(root)?;
        let round = self.bcast_round.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.timeout;
        let size = self.shared.size;

        if self.rank == root {
            let data = payload.ok_or(CommError::MissingPayload)?;
            {
                let mut state = lock(&self.shared.ops);
                state.bcasts.insert(
                    round,
                    BcastSlot {
                        data: data.clone(),
                        fetched: 0,
                    },
                );
                self.shared.ops_cv.notify_all();
            }
            // The slot is removed once every other member has a copy.
            self.wait_ops(deadline, |state| {
                let done = state
                    .bcasts
                    .get(&round)
                    .is_some_and(|slot| slot.fetched == size - 1);
                if done {
                    state.bcasts.remove(&round);
                    Some(())
                } else {
                    None
                }
            })?;
            Ok(data)
        } else {
            if payload.is_some() {
                return Err(CommError::UnexpectedPayload(self.rank));
            }
            self.wait_ops(deadline, |state| {
                state.bcasts.get_mut(&round).map(|slot| {
                    slot.fetched += 1;
                    slot.data.clone()
                })
            })
        }
    }

    fn allgather(&self, value: u64) -> CommResult<Vec<u64>> {
        let round = self.gather_round.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.timeout;
        let size = self.shared.size;
        let rank = self.rank;

        {
            let mut state = lock(&self.shared.ops);
            let slot = state.gathers.entry(round).or_insert_with(|| GatherSlot {
                values: vec![None; size],
                present: 0,
                fetched: 0,
            });
            slot.values[rank] = Some(value);
            slot.present += 1;
            self.shared.ops_cv.notify_all();
        }

        self.wait_ops(deadline, |state| {
            let slot = state.gathers.get_mut(&round)?;
            if slot.present < size {
                return None;
            }
            let values: Vec<u64> = slot.values.iter().map(|v| v.unwrap_or(0)).collect();
            slot.fetched += 1;
            if slot.fetched == size {
                state.gathers.remove(&round);
            }
            Some(values)
        })
    }

    fn split(&self, color: u64) -> CommResult<Box<dyn Communicator>> {
        let round = self.split_round.fetch_add(1, Ordering::Relaxed);
        let colors = self.allgather(color)?;
        let members: Vec<usize> = (0..self.shared.size)
            .filter(|&r| colors[r] == color)
            .collect();
        let sub_size = members.len();
        let sub_rank = members.iter().position(|&r| r == self.rank).unwrap_or(0);
        let deadline = Instant::now() + self.timeout;

        let shared = if sub_rank == 0 {
            let sub = Arc::new(Shared {
                size: sub_size,
                barrier: Mutex::new(BarrierState::default()),
                barrier_cv: Condvar::new(),
                ops: Mutex::new(OpState::default()),
                ops_cv: Condvar::new(),
            });
            {
                let mut state = lock(&self.shared.ops);
                state.splits.insert(
                    (round, color),
                    SplitSlot {
                        shared: Arc::clone(&sub),
                        fetched: 0,
                    },
                );
                self.shared.ops_cv.notify_all();
            }
            self.wait_ops(deadline, |state| {
                let done = state
                    .splits
                    .get(&(round, color))
                    .is_some_and(|slot| slot.fetched == sub_size - 1);
                if done {
                    state.splits.remove(&(round, color));
                    Some(())
                } else {
                    None
                }
            })?;
            sub
        } else {
            self.wait_ops(deadline, |state| {
                state.splits.get_mut(&(round, color)).map(|slot| {
                    slot.fetched += 1;
                    Arc::clone(&slot.shared)
                })
            })?
        };

        Ok(Box::new(LocalComm::attach(sub_rank, self.timeout, shared)))
    }
}
