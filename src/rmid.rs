//! RMID Allocator (RA) — §4.2.
//!
//! Hands out a fixed pool of hardware Resource-Monitoring IDs with a
//! minimum-free quarantine so two successive measurement windows never
//! share a counter. Grounded on `pkg/rmid_allocator/rmid_allocator.bpf.{c,h}`
//! from the original collector: a per-id `is_allocated` table plus a
//! circular free-list addressed by ever-growing head/tail indices.

use std::sync::Mutex;

use crate::error::{InitError, InitResult};

/// Reserved sentinel: id `0` is never allocated (§3, RMID invariants).
pub const RMID_UNASSIGNED: u32 = 0;

/// Compile-time upper bound on the number of RMIDs a single allocator can
/// manage. `init` rejects `max_id` above this regardless of what the
/// hardware reports.
pub const MAX_RMID_CAPACITY: u32 = 4096;

#[derive(Clone, Debug, Default)]
struct Slot {
    allocated: bool,
    comm: String,
    tgid: u32,
}

#[derive(Clone, Copy, Debug)]
struct FreeEntry {
    rmid: u32,
    /// Signed so the "immediately eligible" sentinel (`-min_free_time_ns`)
    /// can be represented without wrapping a `u64`.
    free_timestamp_ns: i64,
}

/// Snapshot of an RMID's binding, returned by [`RmidAllocator::info`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RmidInfo {
    pub comm: String,
    pub tgid: u32,
}

struct Inner {
    max_rmid: u32,
    min_free_time_ns: u64,
    slots: Vec<Slot>,
    free_ring: Vec<FreeEntry>,
    free_head: u64,
    free_tail: u64,
}

impl Inner {
    fn ring_index(&self, growing_index: u64) -> usize {
        (growing_index % self.max_rmid as u64) as usize
    }
}

/// Fixed-capacity RMID pool guarded by a single mutex.
///
/// §5 calls for "a spinlock with interrupts disabled" since the reference
/// design runs inside a kernel; in this userspace re-implementation a
/// [`Mutex`] plays the same role — the critical section is still bounded to
/// O(1) FIFO bookkeeping, so contention is never unbounded.
pub struct RmidAllocator {
    inner: Mutex<Inner>,
}

impl RmidAllocator {
    /// Populates the free list with ids `1..=max_id`, each immediately
    /// eligible for allocation (§3: `last_free_timestamp = -min_free_time_ns`).
    pub fn init(max_id: u32, min_free_time_ns: u64) -> InitResult<Self> {
        if max_id == 0 || max_id > MAX_RMID_CAPACITY {
            return Err(InitError::InvalidMaxRmid {
                got: max_id,
                max_capacity: MAX_RMID_CAPACITY,
            });
        }

        let mut slots = Vec::with_capacity(max_id as usize + 1);
        slots.push(Slot::default()); // index 0: reserved sentinel, never touched.
        slots.resize(max_id as usize + 1, Slot::default());

        let initial_free_timestamp = -(min_free_time_ns as i64);
        let free_ring: Vec<FreeEntry> = (1..=max_id)
            .map(|rmid| FreeEntry {
                rmid,
                free_timestamp_ns: initial_free_timestamp,
            })
            .collect();

        Ok(Self {
            inner: Mutex::new(Inner {
                max_rmid: max_id,
                min_free_time_ns,
                slots,
                free_ring,
                free_head: 0,
                free_tail: max_id as u64,
            }),
        })
    }

    /// Allocates the oldest-eligible freed id (FIFO head) and binds it to
    /// `{comm, tgid}`. Fails without scanning past the head: the head is by
    /// construction the oldest free entry, so if it isn't eligible yet
    /// nothing else is either.
    pub fn allocate(&self, comm: &str, tgid: u32, now_ns: u64) -> Option<u32> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.free_head == inner.free_tail {
            return None; // pool exhausted
        }

        let head_idx = inner.ring_index(inner.free_head);
        let entry = inner.free_ring[head_idx];
        let elapsed = now_ns as i64 - entry.free_timestamp_ns;
        if elapsed < inner.min_free_time_ns as i64 {
            return None; // still in quarantine
        }

        inner.free_head += 1;
        let rmid = entry.rmid;
        let slot = &mut inner.slots[rmid as usize];
        slot.allocated = true;
        slot.comm = comm.to_string();
        slot.tgid = tgid;

        tracing::trace!(rmid, tgid, comm, now_ns, "rmid_alloc");
        Some(rmid)
    }

    /// Returns `id` to the free list, stamping it with `now_ns` so the
    /// quarantine window starts from this moment. No-op for an invalid or
    /// already-free id.
    pub fn free(&self, id: u32, now_ns: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !Self::is_valid(&inner, id) || !inner.slots[id as usize].allocated {
            return;
        }

        let slot = &mut inner.slots[id as usize];
        slot.allocated = false;
        slot.tgid = 0;
        slot.comm.clear();

        let tail_idx = inner.ring_index(inner.free_tail);
        inner.free_ring[tail_idx] = FreeEntry {
            rmid: id,
            free_timestamp_ns: now_ns as i64,
        };
        inner.free_tail += 1;

        tracing::trace!(rmid = id, now_ns, "rmid_free");
    }

    pub fn is_allocated(&self, id: u32) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::is_valid(&inner, id) && inner.slots[id as usize].allocated
    }

    pub fn info(&self, id: u32) -> Option<RmidInfo> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !Self::is_valid(&inner, id) || !inner.slots[id as usize].allocated {
            return None;
        }
        let slot = &inner.slots[id as usize];
        Some(RmidInfo {
            comm: slot.comm.clone(),
            tgid: slot.tgid,
        })
    }

    /// Walks every allocated id, invoking `f(rmid, info)` for each — used by
    /// the administrative `dump` command (§6) to emit synthetic
    /// `rmid_existing` events for consumers that attach after the engine is
    /// already running.
    pub fn dump(&self, mut f: impl FnMut(u32, &RmidInfo)) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for id in 1..=inner.max_rmid {
            let slot = &inner.slots[id as usize];
            if slot.allocated {
                f(
                    id,
                    &RmidInfo {
                        comm: slot.comm.clone(),
                        tgid: slot.tgid,
                    },
                );
            }
        }
    }

    /// Frees every still-allocated id, invoking `f(rmid)` for each one — the
    /// synthetic `rmid_free` burst emitted on engine teardown (§5).
    pub fn destroy(&self, now_ns: u64, mut f: impl FnMut(u32)) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let max_rmid = inner.max_rmid;
        for id in 1..=max_rmid {
            if inner.slots[id as usize].allocated {
                let slot = &mut inner.slots[id as usize];
                slot.allocated = false;
                slot.tgid = 0;
                slot.comm.clear();
                f(id);
            }
        }
        let _ = now_ns;
    }

    fn is_valid(inner: &Inner, id: u32) -> bool {
        id != RMID_UNASSIGNED && id <= inner.max_rmid
    }
}
