//! Task identity surface (§6, "task identity source" collaborator).
//!
//! The reference engine has no kernel task list to walk; every attachment
//! point hands the sampling coordinator the [`Task`] values it needs
//! directly, the way `handle_sched_switch`/`handle_process_fork`/etc.
//! receive `task_struct` pointers straight from their tracepoint context in
//! `collector.bpf.c` / `task_rmid.bpf.c`. [`TaskIdentitySource`] only covers
//! what genuinely needs an external lookup: whether a task is a kernel
//! thread, and the current cgroup id.

use crate::transport::TASK_COMM_LEN;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A process or thread as seen at one attachment point. `pid == tgid` marks
/// a group leader (§9, "group-leader identity as process identity").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Task {
    pub pid: u32,
    pub tgid: u32,
    pub comm: [u8; TASK_COMM_LEN],
}

impl Task {
    pub fn new(pid: u32, tgid: u32, comm: &str) -> Self {
        let mut buf = [0u8; TASK_COMM_LEN];
        let bytes = comm.as_bytes();
        let n = bytes.len().min(TASK_COMM_LEN);
        buf[..n].copy_from_slice(&bytes[..n]);
        Self { pid, tgid, comm: buf }
    }

    pub fn is_group_leader(&self) -> bool {
        self.pid == self.tgid
    }
}

/// External collaborators the coordinator cannot compute itself (§6).
pub trait TaskIdentitySource: Send + Sync {
    /// The task currently occupying `cpu`, used by the tick callback — the
    /// synchronous-context equivalent of `current_task()`.
    fn current_task(&self, cpu: u32) -> Task;
    fn is_kernel_thread(&self, task: &Task) -> bool;
    fn current_cgroup_id(&self, cpu: u32) -> u64;
}

/// Per-task state the sampling coordinator must track across calls, keyed
/// by group-leader `tgid` (§3: metadata flag, exited-leader set, RMID
/// binding all live "adjacent to the task").
#[derive(Default)]
pub struct TaskRegistry {
    metadata_reported: Mutex<HashMap<u32, Arc<AtomicBool>>>,
    exited_leaders: Mutex<HashSet<u32>>,
    rmids: Mutex<HashMap<u32, u32>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once per `leader_tgid` for the registry's
    /// lifetime (SC-M1): a lock-free CAS on the per-leader cell, with the
    /// map lock held only to find-or-create that cell.
    pub fn mark_metadata_reported(&self, leader_tgid: u32) -> bool {
        let cell = {
            let mut map = self.metadata_reported.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(
                map.entry(leader_tgid)
                    .or_insert_with(|| Arc::new(AtomicBool::new(false))),
            )
        };
        cell.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn record_exit(&self, leader_pid: u32) {
        self.exited_leaders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(leader_pid);
    }

    /// Removes `pid` from the exited-leaders set if present, returning
    /// whether it was (SC-F1: exactly one `TASK_FREE` per exited leader).
    pub fn take_exited(&self, pid: u32) -> bool {
        self.exited_leaders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pid)
    }

    pub fn rmid_for(&self, leader_tgid: u32) -> Option<u32> {
        self.rmids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&leader_tgid)
            .copied()
    }

    pub fn set_rmid(&self, leader_tgid: u32, rmid: u32) {
        self.rmids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(leader_tgid, rmid);
    }

    pub fn clear_rmid(&self, leader_tgid: u32) -> Option<u32> {
        self.rmids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&leader_tgid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_reported_wins_exactly_once() {
        let registry = TaskRegistry::new();
        assert!(registry.mark_metadata_reported(100));
        assert!(!registry.mark_metadata_reported(100));
        assert!(!registry.mark_metadata_reported(100));
    }

    #[test]
    fn exit_then_free_reports_exactly_once() {
        let registry = TaskRegistry::new();
        registry.record_exit(100);
        assert!(registry.take_exited(100));
        assert!(!registry.take_exited(100));
    }

    #[test]
    fn rmid_binding_round_trips() {
        let registry = TaskRegistry::new();
        assert_eq!(registry.rmid_for(100), None);
        registry.set_rmid(100, 7);
        assert_eq!(registry.rmid_for(100), Some(7));
        assert_eq!(registry.clear_rmid(100), Some(7));
        assert_eq!(registry.rmid_for(100), None);
    }
}
