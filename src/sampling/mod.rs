//! Sampling Coordinator (SC) — §4.5.
//!
//! The only component with no state of its own: it composes the RMID
//! allocator, counter-delta engine, per-CPU event producer, and task
//! registry into the five attachment-point handlers a real deployment wires
//! to `sched_switch`/`sched_process_fork`/`sched_process_exit`/
//! `sched_process_free` tracepoints and the synchronized tick callback.
//! Grounded on `handle_sched_switch`/`collect_and_send_perf_measurements`/
//! `check_and_send_metadata` in `crates/bpf/src/bpf/collector.bpf.c` and
//! `handle_process_fork`/`handle_process_free`/`allocate_rmid`/`free_rmid`
//! in `cmd/collector/task_rmid.bpf.c`.

use std::sync::Arc;

use crate::clock::Clock;
use crate::counters::{CounterDeltaEngine, CounterSource};
use crate::rmid::{RmidAllocator, RMID_UNASSIGNED};
use crate::task::{Task, TaskIdentitySource, TaskRegistry};
use crate::transport::{Message, Producer};

/// `program_rmid(rmid, closid)` on the current CPU (§6). The catch-all
/// class-of-service is the only one this engine ever programs (§9).
pub const CLOSID_CATCHALL: u32 = 0;

/// The MSR-programming primitive (§6, "RMID MSR programmer").
pub trait RmidProgrammer: Send + Sync {
    fn program_rmid(&self, cpu: u32, rmid: u32, closid: u32);
}

/// Orchestrates RA + CDE + ETP + task registry per §4.5.
pub struct SamplingCoordinator<C, T, P> {
    rmid: RmidAllocator,
    counters: CounterDeltaEngine<C>,
    registry: TaskRegistry,
    identity: T,
    programmer: P,
    producers: Vec<Producer>,
    clock: Arc<dyn Clock>,
}

impl<C: CounterSource, T: TaskIdentitySource, P: RmidProgrammer> SamplingCoordinator<C, T, P> {
    pub fn new(
        rmid: RmidAllocator,
        counters: CounterDeltaEngine<C>,
        identity: T,
        programmer: P,
        producers: Vec<Producer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rmid,
            counters,
            registry: TaskRegistry::new(),
            identity,
            programmer,
            producers,
            clock,
        }
    }

    fn send(&self, cpu: usize, msg: Message) {
        if !self.producers[cpu].push(&msg) {
            tracing::debug!(cpu, msg_type = ?msg.msg_type(), "event dropped, channel full");
        }
    }

    /// Emits `TASK_METADATA` for `task`'s group leader the first time it is
    /// observed, reading `cgroup_id` from the *current* context per the
    /// engine's resolution of the cgroup-consistency open question (§9).
    fn check_and_send_metadata(&self, cpu: usize, now_ns: u64, task: &Task) {
        if self.registry.mark_metadata_reported(task.tgid) {
            self.send(
                cpu,
                Message::TaskMetadata {
                    timestamp_ns: now_ns,
                    pid: task.tgid,
                    comm: task.comm,
                    cgroup_id: self.identity.current_cgroup_id(cpu as u32),
                },
            );
        }
    }

    fn emit_measurement(&self, cpu: usize, now_ns: u64, pid: u32, is_context_switch: bool, next_tgid: u32) {
        if let Some(m) = self.counters.sample(cpu) {
            self.send(
                cpu,
                Message::PerfMeasurement {
                    timestamp_ns: now_ns,
                    pid,
                    cycles_delta: m.cycles_delta,
                    instructions_delta: m.instructions_delta,
                    llc_misses_delta: m.llc_misses_delta,
                    cache_refs_delta: m.cache_refs_delta,
                    time_delta_ns: m.time_delta_ns,
                    is_context_switch,
                    next_tgid,
                },
            );
        }
    }

    /// Tick callback (only invoked by the tick scheduler on non-migrated
    /// firings — §4.3). `current` is the task occupying `cpu` right now.
    pub fn on_tick(&self, cpu: usize, now_ns: u64, current: &Task) {
        self.check_and_send_metadata(cpu, now_ns, current);
        self.emit_measurement(cpu, now_ns, current.tgid, false, 0);
        self.send(cpu, Message::TimerFinishedProcessing { timestamp_ns: now_ns });
    }

    /// `sched_switch(prev, next)`. The measurement and metadata gate are
    /// attributed to `prev` — at the point this fires, `prev` is still
    /// "current" on this CPU (mirrors `bpf_get_current_task_btf()` reading
    /// the outgoing task inside the switch hook) — and run on every switch.
    /// Only the MSR reprogram is conditional on the RMID actually changing.
    pub fn on_switch(&self, cpu: usize, now_ns: u64, prev: &Task, next: &Task) {
        let prev_rmid = self.registry.rmid_for(prev.tgid).unwrap_or(RMID_UNASSIGNED);
        let next_rmid = self.registry.rmid_for(next.tgid).unwrap_or(RMID_UNASSIGNED);

        self.check_and_send_metadata(cpu, now_ns, prev);
        self.emit_measurement(cpu, now_ns, prev.tgid, true, next.tgid);

        if prev_rmid != next_rmid {
            self.programmer.program_rmid(cpu as u32, next_rmid, CLOSID_CATCHALL);
        }
    }

    /// `sched_process_fork(parent, child)`. Group leaders get a fresh RMID
    /// (or none, under quarantine/exhaustion — §4.5 failure semantics);
    /// threads inherit the leader's.
    pub fn on_fork(&self, parent: &Task, child: &Task) {
        if self.identity.is_kernel_thread(child) {
            return;
        }

        if child.is_group_leader() {
            let now_ns = self.clock.now_ns();
            if let Some(rmid) = self.rmid.allocate(&comm_str(&child.comm), child.tgid, now_ns) {
                self.registry.set_rmid(child.tgid, rmid);
            }
        } else if let Some(rmid) = self.registry.rmid_for(parent.tgid) {
            self.registry.set_rmid(child.tgid, rmid);
        }
    }

    /// `sched_process_exit(task)`. Only group leaders are tracked; the
    /// `TASK_FREE` itself waits for `on_free` (§9, "exit-vs-free split").
    pub fn on_exit(&self, task: &Task) {
        if task.is_group_leader() {
            self.registry.record_exit(task.pid);
        }
    }

    /// `sched_process_free(task)`. Releases the RMID and emits `TASK_FREE`
    /// exactly once per exited group leader (SC-F1).
    pub fn on_free(&self, cpu: usize, now_ns: u64, task: &Task) {
        if !self.registry.take_exited(task.pid) {
            return;
        }
        if let Some(rmid) = self.registry.clear_rmid(task.tgid) {
            self.rmid.free(rmid, now_ns);
        }
        self.send(cpu, Message::TaskFree { timestamp_ns: now_ns, pid: task.pid });
    }

    /// Administrative `dump` command (§6): walks the RMID table and emits a
    /// synthetic entry for every still-allocated id via `on_dump`, letting a
    /// late-attaching consumer bootstrap its view.
    pub fn dump(&self, mut on_dump: impl FnMut(u32, &crate::rmid::RmidInfo)) {
        self.rmid.dump(|id, info| on_dump(id, info));
    }

    /// Engine teardown (§5): frees every still-allocated RMID, emitting a
    /// synthetic `rmid_free` observability event for each.
    pub fn destroy(&self) {
        let now_ns = self.clock.now_ns();
        self.rmid.destroy(now_ns, |id| {
            tracing::trace!(rmid = id, now_ns, "rmid_free");
        });
    }
}

fn comm_str(comm: &[u8]) -> String {
    let end = comm.iter().position(|&b| b == 0).unwrap_or(comm.len());
    String::from_utf8_lossy(&comm[..end]).into_owned()
}
