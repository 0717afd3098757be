//! Synchronized Tick Scheduler (STS) — §4.3.
//!
//! One cooperative timer per online CPU, armed at an absolute
//! interval-aligned deadline and (ideally) pinned to its CPU, detecting
//! timer migration when the firing CPU differs from the one it was armed
//! on. Grounded on `DEFINE_SYNC_TIMER` in
//! `pkg/sync_timer/sync_timer.bpf.h` (`align_to_interval`, missed-tick
//! collapse, `BPF_F_TIMER_ABS | BPF_F_TIMER_CPU_PIN`) and the migration
//! check in `sync_timer_callback` from `crates/bpf/src/bpf/collector.bpf.c`.

mod backend;

pub use backend::{PosixTimerBackend, SleepSpec, TimerBackend};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::clock::{align_up, Clock};

/// Capability tier a CPU's timer was armed under (§4.3, "Capability
/// negotiation"). Pinning is an optimization; correctness on all three
/// tiers is preserved by software-computed absolute deadlines plus
/// migration detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArmingMode {
    /// Absolute deadlines + CPU-pinning flag.
    Modern,
    /// Absolute deadlines without pinning.
    Intermediate,
    /// Relative deadlines without pinning.
    Legacy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TickPhase {
    Reset,
    Armed,
    Fired,
    MigrationDetected,
    Destroyed,
}

/// What happened on one timer firing, handed to a [`TickSink`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FireEvent {
    Tick { cpu: u32, now_ns: u64 },
    Migration {
        expected_cpu: u32,
        actual_cpu: u32,
        now_ns: u64,
    },
}

/// Receives every firing, migrated or not. The engine wires this to the
/// event transport for `TIMER_MIGRATION_DETECTED`; ticks that are *not*
/// migrations are additionally routed to the sampling coordinator by the
/// caller of [`TickScheduler::start`] — STS itself only depends on a clock
/// primitive (§2, dependency order), never on the transport.
pub trait TickSink: Send + Sync {
    fn on_fire(&self, event: FireEvent);
}

impl<F: Fn(FireEvent) + Send + Sync> TickSink for F {
    fn on_fire(&self, event: FireEvent) {
        self(event)
    }
}

/// Invoked only for non-migrated ticks (§4.3: "does not invoke the user
/// callback" on migration).
pub trait TickCallback: Send + Sync {
    fn on_tick(&self, cpu: u32, now_ns: u64);
}

impl<F: Fn(u32, u64) + Send + Sync> TickCallback for F {
    fn on_tick(&self, cpu: u32, now_ns: u64) {
        self(cpu, now_ns)
    }
}

/// Pure, deterministically-testable per-CPU state machine (§3, "Per-CPU STS
/// state"). All timing and threading live in [`TickScheduler`]; this type
/// only knows how to react to "a firing happened at `now_ns` on
/// `firing_cpu`".
pub struct CpuTickState {
    pinned_cpu: u32,
    interval_ns: u64,
    next_deadline_ns: u64,
    last_tick_number: u64,
    phase: TickPhase,
    mode: ArmingMode,
}

impl CpuTickState {
    pub fn init(cpu: u32, interval_ns: u64, mode: ArmingMode, now_ns: u64) -> Self {
        Self {
            pinned_cpu: cpu,
            interval_ns,
            next_deadline_ns: align_up(now_ns, interval_ns),
            last_tick_number: now_ns / interval_ns,
            phase: TickPhase::Armed,
            mode,
        }
    }

    pub fn next_deadline_ns(&self) -> u64 {
        self.next_deadline_ns
    }

    pub fn mode(&self) -> ArmingMode {
        self.mode
    }

    /// Processes a firing observed at `now_ns` on `firing_cpu`, re-arms for
    /// the next aligned deadline, and returns the event to report.
    pub fn on_fire(&mut self, firing_cpu: u32, now_ns: u64) -> FireEvent {
        let event = if firing_cpu == self.pinned_cpu {
            self.phase = TickPhase::Fired;
            FireEvent::Tick {
                cpu: self.pinned_cpu,
                now_ns,
            }
        } else {
            self.phase = TickPhase::MigrationDetected;
            FireEvent::Migration {
                expected_cpu: self.pinned_cpu,
                actual_cpu: firing_cpu,
                now_ns,
            }
        };

        let expected_tick = now_ns / self.interval_ns;
        self.last_tick_number = (self.last_tick_number + 1).max(expected_tick);
        self.next_deadline_ns = align_up(now_ns + self.interval_ns, self.interval_ns);
        self.phase = TickPhase::Armed;

        event
    }

    pub fn destroy(&mut self) {
        self.phase = TickPhase::Destroyed;
    }
}

struct CpuThread {
    handle: JoinHandle<()>,
}

/// Owns one [`CpuTickState`] plus a worker thread per online CPU.
pub struct TickScheduler<B> {
    interval_ns: u64,
    mode: ArmingMode,
    clock: Arc<dyn Clock>,
    backend: Arc<B>,
    states: Vec<Arc<Mutex<CpuTickState>>>,
    threads: Mutex<Vec<CpuThread>>,
    shutdown: Arc<AtomicBool>,
}

impl<B: TimerBackend + 'static> TickScheduler<B> {
    pub fn new(num_cpus: usize, interval_ns: u64, mode: ArmingMode, clock: Arc<dyn Clock>, backend: B) -> Self {
        let now = clock.now_ns();
        let states = (0..num_cpus)
            .map(|cpu| Arc::new(Mutex::new(CpuTickState::init(cpu as u32, interval_ns, mode, now))))
            .collect();
        Self {
            interval_ns,
            mode,
            clock,
            backend: Arc::new(backend),
            states,
            threads: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn num_cpus(&self) -> usize {
        self.states.len()
    }

    /// Spawns one cooperative timer thread per CPU. `sink` receives every
    /// firing (migrated or not); `callback` only receives non-migrated
    /// ticks, run to completion before re-arming (§5, "Suspension points").
    pub fn start(&self, sink: Arc<dyn TickSink>, callback: Arc<dyn TickCallback>) {
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        for cpu in 0..self.states.len() {
            let state = Arc::clone(&self.states[cpu]);
            let clock = Arc::clone(&self.clock);
            let backend = Arc::clone(&self.backend);
            let sink = Arc::clone(&sink);
            let callback = Arc::clone(&callback);
            let shutdown = Arc::clone(&self.shutdown);
            let mode = self.mode;
            let interval_ns = self.interval_ns;

            let handle = std::thread::Builder::new()
                .name(format!("sts-cpu-{cpu}"))
                .spawn(move || {
                    if mode == ArmingMode::Modern {
                        let _ = backend.pin_to_cpu(cpu as u32);
                    }
                    while !shutdown.load(Ordering::Acquire) {
                        let deadline = state.lock().unwrap_or_else(|e| e.into_inner()).next_deadline_ns();
                        let now = clock.now_ns();
                        let spec = match mode {
                            ArmingMode::Legacy => {
                                let delta = deadline.saturating_sub(now).max(1);
                                SleepSpec::Relative(std::time::Duration::from_nanos(delta))
                            }
                            _ => SleepSpec::Absolute(deadline),
                        };
                        if backend.sleep(spec).is_err() || shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        let now = clock.now_ns();
                        let firing_cpu = backend.current_cpu().unwrap_or(cpu as u32);
                        let event = state
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .on_fire(firing_cpu, now);
                        sink.on_fire(event);
                        if let FireEvent::Tick { cpu, now_ns } = event {
                            callback.on_tick(cpu, now_ns);
                        }
                    }
                    let _ = interval_ns;
                })
                .expect("failed to spawn STS worker thread");
            threads.push(CpuThread { handle });
        }
    }

    /// Cancels every per-CPU timer and waits for in-flight callbacks to
    /// return (§4.3, "Cancellation & teardown").
    pub fn destroy(&self) {
        self.shutdown.store(true, Ordering::Release);
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        for t in threads.drain(..) {
            let _ = t.handle.join();
        }
        for state in &self.states {
            state.lock().unwrap_or_else(|e| e.into_inner()).destroy();
        }
    }
}
