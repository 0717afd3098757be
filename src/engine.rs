//! Top-level engine composition and lifecycle (§5, §7: init/teardown,
//! partial-init unwind, CPU hotplug re-init path).

use std::sync::Arc;

use crate::clock::{Clock, MonotonicClock};
use crate::config::{ArmingModeOverride, Config};
use crate::counters::CounterSource;
use crate::error::{InitError, InitResult};
use crate::rmid::RmidAllocator;
use crate::sampling::{RmidProgrammer, SamplingCoordinator};
use crate::task::TaskIdentitySource;
use crate::timer::{ArmingMode, FireEvent, PosixTimerBackend, TickScheduler};
use crate::transport::{EventTransport, Message};

/// Detects which [`ArmingMode`] this host supports. The reference
/// implementation has no portable way to probe absolute-timer or
/// CPU-pinning support from userspace, so it reports the best tier
/// (`Modern`) and relies on STS's migration detection for correctness on
/// hosts where pinning silently doesn't stick (§4.3, "capability
/// negotiation... pinning is an optimization, not a correctness
/// requirement").
fn detect_arming_mode() -> ArmingMode {
    ArmingMode::Modern
}

fn online_cpu_count() -> InitResult<usize> {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .map_err(|_| InitError::NoOnlineCpus)
}

/// The fully composed measurement engine: RA + CDE + STS + ETP + SC,
/// running as a background thread per CPU.
pub struct Engine<C, T, P, B = PosixTimerBackend> {
    scheduler: Arc<TickScheduler<B>>,
    transport: Arc<EventTransport>,
    coordinator: Arc<SamplingCoordinator<C, ArcIdentity<T>, P>>,
}

impl<C, T, P> Engine<C, T, P, PosixTimerBackend>
where
    C: CounterSource + 'static,
    T: TaskIdentitySource + 'static,
    P: RmidProgrammer + 'static,
{
    /// Validates configuration, builds every component, and spawns the
    /// per-CPU tick threads. On any fatal error (§7), nothing is left
    /// running: a timer armed partway through `start` is never reachable
    /// because `TickScheduler::new` only constructs per-CPU state and
    /// `start` itself is only called after every fallible step succeeds.
    pub fn start(config: Config, counters: C, identity: T, programmer: P) -> InitResult<Self> {
        let num_cpus = online_cpu_count()?;
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock);

        let rmid = RmidAllocator::init(config.max_rmid, config.min_free_time_ns)?;
        let counter_engine = crate::counters::CounterDeltaEngine::new(counters, Arc::clone(&clock), num_cpus);
        let transport = Arc::new(EventTransport::new(num_cpus, config.channel_capacity));
        let producers = (0..num_cpus).map(|cpu| transport.producer(cpu)).collect();
        let identity = Arc::new(identity);

        let coordinator = Arc::new(SamplingCoordinator::new(
            rmid,
            counter_engine,
            identity_ref(&identity),
            programmer,
            producers,
            Arc::clone(&clock),
        ));

        let mode = match config.arming_mode {
            ArmingModeOverride::Auto => detect_arming_mode(),
            ArmingModeOverride::Forced(mode) => mode,
        };

        let scheduler = Arc::new(TickScheduler::new(
            num_cpus,
            config.interval_ns,
            mode,
            Arc::clone(&clock),
            PosixTimerBackend,
        ));

        let migration_sink_transport = Arc::clone(&transport);
        let sink = Arc::new(move |event: FireEvent| {
            if let FireEvent::Migration {
                expected_cpu,
                actual_cpu,
                now_ns,
            } = event
            {
                let msg = Message::TimerMigrationDetected {
                    timestamp_ns: now_ns,
                    expected_cpu,
                    actual_cpu,
                };
                let _ = migration_sink_transport.producer(expected_cpu as usize).push(&msg);
            }
        });

        let tick_coordinator = Arc::clone(&coordinator);
        let tick_identity = Arc::clone(&identity);
        let callback = Arc::new(move |cpu: u32, now_ns: u64| {
            let current = tick_identity.current_task(cpu);
            tick_coordinator.on_tick(cpu as usize, now_ns, &current);
        });

        scheduler.start(sink, callback);

        Ok(Self {
            scheduler,
            transport,
            coordinator,
        })
    }
}

/// `SamplingCoordinator` is generic over its `TaskIdentitySource`, so the
/// engine keeps identity behind an `Arc` and hands the coordinator a thin
/// forwarding wrapper rather than requiring `T: Clone`.
fn identity_ref<T: TaskIdentitySource + 'static>(identity: &Arc<T>) -> ArcIdentity<T> {
    ArcIdentity(Arc::clone(identity))
}

struct ArcIdentity<T>(Arc<T>);

impl<T: TaskIdentitySource> TaskIdentitySource for ArcIdentity<T> {
    fn current_task(&self, cpu: u32) -> crate::task::Task {
        self.0.current_task(cpu)
    }
    fn is_kernel_thread(&self, task: &crate::task::Task) -> bool {
        self.0.is_kernel_thread(task)
    }
    fn current_cgroup_id(&self, cpu: u32) -> u64 {
        self.0.current_cgroup_id(cpu)
    }
}

impl<C, T, P, B> Engine<C, T, P, B>
where
    C: CounterSource,
    T: TaskIdentitySource,
    P: RmidProgrammer,
    B: crate::timer::TimerBackend + 'static,
{
    pub fn num_cpus(&self) -> usize {
        self.scheduler.num_cpus()
    }

    pub fn transport(&self) -> &EventTransport {
        &self.transport
    }

    pub fn coordinator(&self) -> &SamplingCoordinator<C, ArcIdentity<T>, P> {
        &self.coordinator
    }

    /// Cancels every per-CPU timer, waits for in-flight firings to return,
    /// and releases every still-allocated RMID (§5, "cancellation
    /// semantics"). Draining the transport is left to the caller.
    pub fn destroy(&self) {
        self.scheduler.destroy();
        self.coordinator.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    struct AlwaysFailCounters;
    impl CounterSource for AlwaysFailCounters {
        fn read_cycles(&self, _cpu: u32) -> Option<u64> {
            None
        }
        fn read_instructions(&self, _cpu: u32) -> Option<u64> {
            None
        }
        fn read_llc_misses(&self, _cpu: u32) -> Option<u64> {
            None
        }
        fn read_cache_references(&self, _cpu: u32) -> Option<u64> {
            None
        }
    }

    struct NoopIdentity;
    impl TaskIdentitySource for NoopIdentity {
        fn current_task(&self, _cpu: u32) -> Task {
            Task::new(0, 0, "")
        }
        fn is_kernel_thread(&self, _task: &Task) -> bool {
            false
        }
        fn current_cgroup_id(&self, _cpu: u32) -> u64 {
            0
        }
    }

    struct NoopProgrammer;
    impl RmidProgrammer for NoopProgrammer {
        fn program_rmid(&self, _cpu: u32, _rmid: u32, _closid: u32) {}
    }

    #[test]
    fn invalid_max_rmid_fails_init_without_spawning_anything() {
        let config = Config::default().with_max_rmid(0);
        let result = Engine::start(config, AlwaysFailCounters, NoopIdentity, NoopProgrammer);
        assert!(matches!(result, Err(InitError::InvalidMaxRmid { got: 0, .. })));
    }

    #[test]
    fn engine_starts_and_tears_down_cleanly() {
        let config = Config::default().with_max_rmid(4);
        let engine = Engine::start(config, AlwaysFailCounters, NoopIdentity, NoopProgrammer)
            .expect("engine should start");
        assert!(engine.num_cpus() > 0);
        engine.destroy();
    }
}
