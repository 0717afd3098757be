//! Counter-Delta Engine (CDE) — §4.1.
//!
//! Per-CPU state holding the last-observed free-running counter values;
//! converts absolute reads into per-interval deltas using 64-bit modular
//! subtraction, which handles wraparound for free.
//!
//! Grounded on `collect_and_send_perf_measurements` in
//! `crates/bpf/src/bpf/collector.bpf.c`: four independent
//! `bpf_perf_event_read_value` calls, each updating its own `prev` field
//! only on success, plus the "skip first sample" rule keyed off
//! `prev->timestamp == 0`.

use crate::clock::Clock;
use std::sync::Arc;

/// Hardware (or emulated) counter reads for one CPU, at one instant.
///
/// `perf_event_open`-backed implementations expose these as opaque
/// monotonically-increasing 64-bit values (§1, "out of scope" collaborators).
/// A `None` means the read failed and this counter's delta contributes `0`
/// for this sample without disturbing its stored `previous` value.
pub trait CounterSource: Send + Sync {
    fn read_cycles(&self, cpu: u32) -> Option<u64>;
    fn read_instructions(&self, cpu: u32) -> Option<u64>;
    fn read_llc_misses(&self, cpu: u32) -> Option<u64>;
    fn read_cache_references(&self, cpu: u32) -> Option<u64>;
}

/// A per-interval delta tuple, emitted as `PERF_MEASUREMENT` (§4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Measurement {
    pub time_delta_ns: u64,
    pub cycles_delta: u64,
    pub instructions_delta: u64,
    pub llc_misses_delta: u64,
    pub cache_refs_delta: u64,
}

#[derive(Clone, Copy, Default)]
struct PrevCounters {
    cycles: u64,
    instructions: u64,
    llc_misses: u64,
    cache_refs: u64,
    timestamp_ns: u64,
}

/// One [`PrevCounters`] slot per online CPU.
///
/// Each CPU's slot is touched only by the tick/switch handler pinned to
/// that CPU (§5: "per-CPU indexed array with no cross-CPU access on the hot
/// path"), so a plain `Vec` behind per-slot interior mutability is sound
/// without locking. We use one `std::sync::Mutex` per slot rather than an
/// `UnsafeCell` so a misbehaving caller invoking `sample` concurrently for
/// the same CPU gets a blocked thread instead of undefined behavior; under
/// the engine's actual usage pattern the lock is never contended.
pub struct CounterDeltaEngine<C> {
    source: C,
    clock: Arc<dyn Clock>,
    slots: Vec<std::sync::Mutex<PrevCounters>>,
}

impl<C: CounterSource> CounterDeltaEngine<C> {
    pub fn new(source: C, clock: Arc<dyn Clock>, num_cpus: usize) -> Self {
        Self {
            source,
            clock,
            slots: (0..num_cpus).map(|_| Default::default()).collect(),
        }
    }

    /// Zeroes `cpu`'s state; the next call to `sample` for this CPU will not
    /// emit a measurement.
    pub fn reset(&self, cpu: usize) {
        let mut prev = self.slots[cpu].lock().unwrap_or_else(|e| e.into_inner());
        *prev = PrevCounters::default();
    }

    /// Reads each enabled counter for `cpu`, computes `(current - previous)
    /// mod 2^64`, and returns the delta tuple — unless this is the first
    /// sample since the last `reset`, in which case only the state is
    /// seeded and `None` is returned.
    pub fn sample(&self, cpu: usize) -> Option<Measurement> {
        let now = self.clock.now_ns();
        let mut prev = self.slots[cpu].lock().unwrap_or_else(|e| e.into_inner());

        let cpu_id = cpu as u32;
        let (cycles_delta, new_cycles) =
            delta_or_zero(self.source.read_cycles(cpu_id), prev.cycles);
        let (instructions_delta, new_instructions) =
            delta_or_zero(self.source.read_instructions(cpu_id), prev.instructions);
        let (llc_misses_delta, new_llc_misses) =
            delta_or_zero(self.source.read_llc_misses(cpu_id), prev.llc_misses);
        let (cache_refs_delta, new_cache_refs) =
            delta_or_zero(self.source.read_cache_references(cpu_id), prev.cache_refs);

        let measurement = if prev.timestamp_ns != 0 {
            Some(Measurement {
                time_delta_ns: now.wrapping_sub(prev.timestamp_ns),
                cycles_delta,
                instructions_delta,
                llc_misses_delta,
                cache_refs_delta,
            })
        } else {
            None
        };

        prev.cycles = new_cycles;
        prev.instructions = new_instructions;
        prev.llc_misses = new_llc_misses;
        prev.cache_refs = new_cache_refs;
        prev.timestamp_ns = now;

        measurement
    }
}

/// Returns `(delta, updated_previous)`. A failed read (`None`) contributes a
/// zero delta and leaves `previous` untouched.
fn delta_or_zero(current: Option<u64>, previous: u64) -> (u64, u64) {
    match current {
        Some(value) => (value.wrapping_sub(previous), value),
        None => (0, previous),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FixedCounters {
        cycles: AtomicU64,
        instructions: AtomicU64,
        llc_misses: AtomicU64,
        cache_refs: AtomicU64,
        fail_next_llc: std::sync::atomic::AtomicBool,
    }

    impl CounterSource for FixedCounters {
        fn read_cycles(&self, _cpu: u32) -> Option<u64> {
            Some(self.cycles.load(Ordering::SeqCst))
        }
        fn read_instructions(&self, _cpu: u32) -> Option<u64> {
            Some(self.instructions.load(Ordering::SeqCst))
        }
        fn read_llc_misses(&self, _cpu: u32) -> Option<u64> {
            if self.fail_next_llc.swap(false, Ordering::SeqCst) {
                None
            } else {
                Some(self.llc_misses.load(Ordering::SeqCst))
            }
        }
        fn read_cache_references(&self, _cpu: u32) -> Option<u64> {
            Some(self.cache_refs.load(Ordering::SeqCst))
        }
    }

    // CDE-S: first sample after reset emits nothing; second has time_delta_ns > 0.
    #[test]
    fn first_sample_after_reset_is_skipped() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let counters = FixedCounters {
            cycles: AtomicU64::new(0),
            instructions: AtomicU64::new(0),
            llc_misses: AtomicU64::new(0),
            cache_refs: AtomicU64::new(0),
            fail_next_llc: std::sync::atomic::AtomicBool::new(false),
        };
        let cde = CounterDeltaEngine::new(counters, clock.clone(), 1);

        assert_eq!(cde.sample(0), None);

        clock.advance(1_000_000);
        let m = cde.sample(0).expect("second sample should emit");
        assert_eq!(m.time_delta_ns, 1_000_000);
    }

    // CDE-W: counter wraps from 2^64-10 to 20, delta should be 30.
    #[test]
    fn wraparound_is_handled_by_modular_subtraction() {
        let clock = Arc::new(ManualClock::new(0));
        let counters = FixedCounters {
            cycles: AtomicU64::new(u64::MAX - 9),
            instructions: AtomicU64::new(0),
            llc_misses: AtomicU64::new(0),
            cache_refs: AtomicU64::new(0),
            fail_next_llc: std::sync::atomic::AtomicBool::new(false),
        };
        let cde = CounterDeltaEngine::new(counters, clock.clone(), 1);

        assert_eq!(cde.sample(0), None);
        clock.advance(1_000_000);
        counters_set(&cde, 20);

        let m = cde.sample(0).unwrap();
        assert_eq!(m.cycles_delta, 30);
    }

    fn counters_set(cde: &CounterDeltaEngine<FixedCounters>, cycles: u64) {
        cde.source.cycles.store(cycles, Ordering::SeqCst);
    }

    #[test]
    fn failed_read_contributes_zero_without_moving_baseline() {
        let clock = Arc::new(ManualClock::new(0));
        let counters = FixedCounters {
            cycles: AtomicU64::new(100),
            instructions: AtomicU64::new(0),
            llc_misses: AtomicU64::new(50),
            cache_refs: AtomicU64::new(0),
            fail_next_llc: std::sync::atomic::AtomicBool::new(false),
        };
        let cde = CounterDeltaEngine::new(counters, clock.clone(), 1);
        assert_eq!(cde.sample(0), None); // seeds llc_misses previous = 50

        cde.source.fail_next_llc.store(true, Ordering::SeqCst);
        clock.advance(1_000_000);
        let m = cde.sample(0).unwrap();
        assert_eq!(m.llc_misses_delta, 0); // failed read this round

        // Next round's delta is against the still-50 baseline, proving it wasn't disturbed.
        clock.advance(1_000_000);
        cde.source.llc_misses.store(65, Ordering::SeqCst);
        let m = cde.sample(0).unwrap();
        assert_eq!(m.llc_misses_delta, 15);
    }

    // Seed-case 1 (§8): single-CPU, single-process, 3 ticks.
    #[test]
    fn scenario_single_cpu_three_ticks() {
        let clock = Arc::new(ManualClock::new(0));
        let counters = FixedCounters {
            cycles: AtomicU64::new(0),
            instructions: AtomicU64::new(0),
            llc_misses: AtomicU64::new(0),
            cache_refs: AtomicU64::new(0),
            fail_next_llc: std::sync::atomic::AtomicBool::new(false),
        };
        let cde = CounterDeltaEngine::new(counters, clock.clone(), 1);

        let cycles = [0u64, 1000, 2100, 3250];
        let instructions = [0u64, 2000, 4100, 6250];
        let llc = [0u64, 10, 25, 41];
        let refs = [0u64, 100, 215, 330];
        let times = [1_000_000u64, 2_000_000, 3_000_000];

        // cold-start tick 0 seeds state.
        set_all(&cde, cycles[0], instructions[0], llc[0], refs[0]);
        assert_eq!(cde.sample(0), None);

        let mut results = Vec::new();
        for i in 0..3 {
            clock.set(times[i]);
            set_all(
                &cde,
                cycles[i + 1],
                instructions[i + 1],
                llc[i + 1],
                refs[i + 1],
            );
            results.push(cde.sample(0).unwrap());
        }

        assert_eq!(
            (
                results[0].cycles_delta,
                results[0].instructions_delta,
                results[0].llc_misses_delta,
                results[0].cache_refs_delta,
                results[0].time_delta_ns
            ),
            (1100, 2100, 15, 115, 1_000_000)
        );
        assert_eq!(
            (
                results[1].cycles_delta,
                results[1].instructions_delta,
                results[1].llc_misses_delta,
                results[1].cache_refs_delta,
                results[1].time_delta_ns
            ),
            (1150, 2150, 16, 115, 1_000_000)
        );
    }

    fn set_all(cde: &CounterDeltaEngine<FixedCounters>, c: u64, i: u64, l: u64, r: u64) {
        cde.source.cycles.store(c, Ordering::SeqCst);
        cde.source.instructions.store(i, Ordering::SeqCst);
        cde.source.llc_misses.store(l, Ordering::SeqCst);
        cde.source.cache_refs.store(r, Ordering::SeqCst);
    }
}
