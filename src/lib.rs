//! A synchronized per-CPU performance-telemetry engine: aligned tick
//! scheduling across cores, RMID allocation with post-free quarantine, and
//! a lock-free event transport carrying per-process counter deltas to a
//! userspace consumer.
//!
//! ## Example
//!
//! Wire up the engine over a counter source, task-identity source, and RMID
//! programmer, then drain whatever each CPU produced:
//!
//! ```no_run
//! use perf_sync_collector::config::Config;
//! use perf_sync_collector::counters::CounterSource;
//! use perf_sync_collector::engine::Engine;
//! use perf_sync_collector::sampling::RmidProgrammer;
//! use perf_sync_collector::task::{Task, TaskIdentitySource};
//!
//! struct Counters;
//! impl CounterSource for Counters {
//!     fn read_cycles(&self, _cpu: u32) -> Option<u64> { Some(0) }
//!     fn read_instructions(&self, _cpu: u32) -> Option<u64> { Some(0) }
//!     fn read_llc_misses(&self, _cpu: u32) -> Option<u64> { Some(0) }
//!     fn read_cache_references(&self, _cpu: u32) -> Option<u64> { Some(0) }
//! }
//!
//! struct Identity;
//! impl TaskIdentitySource for Identity {
//!     fn current_task(&self, cpu: u32) -> Task { Task::new(cpu, cpu, "idle") }
//!     fn is_kernel_thread(&self, _task: &Task) -> bool { false }
//!     fn current_cgroup_id(&self, _cpu: u32) -> u64 { 0 }
//! }
//!
//! struct Programmer;
//! impl RmidProgrammer for Programmer {
//!     fn program_rmid(&self, _cpu: u32, _rmid: u32, _closid: u32) {}
//! }
//!
//! let engine = Engine::start(Config::default(), Counters, Identity, Programmer)?;
//! let consumer = engine.transport().consumer(0);
//! while let Some(msg) = consumer.poll() {
//!     tracing::debug!(?msg, "drained");
//! }
//! engine.destroy();
//! # Ok::<(), perf_sync_collector::error::InitError>(())
//! ```

pub mod clock;
pub mod config;
pub mod counters;
pub mod engine;
pub mod error;
pub mod rmid;
pub mod sampling;
pub mod task;
pub mod timer;
pub mod transport;
