//! The timer primitive collaborator (§6): "arm a single-shot or absolute
//! deadline on a specific CPU, and a callback dispatcher that runs the
//! callback on or near that CPU." [`PosixTimerBackend`] is the reference
//! implementation used outside of tests; [`TickScheduler`][super::TickScheduler]
//! is generic over [`TimerBackend`] so tests can substitute a fake.

use std::io;
use std::time::Duration;

/// What to wait for before the next firing.
#[derive(Clone, Copy, Debug)]
pub enum SleepSpec {
    /// Sleep until this absolute `CLOCK_MONOTONIC` nanosecond timestamp
    /// (Modern / Intermediate arming modes).
    Absolute(u64),
    /// Sleep for this long from now (Legacy arming mode).
    Relative(Duration),
}

pub trait TimerBackend: Send + Sync {
    /// Best-effort: pins the calling thread to `cpu`. Intermediate and
    /// Legacy modes tolerate failure here — correctness relies on migration
    /// detection, not on pinning actually working.
    fn pin_to_cpu(&self, cpu: u32) -> io::Result<()>;

    /// Blocks the calling thread per `spec`. Returns `Err` only on a fatal
    /// failure of the underlying sleep syscall.
    fn sleep(&self, spec: SleepSpec) -> io::Result<()>;

    /// Returns the CPU the calling thread is currently running on, if
    /// determinable — used to detect timer migration.
    fn current_cpu(&self) -> Option<u32>;
}

/// `sched_setaffinity` + `clock_nanosleep(CLOCK_MONOTONIC, TIMER_ABSTIME)` +
/// `sched_getcpu` backend for Linux.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixTimerBackend;

impl TimerBackend for PosixTimerBackend {
    fn pin_to_cpu(&self, cpu: u32) -> io::Result<()> {
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu as usize, &mut set);
            let rc = libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set);
            if rc == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }

    fn sleep(&self, spec: SleepSpec) -> io::Result<()> {
        match spec {
            SleepSpec::Relative(duration) => {
                std::thread::sleep(duration);
                Ok(())
            }
            SleepSpec::Absolute(deadline_ns) => {
                let ts = libc::timespec {
                    tv_sec: (deadline_ns / 1_000_000_000) as libc::time_t,
                    tv_nsec: (deadline_ns % 1_000_000_000) as _,
                };
                let rc = unsafe {
                    libc::clock_nanosleep(
                        libc::CLOCK_MONOTONIC,
                        libc::TIMER_ABSTIME,
                        &ts,
                        std::ptr::null_mut(),
                    )
                };
                // clock_nanosleep returns the error code directly rather
                // than via errno.
                if rc == 0 || rc == libc::EINTR {
                    Ok(())
                } else {
                    Err(io::Error::from_raw_os_error(rc))
                }
            }
        }
    }

    fn current_cpu(&self) -> Option<u32> {
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu >= 0 {
            Some(cpu as u32)
        } else {
            None
        }
    }
}
