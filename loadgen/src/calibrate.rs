//! Host-speed calibration of the busy loop
//!
//! Load generators request CPU work in milliseconds, but what they actually
//! execute is a number of iterations of [`busy_work()`]. The conversion factor
//! between the two is measured once per process by timing the busy loop
//! against the process CPU-time clock, see [`CalibrationFactor::host()`].

use std::{hint::black_box, io, sync::OnceLock, time::Duration};
use thiserror::Error;

/// Iteration count of the warm-up pass, whose timing is discarded
pub const WARMUP_ITERATIONS: u64 = 3_000;

/// Iteration count of the timed calibration pass
pub const CALIBRATION_ITERATIONS: u64 = 30_000_000;

/// Run the non-optimizable integer busy loop
///
/// This iterates a 32-bit linear congruential update `count` times, starting
/// from `state`, and returns the final state. Every intermediate state goes
/// through `black_box` so that the compiler can neither elide the loop nor
/// turn it into a closed-form expression.
#[inline(never)]
pub fn busy_work(count: u64, state: i32) -> i32 {
    let a = black_box(134_775_813_i32);
    let c = black_box(1_i32);
    let mut x = state;
    for _ in 0..count {
        x = black_box(a.wrapping_mul(x).wrapping_add(c));
    }
    x
}

/// Source of process CPU time
pub trait CpuClock {
    /// CPU time consumed by the current process so far
    fn cpu_time(&mut self) -> Result<Duration, CalibrationError>;
}

/// The operating system's process CPU-time clock
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCpuClock;
//
impl CpuClock for ProcessCpuClock {
    fn cpu_time(&mut self) -> Result<Duration, CalibrationError> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: ts is a valid timespec that clock_gettime may write into
        let ret = unsafe { libc::clock_gettime(libc::CLOCK_PROCESS_CPUTIME_ID, &mut ts) };
        if ret == -1 {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(CalibrationError::ClockUnavailable(errno));
        }
        Ok(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
    }
}

/// Measure how much CPU time `run(iterations)` takes
pub fn time_iterations(
    clock: &mut impl CpuClock,
    iterations: u64,
    run: impl FnOnce(u64),
) -> Result<Duration, CalibrationError> {
    let start = clock.cpu_time()?;
    run(iterations);
    let stop = clock.cpu_time()?;
    Ok(stop.saturating_sub(start))
}

/// Busy-loop iterations per millisecond of CPU time on this host
///
/// A `CalibrationFactor` is always finite and strictly positive. Failure to
/// calibrate is reported as a [`CalibrationError`] instead of a sentinel.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct CalibrationFactor(f64);
//
impl CalibrationFactor {
    /// Calibration factor of the current host
    ///
    /// The first call runs a warm-up pass and a timed pass of [`busy_work()`],
    /// which takes a noticeable fraction of a second. Later calls return the
    /// cached outcome of that first measurement, including failures.
    pub fn host() -> Result<Self, CalibrationError> {
        static HOST_FACTOR: OnceLock<Result<CalibrationFactor, CalibrationError>> =
            OnceLock::new();
        *HOST_FACTOR.get_or_init(|| {
            let result = Self::calibrate(
                &mut ProcessCpuClock,
                WARMUP_ITERATIONS,
                CALIBRATION_ITERATIONS,
                |count| {
                    black_box(busy_work(count, 0));
                },
            );
            match &result {
                Ok(factor) => log::debug!(
                    "Busy loop calibrated at {:.0} iterations/ms",
                    factor.iterations_per_ms()
                ),
                Err(e) => log::error!("Busy loop calibration failed: {e}"),
            }
            result
        })
    }

    /// Calibrate `run` against `clock`
    ///
    /// `run(n)` must execute `n` iterations of the loop being calibrated. It
    /// is first called with `warmup_iterations` to prime caches and branch
    /// predictors, and that timing is discarded. It is then called with
    /// `iterations`, and the elapsed CPU time of that call is used.
    pub fn calibrate(
        clock: &mut impl CpuClock,
        warmup_iterations: u64,
        iterations: u64,
        mut run: impl FnMut(u64),
    ) -> Result<Self, CalibrationError> {
        time_iterations(clock, warmup_iterations, &mut run)?;
        let elapsed = time_iterations(clock, iterations, &mut run)?;
        Self::from_measurement(iterations, elapsed)
    }

    /// Compute the factor from a timed run of the busy loop
    pub fn from_measurement(iterations: u64, elapsed: Duration) -> Result<Self, CalibrationError> {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        if elapsed_ms <= 0.0 {
            return Err(CalibrationError::NoElapsedTime);
        }
        Ok(Self(iterations as f64 / elapsed_ms))
    }

    /// Measured throughput of the busy loop
    pub fn iterations_per_ms(self) -> f64 {
        self.0
    }

    /// Number of busy-loop iterations that take `ms` milliseconds of CPU time
    ///
    /// Negative durations are treated as zero.
    pub fn work_units(self, ms: f64) -> u64 {
        (self.0 * ms) as u64
    }

    /// Spend about `ms` milliseconds of CPU time in the busy loop
    pub fn consume(self, ms: f64, state: i32) -> i32 {
        busy_work(self.work_units(ms), state)
    }
}

/// Failure to calibrate the busy loop
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum CalibrationError {
    /// The process CPU-time clock could not be read
    #[error("process CPU-time clock is unavailable ({})", os_error(.0))]
    ClockUnavailable(i32),

    /// The timed pass did not register any CPU time
    #[error("calibration pass measured no elapsed CPU time")]
    NoElapsedTime,
}

fn os_error(errno: &i32) -> io::Error {
    io::Error::from_raw_os_error(*errno)
}
