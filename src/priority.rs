//! Real-time scheduling and memory locking
//!
//! Timing measurements are only meaningful if the measured process is not
//! preempted by other processes and does not take page faults. Both are
//! process-wide OS settings, which are abstracted behind the
//! [`ProcessPriorityElevator`] trait so that the harness does not depend on
//! a particular OS.

use std::io;
use thiserror::Error;

/// OS-specific control over the scheduling of the current process
pub trait ProcessPriorityElevator {
    /// Lock every page currently mapped by the process into RAM
    fn lock_memory(&mut self) -> Result<(), SchedulingError>;

    /// Undo [`lock_memory()`](Self::lock_memory)
    fn unlock_memory(&mut self);

    /// Switch the process to the highest available real-time priority
    fn elevate_priority(&mut self) -> Result<(), SchedulingError>;

    /// Undo [`elevate_priority()`](Self::elevate_priority)
    fn restore_priority(&mut self);
}

/// Best elevator for the target OS
#[cfg(target_os = "linux")]
pub type NativeElevator = linux::FifoElevator;

/// Best elevator for the target OS
#[cfg(not(target_os = "linux"))]
pub type NativeElevator = NoopElevator;

/// Elevator for OSes where real-time scheduling is not supported
#[cfg_attr(target_os = "linux", allow(dead_code))]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NoopElevator;
//
impl ProcessPriorityElevator for NoopElevator {
    fn lock_memory(&mut self) -> Result<(), SchedulingError> {
        log::warn!("Memory locking is not supported on this OS, measurements may be noisy");
        Ok(())
    }

    fn unlock_memory(&mut self) {}

    fn elevate_priority(&mut self) -> Result<(), SchedulingError> {
        log::warn!("Real-time scheduling is not supported on this OS, measurements may be noisy");
        Ok(())
    }

    fn restore_priority(&mut self) {}
}

/// Real-time elevation that lasts as long as this guard
///
/// Memory is locked first, then priority is elevated. On drop, these steps
/// are undone in reverse order, including when elevation fails halfway.
pub struct Elevation<'elevator> {
    /// Underlying OS interface
    elevator: &'elevator mut dyn ProcessPriorityElevator,

    /// Truth that memory was locked
    memory_locked: bool,

    /// Truth that priority was elevated
    priority_elevated: bool,
}
//
impl<'elevator> Elevation<'elevator> {
    /// Lock memory and elevate priority
    pub fn acquire(
        elevator: &'elevator mut dyn ProcessPriorityElevator,
    ) -> Result<Self, SchedulingError> {
        let mut result = Self {
            elevator,
            memory_locked: false,
            priority_elevated: false,
        };
        result.elevator.lock_memory()?;
        result.memory_locked = true;
        result.elevator.elevate_priority()?;
        result.priority_elevated = true;
        log::info!("Running with real-time priority and locked memory");
        Ok(result)
    }
}
//
impl Drop for Elevation<'_> {
    fn drop(&mut self) {
        if self.priority_elevated {
            self.elevator.restore_priority();
        }
        if self.memory_locked {
            self.elevator.unlock_memory();
        }
        if self.priority_elevated || self.memory_locked {
            log::info!("Released real-time priority and memory lock");
        }
    }
}

/// Failure to set up real-time execution
#[derive(Debug, Error)]
pub enum SchedulingError {
    /// Process memory could not be locked
    #[error("failed to lock process memory ({0})")]
    LockMemory(#[source] io::Error),

    /// The real-time priority range could not be queried
    #[error("failed to query the maximal real-time priority ({0})")]
    PriorityRange(#[source] io::Error),

    /// The current scheduling policy could not be queried
    #[error("failed to query the current scheduling policy ({0})")]
    SavePolicy(#[source] io::Error),

    /// The process could not switch to real-time scheduling
    #[error("failed to set real-time priority ({0})")]
    Elevate(#[source] io::Error),
}

/// Linux implementation based on `mlockall()` and `SCHED_FIFO`
#[cfg(target_os = "linux")]
pub mod linux {
    use super::{ProcessPriorityElevator, SchedulingError};
    use std::io;

    /// Scheduling policy and parameters of a process
    type Policy = (libc::c_int, libc::sched_param);

    /// Elevator that switches to the highest `SCHED_FIFO` priority
    ///
    /// Creating the elevator does not affect the process yet.
    #[derive(Default)]
    pub struct FifoElevator {
        /// Policy to be restored, if priority was elevated
        previous: Option<Policy>,
    }
    //
    impl FifoElevator {
        /// Query the scheduling policy of the current process
        fn current_policy() -> Result<Policy, SchedulingError> {
            // SAFETY: sched_param is a plain C struct, zero is a valid value
            let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
            // SAFETY: pid 0 designates the current process, param is valid
            let policy = unsafe { libc::sched_getscheduler(0) };
            if policy < 0 || unsafe { libc::sched_getparam(0, &mut param) } != 0 {
                return Err(SchedulingError::SavePolicy(io::Error::last_os_error()));
            }
            Ok((policy, param))
        }
    }
    //
    impl ProcessPriorityElevator for FifoElevator {
        fn lock_memory(&mut self) -> Result<(), SchedulingError> {
            // SAFETY: mlockall has no memory safety preconditions
            if unsafe { libc::mlockall(libc::MCL_CURRENT) } != 0 {
                return Err(SchedulingError::LockMemory(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn unlock_memory(&mut self) {
            // SAFETY: munlockall has no memory safety preconditions
            if unsafe { libc::munlockall() } != 0 {
                log::error!(
                    "Failed to unlock process memory ({})",
                    io::Error::last_os_error()
                );
            }
        }

        fn elevate_priority(&mut self) -> Result<(), SchedulingError> {
            // SAFETY: sched_get_priority_max has no memory safety preconditions
            let max_priority = unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) };
            if max_priority < 0 {
                return Err(SchedulingError::PriorityRange(io::Error::last_os_error()));
            }
            let previous = Self::current_policy()?;

            // SAFETY: See current_policy()
            let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
            param.sched_priority = max_priority;
            // SAFETY: pid 0 designates the current process, param is valid
            if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } != 0 {
                return Err(SchedulingError::Elevate(io::Error::last_os_error()));
            }
            log::debug!("Switched to SCHED_FIFO priority {max_priority}");
            self.previous = Some(previous);
            Ok(())
        }

        fn restore_priority(&mut self) {
            let Some((policy, param)) = self.previous.take() else {
                return;
            };
            // SAFETY: pid 0 designates the current process, param is valid
            if unsafe { libc::sched_setscheduler(0, policy, &param) } != 0 {
                log::error!(
                    "Failed to restore scheduling policy {policy} ({})",
                    io::Error::last_os_error()
                );
            }
        }
    }
}
