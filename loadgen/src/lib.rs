//! Synthetic load generators for job latency measurements
//!
//! This crate provides the building blocks of the CPU-bound and memory-bound
//! workloads: a self-calibrating busy loop, a square-wave job length
//! generator, and a pointer-chase traversal over a pinned memory mapping.
//!
//! None of the job-time entry points allocate, perform I/O or block. All the
//! expensive setup happens when the generators are constructed.

#![deny(missing_docs)]

pub mod calibrate;
pub mod membound;
pub mod sqrwav;

pub use self::{
    calibrate::{busy_work, CalibrationError, CalibrationFactor},
    membound::{MemboundError, PointerChase},
    sqrwav::{Lcg, SquareWave, SquareWaveError, SquareWaveParams},
};
