//! Workload plugin contract and the synthetic workloads that implement it
//!
//! A timing harness drives any [`Workload`] the same way: it calls
//! [`Workload::init()`] once, then times successive calls to
//! [`Workload::perform_job()`] until it has enough measurements or the
//! workload reports that it is [`JobStatus::Done`], and finally releases the
//! workload with [`Workload::uninit()`].

#![deny(missing_docs)]

pub mod base;
pub mod config;
pub mod membound;
pub mod sqrwav;

use loadgen::{CalibrationError, MemboundError};
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub use self::{
    base::Base,
    config::{ConfigError, ConfigLine, OptionSet},
    membound::MemoryLoad,
    sqrwav::CpuLoad,
};

/// Workload that a timing harness can drive
pub trait Workload: Sized {
    /// Short static identifier of the workload
    fn name() -> &'static str;

    /// Set up the workload according to a configuration file
    ///
    /// Every memory allocation and every file or device setup must happen
    /// here, so that jobs can run without any of those. On success, returns
    /// the workload along with an estimate of how many jobs it can run.
    fn init(config: &Path) -> Result<(Self, JobEstimate), InitError>;

    /// Run the next job
    ///
    /// This is the timed part of the workload. It must complete in bounded
    /// time without allocating memory, performing I/O or waiting on blocking
    /// synchronization, otherwise the timing measurements are meaningless.
    /// Nothing enforces this at runtime, it is part of the contract.
    ///
    /// Returns [`JobStatus::Done`] without doing any work once the workload
    /// has no job left.
    fn perform_job(&mut self) -> Result<JobStatus, JobError>;

    /// Release every resource acquired by [`init()`](Self::init)
    ///
    /// Resources are owned by the workload and freed on drop, so the default
    /// implementation just drops it. Consuming `self` makes double release
    /// impossible.
    fn uninit(self) {
        std::mem::drop(self)
    }
}

/// Outcome of a successful [`Workload::perform_job()`] call
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobStatus {
    /// A job was performed, more may follow
    Continue,

    /// No job was performed because the workload has none left
    Done,
}

/// Number of jobs that a workload expects to run
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobEstimate {
    /// The workload will report being done after this many jobs
    Bounded(u64),

    /// The workload can run forever
    Unbounded,
}
//
impl JobEstimate {
    /// Number of jobs to run, using `cap` for unbounded workloads
    pub fn or_cap(self, cap: u64) -> u64 {
        match self {
            Self::Bounded(jobs) => jobs,
            Self::Unbounded => cap,
        }
    }
}

/// Countdown of the jobs that a workload has left
///
/// Configured from a job count option, where a negative count means that
/// the workload never runs out of jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct JobBudget(Option<u64>);
//
impl JobBudget {
    /// Budget of `jobs` jobs
    pub fn bounded(jobs: u64) -> Self {
        Self(Some(jobs))
    }

    /// Budget that never runs out
    pub fn unbounded() -> Self {
        Self(None)
    }

    /// Parse a job count option argument
    pub fn parse(option: char, argument: Option<&str>) -> Result<Self, ConfigError> {
        let jobs = config::parse_value::<i64>(option, argument)?;
        Ok(u64::try_from(jobs).map_or_else(|_| Self::unbounded(), Self::bounded))
    }

    /// Number of jobs left
    pub fn estimate(&self) -> JobEstimate {
        self.0.map_or(JobEstimate::Unbounded, JobEstimate::Bounded)
    }

    /// Take one job from the budget, return false if there was none left
    pub fn take(&mut self) -> bool {
        match &mut self.0 {
            Some(0) => false,
            Some(remaining) => {
                *remaining -= 1;
                true
            }
            None => true,
        }
    }
}

/// Failure to initialize a workload
#[derive(Debug, Error)]
pub enum InitError {
    /// Invalid configuration
    #[error("bad configuration ({0})")]
    Config(#[from] ConfigError),

    /// Failed to acquire a resource
    #[error("failed to set up resources ({0})")]
    Resource(#[from] ResourceError),

    /// The busy loop could not be calibrated
    #[error("failed to calibrate the busy loop ({0})")]
    Calibration(#[from] CalibrationError),
}

/// Failure to acquire a workload resource
#[derive(Debug, Error)]
pub enum ResourceError {
    /// Config file could not be read
    #[error("failed to read config file {} ({source})", path.display())]
    ConfigFile {
        /// Location of the config file
        path: PathBuf,

        /// Underlying I/O error
        source: io::Error,
    },

    /// Memory-bound traversal could not be set up
    #[error("failed to map pointer-chase data ({0})")]
    Membound(#[from] MemboundError),
}

/// Failure reported by a workload while performing a job
#[derive(Debug, Error)]
#[error("{message}")]
pub struct JobError {
    /// Description of the failure
    message: Box<str>,
}
//
impl JobError {
    /// Report a job failure
    pub fn new(message: impl Into<Box<str>>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
