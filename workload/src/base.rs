//! Workload that performs no work
//!
//! Timing its jobs measures the overhead of the harness itself.

use crate::{
    config::{self, OptionSet},
    InitError, JobBudget, JobError, JobEstimate, JobStatus, Workload,
};
use std::path::Path;

/// Options of the base workload
pub const OPTIONS: OptionSet<'static> = OptionSet::new("J:");

/// Default number of jobs
pub const DEFAULT_JOBS: u64 = 1000;

/// Job counter that does nothing else
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Base {
    /// Jobs left to run
    budget: JobBudget,

    /// Jobs run so far
    completed: u64,
}
//
impl Base {
    /// Set up a base workload that will run a certain number of jobs
    pub fn new(budget: JobBudget) -> Self {
        Self {
            budget,
            completed: 0,
        }
    }

    /// Number of jobs run so far
    pub fn completed(&self) -> u64 {
        self.completed
    }
}
//
impl Workload for Base {
    fn name() -> &'static str {
        "base"
    }

    fn init(config: &Path) -> Result<(Self, JobEstimate), InitError> {
        let mut budget = JobBudget::bounded(DEFAULT_JOBS);
        for option in config::load(config, OPTIONS)? {
            match option.name {
                'J' => budget = JobBudget::parse(option.name, option.argument.as_deref())?,
                _ => unreachable!("option -{} is not in the base option set", option.name),
            }
        }
        log::debug!("Set up base workload with {:?}", budget.estimate());
        Ok((Self::new(budget), budget.estimate()))
    }

    fn perform_job(&mut self) -> Result<JobStatus, JobError> {
        if !self.budget.take() {
            return Ok(JobStatus::Done);
        }
        self.completed += 1;
        Ok(JobStatus::Continue)
    }
}
