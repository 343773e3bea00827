//! Memory-bound workload that chases pointers through a pinned mapping

use crate::{
    config::{self, ConfigOption, OptionSet},
    ConfigError, InitError, JobBudget, JobError, JobEstimate, JobStatus, ResourceError, Workload,
};
use loadgen::{membound, MemboundError, PointerChase};
use std::{
    hint::black_box,
    path::{Path, PathBuf},
};

/// Options of the memory-bound workload
pub const OPTIONS: OptionSet<'static> = OptionSet::new("d:g:i:j:");

/// Memory-bound workload settings
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemoryLoadConfig {
    /// Location of the pointer-chase data file (`-d`)
    pub data_file: PathBuf,

    /// Array column traversed by each job (`-g`)
    pub graph_index: usize,

    /// Successor links followed by each job (`-i`)
    pub iterations: u64,

    /// Number of jobs (`-j`)
    pub jobs: JobBudget,
}
//
impl Default for MemoryLoadConfig {
    fn default() -> Self {
        Self {
            data_file: PathBuf::from("./membound_input.dat"),
            graph_index: 0,
            iterations: 1_000_000,
            jobs: JobBudget::bounded(10_000),
        }
    }
}
//
impl MemoryLoadConfig {
    /// Load settings from a config file, starting from the defaults
    pub fn load(path: &Path) -> Result<Self, InitError> {
        let mut result = Self::default();
        for option in config::load(path, OPTIONS)? {
            result.apply(&option)?;
        }
        Ok(result)
    }

    /// Override a setting from a config file option
    ///
    /// Options outside of [`OPTIONS`] are rejected as bad lines.
    pub fn apply(&mut self, option: &ConfigOption) -> Result<(), ConfigError> {
        match option.name {
            'd' => {
                self.data_file = option
                    .argument
                    .as_deref()
                    .map(PathBuf::from)
                    .ok_or(ConfigError::MissingArgument(option.name))?
            }
            'g' => self.graph_index = option.value()?,
            'i' => self.iterations = option.value()?,
            'j' => self.jobs = JobBudget::parse(option.name, option.argument.as_deref())?,
            _ => return Err(ConfigError::BadLine(option.to_string().into())),
        }
        Ok(())
    }
}

/// Pointer-chase traversal, one per job
#[derive(Debug)]
pub struct MemoryLoad {
    /// Mapped data file
    chase: PointerChase,

    /// Jobs left to run
    budget: JobBudget,

    /// Node where the last traversal ended
    last_node: u32,
}
//
impl MemoryLoad {
    /// Set up the workload from settings, using the host cache line size
    pub fn new(config: &MemoryLoadConfig) -> Result<(Self, JobEstimate), InitError> {
        let stride = membound::words_per_cache_line().map_err(ResourceError::from)?;
        Self::with_stride(config, stride)
    }

    /// Set up the workload from settings, with an explicit header length
    ///
    /// A graph index that does not fit in the header is a bad `-g` value.
    pub fn with_stride(
        config: &MemoryLoadConfig,
        stride: usize,
    ) -> Result<(Self, JobEstimate), InitError> {
        let chase = PointerChase::open_with_stride(
            &config.data_file,
            stride,
            config.graph_index,
            config.iterations,
        )
        .map_err(|e| match e {
            MemboundError::GraphIndexOutOfRange { graph_index, .. } => {
                InitError::Config(ConfigError::InvalidValue {
                    option: 'g',
                    value: graph_index.to_string().into(),
                    reason: e.to_string(),
                })
            }
            other => ResourceError::from(other).into(),
        })?;
        Ok(Self::from_chase(chase, config.jobs))
    }

    /// Set up the workload around an existing traversal
    pub fn from_chase(chase: PointerChase, budget: JobBudget) -> (Self, JobEstimate) {
        let result = Self {
            chase,
            budget,
            last_node: 1,
        };
        (result, budget.estimate())
    }

    /// Node where the last traversal ended, or 1 if no job ran yet
    pub fn last_node(&self) -> u32 {
        self.last_node
    }
}
//
impl Workload for MemoryLoad {
    fn name() -> &'static str {
        "membound"
    }

    fn init(config: &Path) -> Result<(Self, JobEstimate), InitError> {
        let config = MemoryLoadConfig::load(config)?;
        Self::new(&config)
    }

    fn perform_job(&mut self) -> Result<JobStatus, JobError> {
        if !self.budget.take() {
            return Ok(JobStatus::Done);
        }
        self.last_node = black_box(self.chase.run());
        Ok(JobStatus::Continue)
    }
}
