//! CPU-bound workload whose job lengths follow a noisy square wave

use crate::{
    config::{self, ConfigOption, OptionSet},
    ConfigError, InitError, JobBudget, JobError, JobEstimate, JobStatus, Workload,
};
use loadgen::{busy_work, CalibrationFactor, SquareWave, SquareWaveParams};
use std::path::Path;

/// Options of the square wave workload
pub const OPTIONS: OptionSet<'static> = OptionSet::new("j:P:D:d:M:m:N:s:");

/// Square wave workload settings, with job lengths in milliseconds
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CpuLoadConfig {
    /// Number of jobs (`-j`)
    pub jobs: JobBudget,

    /// Number of jobs in one period of the wave (`-P`)
    pub period: u64,

    /// Fraction of the period spent at the maximum job length (`-D`)
    pub duty_cycle: f64,

    /// Index of the first job within the wave (`-d`)
    pub start_index: u64,

    /// Nominal length of high jobs in milliseconds (`-M`)
    pub maximum_ms: f64,

    /// Nominal length of low jobs in milliseconds (`-m`)
    pub minimum_ms: f64,

    /// Maximal noise as a fraction of the nominal length (`-N`)
    pub noise_ratio: f64,

    /// Initial state of the noise generator (`-s`)
    pub seed: u64,
}
//
impl Default for CpuLoadConfig {
    fn default() -> Self {
        Self {
            jobs: JobBudget::bounded(10_000),
            period: 10_000,
            duty_cycle: 0.5,
            start_index: 0,
            maximum_ms: 5.0,
            minimum_ms: 1.0,
            noise_ratio: 0.2,
            seed: 0,
        }
    }
}
//
impl CpuLoadConfig {
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
            'j' => self.jobs = JobBudget::parse(option.name, option.argument.as_deref())?,
            'P' => self.period = option.value()?,
            'D' => self.duty_cycle = option.value()?,
            'd' => self.start_index = option.value()?,
            'M' => self.maximum_ms = milliseconds(option)?,
            'm' => self.minimum_ms = milliseconds(option)?,
            'N' => self.noise_ratio = option.value()?,
            's' => self.seed = option.value()?,
            _ => return Err(ConfigError::BadLine(option.to_string().into())),
        }
        Ok(())
    }

    /// Square wave parameters, with job lengths converted to work units
    pub fn square_wave(&self, factor: CalibrationFactor) -> SquareWaveParams {
        SquareWaveParams {
            period: self.period,
            duty_cycle: self.duty_cycle,
            minimum_nominal_value: factor.work_units(self.minimum_ms),
            maximum_nominal_value: factor.work_units(self.maximum_ms),
            noise_ratio: self.noise_ratio,
            start_index: self.start_index,
            seed: self.seed,
        }
    }
}

/// Parse a job length in milliseconds
fn milliseconds(option: &ConfigOption) -> Result<f64, ConfigError> {
    let ms: f64 = option.value()?;
    if ms.is_finite() && ms >= 0.0 {
        Ok(ms)
    } else {
        Err(ConfigError::InvalidValue {
            option: option.name,
            value: option.argument.clone().unwrap_or_default(),
            reason: "job length must be a finite non-negative number of milliseconds".into(),
        })
    }
}

/// Busy loop whose job lengths follow a square wave
#[derive(Clone, Debug, PartialEq)]
pub struct CpuLoad {
    /// Job length generator, in busy-loop iterations
    wave: SquareWave,

    /// Jobs left to run
    budget: JobBudget,

    /// Busy-loop state, carried from one job to the next
    work_state: i32,
}
//
impl CpuLoad {
    /// Set up the workload from settings and a known calibration factor
    pub fn new(
        config: &CpuLoadConfig,
        factor: CalibrationFactor,
    ) -> Result<(Self, JobEstimate), ConfigError> {
        let params = config.square_wave(factor);
        let wave = SquareWave::new(params)?;
        log::debug!(
            "Set up square wave of period {} with {}/{} iterations per high/low job",
            params.period,
            params.maximum_nominal_value,
            params.minimum_nominal_value
        );
        let result = Self {
            wave,
            budget: config.jobs,
            work_state: 0,
        };
        Ok((result, config.jobs.estimate()))
    }

    /// Set up the workload from a config file and a known calibration factor
    pub fn with_factor(
        config: &Path,
        factor: CalibrationFactor,
    ) -> Result<(Self, JobEstimate), InitError> {
        let config = CpuLoadConfig::load(config)?;
        Ok(Self::new(&config, factor)?)
    }

    /// Job length generator
    pub fn wave(&self) -> &SquareWave {
        &self.wave
    }
}
//
impl Workload for CpuLoad {
    fn name() -> &'static str {
        "sqrwav"
    }

    fn init(config: &Path) -> Result<(Self, JobEstimate), InitError> {
        // Job lengths are configured in milliseconds, so we need to know how
        // fast the busy loop runs before the config can be interpreted
        let factor = CalibrationFactor::host()?;
        Self::with_factor(config, factor)
    }

    fn perform_job(&mut self) -> Result<JobStatus, JobError> {
        if !self.budget.take() {
            return Ok(JobStatus::Done);
        }
        let target = self.wave.next_target();
        self.work_state = busy_work(target, self.work_state);
        Ok(JobStatus::Continue)
    }
}
