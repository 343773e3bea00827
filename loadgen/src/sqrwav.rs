//! Square-wave job length generator
//!
//! Successive jobs alternate between a "high" and a "low" nominal amount of
//! work, following a square wave of configurable period and duty cycle. A
//! bounded multiplicative noise, drawn from a 64-bit LCG, is added on top of
//! the nominal value. The whole sequence is deterministic for a given set of
//! [`SquareWaveParams`].

use std::num::NonZeroU64;
use thiserror::Error;

/// Knuth's 64-bit linear congruential generator
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Lcg(u64);
//
impl Lcg {
    /// Multiplier of the LCG recurrence
    pub const MULTIPLIER: u64 = 6_364_136_223_846_793_005;

    /// Increment of the LCG recurrence
    pub const INCREMENT: u64 = 1_442_695_040_888_963_407;

    /// Start from a certain state
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Current state
    pub fn state(&self) -> u64 {
        self.0
    }

    /// Advance the state and return it
    pub fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(Self::MULTIPLIER).wrapping_add(Self::INCREMENT);
        self.0
    }

    /// Advance the state and map it to a uniformly distributed `[0, 1)` real
    ///
    /// This is `state / 2^64` truncated to the 53 bits of precision that an
    /// `f64` mantissa can hold, which keeps the result strictly below 1.
    pub fn next_fraction(&mut self) -> f64 {
        const SCALE: f64 = 1.0 / (1u64 << 53) as f64;
        (self.next_u64() >> 11) as f64 * SCALE
    }
}

/// Configuration of a [`SquareWave`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SquareWaveParams {
    /// Number of jobs in one period of the wave
    pub period: u64,

    /// Fraction of the period spent at the high value, in `[0, 1]`
    pub duty_cycle: f64,

    /// Nominal work during the low part of the period
    pub minimum_nominal_value: u64,

    /// Nominal work during the high part of the period
    pub maximum_nominal_value: u64,

    /// Maximal noise, as a fraction of the nominal value
    pub noise_ratio: f64,

    /// Job index of the first generated value
    pub start_index: u64,

    /// Initial state of the noise generator
    pub seed: u64,
}

/// Stateful square-wave sequence generator
///
/// Each call to [`next_target()`](Self::next_target) advances the job index
/// and the noise generator by one step.
#[derive(Clone, Debug, PartialEq)]
pub struct SquareWave {
    /// Number of jobs in one period
    period: NonZeroU64,

    /// Number of jobs at the start of each period that use the high value
    high_length: u64,

    /// Low nominal value
    minimum_nominal_value: u64,

    /// High nominal value
    maximum_nominal_value: u64,

    /// Noise amplitude, relative to the nominal value
    noise_ratio: f64,

    /// Index of the next job
    index: u64,

    /// Noise generator
    rng: Lcg,
}
//
impl SquareWave {
    /// Set up the generator, checking parameter validity
    pub fn new(params: SquareWaveParams) -> Result<Self, SquareWaveError> {
        let period = NonZeroU64::new(params.period).ok_or(SquareWaveError::ZeroPeriod)?;
        if !(0.0..=1.0).contains(&params.duty_cycle) {
            return Err(SquareWaveError::DutyCycleOutOfRange(params.duty_cycle));
        }
        if !(params.noise_ratio.is_finite() && params.noise_ratio >= 0.0) {
            return Err(SquareWaveError::InvalidNoiseRatio(params.noise_ratio));
        }
        Ok(Self {
            period,
            high_length: (params.duty_cycle * period.get() as f64) as u64,
            minimum_nominal_value: params.minimum_nominal_value,
            maximum_nominal_value: params.maximum_nominal_value,
            noise_ratio: params.noise_ratio,
            index: params.start_index,
            rng: Lcg::new(params.seed),
        })
    }

    /// Index of the next job
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Truth that a job index falls in the high part of the wave
    pub fn is_high(&self, index: u64) -> bool {
        index % self.period < self.high_length
    }

    /// Nominal work associated with a job index, before noise
    pub fn nominal_value(&self, index: u64) -> u64 {
        if self.is_high(index) {
            self.maximum_nominal_value
        } else {
            self.minimum_nominal_value
        }
    }

    /// Amount of work for the next job
    ///
    /// The result lies in `[nominal, nominal * (1 + noise_ratio))`.
    pub fn next_target(&mut self) -> u64 {
        let nominal = self.nominal_value(self.index);
        self.index = self.index.wrapping_add(1);
        let noise = self.noise_ratio * nominal as f64 * self.rng.next_fraction();
        nominal.saturating_add(noise as u64)
    }
}
//
impl Iterator for SquareWave {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        Some(self.next_target())
    }
}

/// Invalid square wave configuration
#[derive(Clone, Copy, Debug, Error, PartialEq)]
pub enum SquareWaveError {
    /// The period must contain at least one job
    #[error("square wave period must be positive")]
    ZeroPeriod,

    /// The duty cycle is a fraction of the period
    #[error("duty cycle {0} is outside of [0, 1]")]
    DutyCycleOutOfRange(f64),

    /// Noise must be a finite, non-negative ratio
    #[error("noise ratio {0} is not a finite non-negative number")]
    InvalidNoiseRatio(f64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn params(period: u64, duty_cycle: f64, min: u64, max: u64) -> SquareWaveParams {
        SquareWaveParams {
            period,
            duty_cycle,
            minimum_nominal_value: min,
            maximum_nominal_value: max,
            noise_ratio: 0.0,
            start_index: 0,
            seed: 0,
        }
    }

    #[test]
    fn lcg_reference_sequence() {
        let mut lcg = Lcg::new(0);
        let outputs = std::iter::repeat_with(|| lcg.next_u64())
            .take(5)
            .collect::<Vec<_>>();
        assert_eq!(
            outputs,
            [
                1_442_695_040_888_963_407,
                1_876_011_003_808_476_466,
                11_166_244_414_315_200_793,
                7_401_132_627_792_533_940,
                7_076_646_890_315_895_283,
            ]
        );
        assert_eq!(lcg.state(), 7_076_646_890_315_895_283);
    }

    #[test]
    fn half_duty_cycle_phases() {
        let wave = SquareWave::new(params(10, 0.5, 1, 100)).unwrap();
        let targets = wave.take(20).collect::<Vec<_>>();
        let period: [u64; 10] = [100, 100, 100, 100, 100, 1, 1, 1, 1, 1];
        assert_eq!(targets, [period, period].concat());
    }

    #[test]
    fn start_index_offset() {
        let wave = SquareWave::new(SquareWaveParams {
            start_index: 7,
            ..params(10, 0.5, 1, 100)
        })
        .unwrap();
        assert_eq!(
            wave.take(6).collect::<Vec<_>>(),
            [1, 1, 1, 100, 100, 100]
        );
    }

    #[test]
    fn extreme_duty_cycles() {
        let always_low = SquareWave::new(params(4, 0.0, 3, 9)).unwrap();
        assert!(always_low.take(8).all(|target| target == 3));
        let always_high = SquareWave::new(params(4, 1.0, 3, 9)).unwrap();
        assert!(always_high.take(8).all(|target| target == 9));
    }

    #[test]
    fn invalid_params() {
        assert_eq!(
            SquareWave::new(params(0, 0.5, 1, 2)),
            Err(SquareWaveError::ZeroPeriod)
        );
        assert_eq!(
            SquareWave::new(params(10, 1.5, 1, 2)),
            Err(SquareWaveError::DutyCycleOutOfRange(1.5))
        );
        assert_eq!(
            SquareWave::new(SquareWaveParams {
                noise_ratio: -0.1,
                ..params(10, 0.5, 1, 2)
            }),
            Err(SquareWaveError::InvalidNoiseRatio(-0.1))
        );
        assert!(SquareWave::new(params(10, f64::NAN, 1, 2)).is_err());
    }

    proptest! {
        #[test]
        fn noise_bound(
            nominal in 0u64..1_000_000_000_000,
            noise_ratio in 0.0f64..10.0,
            seed in any::<u64>(),
        ) {
            let wave = SquareWave::new(SquareWaveParams {
                noise_ratio,
                seed,
                ..params(7, 0.5, nominal, nominal)
            })
            .unwrap();
            let max_noise = noise_ratio * nominal as f64;
            for target in wave.take(32) {
                prop_assert!(target >= nominal);
                if max_noise > 0.0 {
                    prop_assert!(((target - nominal) as f64) < max_noise);
                } else {
                    prop_assert_eq!(target, nominal);
                }
            }
        }

        #[test]
        fn high_jobs_per_period(period in 1u64..1000, duty_cycle in 0.0f64..=1.0, start in any::<u64>()) {
            let wave = SquareWave::new(params(period, duty_cycle, 0, 1)).unwrap();
            let expected = (duty_cycle * period as f64) as u64;
            let first = start % period;
            let num_high = (first..first + period)
                .filter(|&index| wave.is_high(index))
                .count() as u64;
            prop_assert_eq!(num_high, expected);
        }

        #[test]
        fn deterministic(
            period in 1u64..100,
            duty_cycle in 0.0f64..=1.0,
            noise_ratio in 0.0f64..1.0,
            start_index in 0u64..1000,
            seed in any::<u64>(),
        ) {
            let params = SquareWaveParams {
                period,
                duty_cycle,
                minimum_nominal_value: 1000,
                maximum_nominal_value: 5000,
                noise_ratio,
                start_index,
                seed,
            };
            let first = SquareWave::new(params).unwrap().take(50).collect::<Vec<_>>();
            let second = SquareWave::new(params).unwrap().take(50).collect::<Vec<_>>();
            prop_assert_eq!(first, second);
        }
    }
}
