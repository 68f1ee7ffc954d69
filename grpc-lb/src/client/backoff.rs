/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::time::Duration;

use rand::Rng;

/// Parameters of an exponential backoff schedule, as described in
/// https://github.com/grpc/grpc/blob/master/doc/connection-backoff.md.
#[derive(Clone, Debug)]
pub(crate) struct BackoffConfig {
    /// The delay before the first retry.
    pub base_delay: Duration,

    /// The factor applied to the delay after every failed retry.
    pub multiplier: f64,

    /// The fraction by which each delay is randomly spread in both directions.
    pub jitter: f64,

    /// The upper bound of the delay, before jitter.
    pub max_delay: Duration,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub(crate) enum BackoffConfigError {
    #[error("base_delay ({0:?}) exceeds max_delay ({1:?})")]
    BaseExceedsMax(Duration, Duration),
    #[error("multiplier must be at least 1.0, got {0}")]
    MultiplierTooSmall(f64),
    #[error("jitter must be within [0, 1], got {0}")]
    JitterOutOfRange(f64),
}

/// The schedule used between health check stream attempts.
pub(crate) const DEFAULT_BACKOFF_CONFIG: BackoffConfig = BackoffConfig {
    base_delay: Duration::from_secs(1),
    multiplier: 1.6,
    jitter: 0.2,
    max_delay: Duration::from_secs(120),
};

impl BackoffConfig {
    fn validate(&self) -> Result<(), BackoffConfigError> {
        if self.base_delay > self.max_delay {
            return Err(BackoffConfigError::BaseExceedsMax(
                self.base_delay,
                self.max_delay,
            ));
        }
        if self.multiplier < 1.0 {
            return Err(BackoffConfigError::MultiplierTooSmall(self.multiplier));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(BackoffConfigError::JitterOutOfRange(self.jitter));
        }
        Ok(())
    }
}

/// Produces successive, jittered retry delays.  Not thread safe; each retry
/// loop owns its own instance.
pub(crate) struct ExponentialBackoff {
    config: BackoffConfig,
    // Kept as f64 seconds to avoid accumulating rounding errors.
    next_delay_secs: f64,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Result<Self, BackoffConfigError> {
        config.validate()?;
        let next_delay_secs = config.base_delay.as_secs_f64();
        Ok(ExponentialBackoff {
            config,
            next_delay_secs,
        })
    }

    /// Restarts the schedule from `base_delay`.  Called once an attempt made
    /// progress.
    pub fn reset(&mut self) {
        self.next_delay_secs = self.config.base_delay.as_secs_f64();
    }

    /// Returns the delay to wait before the next attempt and advances the
    /// schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next_delay_secs;
        let spread = if self.config.jitter > 0.0 {
            self.config.jitter * rand::rng().random_range(-1.0..1.0)
        } else {
            0.0
        };
        self.next_delay_secs =
            (delay * self.config.multiplier).min(self.config.max_delay.as_secs_f64());
        Duration::from_secs_f64(delay * (1.0 + spread))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{BackoffConfig, BackoffConfigError, DEFAULT_BACKOFF_CONFIG, ExponentialBackoff};

    fn no_jitter(base: u64, multiplier: f64, max: u64) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_secs(base),
            multiplier,
            jitter: 0.0,
            max_delay: Duration::from_secs(max),
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(ExponentialBackoff::new(DEFAULT_BACKOFF_CONFIG).is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let base_too_big = no_jitter(100, 2.0, 10);
        assert!(matches!(
            ExponentialBackoff::new(base_too_big).err(),
            Some(BackoffConfigError::BaseExceedsMax(_, _))
        ));
        assert_eq!(
            ExponentialBackoff::new(no_jitter(1, 0.5, 10)).err(),
            Some(BackoffConfigError::MultiplierTooSmall(0.5))
        );
        let mut bad_jitter = no_jitter(1, 2.0, 10);
        bad_jitter.jitter = 1.5;
        assert_eq!(
            ExponentialBackoff::new(bad_jitter).err(),
            Some(BackoffConfigError::JitterOutOfRange(1.5))
        );
    }

    #[test]
    fn delays_grow_until_capped_and_reset() {
        let mut backoff = ExponentialBackoff::new(no_jitter(1, 2.0, 15)).unwrap();
        let want = [1, 2, 4, 8, 15, 15];
        for secs in want {
            assert_eq!(backoff.next_delay(), Duration::from_secs(secs));
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.2,
            max_delay: Duration::from_secs(15),
        })
        .unwrap();
        for (lo, hi) in [(0.8, 1.2), (1.6, 2.4), (3.2, 4.8)] {
            let secs = backoff.next_delay().as_secs_f64();
            assert!(secs >= lo - 1e-9 && secs <= hi + 1e-9, "{secs} not in [{lo}, {hi}]");
        }
    }
}
