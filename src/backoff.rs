use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{BackoffConfig, ConfigError};

/// Delays never go below this, whatever the jitter draws.
pub const MIN_DELAY: Duration = Duration::from_millis(1);

const MAX_EXPONENT: u32 = 63;

/// Exponential backoff with symmetric ratio jitter.
///
/// `next_delay(a) = max(1ms, clamp(base * 2^a, base, max) * (1 ± jitter))`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    base_ms: u64,
    max_ms: u64,
    jitter_ratio: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max_delay: Duration, jitter_ratio: f64) -> Result<Self, ConfigError> {
        let config = BackoffConfig {
            base_ms: duration_ms(base),
            max_ms: duration_ms(max_delay),
            jitter_ratio,
        };
        Self::from_config(&config)
    }

    pub fn from_config(config: &BackoffConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            base_ms: config.base_ms,
            max_ms: config.max_ms,
            jitter_ratio: config.jitter_ratio,
        })
    }

    pub fn jitter_ratio(&self) -> f64 {
        self.jitter_ratio
    }

    /// The un-jittered delay for `attempt`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(MAX_EXPONENT);
        let exponential = self.base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(exponential.clamp(self.base_ms, self.max_ms))
    }

    pub fn next_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let capped = self.base_delay(attempt);
        if self.jitter_ratio == 0.0 {
            return capped.max(MIN_DELAY);
        }

        let factor = rng.gen_range(-self.jitter_ratio..=self.jitter_ratio);
        let jittered = (duration_ms(capped) as f64 * (1.0 + factor)).round();
        let ms = if jittered.is_finite() && jittered > 0.0 {
            jittered as u64
        } else {
            0
        };
        Duration::from_millis(ms).max(MIN_DELAY)
    }
}

/// Shared randomness for jitter. Seeded sources make retry schedules
/// reproducible in tests.
#[derive(Debug)]
pub struct JitterSource(Mutex<StdRng>);

impl JitterSource {
    pub fn seeded(seed: u64) -> Self {
        Self(Mutex::new(StdRng::seed_from_u64(seed)))
    }

    pub fn from_entropy() -> Self {
        Self(Mutex::new(StdRng::from_entropy()))
    }

    pub fn next_delay(&self, policy: &BackoffPolicy, attempt: u32) -> Duration {
        let mut rng = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        policy.next_delay(attempt, &mut *rng)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
