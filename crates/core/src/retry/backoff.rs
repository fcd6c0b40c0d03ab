use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
    Fibonacci,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterType {
    None,
    Full,
    Equal,
    Decorrelated,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            "fixed" => Ok(Self::Fixed),
            "fibonacci" => Ok(Self::Fibonacci),
            other => Err(ConfigError::Validation(format!(
                "unsupported backoff strategy `{other}` (expected exponential|linear|fixed|fibonacci)"
            ))),
        }
    }
}

impl std::str::FromStr for JitterType {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "full" => Ok(Self::Full),
            "equal" => Ok(Self::Equal),
            "decorrelated" => Ok(Self::Decorrelated),
            other => Err(ConfigError::Validation(format!(
                "unsupported jitter type `{other}` (expected none|full|equal|decorrelated)"
            ))),
        }
    }
}

/// Delay schedule shared by every retry strategy.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: BackoffStrategy,
    pub jitter: JitterType,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff: BackoffStrategy::Exponential,
            jitter: JitterType::Equal,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: JitterType) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Un-jittered delay for the `retry_count`-th retry, clamped to `max_delay`.
    pub fn base_delay_for(&self, retry_count: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();

        let raw = match self.backoff {
            BackoffStrategy::Exponential => base * 2f64.powi(retry_count.min(1024) as i32),
            BackoffStrategy::Linear => base * (f64::from(retry_count) + 1.0),
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Fibonacci => base * fibonacci(retry_count.saturating_add(1)),
        };

        Duration::from_secs_f64(clamp_secs(raw, max))
    }

    /// Delay for the `retry_count`-th retry with the configured jitter applied.
    ///
    /// Decorrelated jitter draws from `[base_delay, previous * 3]` where
    /// `previous` is the un-jittered delay of the preceding attempt.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let delay = self.base_delay_for(retry_count);
        let previous = if retry_count == 0 {
            self.base_delay
        } else {
            self.base_delay_for(retry_count - 1)
        };
        self.apply_jitter(delay, previous, &mut rand::thread_rng())
    }

    pub fn apply_jitter<R: Rng + ?Sized>(
        &self,
        delay: Duration,
        previous: Duration,
        rng: &mut R,
    ) -> Duration {
        let secs = delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();

        let jittered = match self.jitter {
            JitterType::None => secs,
            JitterType::Full => uniform(rng, 0.0, secs),
            JitterType::Equal => secs / 2.0 + uniform(rng, 0.0, secs / 2.0),
            JitterType::Decorrelated => {
                uniform(rng, self.base_delay.as_secs_f64(), previous.as_secs_f64() * 3.0)
            }
        };

        Duration::from_secs_f64(clamp_secs(jittered, max))
    }
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, low: f64, high: f64) -> f64 {
    if high <= low {
        return low;
    }
    rng.gen_range(low..=high)
}

fn clamp_secs(value: f64, max: f64) -> f64 {
    if value.is_nan() || value < 0.0 {
        return 0.0;
    }
    value.min(max)
}

/// `fib(1) = fib(2) = 1`. Saturates well past any realistic delay ceiling.
fn fibonacci(n: u32) -> f64 {
    let (mut previous, mut current) = (0.0_f64, 1.0_f64);
    for _ in 1..n.min(200) {
        let next = previous + current;
        previous = current;
        current = next;
    }
    if n == 0 {
        0.0
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{fibonacci, BackoffStrategy, JitterType, RetryConfig};

    fn config(backoff: BackoffStrategy, jitter: JitterType) -> RetryConfig {
        RetryConfig::default()
            .with_backoff(backoff)
            .with_jitter(jitter)
            .with_delays(Duration::from_millis(100), Duration::from_secs(5))
    }

    #[test]
    fn formulas_match_schedule() {
        let exponential = config(BackoffStrategy::Exponential, JitterType::None);
        assert_eq!(exponential.base_delay_for(0), Duration::from_millis(100));
        assert_eq!(exponential.base_delay_for(3), Duration::from_millis(800));

        let linear = config(BackoffStrategy::Linear, JitterType::None);
        assert_eq!(linear.base_delay_for(0), Duration::from_millis(100));
        assert_eq!(linear.base_delay_for(4), Duration::from_millis(500));

        let fixed = config(BackoffStrategy::Fixed, JitterType::None);
        assert_eq!(fixed.base_delay_for(9), Duration::from_millis(100));

        let fib = config(BackoffStrategy::Fibonacci, JitterType::None);
        let schedule: Vec<_> = (0..6).map(|n| fib.base_delay_for(n).as_millis()).collect();
        assert_eq!(schedule, vec![100, 100, 200, 300, 500, 800]);
    }

    #[test]
    fn unjittered_delays_are_monotonic_until_clamped() {
        for backoff in
            [BackoffStrategy::Exponential, BackoffStrategy::Linear, BackoffStrategy::Fibonacci]
        {
            let config = config(backoff, JitterType::None);
            let mut previous = Duration::ZERO;
            for n in 0..200 {
                let delay = config.delay_for(n);
                assert!(delay >= previous, "{backoff:?} regressed at attempt {n}");
                assert!(delay <= config.max_delay);
                previous = delay;
            }
            assert_eq!(previous, config.max_delay, "{backoff:?} should settle at max_delay");
        }
    }

    #[test]
    fn full_jitter_stays_within_zero_and_base() {
        let config = config(BackoffStrategy::Exponential, JitterType::Full);
        for n in 0..8 {
            let base = config.base_delay_for(n);
            for _ in 0..50 {
                let delay = config.delay_for(n).as_secs_f64();
                assert!(delay <= base.as_secs_f64() + 1e-6, "full jitter exceeded base at {n}");
            }
        }
    }

    #[test]
    fn equal_jitter_stays_within_half_and_base() {
        let config = config(BackoffStrategy::Linear, JitterType::Equal);
        for n in 0..8 {
            let base = config.base_delay_for(n);
            for _ in 0..50 {
                let delay = config.delay_for(n).as_secs_f64();
                assert!(delay + 1e-6 >= base.as_secs_f64() / 2.0);
                assert!(delay <= base.as_secs_f64() + 1e-6);
            }
        }
    }

    #[test]
    fn decorrelated_jitter_draws_between_base_and_three_times_previous() {
        let config = config(BackoffStrategy::Exponential, JitterType::Decorrelated);
        for n in 1..5 {
            let previous = config.base_delay_for(n - 1);
            for _ in 0..50 {
                let delay = config.delay_for(n).as_secs_f64();
                assert!(delay + 1e-6 >= config.base_delay.as_secs_f64());
                assert!(delay <= previous.as_secs_f64() * 3.0 + 1e-6);
            }
        }
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let config = config(BackoffStrategy::Exponential, JitterType::None);
        assert_eq!(config.base_delay_for(u32::MAX), config.max_delay);

        let fib = config.clone().with_backoff(BackoffStrategy::Fibonacci);
        assert_eq!(fib.base_delay_for(u32::MAX), fib.max_delay);
        assert_eq!(fibonacci(1), 1.0);
        assert_eq!(fibonacci(2), 1.0);
        assert_eq!(fibonacci(7), 13.0);
    }

    #[test]
    fn parse_strategy_and_jitter_names() {
        assert_eq!("Fibonacci".parse::<BackoffStrategy>().ok(), Some(BackoffStrategy::Fibonacci));
        assert_eq!("decorrelated".parse::<JitterType>().ok(), Some(JitterType::Decorrelated));
        assert!("random".parse::<JitterType>().is_err());
    }
}
