use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::ReconnectConfig;

/// Time source for reconnect delays, injectable so backoff can be tested
/// without wall-clock sleeps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock that advances instantly when slept on.
pub struct ManualClock {
    origin: Instant,
    offset_ns: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset_ns: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, duration: Duration) {
        // nanosecond resolution so jittered delays are reached exactly
        self.offset_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_ns.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
        // let other threads make progress
        std::thread::yield_now();
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_retries: u32,
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.initial_delay_ms)),
            multiplier: config.multiplier,
            jitter: config.jitter.clamp(0.0, 1.0),
            max_retries: config.max_retries,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

/// Bounded exponential backoff with jitter.
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
    rng: SmallRng,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn with_seed(policy: ReconnectPolicy, seed: u64) -> Self {
        Self {
            policy,
            attempt: 0,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Delay before the next attempt, or `None` once retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_retries {
            return None;
        }

        let base = self.policy.initial_delay.as_secs_f64()
            * self.policy.multiplier.powi(self.attempt as i32);
        let capped = base.min(self.policy.max_delay.as_secs_f64());
        let spread = capped * self.policy.jitter;
        let jittered = if spread > 0.0 {
            capped + self.rng.gen_range(-spread..=spread)
        } else {
            capped
        };

        self.attempt += 1;
        let delay = jittered.clamp(0.0, self.policy.max_delay.as_secs_f64());
        Some(Duration::from_secs_f64(delay))
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
