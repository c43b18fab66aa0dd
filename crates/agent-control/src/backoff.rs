//! Exponential backoff with jitter for Connection Manager reconnect attempts
//! (spec §4.D): a per-request cap of 5-15 minutes, plus an overall elapsed-time
//! cap that differs by variant (enforced by the caller, not this type).

use std::time::Duration;

use rand::Rng;

/// Tunable backoff parameters, exposed so tests can shrink them.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Randomizes each computed delay by ±this fraction.
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10 * 60),
            jitter_fraction: 0.2,
        }
    }
}

/// Stateful exponential-backoff delay generator.
pub struct Backoff {
    config: BackoffConfig,
    current_delay: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current_delay = config.initial_delay;
        Self { config, current_delay }
    }

    /// The delay to wait before the next attempt, with jitter applied.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current_delay;
        self.current_delay = std::cmp::min(
            Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.config.multiplier),
            self.config.max_delay,
        );
        jittered(base, self.config.jitter_fraction)
    }

    /// Resets the delay back to its initial value, e.g. after a successful
    /// reconnect.
    pub fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
    }
}

fn jittered(base: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 {
        return base;
    }
    let mut rng = rand::rng();
    let factor = 1.0 + rng.random_range(-fraction..=fraction);
    Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
}

/// The two overall elapsed-time caps a Control Connection enforces (spec §4.D):
/// 30 minutes on initial connect, 72 hours once it has connected at least once.
#[derive(Debug, Clone, Copy)]
pub struct ElapsedCaps {
    pub initial_connect: Duration,
    pub reconnect: Duration,
}

impl ElapsedCaps {
    pub const CONTROL: Self = Self {
        initial_connect: Duration::from_secs(30 * 60),
        reconnect: Duration::from_secs(72 * 60 * 60),
    };

    /// Data Connections share the Control Connection's reconnect shape
    /// (spec §4.D: "Reconnect is the same shape as Control").
    pub const DATA: Self = Self::CONTROL;

    pub fn cap_for(&self, has_connected_once: bool) -> Duration {
        if has_connected_once {
            self.reconnect
        } else {
            self.initial_connect
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_is_capped() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(350),
            jitter_fraction: 0.0,
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
    }

    #[test]
    fn reset_returns_to_initial_delay() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter_fraction: 0.0,
        });
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn elapsed_caps_pick_the_right_budget() {
        assert_eq!(ElapsedCaps::CONTROL.cap_for(false), Duration::from_secs(30 * 60));
        assert_eq!(ElapsedCaps::CONTROL.cap_for(true), Duration::from_secs(72 * 60 * 60));
    }
}
