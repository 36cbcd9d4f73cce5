use std::time::Duration;

use crate::config::ReconnectSettings;

/// Exponential backoff between push channel reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    max_attempts: Option<u32>,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            multiplier: multiplier.max(1.0),
            max_attempts,
            attempts: 0,
        }
    }

    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.initial_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
            settings.multiplier,
            settings.max_attempts,
        )
    }

    /// Delay before the next attempt, or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self
            .max_attempts
            .is_some_and(|max_attempts| self.attempts >= max_attempts)
        {
            return None;
        }
        let exponent = i32::try_from(self.attempts).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let max_millis = self.max_delay.as_millis() as f64;
        let delay = if scaled.is_finite() && scaled < max_millis {
            Duration::from_millis(scaled.round() as u64)
        } else {
            self.max_delay
        };
        self.attempts = self.attempts.saturating_add(1);
        Some(delay)
    }

    /// Called once a channel opens successfully.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
