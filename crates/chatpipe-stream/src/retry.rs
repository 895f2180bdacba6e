//! Retry and backoff state for the outer request lifecycle

use std::time::Duration;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first request
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.max(1.0);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Where a send call is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Sending,
    Streaming,
    Completed,
    Failed,
}

/// Per-send retry bookkeeping. `attempt` never exceeds `max_attempts`.
#[derive(Debug, Clone)]
pub struct RetryState {
    attempt: u32,
    max_attempts: u32,
    phase: Phase,
    config: RetryConfig,
}

impl RetryState {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            attempt: 0,
            max_attempts: config.max_retries,
            phase: Phase::Idle,
            config,
        }
    }

    /// Retries consumed so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn enter(&mut self, next: Phase, from: &[Phase]) {
        debug_assert!(
            from.contains(&self.phase),
            "invalid retry transition {:?} -> {:?}",
            self.phase,
            next
        );
        self.phase = next;
    }

    /// A request is about to be issued
    pub fn begin_send(&mut self) {
        self.enter(Phase::Sending, &[Phase::Idle, Phase::Failed]);
    }

    /// Headers arrived with a success status
    pub fn begin_streaming(&mut self) {
        self.enter(Phase::Streaming, &[Phase::Sending]);
    }

    /// Terminal success; no further retries are possible
    pub fn complete(&mut self) {
        self.enter(Phase::Completed, &[Phase::Streaming]);
    }

    /// Record a failure. Returns the delay to wait before the next attempt,
    /// or `None` when the budget is exhausted.
    pub fn fail(&mut self) -> Option<Duration> {
        self.enter(Phase::Failed, &[Phase::Sending, Phase::Streaming]);
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self.config.delay_for_attempt(self.attempt);
        self.attempt += 1;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delays_double() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(4));
    }

    #[test]
    fn test_delays_non_decreasing_and_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 3.0,
        };
        let delays: Vec<Duration> = (0..10).map(|a| config.delay_for_attempt(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[9], Duration::from_secs(5));
    }

    #[test]
    fn test_multiplier_below_one_never_shrinks() {
        let config = RetryConfig {
            backoff_multiplier: 0.5,
            ..RetryConfig::default()
        };
        assert_eq!(config.delay_for_attempt(0), config.delay_for_attempt(3));
    }

    #[test]
    fn test_retry_budget() {
        let mut state = RetryState::new(RetryConfig::default());
        assert_eq!(state.phase, Phase::Idle);

        state.begin_send();
        assert_eq!(state.fail(), Some(Duration::from_secs(2)));
        assert_eq!(state.attempt(), 1);
        assert_eq!(state.phase, Phase::Failed);

        state.begin_send();
        assert_eq!(state.fail(), Some(Duration::from_secs(4)));

        state.begin_send();
        assert_eq!(state.fail(), None);
        assert_eq!(state.attempt(), state.max_attempts());
    }

    #[test]
    fn test_completion_is_final() {
        let mut state = RetryState::new(RetryConfig::default());
        state.begin_send();
        state.begin_streaming();
        assert_eq!(state.phase, Phase::Streaming);
        state.complete();
        assert_eq!(state.phase, Phase::Completed);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "invalid retry transition")]
    fn test_complete_requires_streaming() {
        let mut state = RetryState::new(RetryConfig::default());
        state.begin_send();
        state.complete();
    }
}
