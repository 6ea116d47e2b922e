//! Capped exponential back-off shared by the accept loop and client redial.

use std::time::Duration;

/// Shortest wait either caller will sleep for.
const MIN_DELAY: Duration = Duration::from_millis(1);

/// Retry pacing for accept failures and reconnect attempts.
///
/// The first retry waits `initial_delay`; each consecutive failure doubles
/// the wait up to `max_delay`. The accept loop starts over after a
/// successful accept, the client after a successful dial.
///
/// The server defaults to 5 ms rising to 1 s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Wait before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single wait.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    /// Raise both delays to at least one millisecond and order them so the
    /// smaller one is `initial_delay`.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use wirelink::server::BackoffConfig;
    ///
    /// let cfg = BackoffConfig {
    ///     initial_delay: Duration::from_secs(2),
    ///     max_delay: Duration::ZERO,
    /// }
    /// .normalized();
    /// assert_eq!(cfg.initial_delay, Duration::from_millis(1));
    /// assert_eq!(cfg.max_delay, Duration::from_secs(2));
    /// ```
    #[must_use]
    pub fn normalized(self) -> Self {
        let a = self.initial_delay.max(MIN_DELAY);
        let b = self.max_delay.max(MIN_DELAY);
        Self {
            initial_delay: a.min(b),
            max_delay: a.max(b),
        }
    }

    /// Begin a retry sequence.
    pub(crate) fn start(self) -> Backoff {
        let config = self.normalized();
        Backoff {
            config,
            upcoming: config.initial_delay,
        }
    }
}

/// One run of consecutive failures.
#[derive(Debug)]
pub(crate) struct Backoff {
    config: BackoffConfig,
    upcoming: Duration,
}

impl Backoff {
    /// Wait to sleep before the next attempt; the one after doubles.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.upcoming;
        self.upcoming = delay.saturating_mul(2).min(self.config.max_delay);
        delay
    }

    /// Wait the following [`Backoff::next_delay`] call will return.
    pub(crate) fn upcoming(&self) -> Duration { self.upcoming }

    /// Start over after a success.
    pub(crate) fn reset(&mut self) { self.upcoming = self.config.initial_delay; }
}
