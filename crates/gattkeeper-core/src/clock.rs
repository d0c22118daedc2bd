//! Monotonic time source for the update loop.

use std::time::Duration;

use tokio::time::Instant;

/// Monotonic clock owned by the update worker.
///
/// All scheduler timing (task deadlines, reconnect windows, forced-read
/// timers) is measured against this clock. It is a thin wrapper over
/// [`tokio::time::Instant`] so tests running under tokio's paused time see
/// the scheduler advance deterministically.
#[derive(Debug, Clone)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            origin: Instant::now(),
        }
    }

    /// The current instant.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Time elapsed since the clock was created.
    pub fn uptime(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_uptime_advances() {
        let clock = Clock::new();
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(clock.uptime(), Duration::from_millis(250));
    }
}
