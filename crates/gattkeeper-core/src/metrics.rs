//! Running round-trip-time averages for reads and writes.

use std::collections::VecDeque;
use std::time::Duration;

/// An N-sample windowed running average of durations.
///
/// The window size is set from `n_for_average_running_read_time` /
/// `n_for_average_running_write_time` in the manager configuration.
#[derive(Debug, Clone)]
pub struct RunningAverage {
    window: usize,
    samples: VecDeque<Duration>,
    sum: Duration,
}

impl RunningAverage {
    /// Create an average over the last `window` samples. A window of zero
    /// is treated as one.
    pub fn new(window: usize) -> Self {
        RunningAverage {
            window: window.max(1),
            samples: VecDeque::new(),
            sum: Duration::ZERO,
        }
    }

    /// Record one sample, evicting the oldest when the window is full.
    pub fn record(&mut self, sample: Duration) {
        if self.samples.len() == self.window {
            if let Some(old) = self.samples.pop_front() {
                self.sum = self.sum.saturating_sub(old);
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;
    }

    /// The current average, or `None` before the first sample.
    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.sum / self.samples.len() as u32)
        }
    }

    /// Number of samples currently held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Drop all samples.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.sum = Duration::ZERO;
    }
}

/// The per-device pair of running averages.
#[derive(Debug, Clone)]
pub struct RoundTripTimes {
    pub read: RunningAverage,
    pub write: RunningAverage,
}

impl RoundTripTimes {
    pub fn new(read_window: usize, write_window: usize) -> Self {
        RoundTripTimes {
            read: RunningAverage::new(read_window),
            write: RunningAverage::new(write_window),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_average() {
        let avg = RunningAverage::new(5);
        assert!(avg.average().is_none());
        assert!(avg.is_empty());
    }

    #[test]
    fn test_simple_average() {
        let mut avg = RunningAverage::new(4);
        avg.record(Duration::from_millis(10));
        avg.record(Duration::from_millis(30));
        assert_eq!(avg.average(), Some(Duration::from_millis(20)));
        assert_eq!(avg.len(), 2);
    }

    #[test]
    fn test_window_eviction() {
        let mut avg = RunningAverage::new(2);
        avg.record(Duration::from_millis(100));
        avg.record(Duration::from_millis(10));
        avg.record(Duration::from_millis(30));
        // The 100ms sample fell out of the window.
        assert_eq!(avg.average(), Some(Duration::from_millis(20)));
        assert_eq!(avg.len(), 2);
    }

    #[test]
    fn test_zero_window_clamped() {
        let mut avg = RunningAverage::new(0);
        avg.record(Duration::from_millis(7));
        avg.record(Duration::from_millis(9));
        assert_eq!(avg.average(), Some(Duration::from_millis(9)));
    }

    #[test]
    fn test_clear() {
        let mut avg = RunningAverage::new(3);
        avg.record(Duration::from_millis(5));
        avg.clear();
        assert!(avg.average().is_none());
    }
}
