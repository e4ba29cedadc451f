//! Window value type and window assigners (`spec.md` §4.8).
//!
//! A [`Window`] is a half-open `[start, end)` span of event time,
//! millisecond-resolution. [`Tumbling`] assigns each timestamp to exactly
//! one non-overlapping window; [`Sliding`] assigns it to every window of a
//! fixed size advancing by a fixed step, so one timestamp may belong to
//! several windows at once.

use std::time::Duration;

/// A half-open event-time span: includes `start`, excludes `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Window {
    pub start: i64,
    pub end: i64,
}

impl Window {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, timestamp_millis: i64) -> bool {
        timestamp_millis >= self.start && timestamp_millis < self.end
    }
}

/// Assigns event-time timestamps to one or more windows.
pub trait WindowAssigner: Send + Sync {
    /// Every window `timestamp_millis` belongs to, in ascending order of
    /// `start`.
    fn assign(&self, timestamp_millis: i64) -> Vec<Window>;

    /// The latest `end` any window this assigner could ever produce for
    /// `timestamp_millis` might have — used to decide when a window can be
    /// safely closed given a watermark.
    fn max_window_end(&self, timestamp_millis: i64) -> i64 {
        self.assign(timestamp_millis)
            .iter()
            .map(|w| w.end)
            .max()
            .unwrap_or(timestamp_millis)
    }
}

/// Fixed-size, non-overlapping windows: `size`-millisecond buckets aligned
/// to the epoch.
#[derive(Debug, Clone, Copy)]
pub struct Tumbling {
    size_millis: i64,
}

impl Tumbling {
    pub fn new(size: Duration) -> Self {
        Self {
            size_millis: size.as_millis() as i64,
        }
    }
}

impl WindowAssigner for Tumbling {
    fn assign(&self, timestamp_millis: i64) -> Vec<Window> {
        let start = (timestamp_millis.div_euclid(self.size_millis)) * self.size_millis;
        vec![Window::new(start, start + self.size_millis)]
    }
}

/// Fixed-size windows advancing by `step`, so `size / step` windows overlap
/// at any given timestamp when `step < size`.
#[derive(Debug, Clone, Copy)]
pub struct Sliding {
    size_millis: i64,
    step_millis: i64,
}

impl Sliding {
    pub fn new(size: Duration, step: Duration) -> Self {
        Self {
            size_millis: size.as_millis() as i64,
            step_millis: step.as_millis() as i64,
        }
    }
}

impl WindowAssigner for Sliding {
    fn assign(&self, timestamp_millis: i64) -> Vec<Window> {
        let mut windows = Vec::new();
        let last_start = (timestamp_millis.div_euclid(self.step_millis)) * self.step_millis;
        let mut start = last_start;
        while start > timestamp_millis - self.size_millis {
            windows.push(Window::new(start, start + self.size_millis));
            start -= self.step_millis;
        }
        windows.reverse();
        windows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tumbling_assigns_exactly_one_window() {
        let assigner = Tumbling::new(Duration::from_secs(10));
        assert_eq!(assigner.assign(5_000), vec![Window::new(0, 10_000)]);
        assert_eq!(assigner.assign(10_000), vec![Window::new(10_000, 20_000)]);
    }

    #[test]
    fn sliding_assigns_every_overlapping_window() {
        let assigner = Sliding::new(Duration::from_secs(10), Duration::from_secs(5));
        let windows = assigner.assign(12_000);
        assert_eq!(
            windows,
            vec![Window::new(5_000, 15_000), Window::new(10_000, 20_000)]
        );
    }

    #[test]
    fn window_contains_is_half_open() {
        let w = Window::new(0, 10);
        assert!(w.contains(0));
        assert!(!w.contains(10));
    }
}
