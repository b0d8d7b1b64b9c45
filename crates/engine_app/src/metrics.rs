//! Sliding-window outcome tracking.

use std::collections::VecDeque;

/// Success ratio over the most recent `window` outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowedRatio {
    window: usize,
    samples: VecDeque<bool>,
}

impl WindowedRatio {
    /// A window of zero is treated as one.
    #[must_use]
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
        }
    }

    pub fn record(&mut self, success: bool) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(success);
    }

    /// `None` until the first sample.
    #[must_use]
    pub fn ratio(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.successes() as f64 / self.samples.len() as f64)
    }

    #[must_use]
    pub fn successes(&self) -> usize {
        self.samples.iter().filter(|s| **s).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn window(&self) -> usize {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio_over_window() {
        let mut ratio = WindowedRatio::new(4);
        assert_eq!(ratio.ratio(), None);

        for outcome in [false, false, true, true, true, true] {
            ratio.record(outcome);
        }
        assert_eq!(ratio.len(), 4);
        assert_eq!(ratio.ratio(), Some(1.0));

        ratio.record(false);
        assert_eq!(ratio.ratio(), Some(0.75));
    }
}
