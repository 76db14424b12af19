use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Fixed-capacity history of per-frame detection probabilities, most recent first.
///
/// Pushing into a full window drops the oldest sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl ConfidenceWindow {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a sample, returning the one that fell off the end.
    pub fn push(&mut self, sample: f64) -> Option<f64> {
        let dropped = if self.is_full() {
            self.samples.pop_back()
        } else {
            None
        };
        self.samples.push_front(sample.clamp(0.0, 1.0));
        dropped
    }

    /// Mean of the samples held; zero when empty.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn latest(&self) -> Option<f64> {
        self.samples.front().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.samples.iter()
    }
}
