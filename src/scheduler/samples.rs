//! Rolling population sample buffer.

use std::collections::VecDeque;

/// Capped ring buffer of population samples for the currently-open
/// activity period. Oldest samples fall off once the depth is reached.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    samples: VecDeque<i64>,
    depth: usize,
}

impl SampleBuffer {
    pub fn new(depth: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(depth.max(1)),
            depth: depth.max(1),
        }
    }

    pub fn push(&mut self, sample: i64) {
        if self.samples.len() == self.depth {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Rounded average of the held samples, 0 when empty.
    pub fn average(&self) -> i64 {
        if self.samples.is_empty() {
            return 0;
        }
        let sum: i64 = self.samples.iter().sum();
        (sum as f64 / self.samples.len() as f64).round() as i64
    }

    /// Drop all samples; called when a new activity period begins.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
