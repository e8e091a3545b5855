//! Rolling success-rate window.

use std::fmt;

/// Fixed-capacity circular buffer of probe outcomes.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsRing {
    capacity: usize,
    values: Vec<bool>,
    cursor: usize,
}

impl StatisticsRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            values: Vec::new(),
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Record one outcome under the currently configured `capacity`.
    ///
    /// A capacity different from the ring's own discards every sample first.
    pub fn record(&mut self, success: bool, capacity: usize) {
        let capacity = capacity.max(1);
        if capacity != self.capacity {
            self.capacity = capacity;
            self.clear();
        }

        if self.values.len() < self.capacity {
            self.values.push(success);
        } else {
            self.values[self.cursor] = success;
            self.cursor = (self.cursor + 1) % self.values.len();
        }
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.cursor = 0;
    }

    /// Rounded success rate in percent, `None` before the first sample.
    pub fn rolling_percentage(&self) -> Option<u32> {
        if self.values.is_empty() {
            return None;
        }
        let successes = self.values.iter().filter(|&&v| v).count();
        let mean = successes as f64 / self.values.len() as f64;
        Some((mean * 100.0).round_ties_even() as u32)
    }
}

impl fmt::Display for StatisticsRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rolling_percentage() {
            Some(percent) => write!(f, "{:03}%", percent),
            None => f.write_str("???%"),
        }
    }
}
