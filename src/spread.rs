//! Rolling spread statistics per pair.
//!
//! The spread `a - beta * b` feeds a fixed-size rolling window whose mean
//! and standard deviation are maintained incrementally (running sum and
//! sum-of-squares, O(1) per update) rather than recomputed from scratch.

use std::collections::VecDeque;

const STD_EPS: f64 = 1e-9;

/// Point-in-time view of the rolling spread statistics.
#[derive(Debug, Clone, Copy)]
pub struct SpreadStats {
    pub mean: f64,
    pub std: f64,
    pub z_score: Option<f64>,
    pub samples: usize,
}

/// Incremental rolling mean / standard deviation over a bounded window.
#[derive(Debug, Clone)]
pub struct SpreadModel {
    window: usize,
    min_window: usize,
    values: VecDeque<f64>,
    sum: f64,
    sum_sq: f64,
}

impl SpreadModel {
    pub fn new(window: usize, min_window: usize) -> Self {
        Self {
            window: window.max(2),
            min_window: min_window.max(2),
            values: VecDeque::with_capacity(window.max(2)),
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    /// Push the next spread observation and return the current z-score, or
    /// `None` while the sample count is below the minimum window. `None` is
    /// "no signal possible yet", not a failure.
    pub fn update(&mut self, beta: f64, price_a: f64, price_b: f64) -> Option<f64> {
        let spread = price_a - beta * price_b;
        self.push(spread);
        self.stats().z_score
    }

    fn push(&mut self, spread: f64) {
        if self.values.len() >= self.window {
            if let Some(evicted) = self.values.pop_front() {
                self.sum -= evicted;
                self.sum_sq -= evicted * evicted;
            }
        }
        self.values.push_back(spread);
        self.sum += spread;
        self.sum_sq += spread * spread;
    }

    pub fn stats(&self) -> SpreadStats {
        let n = self.values.len();
        if n == 0 {
            return SpreadStats {
                mean: 0.0,
                std: 0.0,
                z_score: None,
                samples: 0,
            };
        }
        let mean = self.sum / n as f64;
        // incremental variance can drift a hair below zero; clamp before sqrt
        let var = (self.sum_sq / n as f64 - mean * mean).max(0.0);
        let std = var.sqrt();
        let z_score = if n < self.min_window || std < STD_EPS {
            None
        } else {
            let latest = *self.values.back().unwrap();
            Some((latest - mean) / std)
        };
        SpreadStats {
            mean,
            std,
            z_score,
            samples: n,
        }
    }

    pub fn samples(&self) -> usize {
        self.values.len()
    }

    pub fn last_spread(&self) -> Option<f64> {
        self.values.back().copied()
    }
}
