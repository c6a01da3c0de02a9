//! Real-time migration progress reporting with moving averages (spec
//! §4.4 Progress).

use std::collections::VecDeque;
use std::time::Instant;

use serde::Serialize;

const WINDOW: usize = 10;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Progress {
    pub files_total: u64,
    pub files_done: u64,
    pub records_done: u64,
    pub tokens_done: u64,
    pub rate_records_per_sec: f64,
    pub eta_seconds: Option<f64>,
}

/// Tracks a moving window of `(instant, records_done)` samples to compute
/// a smoothed throughput and ETA, rather than an instantaneous (noisy)
/// rate from the two most recent samples.
pub struct ProgressTracker {
    samples: VecDeque<(Instant, u64)>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self { samples: VecDeque::with_capacity(WINDOW) }
    }

    pub fn record(&mut self, records_done: u64) {
        if self.samples.len() == WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back((Instant::now(), records_done));
    }

    fn rate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.0.duration_since(first.0).as_secs_f64();
        if elapsed <= 0.0 || last.1 <= first.1 {
            return 0.0;
        }
        (last.1 - first.1) as f64 / elapsed
    }

    pub fn snapshot(&self, files_total: u64, files_done: u64, records_done: u64, tokens_done: u64) -> Progress {
        let rate = self.rate();
        let files_remaining = files_total.saturating_sub(files_done);
        let eta_seconds = if rate > 0.0 && files_total > 0 {
            let records_per_file = if files_done > 0 { records_done as f64 / files_done as f64 } else { 0.0 };
            Some((files_remaining as f64 * records_per_file) / rate)
        } else {
            None
        };

        Progress {
            files_total,
            files_done,
            records_done,
            tokens_done,
            rate_records_per_sec: rate,
            eta_seconds,
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}
