//! Adaptive per-table batcher with a dead-letter queue (spec §4.3.6).
//! Generalizes the teacher's size-triggered rotation in `ledger::append_event`
//! (flush when a threshold is crossed) into a three-way adaptive sizing rule
//! driven by observed batch duration and success rate.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const MIN_BATCH_SIZE: usize = 10;
pub const MAX_BATCH_SIZE: usize = 200;
pub const START_BATCH_SIZE: usize = 50;
pub const TARGET_BATCH_TIME: Duration = Duration::from_secs(1);
pub const DEAD_LETTER_CAPACITY: usize = 100;
const HISTORY_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct BatchOutcome {
    pub size: usize,
    pub duration: Duration,
    pub success: bool,
}

/// Adaptively-sized queue of `T` for one table (messages, file accesses, or
/// tool results). Not thread-safe by itself — callers hold it behind a
/// per-table lock, as the pipeline's worker pool does.
pub struct AdaptiveBatcher<T> {
    queue: VecDeque<T>,
    batch_size: usize,
    flush_interval: Duration,
    last_flush: Instant,
    history: VecDeque<BatchOutcome>,
    dead_letter: VecDeque<Vec<T>>,
    dead_letter_drops: u64,
}

impl<T> AdaptiveBatcher<T> {
    pub fn new(flush_interval: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            batch_size: START_BATCH_SIZE,
            flush_interval,
            last_flush: Instant::now(),
            history: VecDeque::with_capacity(HISTORY_WINDOW),
            dead_letter: VecDeque::new(),
            dead_letter_drops: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Enqueues `item`. Returns `Some(drained)` when the queue has reached
    /// the current adaptive `batch_size` and should be flushed.
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.queue.push_back(item);
        if self.queue.len() >= self.batch_size {
            Some(self.drain())
        } else {
            None
        }
    }

    /// Whether the queue should flush on the time trigger even though it
    /// has not reached `batch_size` yet.
    pub fn should_flush_on_interval(&self) -> bool {
        !self.queue.is_empty() && self.last_flush.elapsed() >= self.flush_interval
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.last_flush = Instant::now();
        self.queue.drain(..).collect()
    }

    /// Feeds back the result of actually sending a batch, adapting
    /// `batch_size` per the §4.3.6 rule ladder.
    pub fn record_outcome(&mut self, outcome: BatchOutcome) {
        if self.history.len() == HISTORY_WINDOW {
            self.history.pop_front();
        }
        self.history.push_back(outcome);

        let success_rate = self.history.iter().filter(|o| o.success).count() as f64 / self.history.len() as f64;
        let avg_duration = self.history.iter().map(|o| o.duration).sum::<Duration>() / self.history.len() as u32;

        let new_size = if success_rate < 0.8 {
            (self.batch_size as f64 * 0.8).round() as usize
        } else if avg_duration < TARGET_BATCH_TIME && success_rate > 0.95 {
            (self.batch_size as f64 * 1.1).round() as usize
        } else if avg_duration > TARGET_BATCH_TIME * 2 {
            (self.batch_size as f64 * 0.9).round() as usize
        } else {
            self.batch_size
        };

        self.batch_size = new_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);
    }

    /// Moves a failed batch to the dead-letter queue. When at capacity, the
    /// incoming batch is dropped and the drop counter incremented instead
    /// of evicting older entries.
    pub fn dead_letter(&mut self, batch: Vec<T>) {
        if self.dead_letter.len() >= DEAD_LETTER_CAPACITY {
            self.dead_letter_drops += 1;
            tracing::error!(drops = self.dead_letter_drops, "dead-letter queue full, dropping failed batch");
            return;
        }
        self.dead_letter.push_back(batch);
    }

    pub fn dead_letter_len(&self) -> usize {
        self.dead_letter.len()
    }

    pub fn dead_letter_drops(&self) -> u64 {
        self.dead_letter_drops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_fifty_and_drains_at_threshold() {
        let mut b: AdaptiveBatcher<u32> = AdaptiveBatcher::new(Duration::from_secs(60));
        assert_eq!(b.batch_size(), START_BATCH_SIZE);
        for i in 0..49 {
            assert!(b.push(i).is_none());
        }
        let drained = b.push(49).unwrap();
        assert_eq!(drained.len(), 50);
    }

    #[test]
    fn shrinks_on_low_success_rate() {
        let mut b: AdaptiveBatcher<u32> = AdaptiveBatcher::new(Duration::from_secs(60));
        for _ in 0..5 {
            b.record_outcome(BatchOutcome { size: 50, duration: Duration::from_millis(100), success: false });
        }
        assert!(b.batch_size() < START_BATCH_SIZE);
    }

    #[test]
    fn grows_on_fast_successful_batches() {
        let mut b: AdaptiveBatcher<u32> = AdaptiveBatcher::new(Duration::from_secs(60));
        for _ in 0..5 {
            b.record_outcome(BatchOutcome { size: 50, duration: Duration::from_millis(50), success: true });
        }
        assert!(b.batch_size() > START_BATCH_SIZE);
    }

    #[test]
    fn shrinks_on_slow_batches() {
        let mut b: AdaptiveBatcher<u32> = AdaptiveBatcher::new(Duration::from_secs(60));
        for _ in 0..5 {
            b.record_outcome(BatchOutcome { size: 50, duration: Duration::from_secs(3), success: true });
        }
        assert!(b.batch_size() < START_BATCH_SIZE);
    }

    #[test]
    fn batch_size_never_leaves_bounds_under_adversarial_sequences() {
        let mut b: AdaptiveBatcher<u32> = AdaptiveBatcher::new(Duration::from_secs(60));
        let sequence = [
            (Duration::from_millis(10), true),
            (Duration::from_secs(5), false),
            (Duration::from_millis(10), true),
            (Duration::from_secs(10), true),
            (Duration::from_millis(1), false),
        ];
        for _ in 0..200 {
            for (duration, success) in sequence {
                b.record_outcome(BatchOutcome { size: b.batch_size(), duration, success });
                assert!(b.batch_size() >= MIN_BATCH_SIZE);
                assert!(b.batch_size() <= MAX_BATCH_SIZE);
            }
        }
    }

    #[test]
    fn dead_letter_queue_drops_without_blocking_once_full() {
        let mut b: AdaptiveBatcher<u32> = AdaptiveBatcher::new(Duration::from_secs(60));
        for i in 0..DEAD_LETTER_CAPACITY {
            b.dead_letter(vec![i as u32]);
        }
        assert_eq!(b.dead_letter_len(), DEAD_LETTER_CAPACITY);
        b.dead_letter(vec![9999]);
        assert_eq!(b.dead_letter_len(), DEAD_LETTER_CAPACITY);
        assert_eq!(b.dead_letter_drops(), 1);
    }

    #[test]
    fn flush_on_interval_requires_nonempty_queue() {
        let mut b: AdaptiveBatcher<u32> = AdaptiveBatcher::new(Duration::from_millis(1));
        assert!(!b.should_flush_on_interval());
        b.push(1);
        std::thread::sleep(Duration::from_millis(5));
        assert!(b.should_flush_on_interval());
    }
}
