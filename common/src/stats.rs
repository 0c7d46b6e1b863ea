//! Counters describing a parallel read

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter {
    count: AtomicU64,
}

impl Counter {
    pub fn add(&self, value: u64) {
        self.count.fetch_add(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Live counters of a parallel read, updated by workers and the consumer
#[derive(Debug)]
pub struct ReadStats {
    pub parts_requested: Counter,
    pub parts_fetched: Counter,
    pub parts_failed: Counter,
    pub bytes_fetched: Counter,
    pub bytes_delivered: Counter,
    start_time: std::time::Instant,
}

impl ReadStats {
    pub fn new() -> Self {
        Self {
            parts_requested: Default::default(),
            parts_fetched: Default::default(),
            parts_failed: Default::default(),
            bytes_fetched: Default::default(),
            bytes_delivered: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> Summary {
        Summary {
            parts_requested: self.parts_requested.get(),
            parts_fetched: self.parts_fetched.get(),
            parts_failed: self.parts_failed.get(),
            bytes_fetched: self.bytes_fetched.get(),
            bytes_delivered: self.bytes_delivered.get(),
            duration: self.get_duration(),
        }
    }
}

impl Default for ReadStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub parts_requested: u64,
    pub parts_fetched: u64,
    pub parts_failed: u64,
    pub bytes_fetched: u64,
    pub bytes_delivered: u64,
    pub duration: std::time::Duration,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            parts_requested: self.parts_requested + other.parts_requested,
            parts_fetched: self.parts_fetched + other.parts_fetched,
            parts_failed: self.parts_failed + other.parts_failed,
            bytes_fetched: self.bytes_fetched + other.bytes_fetched,
            bytes_delivered: self.bytes_delivered + other.bytes_delivered,
            duration: self.duration.max(other.duration),
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let secs = self.duration.as_secs_f64();
        let rate = if secs > 0.0 {
            self.bytes_delivered as f64 / secs
        } else {
            0.0
        };
        write!(
            f,
            "parts requested: {}\n\
            parts fetched: {}\n\
            parts failed: {}\n\
            bytes fetched: {}\n\
            bytes delivered: {}\n\
            average rate: {}/s",
            self.parts_requested,
            self.parts_fetched,
            self.parts_failed,
            bytesize::ByteSize(self.bytes_fetched),
            bytesize::ByteSize(self.bytes_delivered),
            bytesize::ByteSize(rate as u64),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threaded_counting() {
        let stats = ReadStats::new();
        std::thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        stats.parts_fetched.inc();
                        stats.bytes_fetched.add(4);
                    }
                });
            }
        });
        let summary = stats.snapshot();
        assert_eq!(summary.parts_fetched, 1000);
        assert_eq!(summary.bytes_fetched, 4000);
    }

    #[test]
    fn summaries_add_up() {
        let a = Summary {
            parts_fetched: 2,
            bytes_delivered: 10,
            ..Default::default()
        };
        let b = Summary {
            parts_fetched: 3,
            bytes_delivered: 5,
            parts_failed: 1,
            ..Default::default()
        };
        let total = a + b;
        assert_eq!(total.parts_fetched, 5);
        assert_eq!(total.bytes_delivered, 15);
        assert_eq!(total.parts_failed, 1);
    }

    #[test]
    fn summary_display_mentions_counts() {
        let summary = Summary {
            parts_requested: 4,
            parts_fetched: 4,
            bytes_delivered: 16,
            ..Default::default()
        };
        let text = summary.to_string();
        assert!(text.contains("parts requested: 4"));
        assert!(text.contains("parts failed: 0"));
    }
}
