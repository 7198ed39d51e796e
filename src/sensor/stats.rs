//! Per-sensor counters.
//!
//! Lifetime counters are plain atomics, bumped from the reactor, opener and
//! looper threads. The period counters are rolled into a [`PeriodStats`] by
//! the reactor every statistics period.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Rates and message sizes of the last completed statistics period.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeriodStats {
    /// Raw messages per second
    pub sample_rate: f64,
    /// Bytes per second
    pub byte_rate: f64,
    /// Shortest raw message, bytes
    pub min_message_len: usize,
    /// Longest raw message, bytes
    pub max_message_len: usize,
}

/// Counters of one sensor.
#[derive(Debug)]
pub struct SensorStats {
    bytes_read: AtomicU64,
    raw_messages: AtomicU64,
    processed_samples: AtomicU64,
    scan_failures: AtomicU64,
    partial_scans: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    timeouts: AtomicU64,
    reopens: AtomicU64,

    period_messages: AtomicU64,
    period_bytes: AtomicU64,
    period_min_len: AtomicUsize,
    period_max_len: AtomicUsize,
    last_period: Mutex<PeriodStats>,
}

impl Default for SensorStats {
    fn default() -> Self {
        Self {
            bytes_read: AtomicU64::new(0),
            raw_messages: AtomicU64::new(0),
            processed_samples: AtomicU64::new(0),
            scan_failures: AtomicU64::new(0),
            partial_scans: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            reopens: AtomicU64::new(0),
            period_messages: AtomicU64::new(0),
            period_bytes: AtomicU64::new(0),
            period_min_len: AtomicUsize::new(usize::MAX),
            period_max_len: AtomicUsize::new(0),
            last_period: Mutex::new(PeriodStats::default()),
        }
    }
}

macro_rules! counter {
    ($get:ident, $inc:ident, $field:ident) => {
        #[doc = concat!("Lifetime `", stringify!($field), "` count.")]
        #[must_use]
        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }

        pub(crate) fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl SensorStats {
    counter!(processed_samples, inc_processed, processed_samples);
    counter!(scan_failures, inc_scan_failures, scan_failures);
    counter!(partial_scans, inc_partial_scans, partial_scans);
    counter!(read_errors, inc_read_errors, read_errors);
    counter!(write_errors, inc_write_errors, write_errors);
    counter!(timeouts, inc_timeouts, timeouts);
    counter!(reopens, inc_reopens, reopens);

    /// Lifetime bytes read.
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Lifetime raw messages.
    #[must_use]
    pub fn raw_messages(&self) -> u64 {
        self.raw_messages.load(Ordering::Relaxed)
    }

    pub(crate) fn add_bytes(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        self.period_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_message(&self, len: usize) {
        self.raw_messages.fetch_add(1, Ordering::Relaxed);
        self.period_messages.fetch_add(1, Ordering::Relaxed);
        self.period_min_len.fetch_min(len, Ordering::Relaxed);
        self.period_max_len.fetch_max(len, Ordering::Relaxed);
    }

    /// Close the current period of length `elapsed` and start a new one.
    pub fn roll_period(&self, elapsed: Duration) -> PeriodStats {
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let messages = self.period_messages.swap(0, Ordering::Relaxed);
        let bytes = self.period_bytes.swap(0, Ordering::Relaxed);
        let min_len = self.period_min_len.swap(usize::MAX, Ordering::Relaxed);
        let max_len = self.period_max_len.swap(0, Ordering::Relaxed);
        let stats = PeriodStats {
            sample_rate: messages as f64 / secs,
            byte_rate: bytes as f64 / secs,
            min_message_len: if messages == 0 { 0 } else { min_len },
            max_message_len: max_len,
        };
        *self.last_period.lock() = stats;
        stats
    }

    /// Result of the last [`roll_period`](Self::roll_period).
    #[must_use]
    pub fn last_period(&self) -> PeriodStats {
        *self.last_period.lock()
    }
}
