//! Smoothing of time tags of regularly reporting sensors.
//!
//! Serial latency jitter makes arrival times noisy while the instrument
//! itself reports at a fixed rate. The adjuster assigns each sample the
//! time expected from a base time and the nominal interval. The base moves
//! forward by the smallest lateness seen over each averaging period, so slow
//! drift of the instrument clock is followed without passing jitter through.
//!
//! ```text
//! arrival:   |--x----|x------|---x---|-x-----|
//! expected:  x-------x-------x-------x-------     (tbase + n * dt)
//! ```
//!
//! A sample earlier than expected rebases immediately. A gap of more than
//! `gap` intervals, or time running backwards, restarts from the arrival time.

use crate::sample::{Timetag, USECS_PER_SEC};

/// Time tag smoother for one sample tag.
#[derive(Debug, Clone)]
pub struct TimetagAdjuster {
    dt: i64,
    period: i64,
    gap: i64,
    tbase: Option<Timetag>,
    tlast: Timetag,
    n: i64,
    period_start: Timetag,
    min_diff: i64,
}

impl TimetagAdjuster {
    /// `rate` in samples per second (> 0), `period_usecs` the averaging
    /// period, `gap` the tolerated gap in sample intervals.
    #[must_use]
    pub fn new(rate: f64, period_usecs: i64, gap: f64) -> Self {
        let dt = (USECS_PER_SEC as f64 / rate).round() as i64;
        Self {
            dt,
            period: period_usecs.max(dt),
            gap: (gap.max(1.0) * dt as f64).round() as i64,
            tbase: None,
            tlast: 0,
            n: 0,
            period_start: 0,
            min_diff: i64::MAX,
        }
    }

    /// Nominal sample interval in microseconds.
    #[must_use]
    pub fn interval(&self) -> i64 {
        self.dt
    }

    fn restart(&mut self, t: Timetag) -> Timetag {
        self.tbase = Some(t);
        self.tlast = t;
        self.n = 0;
        self.period_start = t;
        self.min_diff = i64::MAX;
        t
    }

    /// Adjusted time for a sample that arrived at `t`.
    pub fn adjust(&mut self, t: Timetag) -> Timetag {
        let Some(tbase) = self.tbase else {
            return self.restart(t);
        };
        if t < self.tlast || t - self.tlast > self.gap {
            return self.restart(t);
        }
        self.tlast = t;

        let n = self.n + 1;
        let texp = tbase + n * self.dt;
        let diff = t - texp;
        if diff < 0 {
            return self.restart(t);
        }
        self.n = n;
        self.min_diff = self.min_diff.min(diff);

        if t - self.period_start >= self.period {
            // Follow drift by the lateness every sample of the period shared.
            let shifted = texp + self.min_diff;
            self.tbase = Some(shifted);
            self.n = 0;
            self.period_start = t;
            self.min_diff = i64::MAX;
            return shifted;
        }
        texp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 1_000;

    #[test]
    fn test_jitter_removed() {
        let mut adj = TimetagAdjuster::new(10.0, 60 * USECS_PER_SEC, 1.5);
        let jitter = [0, 15, 3, 40, 7, 22, 1, 9];
        let base = 1_000_000_000;
        let out: Vec<Timetag> = jitter
            .iter()
            .enumerate()
            .map(|(i, j)| adj.adjust(base + i as i64 * 100 * MS + j * MS))
            .collect();
        for (i, t) in out.iter().enumerate() {
            assert_eq!(*t, base + i as i64 * 100 * MS);
        }
    }

    #[test]
    fn test_drift_followed_at_period_end() {
        // Every sample is 5 ms late relative to the first one.
        let mut adj = TimetagAdjuster::new(10.0, 300 * MS, 1.5);
        let arrivals: Vec<Timetag> = (0..6).map(|i| i * 105 * MS).collect();
        let out: Vec<Timetag> = arrivals.iter().map(|&t| adj.adjust(t)).collect();
        assert_eq!(out[1], 100 * MS);
        assert_eq!(out[2], 200 * MS);
        // Period ends at the fourth sample: base jumps by the minimum lateness.
        assert_eq!(out[3], 300 * MS + 5 * MS);
        assert!(out.iter().zip(&arrivals).all(|(o, a)| o <= a));
    }

    #[test]
    fn test_gap_and_backwards_restart() {
        let mut adj = TimetagAdjuster::new(10.0, USECS_PER_SEC, 1.5);
        assert_eq!(adj.adjust(0), 0);
        assert_eq!(adj.adjust(102 * MS), 100 * MS);
        // 300 ms silence is more than 1.5 intervals.
        assert_eq!(adj.adjust(402 * MS), 402 * MS);
        assert_eq!(adj.adjust(390 * MS), 390 * MS);
    }

    #[test]
    fn test_early_sample_rebases() {
        let mut adj = TimetagAdjuster::new(10.0, USECS_PER_SEC, 1.5);
        adj.adjust(20 * MS);
        assert_eq!(adj.adjust(110 * MS), 110 * MS);
        assert_eq!(adj.adjust(215 * MS), 210 * MS);
    }
}
