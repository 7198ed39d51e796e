//! Reactor-side state of one open sensor.

use crate::sensor::CharacterSensor;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An open sensor in the poll set.
#[derive(Debug)]
pub struct PolledSensor {
    sensor: Arc<CharacterSensor>,
    fd: RawFd,
    last_read: Instant,
    idle_ticks: u32,
    // Set from the tunnel, dropped with this entry on reopen. 0 disables.
    override_ms: Option<u64>,
}

impl PolledSensor {
    /// Track `sensor`, just opened on `fd`.
    #[must_use]
    pub fn new(sensor: Arc<CharacterSensor>, fd: RawFd, now: Instant) -> Self {
        Self {
            sensor,
            fd,
            last_read: now,
            idle_ticks: 0,
            override_ms: None,
        }
    }

    /// The sensor.
    #[must_use]
    pub fn sensor(&self) -> &Arc<CharacterSensor> {
        &self.sensor
    }

    /// Descriptor in the poll set.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Check ticks since the last successful read.
    #[must_use]
    pub fn idle_ticks(&self) -> u32 {
        self.idle_ticks
    }

    /// Timeout in force, `None` if disabled.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        match self.override_ms.unwrap_or_else(|| self.sensor.timeout_ms()) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Override the timeout until the sensor is reopened.
    pub fn set_temporary_timeout(&mut self, ms: u64) {
        self.override_ms = Some(ms);
    }

    /// Drop a temporary override.
    pub fn clear_temporary_timeout(&mut self) {
        self.override_ms = None;
    }

    /// Note a read that returned data.
    pub fn record_read(&mut self, now: Instant) {
        self.last_read = now;
        self.idle_ticks = 0;
    }

    /// One check tick. Returns whether the sensor has been silent for at
    /// least its timeout.
    ///
    /// Checked against elapsed time rather than the tick count alone, so a
    /// timeout fires in `[deadline, deadline + check interval)`.
    pub fn check(&mut self, now: Instant) -> bool {
        self.idle_ticks = self.idle_ticks.saturating_add(1);
        match self.timeout() {
            Some(timeout) => now.saturating_duration_since(self.last_read) >= timeout,
            None => false,
        }
    }
}

/// Interval of the timeout checks: the shortest timeout among `polled`,
/// no shorter than `floor`. `None` if no sensor has a timeout.
#[must_use]
pub fn check_interval<'a>(
    polled: impl IntoIterator<Item = &'a PolledSensor>,
    floor: Duration,
) -> Option<Duration> {
    polled
        .into_iter()
        .filter_map(PolledSensor::timeout)
        .min()
        .map(|t| t.max(floor))
}
