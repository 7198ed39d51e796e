//! Background sensor opener.
//!
//! Opening a device can block for seconds (TCP connect, a sensor that
//! needs an init handshake), so it never happens on the reactor thread. New
//! sensors are opened first; sensors that failed, or that the reactor closed
//! for a reopen, are retried no earlier than the retry interval.

use crate::device::CancelToken;
use crate::error::{DaqError, Result};
use crate::sensor::{CharacterSensor, SensorState};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Receiver of successfully opened sensors.
pub trait OpenListener: Send + Sync {
    /// `sensor` is open and ready to be polled.
    fn sensor_is_open(&self, sensor: Arc<CharacterSensor>);
}

/// Opener counters.
#[derive(Debug, Default)]
pub struct OpenerStats {
    opens: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
}

impl OpenerStats {
    /// Successful opens.
    #[must_use]
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    /// Failed opens, excluding timeouts.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Opens that timed out.
    #[must_use]
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Queues {
    fresh: VecDeque<Arc<CharacterSensor>>,
    problems: Vec<(Instant, Arc<CharacterSensor>)>,
}

impl Queues {
    fn contains(&self, sensor: &Arc<CharacterSensor>) -> bool {
        self.fresh.iter().any(|s| Arc::ptr_eq(s, sensor))
            || self.problems.iter().any(|(_, s)| Arc::ptr_eq(s, sensor))
    }
}

/// The opener thread and its queues.
pub struct SensorOpener {
    listener: Arc<dyn OpenListener>,
    retry: Duration,
    queues: Mutex<Queues>,
    cond: Condvar,
    cancel: CancelToken,
    interrupted: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    stats: OpenerStats,
}

impl std::fmt::Debug for SensorOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorOpener")
            .field("retry", &self.retry)
            .field("pending", &self.pending())
            .field("stats", &self.stats)
            .finish()
    }
}

impl SensorOpener {
    /// New opener reporting to `listener`, retrying problem sensors every
    /// `retry`.
    pub fn new(listener: Arc<dyn OpenListener>, retry: Duration) -> Arc<Self> {
        Arc::new(Self {
            listener,
            retry,
            queues: Mutex::new(Queues::default()),
            cond: Condvar::new(),
            cancel: CancelToken::new(),
            interrupted: AtomicBool::new(false),
            thread: Mutex::new(None),
            stats: OpenerStats::default(),
        })
    }

    /// Spawn the opener thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("sensor-opener".to_string())
            .spawn(move || this.run())
            .map_err(|e| DaqError::io("sensor-opener", "spawn", e))?;
        *thread = Some(handle);
        info!("Sensor opener started");
        Ok(())
    }

    /// Queue a new sensor for opening. Ignored once the sensor's close has
    /// been requested.
    pub fn open_sensor(&self, sensor: Arc<CharacterSensor>) {
        if sensor.close_requested() {
            return;
        }
        sensor.set_state(SensorState::Opening);
        let mut q = self.queues.lock();
        if !q.contains(&sensor) {
            q.fresh.push_back(sensor);
        }
        drop(q);
        self.cond.notify_all();
    }

    /// Queue a closed sensor for a retry after the retry interval.
    pub fn reopen_sensor(&self, sensor: Arc<CharacterSensor>) {
        if sensor.close_requested() {
            return;
        }
        sensor.set_state(SensorState::Opening);
        let mut q = self.queues.lock();
        if !q.contains(&sensor) {
            q.problems.push((Instant::now() + self.retry, sensor));
        }
        drop(q);
        self.cond.notify_all();
    }

    /// Drop `sensor` from the queues. Returns whether it was queued.
    pub fn forget(&self, sensor: &Arc<CharacterSensor>) -> bool {
        let mut q = self.queues.lock();
        let before = q.fresh.len() + q.problems.len();
        q.fresh.retain(|s| !Arc::ptr_eq(s, sensor));
        q.problems.retain(|(_, s)| !Arc::ptr_eq(s, sensor));
        before != q.fresh.len() + q.problems.len()
    }

    /// Sensors waiting to be opened.
    #[must_use]
    pub fn pending(&self) -> usize {
        let q = self.queues.lock();
        q.fresh.len() + q.problems.len()
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> &OpenerStats {
        &self.stats
    }

    /// Ask the thread to exit, aborting a blocking open.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        let _q = self.queues.lock();
        self.cond.notify_all();
    }

    /// Wait for the thread to exit.
    pub fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            if let Err(e) = handle.join() {
                error!("Sensor opener thread panicked: {:?}", e);
            }
        }
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    fn next_sensor(&self) -> Option<Arc<CharacterSensor>> {
        let mut q = self.queues.lock();
        loop {
            if self.is_interrupted() {
                return None;
            }
            if let Some(sensor) = q.fresh.pop_front() {
                return Some(sensor);
            }
            let now = Instant::now();
            if let Some(pos) = q.problems.iter().position(|(due, _)| *due <= now) {
                return Some(q.problems.remove(pos).1);
            }
            match q.problems.iter().map(|(due, _)| *due).min() {
                Some(due) => {
                    let _ = self.cond.wait_until(&mut q, due);
                }
                None => self.cond.wait(&mut q),
            }
        }
    }

    fn run(&self) {
        while let Some(sensor) = self.next_sensor() {
            self.try_open(sensor);
        }
        debug!("sensor opener exiting");
    }

    fn try_open(&self, sensor: Arc<CharacterSensor>) {
        debug!(sensor = %sensor.name(), "opening");
        let result = sensor.open(&self.cancel);
        if sensor.close_requested() {
            sensor.close();
            debug!(sensor = %sensor.name(), "closed while opening, dropped");
            return;
        }
        match result {
            Ok(()) => {
                self.stats.opens.fetch_add(1, Ordering::Relaxed);
                self.listener.sensor_is_open(sensor);
            }
            Err(e) => {
                sensor.close();
                if self.is_interrupted() || matches!(e, DaqError::Interrupted { .. }) {
                    return;
                }
                if !e.is_recoverable() {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    error!(sensor = %sensor.name(), error = %e, "cannot open sensor, giving up");
                    return;
                }
                let name = sensor.name().to_string();
                self.reopen_sensor(sensor);
                if e.is_timeout() {
                    self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    info!(sensor = %name, error = %e, "open timed out, will retry");
                } else {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(sensor = %name, error = %e, "open failed, will retry");
                }
            }
        }
    }
}
