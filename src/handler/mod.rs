//! The sensor reactor.
//!
//! One thread multiplexes every open sensor, every tunnel connection, the
//! tunnel listener and a wake socket with `poll(2)`:
//!
//! ```text
//!              ┌──────────────┐ sensor_is_open ┌───────────────────┐
//! add_sensor ─►│ SensorOpener │───────────────►│  staging (Mutex)  │
//!              └──────▲───────┘                │  opened, closures │
//!                     │ reopen                 └─────────┬─────────┘
//!                     │                                  │ applied once per loop
//!              ┌──────┴──────────────────────────────────▼─────────┐
//!              │ reactor: poll → dispatch → timers → apply staged  │
//!              └───────────────────────────────────────────────────┘
//! ```
//!
//! The poll set is only changed by the reactor, at one point per iteration
//! after dispatch. Other threads stage their changes and write to the wake
//! socket, so a sensor whose close has been applied is never dispatched
//! again.

pub mod opener;
pub mod polled;
pub mod waker;

pub use opener::{OpenListener, OpenerStats, SensorOpener};
pub use polled::{check_interval, PolledSensor};
pub use waker::Waker;

use crate::config::HandlerConfig;
use crate::error::{DaqError, Result};
use crate::rserial::{RemoteSerialConnection, RemoteSerialListener, TunnelContext};
use crate::sensor::{CharacterSensor, SensorState};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct Pending {
    opened: Vec<Arc<CharacterSensor>>,
    // (sensor, reopen afterwards)
    closures: Vec<(Arc<CharacterSensor>, bool)>,
}

struct Staging {
    pending: Mutex<Pending>,
    waker: Waker,
}

impl OpenListener for Staging {
    fn sensor_is_open(&self, sensor: Arc<CharacterSensor>) {
        self.pending.lock().opened.push(sensor);
        self.waker.wake();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Wake,
    Listener,
    Sensor(usize),
    Conn(usize),
}

/// Owner of the sensors and the reactor thread.
pub struct SensorHandler {
    config: HandlerConfig,
    staging: Arc<Staging>,
    opener: Arc<SensorOpener>,
    listener: Option<RemoteSerialListener>,
    all: Mutex<Vec<Arc<CharacterSensor>>>,
    polled: Mutex<Vec<PolledSensor>>,
    check_interval: Mutex<Option<Duration>>,
    interrupted: AtomicBool,
    running: AtomicBool,
    poll_failures: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SensorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorHandler")
            .field("sensors", &self.all.lock().len())
            .field("polled", &self.polled.lock().len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl SensorHandler {
    /// Create the handler, binding the tunnel listener if a port is set.
    pub fn new(config: HandlerConfig) -> Result<Arc<Self>> {
        let staging = Arc::new(Staging {
            pending: Mutex::new(Pending::default()),
            waker: Waker::new()?,
        });
        let opener = SensorOpener::new(staging.clone(), config.opener_retry);
        let listener = match config.remote_serial_port {
            Some(port) => {
                let listener = RemoteSerialListener::bind(port)?;
                info!(addr = %listener.local_addr()?, "remote serial listening");
                Some(listener)
            }
            None => None,
        };
        Ok(Arc::new(Self {
            config,
            staging,
            opener,
            listener,
            all: Mutex::new(Vec::new()),
            polled: Mutex::new(Vec::new()),
            check_interval: Mutex::new(None),
            interrupted: AtomicBool::new(false),
            running: AtomicBool::new(false),
            poll_failures: AtomicU64::new(0),
            thread: Mutex::new(None),
        }))
    }

    /// Address of the tunnel listener.
    #[must_use]
    pub fn remote_serial_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// The opener, for its counters.
    #[must_use]
    pub fn opener(&self) -> &SensorOpener {
        &self.opener
    }

    /// Add a sensor and queue it for opening.
    pub fn add_sensor(&self, sensor: Arc<CharacterSensor>) {
        {
            let mut all = self.all.lock();
            if all.iter().any(|s| Arc::ptr_eq(s, &sensor)) {
                return;
            }
            all.push(sensor.clone());
        }
        info!(sensor = %sensor.name(), id = sensor.id(), "sensor added");
        self.opener.open_sensor(sensor);
    }

    /// Close a sensor at the end of the current reactor iteration.
    ///
    /// The close is final: a sensor still queued in the opener, or inside
    /// an open, is dropped rather than polled or retried.
    pub fn close_sensor(&self, sensor: &Arc<CharacterSensor>) {
        sensor.request_close();
        self.schedule_close(sensor.clone(), false);
    }

    fn schedule_close(&self, sensor: Arc<CharacterSensor>, reopen: bool) {
        let mut pending = self.staging.pending.lock();
        if sensor.state() == SensorState::ClosePending {
            return;
        }
        sensor.set_state(SensorState::ClosePending);
        pending.closures.push((sensor, reopen));
        drop(pending);
        self.staging.waker.wake();
    }

    /// One timeout check: reopen every sensor silent for its timeout.
    ///
    /// Returns the number of sensors scheduled for a reopen.
    pub fn check_sensors(&self, now: Instant) -> usize {
        let timed_out: Vec<Arc<CharacterSensor>> = self
            .polled
            .lock()
            .iter_mut()
            .filter_map(|p| {
                let timeout = p.timeout()?;
                if !p.check(now) || p.sensor().state() == SensorState::ClosePending {
                    return None;
                }
                info!(
                    sensor = %p.sensor().name(),
                    timeout_ms = timeout.as_millis() as u64,
                    idle_checks = p.idle_ticks(),
                    "read timeout, reopening"
                );
                p.sensor().stats().inc_timeouts();
                Some(p.sensor().clone())
            })
            .collect();
        let count = timed_out.len();
        for sensor in timed_out {
            self.schedule_close(sensor, true);
        }
        count
    }

    /// Sensors currently in the poll set.
    #[must_use]
    pub fn opened_sensors(&self) -> Vec<Arc<CharacterSensor>> {
        self.polled.lock().iter().map(|p| p.sensor().clone()).collect()
    }

    /// Every sensor ever added.
    #[must_use]
    pub fn all_sensors(&self) -> Vec<Arc<CharacterSensor>> {
        self.all.lock().clone()
    }

    /// Interval of the timeout checks, `None` if no open sensor has a
    /// timeout.
    #[must_use]
    pub fn check_interval(&self) -> Option<Duration> {
        *self.check_interval.lock()
    }

    /// `poll` failures other than EINTR.
    #[must_use]
    pub fn poll_failures(&self) -> u64 {
        self.poll_failures.load(Ordering::Relaxed)
    }

    fn recompute_check_interval(&self, polled: &[PolledSensor]) {
        let interval = check_interval(polled, self.config.min_check_interval);
        let mut current = self.check_interval.lock();
        if *current != interval {
            debug!(interval_ms = interval.map(|d| d.as_millis() as u64), "timeout check interval");
            *current = interval;
        }
    }

    /// Spawn the reactor thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("sensor-handler".to_string())
            .spawn(move || {
                if let Err(e) = this.run() {
                    error!(error = %e, "sensor handler failed");
                }
            })
            .map_err(|e| DaqError::io("sensor-handler", "spawn", e))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Ask [`run`](Self::run) to return.
    pub fn interrupt(&self) {
        info!("Sensor handler interrupted");
        self.interrupted.store(true, Ordering::SeqCst);
        self.opener.interrupt();
        self.staging.waker.wake();
    }

    /// Wait for the reactor thread.
    pub fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            if let Err(e) = handle.join() {
                error!("Sensor handler thread panicked: {:?}", e);
            }
        }
    }

    /// Run the reactor on the calling thread until interrupted.
    pub fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DaqError::configuration("sensor-handler", "already running"));
        }
        self.opener.start()?;
        info!("Sensor handler started");

        let now = Instant::now();
        let mut reactor = Reactor {
            handler: self,
            conns: Vec::new(),
            table: Vec::new(),
            dirty: true,
            last_check: now,
            last_stats: now,
            last_activity: now,
        };
        while !self.interrupted.load(Ordering::SeqCst) {
            reactor.iterate();
        }
        reactor.shutdown();
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Reactor-thread state.
struct Reactor<'a> {
    handler: &'a SensorHandler,
    conns: Vec<Arc<RemoteSerialConnection>>,
    table: Vec<(RawFd, Owner)>,
    dirty: bool,
    last_check: Instant,
    last_stats: Instant,
    last_activity: Instant,
}

impl Reactor<'_> {
    fn rebuild_table(&mut self) {
        let h = self.handler;
        self.table.clear();
        self.table.push((h.staging.waker.fd(), Owner::Wake));
        if let Some(listener) = &h.listener {
            self.table.push((listener.fd(), Owner::Listener));
        }
        for (i, p) in h.polled.lock().iter().enumerate() {
            self.table.push((p.fd(), Owner::Sensor(i)));
        }
        for (i, c) in self.conns.iter().enumerate() {
            self.table.push((c.fd(), Owner::Conn(i)));
        }
        self.dirty = false;
        debug!(fds = self.table.len(), "poll table rebuilt");
    }

    fn poll_wait(&self, now: Instant) -> Duration {
        let config = &self.handler.config;
        let mut wait = config.max_poll_wait;
        if let Some(interval) = self.handler.check_interval() {
            wait = wait.min((self.last_check + interval).saturating_duration_since(now));
        }
        wait.min((self.last_stats + config.statistics_period).saturating_duration_since(now))
    }

    fn iterate(&mut self) {
        if self.dirty {
            self.rebuild_table();
        }
        let wait = self.poll_wait(Instant::now());
        let millis = u16::try_from(wait.as_millis()).unwrap_or(u16::MAX);

        let ready: Vec<(Owner, PollFlags)> = {
            let mut fds: Vec<PollFd<'_>> = self
                .table
                .iter()
                .map(|(fd, owner)| {
                    // SAFETY: every fd in the table belongs to a sensor, connection,
                    // listener or waker that stays open until the table is rebuilt.
                    #[allow(unsafe_code)]
                    let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
                    let mut events = PollFlags::POLLIN;
                    if let Owner::Conn(i) = owner {
                        if self.conns.get(*i).is_some_and(|c| c.wants_write()) {
                            events |= PollFlags::POLLOUT;
                        }
                    }
                    PollFd::new(borrowed, events)
                })
                .collect();
            match nix::poll::poll(&mut fds, PollTimeout::from(millis)) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => {
                    self.handler.poll_failures.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "poll failed");
                    thread::sleep(Duration::from_millis(10));
                }
            }
            fds.iter()
                .zip(&self.table)
                .filter_map(|(fd, (_, owner))| {
                    fd.revents().filter(|r| !r.is_empty()).map(|r| (*owner, r))
                })
                .collect()
        };

        let mut closing = Vec::new();
        for (owner, revents) in ready {
            self.dispatch(owner, revents, &mut closing);
        }
        self.timers();
        self.apply(closing);
    }

    fn dispatch(&mut self, owner: Owner, revents: PollFlags, closing: &mut Vec<usize>) {
        let h = self.handler;
        match owner {
            Owner::Wake => h.staging.waker.drain(),
            Owner::Listener => {
                if let Some(listener) = &h.listener {
                    let accepted = listener.accept();
                    if !accepted.is_empty() {
                        self.conns.extend(accepted);
                        self.dirty = true;
                    }
                }
            }
            Owner::Sensor(i) => {
                let Some(sensor) = h.polled.lock().get(i).map(|p| p.sensor().clone()) else {
                    return;
                };
                if sensor.state() == SensorState::ClosePending {
                    return;
                }
                match sensor.read_samples() {
                    Ok(n) if n > 0 => {
                        let now = Instant::now();
                        if let Some(p) = h.polled.lock().get_mut(i) {
                            p.record_read(now);
                        }
                        self.last_activity = now;
                    }
                    Ok(_) => {
                        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                            warn!(sensor = %sensor.name(), ?revents, "device error");
                            sensor.stats().inc_read_errors();
                            h.schedule_close(sensor.clone(), sensor.reopen_on_io_error());
                        }
                    }
                    Err(e) => {
                        sensor.stats().inc_read_errors();
                        warn!(sensor = %sensor.name(), error = %e, "read failed");
                        h.schedule_close(sensor.clone(), sensor.reopen_on_io_error());
                    }
                }
            }
            Owner::Conn(i) => {
                let Some(conn) = self.conns.get(i).cloned() else {
                    return;
                };
                if revents.contains(PollFlags::POLLOUT) && !conn.flush() {
                    closing.push(i);
                    return;
                }
                if revents.difference(PollFlags::POLLOUT).is_empty() {
                    return;
                }
                let mut ctx = Tunnel { handler: h };
                if !conn.handle_input(&mut ctx) {
                    closing.push(i);
                }
            }
        }
    }

    fn timers(&mut self) {
        let h = self.handler;
        let now = Instant::now();
        if let Some(interval) = h.check_interval() {
            if now.saturating_duration_since(self.last_check) >= interval {
                h.check_sensors(now);
                self.last_check = now;
            }
        }

        let elapsed = now.saturating_duration_since(self.last_stats);
        if elapsed >= h.config.statistics_period {
            for p in h.polled.lock().iter() {
                let sensor = p.sensor();
                let period = sensor.stats().roll_period(elapsed);
                debug!(
                    sensor = %sensor.name(),
                    sample_rate = period.sample_rate,
                    byte_rate = period.byte_rate,
                    min_len = period.min_message_len,
                    max_len = period.max_message_len,
                    scan_failures = sensor.stats().scan_failures(),
                    partial_scans = sensor.stats().partial_scans(),
                    "statistics"
                );
            }
            self.last_stats = now;
        }

        let idle = now.saturating_duration_since(self.last_activity);
        if idle >= h.config.timeout_warning {
            if !h.polled.lock().is_empty() {
                info!(idle_secs = idle.as_secs(), "no data from any sensor");
            }
            self.last_activity = now;
        }
    }

    fn apply(&mut self, closing: Vec<usize>) {
        let h = self.handler;

        let before = self.conns.len();
        let mut index = 0;
        self.conns.retain(|conn| {
            let keep = !closing.contains(&index) && !conn.is_failed();
            index += 1;
            if !keep {
                conn.close();
            }
            keep
        });
        if self.conns.len() != before {
            self.dirty = true;
        }

        let pending = std::mem::take(&mut *h.staging.pending.lock());
        if pending.closures.is_empty() && pending.opened.is_empty() {
            return;
        }
        for (sensor, reopen) in pending.closures {
            let removed = {
                let mut polled = h.polled.lock();
                polled
                    .iter()
                    .position(|p| Arc::ptr_eq(p.sensor(), &sensor))
                    .map(|pos| polled.remove(pos))
            };
            if removed.is_none() {
                h.opener.forget(&sensor);
            }
            sensor.close();
            if reopen && !sensor.close_requested() {
                sensor.stats().inc_reopens();
                info!(sensor = %sensor.name(), "scheduling reopen");
                h.opener.reopen_sensor(sensor);
            }
            self.dirty = true;
        }

        let now = Instant::now();
        for sensor in pending.opened {
            if sensor.close_requested() {
                sensor.close();
                continue;
            }
            let Some(fd) = sensor.read_fd() else {
                continue;
            };
            sensor.set_state(SensorState::Polled);
            info!(sensor = %sensor.name(), fd, "polling");
            h.polled.lock().push(PolledSensor::new(sensor, fd, now));
            self.dirty = true;
        }
        h.recompute_check_interval(&h.polled.lock());
    }

    fn shutdown(&mut self) {
        let h = self.handler;
        for conn in self.conns.drain(..) {
            conn.close();
        }
        let polled: Vec<PolledSensor> = h.polled.lock().drain(..).collect();
        for p in polled {
            p.sensor().close();
        }
        h.opener.interrupt();
        h.opener.join();
        let pending = std::mem::take(&mut *h.staging.pending.lock());
        for sensor in pending.opened {
            sensor.close();
        }
        *h.check_interval.lock() = None;
        info!("Sensor handler stopped");
    }
}

/// The reactor as seen by a tunnel connection.
struct Tunnel<'a> {
    handler: &'a SensorHandler,
}

impl TunnelContext for Tunnel<'_> {
    fn find_sensor(&self, name: &str) -> Option<Arc<CharacterSensor>> {
        self.handler
            .polled
            .lock()
            .iter()
            .find(|p| p.sensor().name() == name)
            .map(|p| p.sensor().clone())
    }

    fn set_timeout(&mut self, sensor: &CharacterSensor, millis: u64, permanent: bool) {
        let mut polled = self.handler.polled.lock();
        if permanent {
            sensor.set_timeout_ms(millis);
        }
        if let Some(p) = polled
            .iter_mut()
            .find(|p| std::ptr::eq(Arc::as_ptr(p.sensor()), sensor))
        {
            if permanent {
                p.clear_temporary_timeout();
            } else {
                p.set_temporary_timeout(millis);
            }
        }
        self.handler.recompute_check_interval(&polled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorConfig;
    use crate::looper::Looper;

    fn handler() -> Arc<SensorHandler> {
        SensorHandler::new(HandlerConfig::default()).unwrap()
    }

    #[test]
    fn test_add_sensor_once() {
        let h = handler();
        let looper = Arc::new(Looper::new());
        let s = CharacterSensor::from_config(&SensorConfig::new("inet:localhost:1", 1), looper)
            .unwrap();
        h.add_sensor(s.clone());
        h.add_sensor(s.clone());
        assert_eq!(h.all_sensors().len(), 1);
        assert!(h.opened_sensors().is_empty());
        assert_eq!(s.state(), SensorState::Opening);
        assert_eq!(h.opener().pending(), 1);
    }

    #[test]
    fn test_close_pending_is_idempotent() {
        let h = handler();
        let looper = Arc::new(Looper::new());
        let s = CharacterSensor::from_config(&SensorConfig::new("inet:localhost:1", 1), looper)
            .unwrap();
        h.close_sensor(&s);
        h.close_sensor(&s);
        assert_eq!(s.state(), SensorState::ClosePending);
        assert_eq!(h.staging.pending.lock().closures.len(), 1);
    }

    #[test]
    fn test_interrupt_before_run() {
        let h = handler();
        h.interrupt();
        let start = Instant::now();
        h.run().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_listener_port() {
        let config = HandlerConfig {
            remote_serial_port: Some(0),
            ..HandlerConfig::default()
        };
        let h = SensorHandler::new(config).unwrap();
        assert!(h.remote_serial_addr().is_some_and(|a| a.port() != 0));
        assert!(handler().remote_serial_addr().is_none());
    }
}
