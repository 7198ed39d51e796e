//! Shared fixtures: fake instruments on Unix sockets and sample collectors.

#![allow(dead_code)]

use field_daq::config::HandlerConfig;
use field_daq::sample::{SampleClient, SampleRef};
use parking_lot::Mutex;
use std::io::{ErrorKind, Read};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Handler settings short enough for tests.
pub fn fast_handler_config() -> HandlerConfig {
    HandlerConfig {
        remote_serial_port: None,
        opener_retry: Duration::from_millis(100),
        min_check_interval: Duration::from_millis(50),
        max_poll_wait: Duration::from_millis(50),
        statistics_period: Duration::from_secs(10),
        timeout_warning: Duration::from_secs(60),
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// An instrument the sensor connects to over a Unix-domain socket.
pub struct FakeInstrument {
    _dir: TempDir,
    path: PathBuf,
    listener: UnixListener,
}

impl FakeInstrument {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instrument.sock");
        let listener = UnixListener::bind(&path).unwrap();
        listener.set_nonblocking(true).unwrap();
        Self {
            _dir: dir,
            path,
            listener,
        }
    }

    /// Device name to configure.
    pub fn device(&self) -> String {
        format!("unix:{}", self.path.display())
    }

    /// Accept the next connection of the sensor.
    pub fn accept(&self, timeout: Duration) -> Option<UnixStream> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false).unwrap();
                    stream
                        .set_read_timeout(Some(Duration::from_millis(100)))
                        .unwrap();
                    return Some(stream);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => panic!("accept failed: {}", e),
            }
        }
        None
    }
}

/// Read from `stream` until `pattern` has been seen or `timeout` passes.
pub fn read_until(stream: &mut impl Read, pattern: &[u8], timeout: Duration) -> Vec<u8> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    while Instant::now() < deadline {
        if out.windows(pattern.len()).any(|w| w == pattern) {
            break;
        }
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(_) => break,
        }
    }
    out
}

/// Collects every sample it receives.
#[derive(Default)]
pub struct Collector {
    pub samples: Mutex<Vec<SampleRef>>,
}

impl Collector {
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn values(&self) -> Vec<Vec<f64>> {
        self.samples
            .lock()
            .iter()
            .filter_map(|s| s.as_values().map(<[f64]>::to_vec))
            .collect()
    }
}

impl SampleClient for Collector {
    fn receive(&self, sample: &SampleRef) {
        self.samples.lock().push(sample.clone());
    }
}
