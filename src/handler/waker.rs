//! Wakes the reactor out of `poll`.

use crate::error::{DaqError, Result};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// A socket pair whose read end is always in the poll set.
#[derive(Debug)]
pub struct Waker {
    rx: UnixStream,
    tx: UnixStream,
}

impl Waker {
    /// Create the pair.
    pub fn new() -> Result<Self> {
        let (rx, tx) = UnixStream::pair().map_err(|e| DaqError::io("waker", "socketpair", e))?;
        rx.set_nonblocking(true)
            .map_err(|e| DaqError::io("waker", "socketpair", e))?;
        tx.set_nonblocking(true)
            .map_err(|e| DaqError::io("waker", "socketpair", e))?;
        Ok(Self { rx, tx })
    }

    /// Descriptor to poll for readability.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    /// Make the read end readable. A full buffer already means "awake".
    pub fn wake(&self) {
        match (&self.tx).write(&[1]) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => tracing::warn!(error = %e, "reactor wakeup failed"),
        }
    }

    /// Consume all pending wakeups.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.rx).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::wait_fd;
    use nix::poll::PollFlags;
    use std::time::Duration;

    #[test]
    fn test_wake_and_drain() {
        let waker = Waker::new().unwrap();
        assert!(!wait_fd(waker.fd(), PollFlags::POLLIN, Duration::from_millis(10)).unwrap());
        waker.wake();
        waker.wake();
        assert!(wait_fd(waker.fd(), PollFlags::POLLIN, Duration::from_millis(100)).unwrap());
        waker.drain();
        assert!(!wait_fd(waker.fd(), PollFlags::POLLIN, Duration::from_millis(10)).unwrap());
    }
}
