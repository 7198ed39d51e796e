//! Byte-stream transports.
//!
//! A [`Device`] is one open transport behind a single capability surface:
//! `read`, `read_timeout`, `write`, `close`, `read_fd`, `write_fd`. The
//! transport is chosen from the device name:
//!
//! | name                 | transport                                          |
//! |----------------------|----------------------------------------------------|
//! | `/dev/ttyS1`         | serial port                                        |
//! | `inet:host:port`     | TCP client (`sock:` is an alias)                   |
//! | `usock:host:port`    | UDP; empty host binds `port`, otherwise connects   |
//! | `unix:/path`         | Unix-domain stream client                          |
//! | `btspp:addr:channel` | Bluetooth RFComm, recognized but not supported     |
//!
//! Every device is non-blocking once open: `read` returns `Ok(0)` when no data
//! is available, so the reactor only calls it after `poll` reports
//! readability. End of stream on a stream socket is an error.

use crate::config::{Parity, SerialOptions};
use crate::error::{DaqError, Result};
use nix::poll::{PollFd, PollFlags, PollTimeout};
use serialport::{SerialPort, TTYPort};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Total time allowed for a TCP connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Slice length of a cancellable connect.
const CONNECT_SLICE: Duration = Duration::from_millis(250);

/// How long a write waits for a full output buffer to drain.
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Cooperative cancellation flag observed by blocking opens.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// New, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Transport selected by a device name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    /// Serial port at a filesystem path.
    Serial {
        /// Port path
        path: String,
    },
    /// TCP client.
    Tcp {
        /// Remote host
        host: String,
        /// Remote port
        port: u16,
    },
    /// UDP socket; `host == None` binds and receives on `port`.
    Udp {
        /// Remote host, if connected
        host: Option<String>,
        /// Local (bound) or remote (connected) port
        port: u16,
    },
    /// Unix-domain stream client.
    Unix {
        /// Socket path
        path: String,
    },
    /// Bluetooth RFComm.
    Bluetooth {
        /// Device address
        address: String,
        /// RFComm channel
        channel: u8,
    },
}

fn split_host_port(name: &str, rest: &str) -> Result<(String, u16)> {
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| DaqError::configuration(name, "expected <prefix>:host:port"))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| DaqError::configuration(name, format!("invalid port \"{}\"", port)))?;
    Ok((host.to_string(), port))
}

impl DeviceKind {
    /// Parse a device name.
    pub fn from_name(name: &str) -> Result<Self> {
        if let Some(rest) = name
            .strip_prefix("inet:")
            .or_else(|| name.strip_prefix("sock:"))
        {
            let (host, port) = split_host_port(name, rest)?;
            if host.is_empty() {
                return Err(DaqError::configuration(name, "empty host"));
            }
            Ok(DeviceKind::Tcp { host, port })
        } else if let Some(rest) = name.strip_prefix("usock:") {
            let (host, port) = split_host_port(name, rest)?;
            let host = if host.is_empty() { None } else { Some(host) };
            Ok(DeviceKind::Udp { host, port })
        } else if let Some(path) = name.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(DaqError::configuration(name, "empty socket path"));
            }
            Ok(DeviceKind::Unix {
                path: path.to_string(),
            })
        } else if let Some(rest) = name.strip_prefix("btspp:") {
            let (address, channel) = rest
                .rsplit_once(':')
                .ok_or_else(|| DaqError::configuration(name, "expected btspp:address:channel"))?;
            let channel = channel.parse::<u8>().map_err(|_| {
                DaqError::configuration(name, format!("invalid channel \"{}\"", channel))
            })?;
            Ok(DeviceKind::Bluetooth {
                address: address.to_string(),
                channel,
            })
        } else if name.is_empty() {
            Err(DaqError::configuration(name, "empty device name"))
        } else {
            Ok(DeviceKind::Serial {
                path: name.to_string(),
            })
        }
    }

    /// Whether this is a serial port.
    #[must_use]
    pub fn is_serial(&self) -> bool {
        matches!(self, DeviceKind::Serial { .. })
    }
}

enum Transport {
    Serial(TTYPort),
    Tcp(TcpStream),
    Udp(UdpSocket),
    Unix(UnixStream),
}

impl Transport {
    fn raw_fd(&self) -> RawFd {
        match self {
            Transport::Serial(p) => p.as_raw_fd(),
            Transport::Tcp(s) => s.as_raw_fd(),
            Transport::Udp(s) => s.as_raw_fd(),
            Transport::Unix(s) => s.as_raw_fd(),
        }
    }

    fn is_stream(&self) -> bool {
        matches!(self, Transport::Tcp(_) | Transport::Unix(_))
    }
}

/// An open transport.
pub struct Device {
    name: String,
    transport: Transport,
    serial: Option<SerialOptions>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("fd", &self.transport.raw_fd())
            .finish()
    }
}

fn to_serial_parity(p: Parity) -> serialport::Parity {
    match p {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

fn to_data_bits(name: &str, bits: u8) -> Result<serialport::DataBits> {
    match bits {
        5 => Ok(serialport::DataBits::Five),
        6 => Ok(serialport::DataBits::Six),
        7 => Ok(serialport::DataBits::Seven),
        8 => Ok(serialport::DataBits::Eight),
        _ => Err(DaqError::configuration(
            name,
            format!("invalid data bits {}", bits),
        )),
    }
}

fn to_stop_bits(name: &str, bits: u8) -> Result<serialport::StopBits> {
    match bits {
        1 => Ok(serialport::StopBits::One),
        2 => Ok(serialport::StopBits::Two),
        _ => Err(DaqError::configuration(
            name,
            format!("invalid stop bits {}", bits),
        )),
    }
}

/// Wait until `fd` is ready for `flags` or `timeout` passes.
///
/// Returns `Ok(false)` on timeout. Error and hangup conditions count as ready
/// so the following read or write reports them.
pub(crate) fn wait_fd(fd: RawFd, flags: PollFlags, timeout: Duration) -> io::Result<bool> {
    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    // SAFETY: fd is owned by a live Device for the duration of this call.
    #[allow(unsafe_code)]
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(borrowed, flags)];
    match nix::poll::poll(&mut fds, PollTimeout::from(millis)) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::EINTR) => Ok(false),
        Err(e) => Err(io::Error::from(e)),
    }
}

fn connect_tcp(name: &str, host: &str, port: u16, cancel: &CancelToken) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| DaqError::io(name, "resolve", e))?
        .collect();
    if addrs.is_empty() {
        return Err(DaqError::io(
            name,
            "resolve",
            io::Error::new(io::ErrorKind::NotFound, "no addresses"),
        ));
    }

    let start = Instant::now();
    let mut last_err = None;
    while start.elapsed() < CONNECT_TIMEOUT {
        for addr in &addrs {
            if cancel.is_cancelled() {
                return Err(DaqError::Interrupted {
                    name: name.to_string(),
                });
            }
            match TcpStream::connect_timeout(addr, CONNECT_SLICE) {
                Ok(stream) => return Ok(stream),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => last_err = Some(e),
            }
        }
        if let Some(e) = last_err.take() {
            return Err(DaqError::io(name, "connect", e));
        }
    }
    Err(DaqError::Timeout {
        name: name.to_string(),
        operation: "connect",
        millis: CONNECT_TIMEOUT.as_millis() as u64,
    })
}

impl Device {
    /// Open the device named `name`.
    ///
    /// May block (TCP connect) but returns promptly once `cancel` is tripped.
    pub fn open(name: &str, serial: &SerialOptions, cancel: &CancelToken) -> Result<Self> {
        let kind = DeviceKind::from_name(name)?;
        let (transport, serial) = match kind {
            DeviceKind::Serial { path } => {
                let port = serialport::new(path.as_str(), serial.baud)
                    .data_bits(to_data_bits(name, serial.data_bits)?)
                    .parity(to_serial_parity(serial.parity))
                    .stop_bits(to_stop_bits(name, serial.stop_bits)?)
                    .flow_control(serialport::FlowControl::None)
                    .timeout(Duration::ZERO)
                    .open_native()
                    .map_err(|e| DaqError::io(name, "open", io::Error::from(e)))?;
                (Transport::Serial(port), Some(serial.clone()))
            }
            DeviceKind::Tcp { host, port } => {
                let stream = connect_tcp(name, &host, port, cancel)?;
                stream
                    .set_nonblocking(true)
                    .map_err(|e| DaqError::io(name, "open", e))?;
                // Small prompt writes must not wait for Nagle.
                let _ = stream.set_nodelay(true);
                (Transport::Tcp(stream), None)
            }
            DeviceKind::Udp { host, port } => {
                let socket = match host {
                    None => UdpSocket::bind(("0.0.0.0", port)),
                    Some(host) => UdpSocket::bind(("0.0.0.0", 0))
                        .and_then(|s| s.connect((host.as_str(), port)).map(|_| s)),
                }
                .map_err(|e| DaqError::io(name, "open", e))?;
                socket
                    .set_nonblocking(true)
                    .map_err(|e| DaqError::io(name, "open", e))?;
                (Transport::Udp(socket), None)
            }
            DeviceKind::Unix { path } => {
                let stream =
                    UnixStream::connect(&path).map_err(|e| DaqError::io(name, "open", e))?;
                stream
                    .set_nonblocking(true)
                    .map_err(|e| DaqError::io(name, "open", e))?;
                (Transport::Unix(stream), None)
            }
            DeviceKind::Bluetooth { .. } => {
                return Err(DaqError::configuration(
                    name,
                    "Bluetooth RFComm devices are not supported by this build",
                ));
            }
        };
        debug!(device = %name, fd = transport.raw_fd(), "device opened");
        Ok(Self {
            name: name.to_string(),
            transport,
            serial,
        })
    }

    /// Wrap an already connected Unix stream. Used for socket pairs.
    pub fn from_unix_stream(name: impl Into<String>, stream: UnixStream) -> Result<Self> {
        let name = name.into();
        stream
            .set_nonblocking(true)
            .map_err(|e| DaqError::io(name.as_str(), "open", e))?;
        Ok(Self {
            name,
            transport: Transport::Unix(stream),
            serial: None,
        })
    }

    /// Device name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serial line settings, `None` for sockets.
    #[must_use]
    pub fn serial_options(&self) -> Option<&SerialOptions> {
        self.serial.as_ref()
    }

    /// Descriptor to poll for readability.
    #[must_use]
    pub fn read_fd(&self) -> RawFd {
        self.transport.raw_fd()
    }

    /// Descriptor written by [`Device::write`].
    #[must_use]
    pub fn write_fd(&self) -> RawFd {
        self.transport.raw_fd()
    }

    /// Second handle on the same open file description.
    ///
    /// The sensor reads through one handle on the reactor thread and writes
    /// prompts through the other.
    pub fn try_clone(&self) -> Result<Self> {
        let transport = match &self.transport {
            Transport::Serial(p) => p.try_clone_native().map(Transport::Serial).map_err(io::Error::from),
            Transport::Tcp(s) => s.try_clone().map(Transport::Tcp),
            Transport::Udp(s) => s.try_clone().map(Transport::Udp),
            Transport::Unix(s) => s.try_clone().map(Transport::Unix),
        }
        .map_err(|e| DaqError::io(self.name.as_str(), "clone", e))?;
        Ok(Self {
            name: self.name.clone(),
            transport,
            serial: self.serial.clone(),
        })
    }

    /// Read available bytes; `Ok(0)` if none are available.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let result = match &mut self.transport {
            Transport::Serial(p) => p.read(buf),
            Transport::Tcp(s) => s.read(buf),
            Transport::Udp(s) => s.recv(buf),
            Transport::Unix(s) => s.read(buf),
        };
        match result {
            Ok(0) if self.transport.is_stream() && !buf.is_empty() => Err(DaqError::io(
                self.name.as_str(),
                "read",
                io::Error::new(io::ErrorKind::UnexpectedEof, "end of stream"),
            )),
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(DaqError::io(self.name.as_str(), "read", e)),
        }
    }

    /// Wait up to `timeout` for data, then read.
    pub fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let ready = wait_fd(self.read_fd(), PollFlags::POLLIN, timeout)
            .map_err(|e| DaqError::io(self.name.as_str(), "poll", e))?;
        if !ready {
            return Err(DaqError::Timeout {
                name: self.name.clone(),
                operation: "read",
                millis: timeout.as_millis() as u64,
            });
        }
        self.read(buf)
    }

    /// Write all of `buf`, waiting briefly if the output buffer is full.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            let result = match &mut self.transport {
                Transport::Serial(p) => p.write(&buf[written..]),
                Transport::Tcp(s) => s.write(&buf[written..]),
                Transport::Udp(s) => s.send(&buf[written..]),
                Transport::Unix(s) => s.write(&buf[written..]),
            };
            match result {
                Ok(0) => {
                    return Err(DaqError::io(
                        self.name.as_str(),
                        "write",
                        io::Error::from(io::ErrorKind::WriteZero),
                    ))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    let ready = wait_fd(self.write_fd(), PollFlags::POLLOUT, WRITE_TIMEOUT)
                        .map_err(|e| DaqError::io(self.name.as_str(), "poll", e))?;
                    if !ready {
                        return Err(DaqError::Timeout {
                            name: self.name.clone(),
                            operation: "write",
                            millis: WRITE_TIMEOUT.as_millis() as u64,
                        });
                    }
                }
                Err(e) => return Err(DaqError::io(self.name.as_str(), "write", e)),
            }
        }
        Ok(written)
    }

    /// Change the baud rate of a serial port.
    pub fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        match &mut self.transport {
            Transport::Serial(p) => {
                p.set_baud_rate(baud)
                    .map_err(|e| DaqError::io(self.name.as_str(), "set baud", io::Error::from(e)))?;
                if let Some(opts) = self.serial.as_mut() {
                    opts.baud = baud;
                }
                Ok(())
            }
            _ => Err(DaqError::configuration(
                self.name.as_str(),
                "baud rate applies only to serial ports",
            )),
        }
    }

    /// Close the device. Stream sockets are shut down in both directions,
    /// which also ends any cloned handle.
    pub fn close(self) {
        match &self.transport {
            Transport::Tcp(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
            Transport::Unix(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
            Transport::Serial(_) | Transport::Udp(_) => {}
        }
        debug!(device = %self.name, "device closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpListener;
    use std::os::unix::net::UnixListener;

    #[test]
    fn test_parse_device_names() {
        assert_eq!(
            DeviceKind::from_name("/dev/ttyS1").unwrap(),
            DeviceKind::Serial {
                path: "/dev/ttyS1".to_string()
            }
        );
        assert_eq!(
            DeviceKind::from_name("inet:tower.local:4001").unwrap(),
            DeviceKind::Tcp {
                host: "tower.local".to_string(),
                port: 4001
            }
        );
        assert_eq!(
            DeviceKind::from_name("sock:10.0.0.2:30").unwrap(),
            DeviceKind::Tcp {
                host: "10.0.0.2".to_string(),
                port: 30
            }
        );
        assert_eq!(
            DeviceKind::from_name("usock::9000").unwrap(),
            DeviceKind::Udp {
                host: None,
                port: 9000
            }
        );
        assert_eq!(
            DeviceKind::from_name("unix:/tmp/s").unwrap(),
            DeviceKind::Unix {
                path: "/tmp/s".to_string()
            }
        );
        assert!(matches!(
            DeviceKind::from_name("btspp:00:11:22:33:44:55:1").unwrap(),
            DeviceKind::Bluetooth { channel: 1, .. }
        ));
        assert!(DeviceKind::from_name("inet:host:notaport").is_err());
        assert!(DeviceKind::from_name("inet::80").is_err());
        assert!(DeviceKind::from_name("").is_err());
    }

    #[test]
    fn test_bluetooth_is_configuration_error() {
        let err = Device::open(
            "btspp:00:11:22:33:44:55:1",
            &SerialOptions::default(),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_unix_read_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let name = format!("unix:{}", path.display());

        let mut dev = Device::open(&name, &SerialOptions::default(), &CancelToken::new()).unwrap();
        assert!(dev.serial_options().is_none());
        let (mut peer, _) = listener.accept().unwrap();

        let mut buf = [0u8; 64];
        // Nothing yet: would-block reads as zero.
        assert_eq!(dev.read(&mut buf).unwrap(), 0);

        peer.write_all(b"12.5\n").unwrap();
        let n = dev.read_timeout(&mut buf, Duration::from_secs(2)).unwrap();
        assert_eq!(&buf[..n], b"12.5\n");

        let mut writer = dev.try_clone().unwrap();
        writer.write(b"R\r").unwrap();
        let mut got = [0u8; 2];
        std::io::Read::read_exact(&mut peer, &mut got).unwrap();
        assert_eq!(&got, b"R\r");

        drop(peer);
        let err = dev.read_timeout(&mut buf, Duration::from_secs(2)).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_read_timeout_expires() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let name = format!("inet:127.0.0.1:{}", port);
        let mut dev = Device::open(&name, &SerialOptions::default(), &CancelToken::new()).unwrap();
        let _peer = listener.accept().unwrap();

        let mut buf = [0u8; 8];
        let err = dev
            .read_timeout(&mut buf, Duration::from_millis(50))
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_connect_refused_is_recoverable() {
        // Bind then drop to find a port with nothing listening.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let name = format!("inet:127.0.0.1:{}", port);
        let err = Device::open(&name, &SerialOptions::default(), &CancelToken::new()).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_baud_rate_on_socket_rejected() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut dev = Device::from_unix_stream("pair", a).unwrap();
        assert!(dev.set_baud_rate(19200).is_err());
    }
}
