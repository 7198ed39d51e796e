//! Remote-serial tunnel.
//!
//! A TCP client attaches to a live sensor and talks to it as if it held the
//! serial line, while the engine keeps acquiring:
//!
//! ```text
//! client                              server
//!   "<device>\n"             ──►
//!                            ◄──      "OK\n"
//!                            ◄──      "<baud> <parity> <data> <stop>\n"
//!                            ◄──      "<separator, escaped>\n"
//!                            ◄──      "<separator at end 0|1>\n"
//!                            ◄──      "<message length>\n"
//!                            ◄──      "prompted=<true|false>\n"
//!   bytes, escapes           ──►      written to the sensor
//!                            ◄──      every raw message of the sensor
//! ```
//!
//! Connections live on the reactor thread. They never close themselves: a
//! dead connection reports it and the reactor closes it after dispatch.
//! Sends never block; output a client cannot take yet is queued and drained
//! when its socket turns writable, up to [`MAX_PENDING_OUTPUT`].

pub mod escape;

pub use escape::{EscapeAction, EscapeParser, ESC};

use crate::error::{DaqError, Result};
use crate::sample::{SampleClient, SampleRef};
use crate::scan::escape as escape_bytes;
use crate::sensor::CharacterSensor;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Longest device-name request line.
pub const MAX_NAME_LENGTH: usize = 256;

/// Output queued for a client that does not keep up before it is dropped.
pub const MAX_PENDING_OUTPUT: usize = 64 * 1024;

/// What a connection needs from the reactor.
pub trait TunnelContext {
    /// The open sensor with device name `name`.
    fn find_sensor(&self, name: &str) -> Option<Arc<CharacterSensor>>;

    /// Change the read timeout of `sensor`; 0 disables it. A non-permanent
    /// change lasts until the sensor is reopened.
    fn set_timeout(&mut self, sensor: &CharacterSensor, millis: u64, permanent: bool);
}

/// Listening socket of the tunnel.
#[derive(Debug)]
pub struct RemoteSerialListener {
    listener: TcpListener,
}

impl RemoteSerialListener {
    /// Listen on `port` on all interfaces; 0 picks a free port.
    pub fn bind(port: u16) -> Result<Self> {
        let listener =
            TcpListener::bind(("0.0.0.0", port)).map_err(|e| DaqError::io("rserial", "bind", e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| DaqError::io("rserial", "bind", e))?;
        Ok(Self { listener })
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| DaqError::io("rserial", "local address", e))
    }

    /// Descriptor to poll.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Accept every pending connection.
    pub fn accept(&self) -> Vec<Arc<RemoteSerialConnection>> {
        let mut conns = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => match RemoteSerialConnection::new(stream, peer) {
                    Ok(conn) => {
                        info!(peer = %peer, "remote serial connection accepted");
                        conns.push(conn);
                    }
                    Err(e) => warn!(peer = %peer, error = %e, "cannot set up connection"),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "remote serial accept failed");
                    break;
                }
            }
        }
        conns
    }
}

enum ConnState {
    AwaitingName(Vec<u8>),
    Bound {
        sensor: Arc<CharacterSensor>,
        parser: EscapeParser,
        warned: bool,
    },
    Closed,
}

/// One tunnel client.
pub struct RemoteSerialConnection {
    name: String,
    stream: TcpStream,
    state: Mutex<ConnState>,
    outbox: Mutex<BytesMut>,
    failed: AtomicBool,
    this: Weak<RemoteSerialConnection>,
}

impl std::fmt::Debug for RemoteSerialConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSerialConnection")
            .field("peer", &self.name)
            .field("sensor", &self.sensor_name())
            .finish()
    }
}

impl RemoteSerialConnection {
    fn new(stream: TcpStream, peer: SocketAddr) -> io::Result<Arc<Self>> {
        stream.set_nonblocking(true)?;
        let _ = stream.set_nodelay(true);
        Ok(Arc::new_cyclic(|this| Self {
            name: peer.to_string(),
            stream,
            state: Mutex::new(ConnState::AwaitingName(Vec::new())),
            outbox: Mutex::new(BytesMut::new()),
            failed: AtomicBool::new(false),
            this: this.clone(),
        }))
    }

    /// Peer address.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Descriptor to poll.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Device name of the bound sensor.
    #[must_use]
    pub fn sensor_name(&self) -> Option<String> {
        match &*self.state.lock() {
            ConnState::Bound { sensor, .. } => Some(sensor.name().to_string()),
            _ => None,
        }
    }

    /// Whether a send to the client failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Read and act on everything the client sent.
    ///
    /// Returns `false` when the connection should be closed.
    pub fn handle_input(&self, ctx: &mut dyn TunnelContext) -> bool {
        let mut buf = [0u8; 4096];
        loop {
            let n = match (&self.stream).read(&mut buf) {
                Ok(0) => {
                    debug!(peer = %self.name, "remote serial client disconnected");
                    return false;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return !self.is_failed(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(peer = %self.name, error = %e, "remote serial read failed");
                    return false;
                }
            };
            if let Err(e) = self.consume(&buf[..n], ctx) {
                warn!(peer = %self.name, error = %e, "closing remote serial connection");
                return false;
            }
        }
    }

    fn consume(&self, bytes: &[u8], ctx: &mut dyn TunnelContext) -> Result<()> {
        let mut state = self.state.lock();
        let rest = match &mut *state {
            ConnState::AwaitingName(line) => {
                line.extend_from_slice(bytes);
                let Some(nl) = line.iter().position(|&b| b == b'\n') else {
                    if line.len() > MAX_NAME_LENGTH {
                        self.send_line("ERROR: device name too long.\r\n");
                        return Err(DaqError::protocol(&self.name, "device name too long"));
                    }
                    return Ok(());
                };
                let rest = line.split_off(nl + 1);
                let name = String::from_utf8_lossy(&line[..nl]).trim().to_string();
                let sensor = self.bind(&name, ctx)?;
                *state = ConnState::Bound {
                    sensor,
                    parser: EscapeParser::new(),
                    warned: false,
                };
                rest
            }
            ConnState::Bound { .. } => bytes.to_vec(),
            ConnState::Closed => return Ok(()),
        };
        if rest.is_empty() {
            return Ok(());
        }
        let ConnState::Bound {
            sensor,
            parser,
            warned,
        } = &mut *state
        else {
            return Ok(());
        };
        for action in parser.feed(&rest) {
            self.act(action, sensor, warned, ctx)?;
        }
        Ok(())
    }

    fn bind(&self, name: &str, ctx: &mut dyn TunnelContext) -> Result<Arc<CharacterSensor>> {
        let Some(sensor) = ctx.find_sensor(name) else {
            self.send_line(&format!("ERROR: sensor {} not found.\n", name));
            return Err(DaqError::protocol(
                &self.name,
                format!("sensor {} not found", name),
            ));
        };
        let (separator, at_eom, length) = sensor.framing();
        let header = format!(
            "OK\n{}\n{}\n{}\n{}\nprompted={}\n",
            sensor.line_settings(),
            escape_bytes(&separator),
            u8::from(at_eom),
            length,
            sensor.is_prompted()
        );
        self.send(header.as_bytes())
            .map_err(|e| DaqError::io(self.name.as_str(), "send", e))?;
        if let Some(this) = self.this.upgrade() {
            sensor.raw_samples().add_client(this);
        }
        info!(peer = %self.name, sensor = %name, "remote serial connection bound");
        Ok(sensor)
    }

    fn act(
        &self,
        action: EscapeAction,
        sensor: &Arc<CharacterSensor>,
        warned: &mut bool,
        ctx: &mut dyn TunnelContext,
    ) -> Result<()> {
        match action {
            EscapeAction::Data(data) => {
                if !sensor.is_open() {
                    if !*warned {
                        self.send_line(&format!("WARNING: sensor {} is not open.\r\n", sensor.name()));
                        *warned = true;
                    }
                    return Ok(());
                }
                *warned = false;
                if let Err(e) = sensor.write(&data) {
                    warn!(peer = %self.name, sensor = %sensor.name(), error = %e, "tunnel write failed");
                }
            }
            EscapeAction::SetBaud(baud) => {
                if let Err(e) = sensor.set_baud_rate(baud) {
                    self.send_line(&format!("ERROR: {}\r\n", e));
                }
            }
            EscapeAction::TogglePrompting => match sensor.toggle_prompting() {
                Ok(on) => {
                    self.send_line(if on {
                        "prompting = ON\r\n"
                    } else {
                        "prompting = OFF\r\n"
                    });
                }
                Err(e) => self.send_line(&format!("ERROR: {}\r\n", e)),
            },
            EscapeAction::SetTimeout { millis, permanent } => {
                ctx.set_timeout(sensor, millis, permanent);
                info!(sensor = %sensor.name(), millis, permanent, "read timeout changed");
            }
            EscapeAction::Invalid(message) => {
                self.send_line(&format!("ERROR: {}\r\n", message));
                return Err(DaqError::protocol(&self.name, message));
            }
        }
        Ok(())
    }

    fn send_line(&self, line: &str) {
        if let Err(e) = self.send(line.as_bytes()) {
            debug!(peer = %self.name, error = %e, "cannot send to remote serial client");
        }
    }

    /// Whether output is queued, i.e. the socket should be polled for
    /// writability.
    #[must_use]
    pub fn wants_write(&self) -> bool {
        !self.outbox.lock().is_empty()
    }

    /// Write queued output until the socket would block.
    ///
    /// Returns `false` when the connection should be closed.
    pub fn flush(&self) -> bool {
        let mut outbox = self.outbox.lock();
        match write_nonblocking(&self.stream, &outbox) {
            Ok(n) => {
                outbox.advance(n);
                true
            }
            Err(e) => {
                warn!(peer = %self.name, error = %e, "remote serial send failed");
                self.failed.store(true, Ordering::Release);
                false
            }
        }
    }

    fn send(&self, buf: &[u8]) -> io::Result<()> {
        let mut outbox = self.outbox.lock();
        let written = if outbox.is_empty() {
            write_nonblocking(&self.stream, buf)?
        } else {
            0
        };
        let rest = &buf[written..];
        if outbox.len() + rest.len() > MAX_PENDING_OUTPUT {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "client is not keeping up",
            ));
        }
        outbox.extend_from_slice(rest);
        Ok(())
    }

    /// Detach from the sensor and shut the socket down.
    pub fn close(&self) {
        let old = std::mem::replace(&mut *self.state.lock(), ConnState::Closed);
        if let (ConnState::Bound { sensor, .. }, Some(this)) = (old, self.this.upgrade()) {
            let client: Arc<dyn SampleClient> = this;
            sensor.raw_samples().remove_client(&client);
        }
        self.outbox.lock().clear();
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        debug!(peer = %self.name, "remote serial connection closed");
    }
}

/// Write as much of `buf` as the socket takes without blocking.
fn write_nonblocking(mut stream: &TcpStream, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match stream.write(&buf[written..]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

impl SampleClient for RemoteSerialConnection {
    fn receive(&self, sample: &SampleRef) {
        if self.is_failed() {
            return;
        }
        let Some(bytes) = sample.as_bytes() else {
            return;
        };
        let bytes = bytes.strip_suffix(&[0]).unwrap_or(bytes);
        if let Err(e) = self.send(bytes) {
            warn!(peer = %self.name, error = %e, "remote serial send failed");
            self.failed.store(true, Ordering::Release);
        }
    }
}
