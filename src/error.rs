//! Error types for the acquisition engine.
//!
//! `DaqError` is the single error type returned by the library. Each variant
//! belongs to one [`ErrorKind`], and the kind decides the remediation:
//!
//! - **Configuration**: bad format strings, missing message separators, invalid
//!   prompt rates, unsupported device names. Fatal for the component being
//!   initialized; a human has to fix the configuration.
//! - **Transient**: read/write failures on an open device. The sensor is closed
//!   and reopened; the process keeps running.
//! - **Timeout**: no read activity within the configured window, or an open
//!   handshake that never completed. Same remediation as `Transient`, but logged
//!   at a lower severity and tallied separately.
//! - **Protocol**: a remote-serial peer asked for an unknown device or sent a
//!   malformed escape sequence. The connection is closed, nothing else is
//!   affected.
//!
//! Scan failures and partial scans are not errors; they are counters kept by
//! each sensor.

use std::io;
use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type Result<T> = std::result::Result<T, DaqError>;

/// Remediation class of a [`DaqError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Requires operator correction, never retried.
    Configuration,
    /// Recoverable I/O failure, handled by close + reopen.
    Transient,
    /// Recoverable lack of activity, handled by close + reopen.
    Timeout,
    /// Misbehaving remote-serial peer, handled by closing the connection.
    Protocol,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Transient => "transient",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Protocol => "protocol",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type of the engine.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A configured value is semantically invalid.
    #[error("{name}: invalid configuration: {message}")]
    Configuration {
        /// Sensor, tag or section the value belongs to.
        name: String,
        /// What is wrong with it.
        message: String,
    },

    /// A scanf-style format string failed to compile.
    #[error("invalid format \"{format}\" at offset {offset}: {message}")]
    Format {
        /// The offending format string.
        format: String,
        /// Byte offset of the problem within the format.
        offset: usize,
        /// Description of the problem.
        message: String,
    },

    /// I/O failure on a device or socket.
    #[error("{name}: {operation}: {source}")]
    Io {
        /// Device or connection name.
        name: String,
        /// The operation that failed (open, read, write, ...).
        operation: &'static str,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// An operation did not complete in its allotted time.
    #[error("{name}: {operation}: timeout after {millis} msec")]
    Timeout {
        /// Device or connection name.
        name: String,
        /// The operation that timed out.
        operation: &'static str,
        /// The elapsed window.
        millis: u64,
    },

    /// Remote-serial peer violated the tunnel protocol.
    #[error("{name}: protocol error: {message}")]
    Protocol {
        /// Connection name.
        name: String,
        /// Description of the violation.
        message: String,
    },

    /// A write was attempted on a sensor whose device is not open.
    #[error("{name}: device is not open")]
    NotOpen {
        /// Sensor name.
        name: String,
    },

    /// A blocking operation was abandoned because of an interrupt request.
    #[error("{name}: interrupted")]
    Interrupted {
        /// Device or thread name.
        name: String,
    },
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Build a configuration error.
    pub fn configuration(name: impl Into<String>, message: impl Into<String>) -> Self {
        DaqError::Configuration {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Build an I/O error, promoting OS timeouts to [`DaqError::Timeout`].
    pub fn io(name: impl Into<String>, operation: &'static str, source: io::Error) -> Self {
        let name = name.into();
        if source.kind() == io::ErrorKind::TimedOut {
            return DaqError::Timeout {
                name,
                operation,
                millis: 0,
            };
        }
        DaqError::Io {
            name,
            operation,
            source,
        }
    }

    /// Build a protocol error.
    pub fn protocol(name: impl Into<String>, message: impl Into<String>) -> Self {
        DaqError::Protocol {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Remediation class of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaqError::Config(_) | DaqError::Configuration { .. } | DaqError::Format { .. } => {
                ErrorKind::Configuration
            }
            DaqError::Timeout { .. } => ErrorKind::Timeout,
            DaqError::Protocol { .. } => ErrorKind::Protocol,
            DaqError::Io { .. } | DaqError::NotOpen { .. } | DaqError::Interrupted { .. } => {
                ErrorKind::Transient
            }
        }
    }

    /// Whether a retry (close + reopen) can be expected to help.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Timeout)
    }

    /// Whether this is a timeout-class failure.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err = DaqError::configuration("sensor1", "no message separator");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!err.is_recoverable());

        let err = DaqError::io(
            "/dev/ttyS1",
            "read",
            io::Error::from(io::ErrorKind::BrokenPipe),
        );
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_recoverable());

        let err = DaqError::protocol("rserial", "bad escape");
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_os_timeout_promoted() {
        let err = DaqError::io("inet:host:1", "open", io::Error::from(io::ErrorKind::TimedOut));
        assert!(err.is_timeout());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = DaqError::Format {
            format: "%q".to_string(),
            offset: 1,
            message: "unknown conversion 'q'".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("%q"));
        assert!(msg.contains("unknown conversion"));
        assert_eq!(ErrorKind::Timeout.to_string(), "timeout");
    }
}
