//! # Field DAQ Core Library
//!
//! Unattended acquisition of character-stream instruments: serial ports and
//! TCP/UDP/Unix sockets are multiplexed by one reactor thread, their byte
//! streams are framed into messages, timestamped, scanned against
//! scanf-style formats and handed to sample clients as typed samples.
//!
//! ## Crate Structure
//!
//! - **`config`**: figment-based loading and validation of the TOML
//!   configuration (`DaqConfig`).
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the `DaqError` enum and its remediation classes.
//! - **`sample`**: `Sample`, `SampleRef` and the `SampleClient` fan-out.
//! - **`device`**: one enum over serial, TCP, UDP and Unix-domain transports,
//!   selected by device name.
//! - **`scan`**: scanf-style format compilation and execution, and framing of
//!   byte streams into messages.
//! - **`sensor`**: `CharacterSensor`, tying device, framer, formats,
//!   variables, converters and prompts together.
//! - **`looper`**: the shared periodic scheduler used for prompting.
//! - **`handler`**: the poll-based reactor (`SensorHandler`) and the
//!   background opener thread.
//! - **`rserial`**: the remote-serial TCP tunnel to a live sensor.

pub mod config;
pub mod device;
pub mod error;
pub mod handler;
pub mod logging;
pub mod looper;
pub mod rserial;
pub mod sample;
pub mod scan;
pub mod sensor;

pub use error::{DaqError, ErrorKind, Result};
pub use handler::SensorHandler;
pub use sample::{Sample, SampleClient, SampleData, SampleRef};
pub use sensor::CharacterSensor;
