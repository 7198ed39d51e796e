//! Character-stream sensors.
//!
//! A [`CharacterSensor`] owns one device, frames its byte stream into raw
//! messages and turns each raw message into at most one processed sample:
//!
//! ```text
//! Device bytes → MessageScanner → raw Sample ─┬─→ raw clients
//!                                             └─→ FormatScanner rotation
//!                                                   → range checks
//!                                                   → time tag smoothing, lag
//!                                                   → converters
//!                                                   → processed clients
//! ```
//!
//! Reads happen on the reactor thread through the read handle, prompts are
//! written from the looper thread through a cloned write handle.

pub mod convert;
pub mod stats;
pub mod tag;
pub mod timetag;

pub use convert::{CalTable, Converter};
pub use stats::{PeriodStats, SensorStats};
pub use tag::{Prompt, SampleTag, Variable};
pub use timetag::TimetagAdjuster;

use crate::config::{SensorConfig, SerialOptions};
use crate::device::{CancelToken, Device, DeviceKind};
use crate::error::{DaqError, Result};
use crate::looper::{ClientId, Looper, LooperClient};
use crate::sample::{now_usecs, Sample, SampleRef, SampleSource, Timetag, USECS_PER_SEC};
use crate::scan::{unescape, FormatScanner, MessageScanner};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Size of one device read.
const READ_BUFFER_SIZE: usize = 4096;

/// Line settings reported for devices that are not serial ports.
pub const NON_SERIAL_LINE_SETTINGS: &str = "9999 even 8 1";

/// Lifecycle state of a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SensorState {
    /// Never opened
    Unopened = 0,
    /// Queued for, or inside, an open
    Opening = 1,
    /// Open and in the poll set
    Polled = 2,
    /// Close requested, not yet applied
    ClosePending = 3,
    /// Closed
    Closed = 4,
}

impl SensorState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SensorState::Opening,
            2 => SensorState::Polled,
            3 => SensorState::ClosePending,
            4 => SensorState::Closed,
            _ => SensorState::Unopened,
        }
    }
}

/// Checked, compiled form of a [`SensorConfig`].
#[derive(Debug, Clone)]
pub struct SensorDefinition {
    /// Source configuration
    pub config: SensorConfig,
    /// Sample tags
    pub tags: Vec<SampleTag>,
    /// Sensor-level and tag prompts
    pub prompts: Vec<Prompt>,
    /// Expanded init string
    pub init_string: Option<Vec<u8>>,
    scanners: Vec<(FormatScanner, usize)>,
}

impl SensorDefinition {
    /// Build tags and compile formats.
    ///
    /// Fails on malformed formats, unreadable calibration files and on a
    /// sensor where only some tags carry a format.
    pub fn init(config: &SensorConfig) -> Result<Self> {
        let name = config.device.as_str();
        let tags = config
            .tags
            .iter()
            .map(|t| SampleTag::from_config(name, t))
            .collect::<Result<Vec<_>>>()?;

        let with_format = tags.iter().filter(|t| t.format.is_some()).count();
        if with_format != 0 && with_format != tags.len() {
            return Err(DaqError::configuration(
                name,
                "either all sample tags or none must have a scan format",
            ));
        }

        let mut scanners = Vec::with_capacity(with_format);
        for (idx, tag) in tags.iter().enumerate() {
            let Some(format) = &tag.format else {
                continue;
            };
            let scanner = FormatScanner::new(format)?;
            if scanner.num_fields() < tag.variables.len() {
                warn!(
                    sensor = %name,
                    tag = tag.id,
                    format = %format,
                    fields = scanner.num_fields(),
                    variables = tag.variables.len(),
                    "format has fewer fields than variables"
                );
            }
            scanners.push((scanner, idx));
        }

        let mut prompts: Vec<Prompt> = config.prompts.iter().map(Prompt::from_config).collect();
        prompts.extend(tags.iter().filter_map(|t| t.prompt.clone()));

        Ok(Self {
            config: config.clone(),
            tags,
            prompts,
            init_string: config.init_string.as_deref().map(unescape),
            scanners,
        })
    }

    /// Check message framing, prompt rates, tag rates and smoothing.
    pub fn validate(&self) -> Result<()> {
        let name = self.config.device.as_str();
        MessageScanner::new(name, &self.config.message)?;
        for prompt in &self.config.prompts {
            if !prompt.rate.is_finite() || prompt.rate < 0.0 {
                return Err(DaqError::configuration(
                    name,
                    format!("prompt \"{}\": invalid rate {}", prompt.string, prompt.rate),
                ));
            }
        }
        for tag in &self.tags {
            tag.validate(name)?;
        }
        Ok(())
    }

    /// Whether any prompt repeats.
    #[must_use]
    pub fn is_prompted(&self) -> bool {
        self.prompts.iter().any(|p| p.period_ms() > 0)
    }
}

#[derive(Debug)]
struct ScanState {
    next: usize,
    adjusters: HashMap<u32, TimetagAdjuster>,
}

/// Writes one prompt on each looper notification.
struct PromptClient {
    sensor: Weak<CharacterSensor>,
    bytes: Vec<u8>,
}

impl LooperClient for PromptClient {
    fn looper_notify(&self, _now: Timetag) {
        let Some(sensor) = self.sensor.upgrade() else {
            return;
        };
        if let Err(e) = sensor.write(&self.bytes) {
            sensor.stats.inc_write_errors();
            warn!(sensor = %sensor.name, error = %e, "prompt write failed");
        }
    }
}

/// A sensor producing a character stream.
pub struct CharacterSensor {
    name: String,
    def: SensorDefinition,
    looper: Arc<Looper>,
    this: Weak<CharacterSensor>,
    lag_usecs: i64,
    timeout_ms: AtomicU64,
    scan: Mutex<ScanState>,
    framer: Mutex<MessageScanner>,
    reader: Mutex<Option<Device>>,
    writer: Mutex<Option<Device>>,
    state: AtomicU8,
    close_requested: AtomicBool,
    prompting: AtomicBool,
    prompt_ids: Mutex<Vec<ClientId>>,
    raw_source: SampleSource,
    processed_source: SampleSource,
    stats: SensorStats,
}

impl std::fmt::Debug for CharacterSensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CharacterSensor")
            .field("name", &self.name)
            .field("id", &self.def.config.id)
            .field("state", &self.state())
            .finish()
    }
}

impl CharacterSensor {
    /// Create a sensor from a checked definition.
    pub fn new(def: SensorDefinition, looper: Arc<Looper>) -> Result<Arc<Self>> {
        def.validate()?;
        let framer = MessageScanner::new(&def.config.device, &def.config.message)?;
        let lag_usecs = def.config.lag.map_or(0, |d| d.as_micros() as i64);
        let timeout_ms = def.config.timeout.map_or(0, |d| d.as_millis() as u64);
        let prompting = def.is_prompted();
        Ok(Arc::new_cyclic(|this| Self {
            name: def.config.device.clone(),
            lag_usecs,
            timeout_ms: AtomicU64::new(timeout_ms),
            scan: Mutex::new(ScanState {
                next: 0,
                adjusters: Self::adjusters(&def.tags),
            }),
            framer: Mutex::new(framer),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            state: AtomicU8::new(SensorState::Unopened as u8),
            close_requested: AtomicBool::new(false),
            prompting: AtomicBool::new(prompting),
            prompt_ids: Mutex::new(Vec::new()),
            raw_source: SampleSource::new(),
            processed_source: SampleSource::new(),
            stats: SensorStats::default(),
            this: this.clone(),
            looper,
            def,
        }))
    }

    /// Initialize, validate and create in one step.
    pub fn from_config(config: &SensorConfig, looper: Arc<Looper>) -> Result<Arc<Self>> {
        Self::new(SensorDefinition::init(config)?, looper)
    }

    fn adjusters(tags: &[SampleTag]) -> HashMap<u32, TimetagAdjuster> {
        tags.iter()
            .filter_map(|t| {
                let s = t.smoothing.as_ref()?;
                let period = s.period.as_micros() as i64;
                Some((t.id, TimetagAdjuster::new(t.rate, period, s.gap)))
            })
            .collect()
    }

    /// Device name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the raw samples.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.def.config.id
    }

    /// The definition this sensor was built from.
    #[must_use]
    pub fn definition(&self) -> &SensorDefinition {
        &self.def
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> &SensorStats {
        &self.stats
    }

    /// Clients of the framed, unprocessed messages.
    #[must_use]
    pub fn raw_samples(&self) -> &SampleSource {
        &self.raw_source
    }

    /// Clients of the scanned samples.
    #[must_use]
    pub fn processed_samples(&self) -> &SampleSource {
        &self.processed_source
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> SensorState {
        SensorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SensorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether the device is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.reader.lock().is_some()
    }

    /// Whether any prompt repeats.
    #[must_use]
    pub fn is_prompted(&self) -> bool {
        self.def.is_prompted()
    }

    /// Whether repeating prompts are currently being sent (or will be, on
    /// the next open).
    #[must_use]
    pub fn is_prompting(&self) -> bool {
        self.prompting.load(Ordering::Acquire)
    }

    /// Whether a read failure should reopen rather than just close.
    #[must_use]
    pub fn reopen_on_io_error(&self) -> bool {
        self.def.config.reopen_on_io_error
    }

    /// Read timeout in ms, 0 if disabled.
    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    /// Change the read timeout for this and later opens; 0 disables it.
    pub fn set_timeout_ms(&self, ms: u64) {
        self.timeout_ms.store(ms, Ordering::Relaxed);
    }

    /// Descriptor to poll, if open.
    #[must_use]
    pub fn read_fd(&self) -> Option<RawFd> {
        self.reader.lock().as_ref().map(Device::read_fd)
    }

    /// Open the device, send the init string and one-shot prompts, and
    /// start prompting.
    ///
    /// Blocks for at most the connect timeout; returns early once `cancel`
    /// is tripped. The init string goes out before the device is installed,
    /// so a concurrent [`close`](Self::close) never waits on it. Fails with
    /// [`DaqError::Interrupted`] once [`request_close`](Self::request_close)
    /// has been called.
    pub fn open(&self, cancel: &CancelToken) -> Result<()> {
        self.check_close_requested()?;
        let device = Device::open(&self.name, &self.def.config.serial, cancel)?;
        let mut writer = device.try_clone()?;

        {
            let mut framer = self.framer.lock();
            framer.reset();
            framer.set_usecs_per_byte(device.serial_options().map_or(0, usecs_per_byte));
        }
        {
            let mut scan = self.scan.lock();
            scan.next = 0;
            scan.adjusters = Self::adjusters(&self.def.tags);
        }

        let one_shot = self.def.prompts.iter().filter(|p| p.period_ms() == 0);
        for bytes in self
            .def
            .init_string
            .iter()
            .chain(one_shot.map(|p| &p.bytes))
        {
            trace!(sensor = %self.name, len = bytes.len(), "write");
            writer.write(bytes)?;
            self.check_close_requested()?;
        }

        {
            let mut reader = self.reader.lock();
            self.check_close_requested()?;
            *self.writer.lock() = Some(writer);
            *reader = Some(device);
        }
        info!(sensor = %self.name, "opened");

        if self.is_prompting() {
            self.start_prompting()?;
            if self.close_requested() {
                self.stop_prompting();
                return self.check_close_requested();
            }
        }
        Ok(())
    }

    /// Mark the sensor closed for good: later opens fail and the opener
    /// drops it instead of retrying.
    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::Release);
    }

    /// Whether [`request_close`](Self::request_close) has been called.
    #[must_use]
    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    fn check_close_requested(&self) -> Result<()> {
        if self.close_requested() {
            return Err(DaqError::Interrupted {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Stop prompting and close the device. Safe to call when not open.
    pub fn close(&self) {
        self.stop_prompting();
        let reader = self.reader.lock().take();
        let writer = self.writer.lock().take();
        drop(writer);
        if let Some(device) = reader {
            device.close();
            info!(sensor = %self.name, "closed");
        }
        self.set_state(SensorState::Closed);
    }

    /// Write bytes to the device.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut writer = self.writer.lock();
        let device = writer.as_mut().ok_or_else(|| DaqError::NotOpen {
            name: self.name.clone(),
        })?;
        trace!(sensor = %self.name, len = buf.len(), "write");
        device.write(buf)
    }

    /// Change the serial baud rate of the open device.
    pub fn set_baud_rate(&self, baud: u32) -> Result<()> {
        let mut writer = self.writer.lock();
        let device = writer.as_mut().ok_or_else(|| DaqError::NotOpen {
            name: self.name.clone(),
        })?;
        device.set_baud_rate(baud)?;
        if let Some(opts) = device.serial_options() {
            self.framer.lock().set_usecs_per_byte(usecs_per_byte(opts));
        }
        info!(sensor = %self.name, baud, "baud rate changed");
        Ok(())
    }

    /// `<baud> <parity> <data bits> <stop bits>` of the device.
    #[must_use]
    pub fn line_settings(&self) -> String {
        let current = self
            .writer
            .lock()
            .as_ref()
            .and_then(|d| d.serial_options().cloned());
        let opts = match current {
            Some(opts) => opts,
            None if DeviceKind::from_name(&self.name).is_ok_and(|k| k.is_serial()) => {
                self.def.config.serial.clone()
            }
            None => return NON_SERIAL_LINE_SETTINGS.to_string(),
        };
        format!("{} {} {} {}", opts.baud, opts.parity, opts.data_bits, opts.stop_bits)
    }

    /// Framing parameters: separator, separator-at-end, fixed length.
    #[must_use]
    pub fn framing(&self) -> (Vec<u8>, bool, usize) {
        let framer = self.framer.lock();
        (
            framer.separator().to_vec(),
            framer.separator_at_eom(),
            framer.message_length(),
        )
    }

    /// Start or stop repeating prompts. Returns the new state.
    pub fn toggle_prompting(&self) -> Result<bool> {
        if self.is_prompting() {
            self.stop_prompting();
            self.prompting.store(false, Ordering::Release);
        } else {
            self.prompting.store(true, Ordering::Release);
            if self.is_open() {
                self.start_prompting()?;
            }
        }
        let on = self.is_prompting();
        info!(sensor = %self.name, prompting = on, "prompting toggled");
        Ok(on)
    }

    fn start_prompting(&self) -> Result<()> {
        let mut ids = self.prompt_ids.lock();
        if !ids.is_empty() {
            return Ok(());
        }
        for prompt in self.def.prompts.iter().filter(|p| p.period_ms() > 0) {
            let client = Arc::new(PromptClient {
                sensor: self.this.clone(),
                bytes: prompt.bytes.clone(),
            });
            match self
                .looper
                .add_client(client, prompt.period_ms(), prompt.offset_ms())
            {
                Ok(id) => ids.push(id),
                Err(e) => {
                    for id in ids.drain(..) {
                        self.looper.remove_client(id);
                    }
                    return Err(e);
                }
            }
        }
        debug!(sensor = %self.name, prompts = ids.len(), "prompting started");
        Ok(())
    }

    fn stop_prompting(&self) {
        let ids: Vec<ClientId> = self.prompt_ids.lock().drain(..).collect();
        for id in &ids {
            self.looper.remove_client(*id);
        }
        if !ids.is_empty() {
            debug!(sensor = %self.name, "prompting stopped");
        }
    }

    /// Read what the device has, frame it and distribute the results.
    ///
    /// Returns the number of bytes read.
    pub fn read_samples(&self) -> Result<usize> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let n = {
            let mut reader = self.reader.lock();
            let device = reader.as_mut().ok_or_else(|| DaqError::NotOpen {
                name: self.name.clone(),
            })?;
            device.read(&mut buf)?
        };
        if n == 0 {
            return Ok(0);
        }
        let tread = now_usecs();
        self.stats.add_bytes(n);

        let mut raws = Vec::new();
        self.framer
            .lock()
            .scan(&buf[..n], tread, self.def.config.id, &mut raws);
        for raw in &raws {
            self.stats.add_message(raw.len());
            self.raw_source.distribute(raw);
            for sample in self.process(raw) {
                self.processed_source.distribute(&sample);
            }
        }
        Ok(n)
    }

    /// Scan one raw message into at most one processed sample.
    ///
    /// Formats are tried starting with the one that last matched. A message
    /// no format matches is counted and dropped, and the next message starts
    /// with the following format.
    pub fn process(&self, raw: &Sample) -> Vec<SampleRef> {
        let Some(msg) = raw.as_bytes() else {
            return Vec::new();
        };
        if self.def.scanners.is_empty() {
            return Vec::new();
        }

        let mut scan = self.scan.lock();
        let count = self.def.scanners.len();
        let start = scan.next % count;
        let matched = (0..count).map(|k| (start + k) % count).find_map(|i| {
            let values = self.def.scanners[i].0.scan(msg);
            (!values.is_empty()).then_some((i, values))
        });
        let Some((index, mut values)) = matched else {
            scan.next = (start + 1) % count;
            self.stats.inc_scan_failures();
            trace!(sensor = %self.name, msg = %String::from_utf8_lossy(msg).trim_end(), "no format matched");
            return Vec::new();
        };
        scan.next = index;

        let tag = &self.def.tags[self.def.scanners[index].1];
        let nvars = tag.variables.len();
        if nvars > 0 {
            if values.len() < nvars {
                self.stats.inc_partial_scans();
            }
            values.resize(nvars, f64::NAN);
        }

        let mut time = raw.time;
        if let Some(adjuster) = scan.adjusters.get_mut(&tag.id) {
            time = adjuster.adjust(time);
        }
        drop(scan);
        time -= self.lag_usecs;

        for (value, var) in values.iter_mut().zip(&tag.variables) {
            *value = var.apply(time, *value);
        }
        self.stats.inc_processed();
        vec![Arc::new(Sample::values(tag.id, time, values))]
    }
}

impl Drop for CharacterSensor {
    fn drop(&mut self) {
        self.stop_prompting();
    }
}

/// Line time of one character, microseconds.
fn usecs_per_byte(opts: &SerialOptions) -> i64 {
    let parity = u32::from(opts.parity != crate::config::Parity::None);
    let bits = 1 + u32::from(opts.data_bits) + parity + u32::from(opts.stop_bits);
    if opts.baud == 0 {
        return 0;
    }
    (i64::from(bits) * USECS_PER_SEC) / i64::from(opts.baud)
}

/// Effective timeout of a sensor as a [`Duration`], `None` if disabled.
#[must_use]
pub fn timeout_of(sensor: &CharacterSensor) -> Option<Duration> {
    match sensor.timeout_ms() {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ConverterConfig, MessageConfig, Parity, PromptConfig, SampleTagConfig, SmoothingConfig,
        VariableConfig,
    };
    use tracing_test::traced_test;

    fn variable(name: &str) -> VariableConfig {
        VariableConfig {
            name: name.to_string(),
            units: String::new(),
            missing_value: None,
            min: None,
            max: None,
            converter: None,
        }
    }

    fn tag(id: u32, format: &str, vars: &[&str]) -> SampleTagConfig {
        SampleTagConfig {
            id,
            rate: 0.0,
            format: Some(format.to_string()),
            prompt: None,
            smoothing: None,
            variables: vars.iter().map(|v| variable(v)).collect(),
        }
    }

    fn sensor(tags: Vec<SampleTagConfig>) -> Arc<CharacterSensor> {
        let mut config = SensorConfig::new("inet:localhost:1", 100);
        config.tags = tags;
        CharacterSensor::from_config(&config, Arc::new(Looper::new())).unwrap()
    }

    fn raw(msg: &str) -> Sample {
        Sample::raw(100, 1_000_000, msg.as_bytes().to_vec())
    }

    #[test]
    fn test_full_scan() {
        let s = sensor(vec![tag(1, "%f,%f", &["a", "b"])]);
        let out = s.process(&raw("1.5,2.5\n"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, 1);
        assert_eq!(out[0].as_values().unwrap(), &[1.5, 2.5]);
        assert_eq!(s.stats().partial_scans(), 0);
        assert_eq!(s.stats().processed_samples(), 1);
    }

    #[test]
    fn test_partial_scan_fills_nan() {
        let s = sensor(vec![tag(1, "%f,%f", &["a", "b"])]);
        let out = s.process(&raw("1.5\n"));
        let values = out[0].as_values().unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0], 1.5);
        assert!(values[1].is_nan());
        assert_eq!(s.stats().partial_scans(), 1);
    }

    #[test]
    fn test_rotation_prefers_last_match() {
        let s = sensor(vec![tag(1, "%f", &["x"]), tag(2, "A%d", &["n"])]);
        let out = s.process(&raw("A42\n"));
        assert_eq!(out[0].id, 2);
        assert_eq!(out[0].as_values().unwrap(), &[42.0]);
        assert_eq!(s.scan.lock().next, 1);

        let out = s.process(&raw("A7\n"));
        assert_eq!(out[0].id, 2);
        let out = s.process(&raw("3.5\n"));
        assert_eq!(out[0].id, 1);
        assert_eq!(s.scan.lock().next, 0);
    }

    #[test]
    fn test_total_failure_advances() {
        let s = sensor(vec![tag(1, "X%f", &["x"]), tag(2, "Y%f", &["y"])]);
        assert!(s.process(&raw("garbage\n")).is_empty());
        assert_eq!(s.stats().scan_failures(), 1);
        assert_eq!(s.scan.lock().next, 1);
        assert!(s.process(&raw("more garbage\n")).is_empty());
        assert_eq!(s.scan.lock().next, 0);
    }

    #[test]
    fn test_range_lag_and_conversion() {
        let mut t = tag(1, "%f %f", &["a", "b"]);
        t.variables[0].max = Some(10.0);
        t.variables[1].converter = Some(ConverterConfig::Linear {
            slope: 2.0,
            intercept: 1.0,
        });
        let mut config = SensorConfig::new("inet:localhost:1", 100);
        config.tags = vec![t];
        config.lag = Some(Duration::from_millis(250));
        let s = CharacterSensor::from_config(&config, Arc::new(Looper::new())).unwrap();

        let out = s.process(&raw("11 3\r\n"));
        let values = out[0].as_values().unwrap();
        assert!(values[0].is_nan());
        assert_eq!(values[1], 7.0);
        assert_eq!(out[0].time, 1_000_000 - 250_000);
    }

    #[test]
    fn test_smoothing_applied() {
        let mut t = tag(1, "%f", &["a"]);
        t.rate = 1.0;
        t.smoothing = Some(SmoothingConfig {
            period: Duration::from_secs(60),
            gap: 1.5,
        });
        let s = sensor(vec![t]);
        let first = s.process(&Sample::raw(100, 10_000_000, b"1\n".to_vec()));
        let second = s.process(&Sample::raw(100, 11_040_000, b"2\n".to_vec()));
        assert_eq!(first[0].time, 10_000_000);
        assert_eq!(second[0].time, 11_000_000);
    }

    #[test]
    fn test_raw_only_sensor() {
        let mut config = SensorConfig::new("inet:localhost:1", 100);
        config.tags = vec![SampleTagConfig {
            format: None,
            ..tag(1, "", &[])
        }];
        let s = CharacterSensor::from_config(&config, Arc::new(Looper::new())).unwrap();
        assert!(s.process(&raw("1 2 3\n")).is_empty());
        assert_eq!(s.stats().scan_failures(), 0);
    }

    #[test]
    fn test_mixed_formats_rejected() {
        let mut config = SensorConfig::new("inet:localhost:1", 100);
        config.tags = vec![
            tag(1, "%f", &["a"]),
            SampleTagConfig {
                format: None,
                ..tag(2, "", &["b"])
            },
        ];
        let err = SensorDefinition::init(&config).unwrap_err();
        assert!(err.to_string().contains("all sample tags"));
    }

    #[test]
    fn test_bad_format_rejected() {
        let mut config = SensorConfig::new("inet:localhost:1", 100);
        config.tags = vec![tag(1, "%q", &["a"])];
        assert!(SensorDefinition::init(&config).is_err());
    }

    #[test]
    #[traced_test]
    fn test_fewer_fields_than_variables_warns() {
        let mut config = SensorConfig::new("inet:localhost:1", 100);
        config.tags = vec![tag(1, "%f", &["a", "b", "c"])];
        assert!(SensorDefinition::init(&config).is_ok());
        assert!(logs_contain("format has fewer fields than variables"));
    }

    #[test]
    fn test_validate() {
        let mut config = SensorConfig::new("inet:localhost:1", 100);
        config.message = MessageConfig {
            separator: String::new(),
            separator_at_eom: true,
            length: 0,
        };
        let def = SensorDefinition::init(&config).unwrap();
        assert!(def.validate().is_err());

        let mut config = SensorConfig::new("inet:localhost:1", 100);
        config.prompts = vec![PromptConfig {
            string: "?".to_string(),
            rate: -1.0,
            offset: 0.0,
        }];
        assert!(SensorDefinition::init(&config).unwrap().validate().is_err());

        config.prompts[0].rate = 0.0;
        let def = SensorDefinition::init(&config).unwrap();
        assert!(def.validate().is_ok());
        assert!(!def.is_prompted());
    }

    #[test]
    fn test_line_settings() {
        let s = sensor(vec![]);
        assert_eq!(s.line_settings(), NON_SERIAL_LINE_SETTINGS);

        let mut config = SensorConfig::new("/dev/ttyS9", 1);
        config.serial.baud = 19200;
        config.serial.parity = Parity::Even;
        config.serial.data_bits = 7;
        let s = CharacterSensor::from_config(&config, Arc::new(Looper::new())).unwrap();
        assert_eq!(s.line_settings(), "19200 even 7 1");
    }

    #[test]
    fn test_write_when_closed() {
        let s = sensor(vec![]);
        assert!(matches!(s.write(b"x"), Err(DaqError::NotOpen { .. })));
        assert!(!s.is_open());
        assert_eq!(s.state(), SensorState::Unopened);
    }

    #[test]
    fn test_usecs_per_byte() {
        let opts = SerialOptions {
            baud: 9600,
            ..SerialOptions::default()
        };
        // 10 bits per character.
        assert_eq!(usecs_per_byte(&opts), 1041);
    }
}
