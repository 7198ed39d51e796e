//! field-daq daemon
//!
//! Loads the sensor configuration, opens every sensor in the background and
//! acquires until SIGINT, SIGTERM or SIGHUP.
//!
//! ```bash
//! field-daq --config /etc/field-daq.toml
//! field-daq --config tower.toml --rserial-port 8100 --print-samples
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use field_daq::config::DaqConfig;
use field_daq::logging::{self, LoggingConfig};
use field_daq::looper::Looper;
use field_daq::sample::{SampleClient, SampleData, SampleRef};
use field_daq::scan::escape;
use field_daq::{CharacterSensor, SensorHandler};
use nix::sys::signal::{SigSet, Signal};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "field-daq")]
#[command(about = "Unattended acquisition of serial and socket instruments", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    /// Listen for remote-serial clients on this port
    #[arg(long)]
    rserial_port: Option<u16>,

    /// Print every sample to stdout
    #[arg(long)]
    print_samples: bool,

    /// Print the merged configuration and exit
    #[arg(long)]
    print_config: bool,
}

/// Writes samples to stdout, one line each.
struct SamplePrinter;

impl SampleClient for SamplePrinter {
    fn receive(&self, sample: &SampleRef) {
        let time = DateTime::<Utc>::from_timestamp_micros(sample.time)
            .map(|t| t.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string())
            .unwrap_or_else(|| sample.time.to_string());
        let body = match &sample.data {
            SampleData::Raw(bytes) => {
                let bytes: &[u8] = bytes;
                escape(bytes.strip_suffix(&[0]).unwrap_or(bytes))
            }
            SampleData::Values(values) => values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(" "),
        };
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{} {} {}", time, sample.id, body);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = DaqConfig::load_from(&cli.config)
        .with_context(|| format!("cannot load {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    if let Some(port) = cli.rserial_port {
        config.handler.remote_serial_port = Some(port);
    }
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;

    if cli.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let logging = LoggingConfig::from_application(&config.application).map_err(anyhow::Error::msg)?;
    logging::init(logging).map_err(anyhow::Error::msg)?;
    info!(
        name = %config.application.name,
        sensors = config.sensors.len(),
        "Starting field-daq v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Blocked before any thread starts so every thread inherits the mask.
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.add(Signal::SIGHUP);
    signals.thread_block().context("cannot block signals")?;

    let looper = Arc::new(Looper::new());
    let handler = SensorHandler::new(config.handler.clone()).context("cannot create sensor handler")?;
    if let Some(addr) = handler.remote_serial_addr() {
        info!(%addr, "remote serial enabled");
    }

    let printer: Option<Arc<dyn SampleClient>> = cli
        .print_samples
        .then(|| Arc::new(SamplePrinter) as Arc<dyn SampleClient>);
    for sensor_config in &config.sensors {
        let sensor = CharacterSensor::from_config(sensor_config, looper.clone())
            .with_context(|| format!("sensor {}", sensor_config.device))?;
        if let Some(printer) = &printer {
            let scanned = sensor.definition().tags.iter().any(|t| t.format.is_some());
            if scanned {
                sensor.processed_samples().add_client(printer.clone());
            } else {
                sensor.raw_samples().add_client(printer.clone());
            }
        }
        handler.add_sensor(sensor);
    }

    handler.start().context("cannot start sensor handler")?;

    let signal = signals.wait().context("waiting for signals")?;
    info!(?signal, "Shutting down");
    handler.interrupt();
    handler.join();
    looper.stop();
    info!("Shutdown complete");
    Ok(())
}
