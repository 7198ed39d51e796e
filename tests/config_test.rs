//! Loading the daemon configuration from files and the environment.

use field_daq::config::{ConverterConfig, DaqConfig, Parity, ENV_PREFIX};
use field_daq::looper::Looper;
use field_daq::CharacterSensor;
use serial_test::serial;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

const TOWER: &str = r#"
[application]
name = "tower"

[handler]
remote_serial_port = 8100

[[sensors]]
device = "/dev/ttyS1"
id = 200
timeout = "5s"
serial = { baud = 19200, parity = "even", data_bits = 7 }
message = { separator = "\\r\\n" }
init_string = "\\x02START\\r"

[[sensors.prompts]]
string = "?\\r"
rate = 1.0

[[sensors.tags]]
id = 201
rate = 1.0
format = "%f %f"
smoothing = { period = "1m" }
variables = [
  { name = "T", units = "degC" },
  { name = "RH", units = "%", converter = { type = "polynomial", coefs = [0.0, 100.0] } },
]

[[sensors]]
device = "inet:logger.local:4001"
id = 300
"#;

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_load_file() {
    let file = write_config(TOWER);
    let config = DaqConfig::load_from(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.handler.remote_serial_port, Some(8100));
    let serial = &config.sensors[0];
    assert_eq!(serial.serial.baud, 19200);
    assert_eq!(serial.serial.parity, Parity::Even);
    assert_eq!(serial.timeout, Some(Duration::from_secs(5)));
    assert_eq!(
        serial.tags[0].variables[1].converter,
        Some(ConverterConfig::Polynomial {
            coefs: vec![0.0, 100.0]
        })
    );

    let sensor = CharacterSensor::from_config(serial, Arc::new(Looper::new())).unwrap();
    assert!(sensor.is_prompted());
    assert_eq!(sensor.line_settings(), "19200 even 7 1");
    assert_eq!(sensor.framing(), (b"\r\n".to_vec(), true, 0));
    assert_eq!(
        sensor.definition().init_string.as_deref(),
        Some(&b"\x02START\r"[..])
    );
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = write_config(TOWER);
    let key = format!("{}HANDLER__OPENER_RETRY", ENV_PREFIX);
    std::env::set_var(&key, "3s");
    let config = DaqConfig::load_from(file.path());
    std::env::remove_var(&key);
    assert_eq!(config.unwrap().handler.opener_retry, Duration::from_secs(3));
}

#[test]
#[serial]
fn test_duplicate_ids_rejected() {
    let text = TOWER.replace("id = 300", "id = 201");
    let config = DaqConfig::from_toml_str(&text).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.contains("Duplicate sample id"), "{}", err);
}

#[test]
#[serial]
fn test_bad_format_fails_sensor_creation() {
    let text = TOWER.replace("format = \"%f %f\"", "format = \"%f %y\"");
    let config = DaqConfig::from_toml_str(&text).unwrap();
    let err = CharacterSensor::from_config(&config.sensors[0], Arc::new(Looper::new())).unwrap_err();
    assert!(!err.is_recoverable());
}
