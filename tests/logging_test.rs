//! Subscriber installation from a fresh process.

use field_daq::config::ApplicationConfig;
use field_daq::logging::{self, LoggingConfig, OutputFormat};
use tracing::Level;

#[test]
fn test_init_is_idempotent() {
    let first = logging::init(LoggingConfig::new(Level::DEBUG).with_format(OutputFormat::Compact));
    assert!(first.is_ok(), "{:?}", first);

    let app = ApplicationConfig {
        log_format: "json".to_string(),
        ..ApplicationConfig::default()
    };
    let second = logging::init(LoggingConfig::from_application(&app).unwrap());
    assert_eq!(first, second);
    tracing::info!(sensor = "/dev/ttyS1", "logging works");
}
