//! The shipped configuration file must load and validate.

use motion_daq::config::{AppConfig, FilterKind, DEFAULT_CONFIG_PATH};
use motion_daq::logging::OutputFormat;
use motion_daq::pipeline::FilterBlueprint;
use std::time::Duration;

#[test]
fn test_shipped_config_is_valid() {
    let config = AppConfig::load_from(DEFAULT_CONFIG_PATH).expect("Failed to load config");
    config.validate().expect("Shipped config should validate");

    assert_eq!(config.application.log_format, OutputFormat::Pretty);
    assert_eq!(config.filter.kind, FilterKind::Magnitude);
    assert_eq!(config.link.settings().reconnect_backoff, Duration::from_secs(2));
    assert!(config.enabled_devices().next().is_none());

    match config.filter.blueprint() {
        FilterBlueprint::Magnitude(settings) => {
            assert_eq!(settings.update_period, Duration::from_millis(50));
            assert_eq!(settings.window_size, Duration::from_millis(500));
        }
        other => panic!("unexpected blueprint: {other:?}"),
    }
}

#[test]
fn test_shipped_scale_matches_defaults() {
    let config = AppConfig::load_from(DEFAULT_CONFIG_PATH).expect("Failed to load config");
    let scale = config.control.scale();
    assert_eq!(scale.normalize(500.0), 0.0);
    assert_eq!(scale.normalize(3000.0), 1.0);
}
