//! Integration tests for configuration loading

use entry_checkin::infra::config::Facing;
use entry_checkin::infra::{CaptureSource, Config};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

#[test]
fn test_load_config_from_file() {
    let temp_file = write_config(
        r#"
[site]
id = "hall-a"
operator_id = "op-7"

[camera]
source = "serial"
device = "/dev/ttyUSB1"
baud = 115200
max_fps = 5
acquire_timeout_ms = 3000
facing = "front"
buffer = 0

[backend]
url = "https://tickets.example.com"
api_key = "anon-key"
step_timeout_ms = 1500

[resolution]
fallback_on_not_found = true

[session]
error_cooldown_ms = 1000
success_rearm_ms = 2000

[metrics]
interval_secs = 15
prometheus_port = 9091

[egress]
file = "/var/log/checkins.jsonl"
"#,
    );

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "hall-a");
    assert_eq!(config.operator_id(), "op-7");
    assert_eq!(config.capture_source(), &CaptureSource::Serial);
    assert_eq!(config.camera_device(), "/dev/ttyUSB1");
    assert_eq!(config.camera_baud(), 115200);
    assert_eq!(config.max_fps(), 5);
    assert_eq!(config.acquire_timeout(), Duration::from_secs(3));
    assert_eq!(config.facing(), Facing::Front);
    assert_eq!(config.camera_buffer(), 1);
    assert_eq!(config.backend_url(), "https://tickets.example.com");
    assert_eq!(config.backend_api_key(), Some("anon-key"));
    assert_eq!(config.step_timeout(), Duration::from_millis(1500));
    assert!(config.fallback_on_not_found());
    assert_eq!(config.error_cooldown(), Duration::from_secs(1));
    assert_eq!(config.success_rearm(), Some(Duration::from_secs(2)));
    assert_eq!(config.prometheus_port(), 9091);
    assert_eq!(config.egress_file(), "/var/log/checkins.jsonl");
}

#[test]
fn test_minimal_config_uses_section_defaults() {
    let temp_file = write_config(
        r#"
[camera]
source = "keyboard"

[backend]
url = "http://127.0.0.1:8787"

[metrics]
interval_secs = 10
"#,
    );

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "entrance");
    assert_eq!(config.max_fps(), 8);
    assert_eq!(config.step_timeout(), Duration::from_secs(5));
    assert!(!config.fallback_on_not_found());
    assert_eq!(config.success_rearm(), None);
    assert_eq!(config.prometheus_port(), 0);
    assert_eq!(config.egress_file(), "checkins.jsonl");
}

#[test]
fn test_zero_fps_is_rejected() {
    let temp_file = write_config(
        r#"
[camera]
source = "keyboard"
max_fps = 0

[backend]
url = "http://127.0.0.1:8787"

[metrics]
interval_secs = 10
"#,
    );

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(err.to_string().contains("max_fps"));
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.config_file(), "default");
    assert_eq!(config.backend_url(), "http://127.0.0.1:8787");
    assert_eq!(config.capture_source(), &CaptureSource::Keyboard);
}

#[test]
fn test_shipped_dev_config_parses() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/dev.toml");
    let config = Config::from_file(path).unwrap();
    assert_eq!(config.site_id(), "main-entrance");
    assert_eq!(config.capture_source(), &CaptureSource::Keyboard);
}
