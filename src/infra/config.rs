//! Configuration loading from TOML files
//!
//! The binary picks the file from `--config <path>`, then the CONFIG_FILE
//! environment variable, then config/dev.toml, and hands it to
//! `load_from_path`.

use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Where decoded codes come from
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSource {
    /// QR reader on a serial port
    Serial,
    /// Keyboard-wedge reader typing codes on stdin
    Keyboard,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Rear,
    Front,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    #[serde(default = "default_site_id")]
    pub id: String,
    /// Operator recorded on every check-in made from this device
    #[serde(default = "default_operator_id")]
    pub operator_id: String,
}

fn default_site_id() -> String {
    "entrance".to_string()
}

fn default_operator_id() -> String {
    "gate-operator".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub source: CaptureSource,
    #[serde(default = "default_camera_device")]
    pub device: String,
    #[serde(default = "default_camera_baud")]
    pub baud: u32,
    #[serde(default = "default_max_fps")]
    pub max_fps: u32,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_facing")]
    pub facing: Facing,
    #[serde(default = "default_camera_buffer")]
    pub buffer: usize,
}

fn default_camera_device() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_camera_baud() -> u32 {
    9600
}

fn default_max_fps() -> u32 {
    8 // 5-10 fps keeps low-end decoders from thrashing
}

fn default_acquire_timeout_ms() -> u64 {
    10_000
}

fn default_facing() -> Facing {
    Facing::Rear
}

fn default_camera_buffer() -> usize {
    32
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
}

fn default_step_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResolutionConfig {
    /// Consult the fallback reads even when the atomic call reports NOT_FOUND
    #[serde(default)]
    pub fallback_on_not_found: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_error_cooldown_ms")]
    pub error_cooldown_ms: u64,
    /// Automatic re-arm after a successful decision (0 to disable)
    #[serde(default)]
    pub success_rearm_ms: u64,
}

fn default_error_cooldown_ms() -> u64 {
    2500
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { error_cooldown_ms: default_error_cooldown_ms(), success_rearm_ms: 0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    /// File path for the decision audit log (JSONL format)
    #[serde(default = "default_egress_file")]
    pub file: String,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self { file: default_egress_file() }
    }
}

fn default_egress_file() -> String {
    "checkins.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    pub camera: CameraConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub resolution: ResolutionConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub egress: EgressConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    operator_id: String,
    capture_source: CaptureSource,
    camera_device: String,
    camera_baud: u32,
    max_fps: u32,
    acquire_timeout_ms: u64,
    facing: Facing,
    camera_buffer: usize,
    backend_url: String,
    backend_api_key: Option<String>,
    step_timeout_ms: u64,
    fallback_on_not_found: bool,
    error_cooldown_ms: u64,
    success_rearm_ms: u64,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    egress_file: String,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            operator_id: default_operator_id(),
            capture_source: CaptureSource::Keyboard,
            camera_device: default_camera_device(),
            camera_baud: default_camera_baud(),
            max_fps: default_max_fps(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            facing: Facing::Rear,
            camera_buffer: default_camera_buffer(),
            backend_url: "http://127.0.0.1:8787".to_string(),
            backend_api_key: None,
            step_timeout_ms: default_step_timeout_ms(),
            fallback_on_not_found: false,
            error_cooldown_ms: default_error_cooldown_ms(),
            success_rearm_ms: 0,
            metrics_interval_secs: 10,
            prometheus_port: 0,
            egress_file: default_egress_file(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        if toml_config.camera.max_fps == 0 {
            anyhow::bail!("camera.max_fps must be greater than zero in {}", path.display());
        }

        Ok(Self {
            site_id: toml_config.site.id,
            operator_id: toml_config.site.operator_id,
            capture_source: toml_config.camera.source,
            camera_device: toml_config.camera.device,
            camera_baud: toml_config.camera.baud,
            max_fps: toml_config.camera.max_fps,
            acquire_timeout_ms: toml_config.camera.acquire_timeout_ms,
            facing: toml_config.camera.facing,
            camera_buffer: toml_config.camera.buffer.max(1),
            backend_url: toml_config.backend.url,
            backend_api_key: toml_config.backend.api_key,
            step_timeout_ms: toml_config.backend.step_timeout_ms,
            fallback_on_not_found: toml_config.resolution.fallback_on_not_found,
            error_cooldown_ms: toml_config.session.error_cooldown_ms,
            success_rearm_ms: toml_config.session.success_rearm_ms,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            egress_file: toml_config.egress.file,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration from a path, falling back to defaults on any error
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn operator_id(&self) -> &str {
        &self.operator_id
    }

    pub fn capture_source(&self) -> &CaptureSource {
        &self.capture_source
    }

    pub fn camera_device(&self) -> &str {
        &self.camera_device
    }

    pub fn camera_baud(&self) -> u32 {
        self.camera_baud
    }

    pub fn max_fps(&self) -> u32 {
        self.max_fps
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn facing(&self) -> Facing {
        self.facing
    }

    pub fn camera_buffer(&self) -> usize {
        self.camera_buffer
    }

    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    pub fn backend_api_key(&self) -> Option<&str> {
        self.backend_api_key.as_deref()
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn fallback_on_not_found(&self) -> bool {
        self.fallback_on_not_found
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_millis(self.error_cooldown_ms)
    }

    /// Delay before re-arming after Success/AlreadyDone, if enabled
    pub fn success_rearm(&self) -> Option<Duration> {
        (self.success_rearm_ms > 0).then(|| Duration::from_millis(self.success_rearm_ms))
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn egress_file(&self) -> &str {
        &self.egress_file
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method to point the backend at another base URL
    pub fn with_backend_url(mut self, url: &str) -> Self {
        self.backend_url = url.to_string();
        self
    }

    /// Builder method for the per-step timeout
    pub fn with_step_timeout_ms(mut self, ms: u64) -> Self {
        self.step_timeout_ms = ms;
        self
    }

    /// Builder method for the post-error cooldown
    pub fn with_error_cooldown_ms(mut self, ms: u64) -> Self {
        self.error_cooldown_ms = ms;
        self
    }

    /// Builder method for automatic re-arm after success
    pub fn with_success_rearm_ms(mut self, ms: u64) -> Self {
        self.success_rearm_ms = ms;
        self
    }

    /// Builder method for the capture frame-rate bound
    pub fn with_max_fps(mut self, fps: u32) -> Self {
        self.max_fps = fps.max(1);
        self
    }

    pub fn with_fallback_on_not_found(mut self, enabled: bool) -> Self {
        self.fallback_on_not_found = enabled;
        self
    }
}
