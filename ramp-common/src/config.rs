//! Daemon configuration.
//!
//! Loaded from a TOML file with serde defaults for every field, so an
//! empty file (or no file at all) yields a working configuration.
//! Validation runs once at startup and reports warnings rather than
//! refusing to boot wherever a safe default exists.

use crate::types::RampSchedule;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RampConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Deployment environment this daemon serves.
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Path to the Unix socket for client communication.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    /// Port for the observability HTTP server; 0 disables it.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Evaluation-path store read budget in milliseconds. On overrun the
    /// evaluation fails closed instead of blocking the caller.
    #[serde(default = "default_read_timeout_ms")]
    pub evaluation_read_timeout_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            log_level: default_log_level(),
            socket_path: default_socket_path(),
            http_port: default_http_port(),
            evaluation_read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl GeneralConfig {
    pub fn evaluation_read_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluation_read_timeout_ms)
    }
}

/// Percentage schedule for the Ramping stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Strictly increasing percentage steps ending at 100.
    #[serde(default = "default_steps")]
    pub steps: Vec<u8>,
    /// Minimum time a step must hold, breach-free, before the monitor
    /// advances to the next one.
    #[serde(default = "default_observation_secs")]
    pub min_observation_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            min_observation_secs: default_observation_secs(),
        }
    }
}

impl ScheduleConfig {
    pub fn ramp_schedule(&self) -> RampSchedule {
        RampSchedule::new(self.steps.clone())
    }

    pub fn min_observation(&self) -> Duration {
        Duration::from_secs(self.min_observation_secs)
    }
}

/// Health monitor thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Interval between monitor cycles.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Error-rate breach: value exceeds this multiple of baseline.
    #[serde(default = "default_error_rate_multiplier")]
    pub error_rate_multiplier: f64,
    /// Latency breach: value exceeds baseline by this relative increase
    /// (0.5 = +50%).
    #[serde(default = "default_latency_increase")]
    pub latency_increase: f64,
    /// Consecutive breached samples required before auto-rollback. Any
    /// shorter streak only holds percentage advancement.
    #[serde(default = "default_min_consecutive_breaches")]
    pub min_consecutive_breaches: u32,
    /// Path to the metrics feed sample file (JSON lines of HealthSample).
    /// Empty means no feed is wired, which keeps the monitor in hold-only
    /// mode.
    #[serde(default)]
    pub samples_path: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            error_rate_multiplier: default_error_rate_multiplier(),
            latency_increase: default_latency_increase(),
            min_consecutive_breaches: default_min_consecutive_breaches(),
            samples_path: String::new(),
        }
    }
}

impl MonitorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Audit log sizing and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// In-memory transition records retained for queries.
    #[serde(default = "default_audit_capacity")]
    pub capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            capacity: default_audit_capacity(),
        }
    }
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_socket_path() -> String {
    "/tmp/rampd.sock".to_string()
}

fn default_http_port() -> u16 {
    9464
}

fn default_read_timeout_ms() -> u64 {
    50
}

fn default_steps() -> Vec<u8> {
    RampSchedule::default().steps
}

fn default_observation_secs() -> u64 {
    300
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_error_rate_multiplier() -> f64 {
    2.0
}

fn default_latency_increase() -> f64 {
    0.5
}

fn default_min_consecutive_breaches() -> u32 {
    3
}

fn default_audit_capacity() -> usize {
    1000
}

impl RampConfig {
    /// Load configuration from a TOML file. A missing file yields the
    /// defaults; a malformed file is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse(path.display().to_string(), e))
    }

    /// Startup sanity warnings. None of these are fatal.
    pub fn validation_warnings(&self) -> Vec<String> {
        let mut warnings = self.schedule.ramp_schedule().validation_warnings();
        if self.monitor.error_rate_multiplier < 1.0 {
            warnings.push(format!(
                "monitor.error_rate_multiplier {} is below 1.0; any error rate at all breaches",
                self.monitor.error_rate_multiplier
            ));
        }
        if self.monitor.latency_increase <= 0.0 {
            warnings.push(format!(
                "monitor.latency_increase {} is not positive; any latency movement breaches",
                self.monitor.latency_increase
            ));
        }
        if self.monitor.min_consecutive_breaches == 0 {
            warnings.push(
                "monitor.min_consecutive_breaches is 0; a single noisy sample will roll back"
                    .to_string(),
            );
        }
        if self.monitor.samples_path.is_empty() {
            warnings.push(
                "monitor.samples_path is unset; monitor runs in hold-only mode".to_string(),
            );
        }
        if self.audit.capacity == 0 {
            warnings.push("audit.capacity is 0; in-memory audit queries will be empty".to_string());
        }
        warnings
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    Read(String, #[source] std::io::Error),
    #[error("failed to parse config {0}: {1}")]
    Parse(String, #[source] toml::de::Error),
}
