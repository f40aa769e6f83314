use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::report::traffic::TrafficKey;

/// Top-level configuration for the aggregoor service.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Coordinator queue configuration.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Reports to create at startup.
    #[serde(default)]
    pub reports: Vec<ReportConfig>,
}

/// Coordinator queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Capacity of the inbound batch queue from the repacker. Default: 1024.
    #[serde(default = "default_input_buffer_capacity")]
    pub input_buffer_capacity: usize,

    /// Capacity of each report host's ingest queue, in batches. A full queue
    /// drops batches rather than stalling the coordinator. Default: 256.
    #[serde(default = "default_report_packets_buffer_capacity")]
    pub report_packets_buffer_capacity: usize,
}

/// One report to create at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Unique report name, used to address the report on the control plane.
    pub name: String,

    /// Packet field the report keys its rows by. Default: script_name.
    #[serde(default = "default_report_key")]
    pub key: TrafficKey,

    /// Total aggregation window. Default: 60s.
    #[serde(default = "default_time_window", with = "humantime_serde")]
    pub time_window: Duration,

    /// Number of ticks the window is split into. Default: 60.
    #[serde(default = "default_tick_count")]
    pub tick_count: u32,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_input_buffer_capacity() -> usize {
    1024
}

fn default_report_packets_buffer_capacity() -> usize {
    256
}

fn default_report_key() -> TrafficKey {
    TrafficKey::ScriptName
}

fn default_time_window() -> Duration {
    Duration::from_secs(60)
}

fn default_tick_count() -> u32 {
    60
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            coordinator: CoordinatorConfig::default(),
            health: HealthConfig::default(),
            reports: Vec::new(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            input_buffer_capacity: default_input_buffer_capacity(),
            report_packets_buffer_capacity: default_report_packets_buffer_capacity(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.input_buffer_capacity == 0 {
            bail!("coordinator.input_buffer_capacity must be positive");
        }

        if self.coordinator.report_packets_buffer_capacity == 0 {
            bail!("coordinator.report_packets_buffer_capacity must be positive");
        }

        let mut names = HashSet::new();
        for report in &self.reports {
            if report.name.is_empty() {
                bail!("report name must not be empty");
            }

            if !names.insert(report.name.as_str()) {
                bail!("duplicate report name: {}", report.name);
            }

            if report.tick_count == 0 {
                bail!("report {}: tick_count must be positive", report.name);
            }

            if report.time_window < Duration::from_micros(u64::from(report.tick_count)) {
                bail!(
                    "report {}: time_window too small for {} ticks",
                    report.name,
                    report.tick_count
                );
            }
        }

        Ok(())
    }
}
