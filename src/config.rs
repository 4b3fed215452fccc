//! Line-based `key = value` configuration.
//!
//! Unknown keys warn and are ignored; malformed lines and bad values are
//! startup-fatal. Every key is optional and falls back to its default.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use log::warn;

use crate::error::{ControlError, Result};
use crate::mode::Mode;
use crate::sched::SchedulingAlgorithm;

#[derive(Debug, Clone)]
pub struct Config {
    pub monitoring_interval_ms: u64,
    pub default_scheduling_algorithm: SchedulingAlgorithm,
    pub default_time_slice_ms: u64,
    pub memory_threshold_percent: f64,
    pub critical_memory_threshold_percent: f64,
    pub cpu_threshold_percent: f64,
    pub enable_auto_optimization: bool,
    pub enable_auto_mode: bool,
    pub default_mode: Mode,
    pub log_level: log::LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            monitoring_interval_ms: 1000,
            default_scheduling_algorithm: SchedulingAlgorithm::Priority,
            default_time_slice_ms: 100,
            memory_threshold_percent: 80.0,
            critical_memory_threshold_percent: 90.0,
            cpu_threshold_percent: 90.0,
            enable_auto_optimization: true,
            enable_auto_mode: false,
            default_mode: Mode::Balanced,
            log_level: log::LevelFilter::Info,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .map_err(|e| ControlError::from_path_io(&path.to_string_lossy(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Config> {
        let mut config = Config::default();
        for (index, raw_line) in content.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| invalid(index, line))?;
            let key = key.trim();
            let value = unquote(value.trim());
            match key {
                "monitoring_interval_ms" => {
                    config.monitoring_interval_ms =
                        value.parse().map_err(|_| invalid(index, line))?;
                }
                "default_scheduling_algorithm" => {
                    config.default_scheduling_algorithm =
                        SchedulingAlgorithm::from_str(value).map_err(|_| invalid(index, line))?;
                }
                "default_time_slice_ms" => {
                    config.default_time_slice_ms =
                        value.parse().map_err(|_| invalid(index, line))?;
                }
                "memory_threshold_percent" => {
                    config.memory_threshold_percent =
                        value.parse().map_err(|_| invalid(index, line))?;
                }
                "critical_memory_threshold_percent" => {
                    config.critical_memory_threshold_percent =
                        value.parse().map_err(|_| invalid(index, line))?;
                }
                "cpu_threshold_percent" => {
                    config.cpu_threshold_percent =
                        value.parse().map_err(|_| invalid(index, line))?;
                }
                "enable_auto_optimization" => {
                    config.enable_auto_optimization =
                        parse_bool(value).ok_or_else(|| invalid(index, line))?;
                }
                "enable_auto_mode" => {
                    config.enable_auto_mode =
                        parse_bool(value).ok_or_else(|| invalid(index, line))?;
                }
                "default_mode" => {
                    config.default_mode =
                        Mode::from_str(value).map_err(|_| invalid(index, line))?;
                }
                "log_level" => {
                    config.log_level = parse_log_level(value).ok_or_else(|| invalid(index, line))?;
                }
                unknown => {
                    warn!("[config] ignoring unknown key: {unknown}");
                }
            }
        }
        Ok(config)
    }
}

fn invalid(index: usize, line: &str) -> ControlError {
    ControlError::InvalidArgument {
        reason: format!("config line {}: {line:?}", index + 1),
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_log_level(value: &str) -> Option<log::LevelFilter> {
    match value.to_ascii_lowercase().as_str() {
        "debug" => Some(log::LevelFilter::Debug),
        "info" => Some(log::LevelFilter::Info),
        "warning" | "warn" => Some(log::LevelFilter::Warn),
        // The log facade has no level above error.
        "error" | "critical" => Some(log::LevelFilter::Error),
        _ => None,
    }
}
