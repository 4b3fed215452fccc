//! Auto-mode inference from observed activity and environment probes.

use std::time::Duration;

use once_cell::sync::Lazy;

use crate::collectors::power::BatteryStatus;
use crate::snapshot::SystemSnapshot;

use super::Mode;

static GAMING_SET: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "steam", "gamescope", "wine", "proton", "lutris", "heroic", "retroarch", "minecraft",
    ]
});

static PRODUCTIVITY_SET: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "code",
        "idea",
        "vim",
        "nvim",
        "emacs",
        "cargo",
        "make",
        "gcc",
        "clang",
        "docker",
        "libreoffice",
        "gimp",
        "blender",
    ]
});

#[derive(Debug, Clone)]
pub struct AutoModeConfig {
    pub period: Duration,
    pub battery_threshold_percent: f64,
    pub thermal_threshold_c: f64,
    pub gaming_cpu_percent: f64,
    pub gaming_rss_kb: u64,
    pub gaming_set: Vec<String>,
    pub productivity_set: Vec<String>,
}

impl Default for AutoModeConfig {
    fn default() -> Self {
        AutoModeConfig {
            period: Duration::from_secs(30),
            battery_threshold_percent: 20.0,
            thermal_threshold_c: 80.0,
            gaming_cpu_percent: 30.0,
            gaming_rss_kb: 1024 * 1024,
            gaming_set: GAMING_SET.iter().map(|s| s.to_string()).collect(),
            productivity_set: PRODUCTIVITY_SET.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Infer the appropriate mode. Returns the mode plus a human-readable
/// reason, used verbatim in the `AutoModeSuggested` event.
pub fn infer_mode(
    snapshot: &SystemSnapshot,
    battery: Option<BatteryStatus>,
    temperature_c: Option<f64>,
    config: &AutoModeConfig,
) -> (Mode, String) {
    if let Some(battery) = battery {
        if battery.on_battery && battery.percent <= config.battery_threshold_percent {
            return (
                Mode::PowerSaving,
                format!(
                    "battery {}% \u{2264} {}%",
                    battery.percent, config.battery_threshold_percent
                ),
            );
        }
    }
    if let Some(temp) = temperature_c {
        if temp >= config.thermal_threshold_c {
            return (
                Mode::PowerSaving,
                format!("thermal {temp}\u{b0}C \u{2265} {}\u{b0}C", config.thermal_threshold_c),
            );
        }
    }

    for record in snapshot.processes.values() {
        let is_game = config.gaming_set.iter().any(|p| record.name.contains(p.as_str()));
        if is_game
            && (record.cpu_percent > config.gaming_cpu_percent
                || record.rss_kb > config.gaming_rss_kb)
        {
            return (Mode::Gaming, format!("gaming process {} active", record.name));
        }
    }

    let productive: std::collections::HashSet<&str> = snapshot
        .processes
        .values()
        .filter(|r| {
            config
                .productivity_set
                .iter()
                .any(|p| r.name.contains(p.as_str()))
        })
        .map(|r| r.name.as_str())
        .collect();
    if productive.len() >= 2 {
        return (
            Mode::Productivity,
            format!("{} productivity processes active", productive.len()),
        );
    }

    (Mode::Balanced, "no dominant activity".to_string())
}
