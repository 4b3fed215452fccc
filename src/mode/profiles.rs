//! Operating modes and their built-in configurations.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::memory::MemoryStrategy;
use crate::sched::SchedulingAlgorithm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Gaming,
    Productivity,
    PowerSaving,
    Balanced,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Gaming => "gaming",
            Mode::Productivity => "productivity",
            Mode::PowerSaving => "power-saving",
            Mode::Balanced => "balanced",
        };
        f.write_str(name)
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gaming" => Ok(Mode::Gaming),
            "productivity" => Ok(Mode::Productivity),
            "power-saving" | "powersaving" | "power_saving" => Ok(Mode::PowerSaving),
            "balanced" => Ok(Mode::Balanced),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

/// A pure value describing a target system posture. Installing one is the
/// mode controller's job; nothing here touches the system.
#[derive(Debug, Clone)]
pub struct ModeConfiguration {
    pub scheduler_algorithm: SchedulingAlgorithm,
    pub default_slice_ms: u64,
    pub priority_boosting: bool,

    pub memory_strategy: MemoryStrategy,
    pub pressure_threshold_percent: f64,
    pub swap_enabled: bool,

    /// Name patterns favored with a low nice value.
    pub high_priority: Vec<String>,
    /// Name patterns pushed to a high nice value.
    pub low_priority: Vec<String>,
    /// Name patterns paused while the mode is active.
    pub suspend: Vec<String>,

    pub cpu_governor: String,
    pub cpu_turbo: bool,
    /// None leaves the screen untouched.
    pub screen_brightness_percent: Option<u8>,
    pub disabled_services: Vec<String>,
    pub enabled_services: Vec<String>,
    pub max_cpu_percent: f64,
    /// Pin high-priority matches to the full core set.
    pub pin_high_priority: bool,
}

fn patterns(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

impl ModeConfiguration {
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Gaming => ModeConfiguration {
                scheduler_algorithm: SchedulingAlgorithm::Priority,
                default_slice_ms: 50,
                priority_boosting: true,
                memory_strategy: MemoryStrategy::Aggressive,
                pressure_threshold_percent: 70.0,
                swap_enabled: false,
                high_priority: patterns(&[
                    "steam", "gamescope", "wine", "proton", "lutris", "heroic",
                ]),
                low_priority: patterns(&["tracker", "baloo", "fwupd"]),
                suspend: patterns(&["update-notifier", "packagekitd"]),
                cpu_governor: "performance".to_string(),
                cpu_turbo: true,
                screen_brightness_percent: None,
                disabled_services: Vec::new(),
                enabled_services: Vec::new(),
                max_cpu_percent: 100.0,
                pin_high_priority: true,
            },
            Mode::Productivity => ModeConfiguration {
                scheduler_algorithm: SchedulingAlgorithm::CompletelyFair,
                default_slice_ms: 100,
                priority_boosting: true,
                memory_strategy: MemoryStrategy::Balanced,
                pressure_threshold_percent: 75.0,
                swap_enabled: true,
                high_priority: patterns(&[
                    "code", "idea", "firefox", "chromium", "libreoffice",
                ]),
                low_priority: patterns(&["borg", "restic", "rsync"]),
                suspend: Vec::new(),
                cpu_governor: "ondemand".to_string(),
                cpu_turbo: true,
                screen_brightness_percent: None,
                disabled_services: Vec::new(),
                enabled_services: Vec::new(),
                max_cpu_percent: 100.0,
                pin_high_priority: false,
            },
            Mode::PowerSaving => ModeConfiguration {
                scheduler_algorithm: SchedulingAlgorithm::RoundRobin,
                default_slice_ms: 150,
                priority_boosting: false,
                memory_strategy: MemoryStrategy::Conservative,
                pressure_threshold_percent: 85.0,
                swap_enabled: true,
                high_priority: Vec::new(),
                low_priority: patterns(&["cargo", "make", "ffmpeg", "tracker"]),
                suspend: Vec::new(),
                cpu_governor: "powersave".to_string(),
                cpu_turbo: false,
                screen_brightness_percent: Some(40),
                disabled_services: Vec::new(),
                enabled_services: Vec::new(),
                max_cpu_percent: 50.0,
                pin_high_priority: false,
            },
            Mode::Balanced => ModeConfiguration {
                scheduler_algorithm: SchedulingAlgorithm::Priority,
                default_slice_ms: 100,
                priority_boosting: true,
                memory_strategy: MemoryStrategy::Balanced,
                pressure_threshold_percent: 80.0,
                swap_enabled: true,
                high_priority: Vec::new(),
                low_priority: Vec::new(),
                suspend: Vec::new(),
                cpu_governor: "schedutil".to_string(),
                cpu_turbo: true,
                screen_brightness_percent: None,
                disabled_services: Vec::new(),
                enabled_services: Vec::new(),
                max_cpu_percent: 100.0,
                pin_high_priority: false,
            },
        }
    }

    pub fn matches_high_priority(&self, name: &str) -> bool {
        self.high_priority.iter().any(|p| name.contains(p.as_str()))
    }

    pub fn matches_low_priority(&self, name: &str) -> bool {
        self.low_priority.iter().any(|p| name.contains(p.as_str()))
    }

    pub fn matches_suspend(&self, name: &str) -> bool {
        self.suspend.iter().any(|p| name.contains(p.as_str()))
    }
}
