//! Workload classification from process names and smoothed CPU usage.

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::snapshot::ProcessRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessClass {
    Interactive,
    Batch,
    RealTime,
    System,
    Idle,
}

static SYSTEM_PATTERNS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "systemd", "init", "kthreadd", "kworker", "dbus", "udevd", "journald", "cron", "sshd",
        "polkitd",
    ]
});

static INTERACTIVE_PATTERNS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "gnome-shell",
        "plasmashell",
        "kwin",
        "mutter",
        "Xorg",
        "Xwayland",
        "firefox",
        "chromium",
        "chrome",
        "code",
        "kitty",
        "alacritty",
        "konsole",
        "gnome-terminal",
        "steam",
        "lutris",
        "heroic",
    ]
});

static BATCH_PATTERNS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "make", "cmake", "ninja", "gcc", "g++", "clang", "rustc", "cargo", "ld", "cc1", "javac",
        "ffmpeg", "rsync", "tar", "gzip", "zstd", "borg", "restic", "backup",
    ]
});

/// CPU level treated as sustained heavy use; the observer's smoothing means
/// a single spike does not cross it.
const BUSY_CPU_PERCENT: f64 = 80.0;
const IDLE_CPU_PERCENT: f64 = 5.0;

fn name_matches(name: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| name.contains(p))
}

/// Assign a class to a process record. Name rules run first, then the
/// smoothed CPU reading adjusts the verdict.
pub fn classify(record: &ProcessRecord) -> ProcessClass {
    let by_name = if record.is_critical || name_matches(&record.name, &SYSTEM_PATTERNS) {
        ProcessClass::System
    } else if name_matches(&record.name, &INTERACTIVE_PATTERNS) {
        ProcessClass::Interactive
    } else if name_matches(&record.name, &BATCH_PATTERNS) {
        ProcessClass::Batch
    } else {
        ProcessClass::Interactive
    };

    match by_name {
        ProcessClass::System => ProcessClass::System,
        _ if record.cpu_percent >= BUSY_CPU_PERCENT => ProcessClass::Batch,
        _ if record.cpu_percent <= IDLE_CPU_PERCENT => ProcessClass::Idle,
        other => other,
    }
}
