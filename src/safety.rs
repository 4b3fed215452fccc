//! Critical-process guard.
//!
//! A process whose name matches the critical set may not be terminated,
//! paused, or deprioritized by automated policy. The check runs at every
//! actuation site before the syscall, never after.

use once_cell::sync::Lazy;

static DEFAULT_CRITICAL_PATTERNS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "systemd",
        "init",
        "kthreadd",
        "kworker",
        "ksoftirqd",
        "migration",
        "rcu_",
        "watchdog",
        "dbus-daemon",
        "dbus-broker",
        "NetworkManager",
        "wpa_supplicant",
        "sshd",
        "login",
        "Xorg",
        "Xwayland",
        "pipewire",
        "wireplumber",
        "pulseaudio",
        "tunixd",
    ]
});

/// Configurable set of process-name patterns. Matching is substring-based,
/// the way kernel thread families (`kworker/0:1`) and instance-suffixed
/// daemons show up in `/proc/<pid>/comm`.
#[derive(Debug, Clone)]
pub struct CriticalSet {
    patterns: Vec<String>,
}

impl Default for CriticalSet {
    fn default() -> Self {
        CriticalSet {
            patterns: DEFAULT_CRITICAL_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl CriticalSet {
    pub fn with_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CriticalSet {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    /// Extend the default set with caller-supplied patterns.
    pub fn extend<I, S>(&mut self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns.extend(patterns.into_iter().map(Into::into));
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| name.contains(p.as_str()))
    }
}
