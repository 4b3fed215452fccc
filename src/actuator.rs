//! The one place policy touches the OS.
//!
//! Every call is fallible and every caller maps the result onto the event
//! stream. `can_modify` must pass before any pause, terminate or
//! priority-lowering call issued by automated policy; manual actuation may
//! bypass the critical check only behind the explicit override flag.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use walkdir::WalkDir;

use crate::collectors::power::{self, BatteryStatus};
use crate::error::{ControlError, Result};
use crate::safety::CriticalSet;

pub const NICE_MIN: i32 = -20;
pub const NICE_MAX: i32 = 19;

/// How much cache to ask the kernel to drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDropKind {
    Page,
    All,
}

pub trait SystemControl: Send + Sync {
    fn set_nice(&self, pid: i32, nice: i32) -> Result<()>;
    fn nice_of(&self, pid: i32) -> Result<i32>;
    fn pause(&self, pid: i32) -> Result<()>;
    fn resume(&self, pid: i32) -> Result<()>;
    fn terminate(&self, pid: i32, timeout: Duration) -> Result<()>;
    /// Critical check plus permission probe. Mandatory before any pause,
    /// terminate or priority-lowering call from automated policy.
    fn can_modify(&self, pid: i32) -> bool;
    fn set_affinity(&self, pid: i32, cores: &[usize]) -> Result<()>;
    fn set_cpu_governor(&self, name: &str) -> Result<()>;
    fn get_cpu_governor(&self) -> Result<String>;
    fn set_turbo(&self, enabled: bool) -> Result<()>;
    fn set_brightness_percent(&self, percent: u8) -> Result<()>;
    fn drop_caches(&self, kind: CacheDropKind) -> Result<()>;
    fn compact_memory(&self) -> Result<()>;
    fn start_service(&self, name: &str) -> Result<()>;
    fn stop_service(&self, name: &str) -> Result<()>;
    fn read_battery(&self) -> Option<BatteryStatus>;
    fn read_temperature_c(&self) -> Option<f64>;
    /// Null-signal probe: does the pid exist right now?
    fn is_alive(&self, pid: i32) -> bool;
}

/// Real implementation against `/proc`, `/sys` and the signal interface.
pub struct LinuxControl {
    proc_root: PathBuf,
    sys_root: PathBuf,
    critical: Arc<CriticalSet>,
    manual_override: bool,
}

impl LinuxControl {
    pub fn new(critical: Arc<CriticalSet>) -> Self {
        Self::with_roots("/proc", "/sys", critical)
    }

    pub fn with_roots(
        proc_root: impl Into<PathBuf>,
        sys_root: impl Into<PathBuf>,
        critical: Arc<CriticalSet>,
    ) -> Self {
        LinuxControl {
            proc_root: proc_root.into(),
            sys_root: sys_root.into(),
            critical,
            manual_override: false,
        }
    }

    /// Allow manual actuation to bypass the critical-set guard.
    pub fn with_manual_override(mut self, enabled: bool) -> Self {
        self.manual_override = enabled;
        self
    }

    fn process_name(&self, pid: i32) -> Option<String> {
        fs::read_to_string(self.proc_root.join(pid.to_string()).join("comm"))
            .ok()
            .map(|s| s.trim().to_string())
    }

    fn guard_critical(&self, pid: i32) -> Result<()> {
        if self.manual_override {
            return Ok(());
        }
        if let Some(name) = self.process_name(pid) {
            if self.critical.matches(&name) {
                return Err(ControlError::InvalidArgument {
                    reason: format!("pid {pid} ({name}) is in the critical set"),
                });
            }
        }
        Ok(())
    }

    fn send_signal(&self, pid: i32, signal: libc::c_int) -> Result<()> {
        let rc = unsafe { libc::kill(pid, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Err(ControlError::NotFound { pid }),
            Some(libc::EPERM) => Err(ControlError::PermissionDenied {
                resource: format!("pid {pid}"),
            }),
            _ => Err(ControlError::Transient(err.to_string())),
        }
    }

    fn write_sys(&self, path: &Path, value: &str) -> Result<()> {
        fs::write(path, value)
            .map_err(|e| ControlError::from_path_io(&path.to_string_lossy(), e))
    }

    fn governor_nodes(&self) -> Vec<PathBuf> {
        WalkDir::new(self.sys_root.join("devices/system/cpu"))
            .max_depth(3)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() == "scaling_governor")
            .map(|e| e.path().to_path_buf())
            .collect()
    }

    fn systemctl(&self, verb: &str, unit: &str) -> Result<()> {
        let status = Command::new("systemctl")
            .arg(verb)
            .arg(unit)
            .status()
            .map_err(|e| ControlError::from_path_io("systemctl", e))?;
        if status.success() {
            Ok(())
        } else {
            Err(ControlError::Transient(format!(
                "systemctl {verb} {unit} exited with {status}"
            )))
        }
    }
}

impl SystemControl for LinuxControl {
    fn set_nice(&self, pid: i32, nice: i32) -> Result<()> {
        let nice = nice.clamp(NICE_MIN, NICE_MAX);
        // Raising a process's nice value lowers its favor, which the critical
        // set forbids.
        if nice > self.nice_of(pid).unwrap_or(NICE_MIN) {
            self.guard_critical(pid)?;
        }
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, nice) };
        if rc == 0 {
            debug!("[actuator] set nice of pid {pid} to {nice}");
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Err(ControlError::NotFound { pid }),
            Some(libc::EPERM) | Some(libc::EACCES) => Err(ControlError::PermissionDenied {
                resource: format!("pid {pid}"),
            }),
            _ => Err(ControlError::Transient(err.to_string())),
        }
    }

    fn nice_of(&self, pid: i32) -> Result<i32> {
        // getpriority returns -1 both as a value and as an error marker, so
        // errno has to be cleared and re-checked.
        unsafe { *libc::__errno_location() = 0 };
        let value = unsafe { libc::getpriority(libc::PRIO_PROCESS, pid as libc::id_t) };
        let errno = unsafe { *libc::__errno_location() };
        if value == -1 && errno != 0 {
            return match errno {
                libc::ESRCH => Err(ControlError::NotFound { pid }),
                libc::EPERM | libc::EACCES => Err(ControlError::PermissionDenied {
                    resource: format!("pid {pid}"),
                }),
                _ => Err(ControlError::Transient(format!("getpriority errno {errno}"))),
            };
        }
        Ok(value)
    }

    fn pause(&self, pid: i32) -> Result<()> {
        self.guard_critical(pid)?;
        self.send_signal(pid, libc::SIGSTOP)
    }

    fn resume(&self, pid: i32) -> Result<()> {
        self.send_signal(pid, libc::SIGCONT)
    }

    fn terminate(&self, pid: i32, timeout: Duration) -> Result<()> {
        self.guard_critical(pid)?;
        self.send_signal(pid, libc::SIGTERM)?;
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.is_alive(pid) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        match self.send_signal(pid, libc::SIGKILL) {
            Ok(()) | Err(ControlError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn can_modify(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        if !self.manual_override {
            if let Some(name) = self.process_name(pid) {
                if self.critical.matches(&name) {
                    return false;
                }
            }
        }
        // Null signal: 0 means alive and signalable, EPERM means alive but
        // out of reach.
        unsafe { libc::kill(pid, 0) == 0 }
    }

    fn set_affinity(&self, pid: i32, cores: &[usize]) -> Result<()> {
        if cores.is_empty() {
            return Err(ControlError::InvalidArgument {
                reason: "empty core set".into(),
            });
        }
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        for &core in cores {
            unsafe { libc::CPU_SET(core, &mut set) };
        }
        let rc = unsafe {
            libc::sched_setaffinity(pid, std::mem::size_of::<libc::cpu_set_t>(), &set)
        };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Err(ControlError::NotFound { pid }),
            Some(libc::EPERM) => Err(ControlError::PermissionDenied {
                resource: format!("pid {pid}"),
            }),
            _ => Err(ControlError::Transient(err.to_string())),
        }
    }

    fn set_cpu_governor(&self, name: &str) -> Result<()> {
        let nodes = self.governor_nodes();
        if nodes.is_empty() {
            return Err(ControlError::ResourceUnavailable {
                path: "cpufreq/scaling_governor".into(),
            });
        }
        for node in nodes {
            self.write_sys(&node, name)?;
        }
        debug!("[actuator] cpu governor set to {name}");
        Ok(())
    }

    fn get_cpu_governor(&self) -> Result<String> {
        let path = self
            .sys_root
            .join("devices/system/cpu/cpu0/cpufreq/scaling_governor");
        fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(|e| ControlError::from_path_io(&path.to_string_lossy(), e))
    }

    fn set_turbo(&self, enabled: bool) -> Result<()> {
        let no_turbo = self.sys_root.join("devices/system/cpu/intel_pstate/no_turbo");
        if no_turbo.exists() {
            return self.write_sys(&no_turbo, if enabled { "0" } else { "1" });
        }
        let boost = self.sys_root.join("devices/system/cpu/cpufreq/boost");
        if boost.exists() {
            return self.write_sys(&boost, if enabled { "1" } else { "0" });
        }
        Err(ControlError::ResourceUnavailable {
            path: "cpu turbo control".into(),
        })
    }

    fn set_brightness_percent(&self, percent: u8) -> Result<()> {
        let percent = percent.min(100) as u64;
        let base = self.sys_root.join("class/backlight");
        let mut any = false;
        for entry in WalkDir::new(&base).min_depth(1).max_depth(1).into_iter().flatten() {
            let max_path = entry.path().join("max_brightness");
            let max: u64 = match fs::read_to_string(&max_path)
                .ok()
                .and_then(|s| s.trim().parse().ok())
            {
                Some(v) => v,
                None => continue,
            };
            let value = (max * percent / 100).max(1);
            self.write_sys(&entry.path().join("brightness"), &value.to_string())?;
            any = true;
        }
        if any {
            Ok(())
        } else {
            Err(ControlError::ResourceUnavailable {
                path: base.to_string_lossy().into_owned(),
            })
        }
    }

    fn drop_caches(&self, kind: CacheDropKind) -> Result<()> {
        let value = match kind {
            CacheDropKind::Page => "1",
            CacheDropKind::All => "3",
        };
        self.write_sys(&self.proc_root.join("sys/vm/drop_caches"), value)
    }

    fn compact_memory(&self) -> Result<()> {
        self.write_sys(&self.proc_root.join("sys/vm/compact_memory"), "1")
    }

    fn start_service(&self, name: &str) -> Result<()> {
        self.systemctl("start", name)
    }

    fn stop_service(&self, name: &str) -> Result<()> {
        self.systemctl("stop", name)
    }

    fn read_battery(&self) -> Option<BatteryStatus> {
        power::read_battery(&self.sys_root)
    }

    fn read_temperature_c(&self) -> Option<f64> {
        power::read_temperature_c(&self.sys_root)
    }

    fn is_alive(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        let rc = unsafe { libc::kill(pid, 0) };
        if rc == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}
