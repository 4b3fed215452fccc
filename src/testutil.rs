//! Scripted SystemControl double shared by the policy components' tests.
//! Records every actuation and lets tests inject failures per surface.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::actuator::{CacheDropKind, SystemControl, NICE_MAX, NICE_MIN};
use crate::collectors::power::BatteryStatus;
use crate::error::{ControlError, Result};
use crate::safety::CriticalSet;
use crate::snapshot::{MemoryPressure, ProcessRecord, ProcessState, SystemSnapshot};

#[derive(Default)]
pub struct FakeControl {
    pub calls: Mutex<Vec<String>>,
    pub names: Mutex<HashMap<i32, String>>,
    pub alive: Mutex<HashSet<i32>>,
    pub nices: Mutex<HashMap<i32, i32>>,
    pub paused: Mutex<HashSet<i32>>,
    pub terminated: Mutex<Vec<i32>>,
    pub governor: Mutex<String>,
    pub turbo: Mutex<Option<bool>>,
    pub brightness: Mutex<Option<u8>>,
    pub battery: Mutex<Option<BatteryStatus>>,
    pub temperature: Mutex<Option<f64>>,
    pub fail_set_governor: AtomicBool,
    pub fail_drop_caches: AtomicBool,
    pub critical: CriticalSet,
}

impl FakeControl {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeControl {
            governor: Mutex::new("ondemand".to_string()),
            critical: CriticalSet::default(),
            ..Default::default()
        })
    }

    pub fn add_process(&self, pid: i32, name: &str, nice: i32) {
        self.names.lock().unwrap().insert(pid, name.to_string());
        self.alive.lock().unwrap().insert(pid);
        self.nices.lock().unwrap().insert(pid, nice);
    }

    pub fn kill_process(&self, pid: i32) {
        self.alive.lock().unwrap().remove(&pid);
    }

    pub fn nice(&self, pid: i32) -> Option<i32> {
        self.nices.lock().unwrap().get(&pid).copied()
    }

    pub fn is_paused(&self, pid: i32) -> bool {
        self.paused.lock().unwrap().contains(&pid)
    }

    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn log(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }

    fn check_alive(&self, pid: i32) -> Result<()> {
        if self.alive.lock().unwrap().contains(&pid) {
            Ok(())
        } else {
            Err(ControlError::NotFound { pid })
        }
    }

    fn is_critical(&self, pid: i32) -> bool {
        self.names
            .lock()
            .unwrap()
            .get(&pid)
            .map(|n| self.critical.matches(n))
            .unwrap_or(false)
    }
}

impl SystemControl for FakeControl {
    fn set_nice(&self, pid: i32, nice: i32) -> Result<()> {
        let nice = nice.clamp(NICE_MIN, NICE_MAX);
        self.log(format!("set_nice({pid}, {nice})"));
        self.check_alive(pid)?;
        self.nices.lock().unwrap().insert(pid, nice);
        Ok(())
    }

    fn nice_of(&self, pid: i32) -> Result<i32> {
        self.check_alive(pid)?;
        Ok(self.nices.lock().unwrap().get(&pid).copied().unwrap_or(0))
    }

    fn pause(&self, pid: i32) -> Result<()> {
        self.log(format!("pause({pid})"));
        self.check_alive(pid)?;
        self.paused.lock().unwrap().insert(pid);
        Ok(())
    }

    fn resume(&self, pid: i32) -> Result<()> {
        self.log(format!("resume({pid})"));
        self.check_alive(pid)?;
        self.paused.lock().unwrap().remove(&pid);
        Ok(())
    }

    fn terminate(&self, pid: i32, _timeout: Duration) -> Result<()> {
        self.log(format!("terminate({pid})"));
        self.check_alive(pid)?;
        self.alive.lock().unwrap().remove(&pid);
        self.terminated.lock().unwrap().push(pid);
        Ok(())
    }

    fn can_modify(&self, pid: i32) -> bool {
        pid > 0 && self.alive.lock().unwrap().contains(&pid) && !self.is_critical(pid)
    }

    fn set_affinity(&self, pid: i32, cores: &[usize]) -> Result<()> {
        self.log(format!("set_affinity({pid}, {cores:?})"));
        self.check_alive(pid)
    }

    fn set_cpu_governor(&self, name: &str) -> Result<()> {
        self.log(format!("set_cpu_governor({name})"));
        if self.fail_set_governor.load(Ordering::SeqCst) {
            return Err(ControlError::PermissionDenied {
                resource: "cpufreq/scaling_governor".into(),
            });
        }
        *self.governor.lock().unwrap() = name.to_string();
        Ok(())
    }

    fn get_cpu_governor(&self) -> Result<String> {
        Ok(self.governor.lock().unwrap().clone())
    }

    fn set_turbo(&self, enabled: bool) -> Result<()> {
        self.log(format!("set_turbo({enabled})"));
        *self.turbo.lock().unwrap() = Some(enabled);
        Ok(())
    }

    fn set_brightness_percent(&self, percent: u8) -> Result<()> {
        self.log(format!("set_brightness_percent({percent})"));
        *self.brightness.lock().unwrap() = Some(percent);
        Ok(())
    }

    fn drop_caches(&self, kind: CacheDropKind) -> Result<()> {
        self.log(format!("drop_caches({kind:?})"));
        if self.fail_drop_caches.load(Ordering::SeqCst) {
            return Err(ControlError::PermissionDenied {
                resource: "vm/drop_caches".into(),
            });
        }
        Ok(())
    }

    fn compact_memory(&self) -> Result<()> {
        self.log("compact_memory()".to_string());
        Ok(())
    }

    fn start_service(&self, name: &str) -> Result<()> {
        self.log(format!("start_service({name})"));
        Ok(())
    }

    fn stop_service(&self, name: &str) -> Result<()> {
        self.log(format!("stop_service({name})"));
        Ok(())
    }

    fn read_battery(&self) -> Option<BatteryStatus> {
        *self.battery.lock().unwrap()
    }

    fn read_temperature_c(&self) -> Option<f64> {
        *self.temperature.lock().unwrap()
    }

    fn is_alive(&self, pid: i32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }
}

/// Build a ProcessRecord with sane defaults for policy tests.
pub fn record(pid: i32, name: &str, cpu: f64, rss_kb: u64) -> ProcessRecord {
    ProcessRecord {
        pid,
        name: name.to_string(),
        cmdline: name.to_string(),
        cpu_percent: cpu,
        rss_kb,
        vsz_kb: rss_kb * 2,
        shared_kb: 0,
        private_kb: rss_kb,
        minor_faults: 0,
        major_faults: 0,
        nice_value: 0,
        state: ProcessState::Running,
        parent_pid: 1,
        growth_rate_kb_per_s: 0.0,
        is_critical: CriticalSet::default().matches(name),
    }
}

/// Build a snapshot around a process list and a memory usage percentage.
pub fn snapshot(seq: u64, used_percent: f64, records: Vec<ProcessRecord>) -> SystemSnapshot {
    let total = 1_000_000u64;
    let used = (total as f64 * used_percent / 100.0) as u64;
    let mut snap = SystemSnapshot::empty();
    snap.seq = seq;
    snap.mem_total_kb = total;
    snap.mem_used_kb = used;
    snap.mem_available_kb = total - used;
    snap.pressure = MemoryPressure::classify(used_percent, 70.0, 90.0);
    snap.processes = records.into_iter().map(|r| (r.pid, r)).collect();
    snap
}
