//! Samples the kernel's process and memory interfaces into versioned
//! snapshots and publishes the latest one atomically.
//!
//! The observer has no upward dependencies: higher layers hold a reference
//! to it, never the reverse. It is the sole writer of `ProcessRecord`s.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::collectors::{self, CpuTimes, MemInfo, ProcReader};
use crate::events::{Event, EventBus};
use crate::safety::CriticalSet;
use crate::snapshot::{
    MemoryPressure, ProcessRecord, SnapshotStore, SystemSnapshot,
    DEFAULT_CRITICAL_PRESSURE_PERCENT, DEFAULT_LOW_PRESSURE_PERCENT,
};

/// Smoothing factor for per-process CPU readings.
const CPU_EWMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub tick: Duration,
    /// Total-CPU level above which a `SystemThresholdExceeded` event fires.
    pub cpu_threshold_percent: f64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        ObserverConfig {
            tick: Duration::from_secs(1),
            cpu_threshold_percent: 90.0,
        }
    }
}

/// Carry-over state between samples: previous jiffy counters and memory
/// fields so deltas and degraded reads have something to lean on.
#[derive(Default)]
struct SamplerState {
    prev_cpu: Option<CpuTimes>,
    prev_sample_at: Option<Instant>,
    per_pid: HashMap<i32, PidSample>,
    last_mem: Option<MemInfo>,
    mem_read_failing: bool,
    cpu_over_threshold: bool,
}

struct PidSample {
    cpu_jiffies: u64,
    rss_kb: u64,
    cpu_ewma: f64,
}

type SnapshotCallback = Arc<dyn Fn(&Arc<SystemSnapshot>) + Send + Sync>;

struct ObserverInner {
    reader: ProcReader,
    config: ObserverConfig,
    store: SnapshotStore,
    sampler: Mutex<SamplerState>,
    subscribers: RwLock<Vec<SnapshotCallback>>,
    critical: Arc<CriticalSet>,
    bus: Arc<EventBus>,
    stop: AtomicBool,
}

pub struct Observer {
    inner: Arc<ObserverInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Observer {
    pub fn new(config: ObserverConfig, critical: Arc<CriticalSet>, bus: Arc<EventBus>) -> Self {
        Self::with_proc_root("/proc", config, critical, bus)
    }

    pub fn with_proc_root(
        proc_root: impl Into<PathBuf>,
        config: ObserverConfig,
        critical: Arc<CriticalSet>,
        bus: Arc<EventBus>,
    ) -> Self {
        Observer {
            inner: Arc::new(ObserverInner {
                reader: ProcReader::new(proc_root),
                config,
                store: SnapshotStore::new(),
                sampler: Mutex::new(SamplerState::default()),
                subscribers: RwLock::new(Vec::new()),
                critical,
                bus,
                stop: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Latest consistent snapshot; never a partially built one.
    pub fn latest(&self) -> Arc<SystemSnapshot> {
        self.inner.store.latest()
    }

    /// Register a callback invoked once per new snapshot, serially on the
    /// observer's worker. Callbacks must not block indefinitely.
    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&Arc<SystemSnapshot>) + Send + Sync + 'static,
    {
        self.inner.subscribers.write().unwrap().push(Arc::new(f));
    }

    /// Is the pid alive? Consults the latest snapshot first, then verifies
    /// with a null signal to guard against snapshot lag.
    pub fn is_alive(&self, pid: i32) -> bool {
        if self.latest().contains_pid(pid) {
            return true;
        }
        if pid <= 0 {
            return false;
        }
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    /// Spawn the sampling worker. Idempotent.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        self.inner.stop.store(false, Ordering::SeqCst);
        let inner = self.inner.clone();
        info!("[observer] starting, tick {:?}", inner.config.tick);
        *worker = Some(tokio::spawn(async move {
            while !inner.stop.load(Ordering::SeqCst) {
                inner.sample_once();
                sleep(inner.config.tick).await;
            }
            debug!("[observer] worker exiting");
        }));
    }

    /// Stop and join the worker. Idempotent.
    pub async fn stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
            info!("[observer] stopped");
        }
    }

    /// Take one sample synchronously. The worker calls this once per tick;
    /// tests drive it directly.
    pub fn sample_now(&self) -> Arc<SystemSnapshot> {
        self.inner.sample_once()
    }

    #[cfg(test)]
    pub(crate) fn publish_for_test(&self, snapshot: SystemSnapshot) -> Arc<SystemSnapshot> {
        self.inner.store.publish(snapshot)
    }
}

impl ObserverInner {
    fn sample_once(&self) -> Arc<SystemSnapshot> {
        let now = Instant::now();
        let mut sampler = self.sampler.lock().unwrap();

        let cpu_now = collectors::read_cpu_times(self.reader.root());
        let elapsed = sampler
            .prev_sample_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        // A clock hiccup (zero or negative elapsed) means deltas are garbage;
        // treat the interval as one tick and skip rate computation.
        let rates_valid = elapsed > Duration::ZERO;

        let cpu_total_percent = match (cpu_now.as_ref(), sampler.prev_cpu.as_ref()) {
            (Some(now_times), Some(prev)) if rates_valid => {
                now_times.usage_since(prev).unwrap_or(0.0)
            }
            _ => self.store.latest().cpu_total_percent,
        };
        let cpus = cpu_now.map(|c| c.cpus).unwrap_or(1).max(1);
        let total_jiffy_delta = match (cpu_now.as_ref(), sampler.prev_cpu.as_ref()) {
            (Some(now_times), Some(prev)) => now_times.total().saturating_sub(prev.total()),
            _ => 0,
        };

        let mem = collectors::read_meminfo(self.reader.root());
        match (&mem, sampler.mem_read_failing) {
            (None, false) => {
                warn!("[observer] cannot read system memory; carrying forward last values");
                sampler.mem_read_failing = true;
            }
            (Some(_), true) => {
                info!("[observer] system memory readable again");
                sampler.mem_read_failing = false;
            }
            _ => {}
        }
        let mem = mem.or(sampler.last_mem);
        if let Some(mem) = mem {
            sampler.last_mem = Some(mem);
        }

        let load = collectors::read_loadavg(self.reader.root()).unwrap_or_default();

        let mut processes = HashMap::new();
        let mut next_pid_state = HashMap::new();
        for pid in self.reader.pids() {
            // The pid may exit between enumeration and read; drop it silently.
            let raw = match self.reader.read(pid) {
                Some(raw) => raw,
                None => continue,
            };
            let prev = sampler.per_pid.get(&pid);
            let cpu_raw = match prev {
                Some(prev) if rates_valid && total_jiffy_delta > 0 => {
                    let pid_delta = raw.cpu_jiffies.saturating_sub(prev.cpu_jiffies) as f64;
                    let per_cpu_elapsed = total_jiffy_delta as f64 / cpus as f64;
                    (100.0 * pid_delta / per_cpu_elapsed).clamp(0.0, 100.0)
                }
                // First sample for a pid yields 0.
                _ => 0.0,
            };
            let cpu_ewma = match prev {
                Some(prev) => CPU_EWMA_ALPHA * cpu_raw + (1.0 - CPU_EWMA_ALPHA) * prev.cpu_ewma,
                None => cpu_raw,
            };
            let growth_rate_kb_per_s = match prev {
                Some(prev) if rates_valid => {
                    (raw.rss_kb as f64 - prev.rss_kb as f64) / elapsed.as_secs_f64()
                }
                _ => 0.0,
            };
            next_pid_state.insert(
                pid,
                PidSample {
                    cpu_jiffies: raw.cpu_jiffies,
                    rss_kb: raw.rss_kb,
                    cpu_ewma,
                },
            );
            processes.insert(
                pid,
                ProcessRecord {
                    pid,
                    is_critical: self.critical.matches(&raw.name),
                    name: raw.name,
                    cmdline: raw.cmdline,
                    cpu_percent: cpu_ewma,
                    rss_kb: raw.rss_kb,
                    vsz_kb: raw.vsz_kb,
                    shared_kb: raw.shared_kb,
                    private_kb: raw.rss_kb.saturating_sub(raw.shared_kb),
                    minor_faults: raw.minor_faults,
                    major_faults: raw.major_faults,
                    nice_value: raw.nice_value,
                    state: raw.state,
                    parent_pid: raw.parent_pid,
                    growth_rate_kb_per_s,
                },
            );
        }

        sampler.per_pid = next_pid_state;
        if let Some(cpu) = cpu_now {
            sampler.prev_cpu = Some(cpu);
        }
        sampler.prev_sample_at = Some(now);

        let mem = sampler.last_mem.unwrap_or_default();
        let mut snapshot = SystemSnapshot {
            taken_at: now,
            seq: 0,
            cpu_total_percent,
            load_1m: load.one,
            load_5m: load.five,
            load_15m: load.fifteen,
            mem_total_kb: mem.total_kb,
            mem_used_kb: mem.used_kb(),
            mem_available_kb: mem.available_kb,
            swap_total_kb: mem.swap_total_kb,
            swap_used_kb: mem.swap_used_kb(),
            processes,
            pressure: MemoryPressure::Low,
        };
        snapshot.pressure = MemoryPressure::classify(
            snapshot.mem_used_percent(),
            DEFAULT_LOW_PRESSURE_PERCENT,
            DEFAULT_CRITICAL_PRESSURE_PERCENT,
        );

        let over = cpu_total_percent > self.config.cpu_threshold_percent;
        let was_over = sampler.cpu_over_threshold;
        sampler.cpu_over_threshold = over;
        drop(sampler);

        let published = self.store.publish(snapshot);
        self.bus.emit(Event::SnapshotTaken { seq: published.seq });
        if over && !was_over {
            self.bus.emit(Event::SystemThresholdExceeded {
                what: "cpu_total_percent".into(),
                value: cpu_total_percent,
                limit: self.config.cpu_threshold_percent,
            });
        }

        let subscribers: Vec<SnapshotCallback> =
            self.subscribers.read().unwrap().clone();
        for subscriber in &subscribers {
            subscriber(&published);
        }
        published
    }
}
