//! Mode controller: installs a `ModeConfiguration` across the scheduler,
//! memory controller, process actuator and CPU tuning atomically from the
//! caller's viewpoint, with rollback on failure. Optionally infers the mode
//! itself from observed activity.

pub mod detect;
pub mod profiles;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::actuator::SystemControl;
use crate::error::{Component, ControlError, Result};
use crate::events::{process_action, Event, EventBus, ProcessActionKind};
use crate::memory::MemoryController;
use crate::observer::Observer;
use crate::sched::Scheduler;
use crate::snapshot::SystemSnapshot;

pub use detect::AutoModeConfig;
pub use profiles::{Mode, ModeConfiguration};

/// Outcome of a successful `switch_to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    Switched,
    /// The requested mode was already active; nothing was touched.
    AlreadyActive,
}

/// Everything one apply changed, sufficient to undo it.
#[derive(Debug, Clone, Default)]
struct StateBackup {
    algorithm: Option<crate::sched::SchedulingAlgorithm>,
    governor: Option<String>,
    /// pid -> nice before this apply touched it.
    nices: HashMap<i32, i32>,
    /// Pids this apply paused.
    paused: Vec<i32>,
    /// Pids this apply resumed (they were paused by an earlier mode).
    resumed: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct ModeControllerConfig {
    pub smooth_transitions: bool,
    pub transition_delay: Duration,
    pub high_priority_nice: i32,
    pub low_priority_nice: i32,
    /// Core set used when a mode pins its high-priority processes; empty
    /// disables affinity changes.
    pub cpu_cores: Vec<usize>,
    pub auto: AutoModeConfig,
}

impl Default for ModeControllerConfig {
    fn default() -> Self {
        ModeControllerConfig {
            smooth_transitions: false,
            transition_delay: Duration::from_secs(2),
            high_priority_nice: -5,
            low_priority_nice: 10,
            cpu_cores: Vec::new(),
            auto: AutoModeConfig::default(),
        }
    }
}

struct ModeState {
    current: Mode,
    previous: Mode,
    mode_start: Instant,
    /// Pids currently paused by this controller, across applies.
    suspended_by_us: HashSet<i32>,
    /// First-seen nice per pid, restored at shutdown.
    baseline_nices: HashMap<i32, i32>,
    baseline_governor: Option<String>,
}

type ModeCallback = Arc<dyn Fn(Mode, Mode) + Send + Sync>;

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct ModeInner {
    switch_in_progress: AtomicBool,
    state: Mutex<ModeState>,
    scheduler: Arc<Scheduler>,
    memory: Arc<MemoryController>,
    observer: Arc<Observer>,
    control: Arc<dyn SystemControl>,
    bus: Arc<EventBus>,
    callbacks: RwLock<Vec<ModeCallback>>,
    config: ModeControllerConfig,
    auto_enabled: AtomicBool,
    auto_period: Mutex<Duration>,
    degraded: Mutex<HashSet<String>>,
    stop: AtomicBool,
}

pub struct ModeController {
    inner: Arc<ModeInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ModeController {
    pub fn new(
        config: ModeControllerConfig,
        scheduler: Arc<Scheduler>,
        memory: Arc<MemoryController>,
        observer: Arc<Observer>,
        control: Arc<dyn SystemControl>,
        bus: Arc<EventBus>,
    ) -> Self {
        let baseline_governor = control.get_cpu_governor().ok();
        let auto_period = config.auto.period;
        ModeController {
            inner: Arc::new(ModeInner {
                switch_in_progress: AtomicBool::new(false),
                state: Mutex::new(ModeState {
                    current: Mode::Balanced,
                    previous: Mode::Balanced,
                    mode_start: Instant::now(),
                    suspended_by_us: HashSet::new(),
                    baseline_nices: HashMap::new(),
                    baseline_governor,
                }),
                scheduler,
                memory,
                observer,
                control,
                bus,
                callbacks: RwLock::new(Vec::new()),
                config,
                auto_enabled: AtomicBool::new(false),
                auto_period: Mutex::new(auto_period),
                degraded: Mutex::new(HashSet::new()),
                stop: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn current_mode(&self) -> Mode {
        self.inner.state.lock().unwrap().current
    }

    pub fn previous_mode(&self) -> Mode {
        self.inner.state.lock().unwrap().previous
    }

    /// How long the current mode has been active.
    pub fn mode_uptime(&self) -> Duration {
        self.inner.state.lock().unwrap().mode_start.elapsed()
    }

    pub fn enable_auto_mode(&self, enabled: bool) {
        self.inner.auto_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_auto_period(&self, period: Duration) {
        *self.inner.auto_period.lock().unwrap() = period;
    }

    /// Callbacks fire after commit, never during apply, and never while any
    /// controller lock is held.
    pub fn register_mode_change_callback<F>(&self, f: F)
    where
        F: Fn(Mode, Mode) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().unwrap().push(Arc::new(f));
    }

    /// Install `mode`. Fails fast with `SwitchInProgress` when another
    /// switch is in flight; rolls back and returns `ApplyFailed` when any
    /// apply step fails.
    pub async fn switch_to(&self, mode: Mode) -> Result<SwitchOutcome> {
        self.inner.clone().switch_to(mode).await
    }

    /// Spawn the auto-detect worker. Idempotent.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        self.inner.stop.store(false, Ordering::SeqCst);
        let inner = self.inner.clone();
        info!("[mode] auto-detect worker starting");
        *worker = Some(tokio::spawn(async move {
            while !inner.stop.load(Ordering::SeqCst) {
                let period = *inner.auto_period.lock().unwrap();
                sleep(period).await;
                if inner.stop.load(Ordering::SeqCst) {
                    break;
                }
                if inner.auto_enabled.load(Ordering::SeqCst) {
                    inner.clone().auto_tick().await;
                }
            }
            debug!("[mode] auto-detect worker exiting");
        }));
    }

    pub async fn stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            info!("[mode] stopped");
        }
    }

    /// Run one auto-detect pass immediately, regardless of the period.
    pub async fn auto_tick(&self) {
        self.inner.clone().auto_tick().await;
    }

    /// Best-effort restoration of everything the controller changed since
    /// startup: baseline governor, baseline nice values, paused pids.
    pub fn shutdown(&self) {
        let (governor, nices, suspended) = {
            let state = self.inner.state.lock().unwrap();
            (
                state.baseline_governor.clone(),
                state.baseline_nices.clone(),
                state.suspended_by_us.iter().copied().collect::<Vec<_>>(),
            )
        };
        if let Some(governor) = governor {
            if let Err(e) = self.inner.control.set_cpu_governor(&governor) {
                warn!("[mode] shutdown governor restore failed: {e}");
            }
        }
        for (pid, nice) in nices {
            if let Err(e) = self.inner.control.set_nice(pid, nice) {
                debug!("[mode] shutdown nice restore for pid {pid} failed: {e}");
            }
        }
        for pid in suspended {
            if let Err(e) = self.inner.control.resume(pid) {
                debug!("[mode] shutdown resume of pid {pid} failed: {e}");
            }
        }
    }
}

impl ModeInner {
    async fn switch_to(self: Arc<Self>, mode: Mode) -> Result<SwitchOutcome> {
        if self.state.lock().unwrap().current == mode {
            return Ok(SwitchOutcome::AlreadyActive);
        }
        if self
            .switch_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ControlError::SwitchInProgress);
        }
        let _in_flight = InFlight(&self.switch_in_progress);

        let config = ModeConfiguration::for_mode(mode);
        if self.config.smooth_transitions {
            sleep(self.config.transition_delay).await;
        }

        let snapshot = self.observer.latest();
        let mut backup = StateBackup {
            algorithm: Some(self.scheduler.algorithm()),
            governor: self.control.get_cpu_governor().ok(),
            ..Default::default()
        };
        let mut buffered: Vec<Event> = Vec::new();

        let old = self.state.lock().unwrap().current;
        info!("[mode] applying {old} -> {mode}");
        match self.apply(&config, &snapshot, &mut backup, &mut buffered) {
            Ok(()) => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.previous = state.current;
                    state.current = mode;
                    state.mode_start = Instant::now();
                    for (pid, nice) in &backup.nices {
                        state.baseline_nices.entry(*pid).or_insert(*nice);
                    }
                }
                self.bus.emit(Event::ModeChanged { old, new: mode });
                for event in buffered {
                    self.bus.emit(event);
                }
                let callbacks: Vec<ModeCallback> =
                    self.callbacks.read().unwrap().clone();
                for callback in &callbacks {
                    callback(old, mode);
                }
                info!("[mode] now in {mode}");
                Ok(SwitchOutcome::Switched)
            }
            Err(e) => {
                warn!("[mode] apply of {mode} failed, rolling back: {e}");
                self.rollback(&backup, &mut buffered);
                for event in buffered {
                    self.bus.emit(event);
                }
                Err(e)
            }
        }
    }

    /// Apply steps in order: scheduler, memory controller, process
    /// priorities, CPU governor, system services, power tuning. Per-pid
    /// failures are absorbed into events; per-component failures abort.
    fn apply(
        &self,
        config: &ModeConfiguration,
        snapshot: &SystemSnapshot,
        backup: &mut StateBackup,
        buffered: &mut Vec<Event>,
    ) -> Result<()> {
        self.scheduler.set_algorithm(config.scheduler_algorithm);
        self.scheduler.set_default_slice(config.default_slice_ms);
        self.scheduler.set_priority_boosting(config.priority_boosting);
        self.scheduler.set_max_cpu_percent(config.max_cpu_percent);

        self.memory.set_strategy(config.memory_strategy);
        self.memory.set_low_threshold(config.pressure_threshold_percent);
        self.memory.set_swap_enabled(config.swap_enabled);

        self.apply_process_policy(config, snapshot, backup, buffered);

        self.component_step(
            Component::CpuGovernor,
            "cpu governor",
            self.control.set_cpu_governor(&config.cpu_governor),
        )?;

        for unit in &config.disabled_services {
            self.component_step(
                Component::SystemServices,
                "service stop",
                self.control.stop_service(unit),
            )?;
        }
        for unit in &config.enabled_services {
            self.component_step(
                Component::SystemServices,
                "service start",
                self.control.start_service(unit),
            )?;
        }

        self.component_step(
            Component::PowerTuning,
            "cpu turbo",
            self.control.set_turbo(config.cpu_turbo),
        )?;
        if let Some(percent) = config.screen_brightness_percent {
            self.component_step(
                Component::PowerTuning,
                "screen brightness",
                self.control.set_brightness_percent(percent),
            )?;
        }
        Ok(())
    }

    fn apply_process_policy(
        &self,
        config: &ModeConfiguration,
        snapshot: &SystemSnapshot,
        backup: &mut StateBackup,
        buffered: &mut Vec<Event>,
    ) {
        // Resume pids an earlier mode paused that this mode no longer wants
        // suspended.
        let previously_suspended: Vec<i32> = {
            let state = self.state.lock().unwrap();
            state.suspended_by_us.iter().copied().collect()
        };
        for pid in previously_suspended {
            let name = snapshot.processes.get(&pid).map(|r| r.name.clone());
            let keep = name
                .as_deref()
                .map(|n| config.matches_suspend(n))
                .unwrap_or(false);
            if keep {
                continue;
            }
            let result = self.control.resume(pid);
            if result.is_ok() {
                self.state.lock().unwrap().suspended_by_us.remove(&pid);
                backup.resumed.push(pid);
            }
            buffered.push(process_action(pid, ProcessActionKind::Resume, &result));
        }

        let mut pids: Vec<i32> = snapshot.processes.keys().copied().collect();
        pids.sort_unstable();
        for pid in pids {
            let record = &snapshot.processes[&pid];
            if record.is_critical {
                continue;
            }
            if config.matches_suspend(&record.name) {
                if !self.control.can_modify(pid) {
                    continue;
                }
                if self.state.lock().unwrap().suspended_by_us.contains(&pid) {
                    continue;
                }
                let result = self.control.pause(pid);
                if result.is_ok() {
                    self.state.lock().unwrap().suspended_by_us.insert(pid);
                    backup.paused.push(pid);
                }
                buffered.push(process_action(pid, ProcessActionKind::Pause, &result));
            } else if config.matches_high_priority(&record.name) {
                self.adjust_nice(pid, self.config.high_priority_nice, backup, buffered);
                if config.pin_high_priority && !self.config.cpu_cores.is_empty() {
                    if let Err(e) = self.control.set_affinity(pid, &self.config.cpu_cores) {
                        debug!("[mode] affinity for pid {pid} failed: {e}");
                    }
                }
            } else if config.matches_low_priority(&record.name) {
                if !self.control.can_modify(pid) {
                    continue;
                }
                self.adjust_nice(pid, self.config.low_priority_nice, backup, buffered);
            }
        }
    }

    fn adjust_nice(
        &self,
        pid: i32,
        target: i32,
        backup: &mut StateBackup,
        buffered: &mut Vec<Event>,
    ) {
        // The pid may be gone or unreadable; either way there is nothing to
        // adjust.
        let prior = match self.control.nice_of(pid) {
            Ok(prior) => prior,
            Err(_) => return,
        };
        if prior == target {
            return;
        }
        let result = self.control.set_nice(pid, target);
        if result.is_ok() {
            backup.nices.entry(pid).or_insert(prior);
        }
        buffered.push(process_action(pid, ProcessActionKind::SetPriority, &result));
    }

    /// A missing kernel interface degrades the step to a no-op (logged once
    /// per resource); any other failure aborts the apply.
    fn component_step(
        &self,
        component: Component,
        what: &str,
        result: Result<()>,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                self.degraded.lock().unwrap().remove(what);
                Ok(())
            }
            Err(ControlError::ResourceUnavailable { path }) => {
                if self.degraded.lock().unwrap().insert(what.to_string()) {
                    warn!("[mode] {what} unavailable ({path}), continuing without it");
                }
                Ok(())
            }
            Err(cause) => Err(ControlError::ApplyFailed {
                component,
                cause: Box::new(cause),
            }),
        }
    }

    /// Undo one apply: restore algorithm and governor, restore per-pid nice
    /// (best effort for dead pids), resume pids this apply paused and
    /// re-pause pids it resumed.
    fn rollback(&self, backup: &StateBackup, buffered: &mut Vec<Event>) {
        if let Some(algorithm) = backup.algorithm {
            self.scheduler.set_algorithm(algorithm);
        }
        if let Some(governor) = &backup.governor {
            if let Err(e) = self.control.set_cpu_governor(governor) {
                warn!("[mode] rollback governor restore failed: {e}");
            }
        }
        for (pid, nice) in &backup.nices {
            let result = self.control.set_nice(*pid, *nice);
            if let Err(e) = &result {
                debug!("[mode] rollback nice restore for pid {pid} failed: {e}");
            }
            buffered.push(process_action(*pid, ProcessActionKind::SetPriority, &result));
        }
        for pid in &backup.paused {
            let result = self.control.resume(*pid);
            if result.is_ok() {
                self.state.lock().unwrap().suspended_by_us.remove(pid);
            }
            buffered.push(process_action(*pid, ProcessActionKind::Resume, &result));
        }
        for pid in &backup.resumed {
            let result = self.control.pause(*pid);
            if result.is_ok() {
                self.state.lock().unwrap().suspended_by_us.insert(*pid);
            }
            buffered.push(process_action(*pid, ProcessActionKind::Pause, &result));
        }
    }

    async fn auto_tick(self: Arc<Self>) {
        let snapshot = self.observer.latest();
        let battery = self.control.read_battery();
        let temperature = self.control.read_temperature_c();
        let (inferred, reason) =
            detect::infer_mode(&snapshot, battery, temperature, &self.config.auto);
        let current = self.state.lock().unwrap().current;
        if inferred == current {
            return;
        }
        info!("[mode] auto-detect suggests {inferred}: {reason}");
        self.bus.emit(Event::AutoModeSuggested {
            mode: inferred,
            reason,
        });
        match self.clone().switch_to(inferred).await {
            Ok(_) => {}
            Err(ControlError::SwitchInProgress) => {
                debug!("[mode] auto switch skipped, another switch in flight");
            }
            Err(e) => warn!("[mode] auto switch to {inferred} failed: {e}"),
        }
    }
}
