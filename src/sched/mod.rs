//! Scheduler policy engine.
//!
//! On every scheduling tick the engine classifies the known processes,
//! recomputes dynamic priorities, ages starved processes, picks the next
//! favored process under the active algorithm and translates that choice
//! into a nice-value adjustment through the actuator. All state sits behind
//! one mutex; the lock is never held across actuator I/O.

pub mod algorithm;
pub mod classify;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::actuator::{SystemControl, NICE_MAX, NICE_MIN};
use crate::error::ControlError;
use crate::events::{process_action, Event, EventBus, ProcessActionKind};
use crate::observer::Observer;
use crate::snapshot::SystemSnapshot;

pub use algorithm::{RunQueues, SchedulingAlgorithm, MLFQ_LEVELS};
pub use classify::ProcessClass;

pub const MIN_SLICE_MS: u64 = 10;
pub const MAX_SLICE_MS: u64 = 500;
pub const DEFAULT_SLICE_MS: u64 = 100;

const CPU_HISTORY_LEN: usize = 10;
const STARVATION_BOOST: i32 = 5;
const PRIORITY_CEIL: i32 = 19;
/// How far below its base nice the favored process is pushed.
const FAVOR_NICE_DROP: i32 = 2;

/// The scheduler's view of one process.
#[derive(Debug, Clone)]
pub struct ScheduledProcess {
    pub pid: i32,
    pub class: ProcessClass,
    pub base_nice: i32,
    pub dynamic_priority: i32,
    pub virtual_runtime: f64,
    pub time_slice_ms: u64,
    pub queue_level: usize,
    pub last_scheduled_at: Option<Instant>,
    pub enrolled_at: Instant,
    pub schedule_count: u64,
    pub preemption_count: u64,
    pub cpu_history: VecDeque<f64>,
    starvation_boost: i32,
    last_boost_at: Option<Instant>,
    /// Nice value this engine last actuated for the pid, if any.
    applied_nice: Option<i32>,
}

impl ScheduledProcess {
    pub fn new(pid: i32, class: ProcessClass, base_nice: i32, time_slice_ms: u64) -> Self {
        ScheduledProcess {
            pid,
            class,
            base_nice,
            dynamic_priority: base_nice,
            virtual_runtime: 0.0,
            time_slice_ms,
            queue_level: 0,
            last_scheduled_at: None,
            enrolled_at: Instant::now(),
            schedule_count: 0,
            preemption_count: 0,
            cpu_history: VecDeque::with_capacity(CPU_HISTORY_LEN),
            starvation_boost: 0,
            last_boost_at: None,
            applied_nice: None,
        }
    }

    pub fn last_scheduled_key(&self) -> Option<Instant> {
        self.last_scheduled_at
    }

    fn record_cpu(&mut self, cpu: f64) {
        if self.cpu_history.len() == CPU_HISTORY_LEN {
            self.cpu_history.pop_front();
        }
        self.cpu_history.push_back(cpu);
    }

    fn waiting_since(&self) -> Instant {
        self.last_scheduled_at.unwrap_or(self.enrolled_at)
    }
}

/// Per-class overrides installed by `set_algorithm_for_class`.
#[derive(Debug, Clone, Copy)]
pub struct ClassPolicy {
    pub algorithm: SchedulingAlgorithm,
    pub slice_ms: u64,
    pub nice_min: i32,
    pub nice_max: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulingStats {
    pub context_switches: u64,
    pub preemptions: u64,
    pub starvation_boosts: u64,
    pub avg_response_time_ms: f64,
    pub cpu_utilization_percent: f64,
    pub active_processes: usize,
    pub algorithm: SchedulingAlgorithm,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    pub default_slice_ms: u64,
    pub starvation_threshold: Duration,
    /// Total-CPU level above which slices shrink.
    pub adaptive_cpu_threshold: f64,
    /// Total-CPU level below which slices relax back toward their default.
    pub relax_cpu_threshold: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            tick: Duration::from_millis(50),
            default_slice_ms: DEFAULT_SLICE_MS,
            starvation_threshold: Duration::from_secs(5),
            adaptive_cpu_threshold: 80.0,
            relax_cpu_threshold: 20.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RunningSlot {
    pid: i32,
    since: Instant,
    slice_ms: u64,
}

#[derive(Default)]
struct StatCounters {
    context_switches: u64,
    preemptions: u64,
    starvation_boosts: u64,
    response_total_ms: f64,
    response_samples: u64,
}

struct SchedState {
    algorithm: SchedulingAlgorithm,
    default_slice_ms: u64,
    starvation_threshold: Duration,
    adaptive_cpu_threshold: f64,
    relax_cpu_threshold: f64,
    priority_boosting: bool,
    max_cpu_percent: f64,
    procs: HashMap<i32, ScheduledProcess>,
    queues: RunQueues,
    realtime: HashMap<i32, i32>,
    class_policies: HashMap<ProcessClass, ClassPolicy>,
    running: Option<RunningSlot>,
    last_cpu_utilization: f64,
    over_limit: std::collections::HashSet<i32>,
    stats: StatCounters,
}

struct SchedInner {
    state: Mutex<SchedState>,
    control: Arc<dyn SystemControl>,
    bus: Arc<EventBus>,
    stop: AtomicBool,
    tick_period: Duration,
}

pub struct Scheduler {
    inner: Arc<SchedInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        algorithm: SchedulingAlgorithm,
        control: Arc<dyn SystemControl>,
        bus: Arc<EventBus>,
    ) -> Self {
        Scheduler {
            inner: Arc::new(SchedInner {
                state: Mutex::new(SchedState {
                    algorithm,
                    default_slice_ms: config
                        .default_slice_ms
                        .clamp(MIN_SLICE_MS, MAX_SLICE_MS),
                    starvation_threshold: config.starvation_threshold,
                    adaptive_cpu_threshold: config.adaptive_cpu_threshold,
                    relax_cpu_threshold: config.relax_cpu_threshold,
                    priority_boosting: true,
                    max_cpu_percent: 100.0,
                    procs: HashMap::new(),
                    queues: RunQueues::default(),
                    realtime: HashMap::new(),
                    class_policies: HashMap::new(),
                    running: None,
                    last_cpu_utilization: 0.0,
                    over_limit: Default::default(),
                    stats: StatCounters::default(),
                }),
                control,
                bus,
                stop: AtomicBool::new(false),
                tick_period: config.tick,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the scheduling worker, pulling the latest snapshot each tick.
    pub fn start(&self, observer: Arc<Observer>) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        self.inner.stop.store(false, Ordering::SeqCst);
        let inner = self.inner.clone();
        info!("[sched] starting, tick {:?}", inner.tick_period);
        *worker = Some(tokio::spawn(async move {
            while !inner.stop.load(Ordering::SeqCst) {
                let snapshot = observer.latest();
                inner.tick_with(&snapshot);
                sleep(inner.tick_period).await;
            }
            debug!("[sched] worker exiting");
        }));
    }

    pub async fn stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
            info!("[sched] stopped");
        }
    }

    /// Run one scheduling tick against the given snapshot. The worker calls
    /// this; tests and callers may drive it synchronously.
    pub fn tick_with(&self, snapshot: &SystemSnapshot) {
        self.inner.tick_with(snapshot);
    }

    pub fn register(&self, pid: i32) {
        let mut state = self.inner.state.lock().unwrap();
        if state.procs.contains_key(&pid) {
            return;
        }
        let slice = state.default_slice_ms;
        state
            .procs
            .insert(pid, ScheduledProcess::new(pid, ProcessClass::Interactive, 0, slice));
        state.queues.enroll(pid, 0);
    }

    pub fn unregister(&self, pid: i32) {
        let mut state = self.inner.state.lock().unwrap();
        state.procs.remove(&pid);
        state.queues.remove(pid);
        state.realtime.remove(&pid);
        if state.running.map(|r| r.pid) == Some(pid) {
            state.running = None;
        }
    }

    pub fn algorithm(&self) -> SchedulingAlgorithm {
        self.inner.state.lock().unwrap().algorithm
    }

    /// Switch the active algorithm atomically: clears the queue structures
    /// and re-enrolls every known process into the new ones.
    pub fn set_algorithm(&self, algorithm: SchedulingAlgorithm) {
        let mut state = self.inner.state.lock().unwrap();
        if state.algorithm == algorithm {
            return;
        }
        info!("[sched] algorithm {:?} -> {:?}", state.algorithm, algorithm);
        state.algorithm = algorithm;
        state.queues.clear();
        let mut pids: Vec<i32> = state.procs.keys().copied().collect();
        pids.sort_unstable();
        for pid in pids {
            if let Some(proc) = state.procs.get_mut(&pid) {
                proc.queue_level = 0;
            }
            state.queues.enroll(pid, 0);
        }
        state.running = None;
    }

    pub fn set_default_slice(&self, slice_ms: u64) {
        let slice = slice_ms.clamp(MIN_SLICE_MS, MAX_SLICE_MS);
        let mut state = self.inner.state.lock().unwrap();
        state.default_slice_ms = slice;
        let overridden: Vec<ProcessClass> = state.class_policies.keys().copied().collect();
        for proc in state.procs.values_mut() {
            if !overridden.contains(&proc.class) {
                proc.time_slice_ms = slice;
            }
        }
    }

    pub fn set_algorithm_for_class(&self, class: ProcessClass, policy: ClassPolicy) {
        let mut state = self.inner.state.lock().unwrap();
        let policy = ClassPolicy {
            slice_ms: policy.slice_ms.clamp(MIN_SLICE_MS, MAX_SLICE_MS),
            nice_min: policy.nice_min.clamp(NICE_MIN, NICE_MAX),
            nice_max: policy.nice_max.clamp(NICE_MIN, NICE_MAX),
            ..policy
        };
        for proc in state.procs.values_mut() {
            if proc.class == class {
                proc.time_slice_ms = policy.slice_ms;
            }
        }
        state.class_policies.insert(class, policy);
    }

    /// Put a pid in the real-time set; it preempts algorithmic selection.
    pub fn set_realtime(&self, pid: i32, rt_priority: i32) {
        self.inner.state.lock().unwrap().realtime.insert(pid, rt_priority);
    }

    pub fn clear_realtime(&self, pid: i32) {
        self.inner.state.lock().unwrap().realtime.remove(&pid);
    }

    pub fn set_priority_boosting(&self, enabled: bool) {
        self.inner.state.lock().unwrap().priority_boosting = enabled;
    }

    pub fn set_max_cpu_percent(&self, limit: f64) {
        self.inner.state.lock().unwrap().max_cpu_percent = limit.clamp(1.0, 100.0);
    }

    pub fn set_starvation_threshold(&self, threshold: Duration) {
        self.inner.state.lock().unwrap().starvation_threshold = threshold;
    }

    pub fn statistics(&self) -> SchedulingStats {
        let state = self.inner.state.lock().unwrap();
        let avg = if state.stats.response_samples > 0 {
            state.stats.response_total_ms / state.stats.response_samples as f64
        } else {
            0.0
        };
        SchedulingStats {
            context_switches: state.stats.context_switches,
            preemptions: state.stats.preemptions,
            starvation_boosts: state.stats.starvation_boosts,
            avg_response_time_ms: avg,
            cpu_utilization_percent: state.last_cpu_utilization,
            active_processes: state.procs.len(),
            algorithm: state.algorithm,
        }
    }

    /// Snapshot of one scheduled process, for assertions and introspection.
    pub fn process(&self, pid: i32) -> Option<ScheduledProcess> {
        self.inner.state.lock().unwrap().procs.get(&pid).cloned()
    }
}

impl SchedInner {
    fn tick_with(&self, snapshot: &SystemSnapshot) {
        let now = Instant::now();
        let mut events: Vec<Event> = Vec::new();
        let mut nice_plan: Vec<(i32, i32)> = Vec::new();

        {
            let mut state = self.state.lock().unwrap();
            state.last_cpu_utilization = snapshot.cpu_total_percent;

            self.sync_with_snapshot(&mut state, snapshot);
            self.refresh_processes(&mut state, snapshot, now, &mut events);
            self.apply_adaptive_slices(&mut state, snapshot.cpu_total_percent);
            self.check_cpu_limits(&mut state, snapshot, &mut events);

            if let Some(selected) = self.select_next(&mut state, now) {
                self.account_selection(&mut state, selected, now);
                self.plan_nice_changes(&mut state, selected, &mut nice_plan);
            }
        }

        for (pid, nice) in nice_plan {
            let result = self.control.set_nice(pid, nice);
            if let Err(ControlError::NotFound { .. }) = &result {
                debug!("[sched] pid {pid} vanished before actuation");
            } else if let Err(e) = &result {
                warn!("[sched] set_nice({pid}, {nice}) failed: {e}");
            }
            events.push(process_action(pid, ProcessActionKind::SetPriority, &result));
        }
        for event in events {
            self.bus.emit(event);
        }
    }

    /// Enroll pids the observer started reporting, retire pids it stopped
    /// reporting that are confirmed dead.
    fn sync_with_snapshot(&self, state: &mut SchedState, snapshot: &SystemSnapshot) {
        let new_pids: Vec<i32> = snapshot
            .processes
            .keys()
            .filter(|pid| !state.procs.contains_key(*pid))
            .copied()
            .collect();
        for pid in new_pids {
            let record = &snapshot.processes[&pid];
            let class = classify::classify(record);
            let slice = state
                .class_policies
                .get(&class)
                .map(|p| p.slice_ms)
                .unwrap_or(state.default_slice_ms);
            state
                .procs
                .insert(pid, ScheduledProcess::new(pid, class, record.nice_value, slice));
            state.queues.enroll(pid, 0);
        }

        let gone: Vec<i32> = state
            .procs
            .keys()
            .filter(|pid| !snapshot.contains_pid(**pid) && !self.control.is_alive(**pid))
            .copied()
            .collect();
        for pid in gone {
            state.procs.remove(&pid);
            state.queues.remove(pid);
            state.realtime.remove(&pid);
            if state.running.map(|r| r.pid) == Some(pid) {
                state.running = None;
            }
        }
    }

    /// Classification, CPU history, dynamic priority and starvation aging.
    fn refresh_processes(
        &self,
        state: &mut SchedState,
        snapshot: &SystemSnapshot,
        now: Instant,
        events: &mut Vec<Event>,
    ) {
        let threshold = state.starvation_threshold;
        let mut boosts = 0u64;
        for proc in state.procs.values_mut() {
            let record = match snapshot.processes.get(&proc.pid) {
                Some(record) => record,
                None => continue,
            };
            proc.class = classify::classify(record);
            proc.record_cpu(record.cpu_percent);
            // An observed nice this engine did not apply is a new base, e.g.
            // a mode switch or the user reniced the process.
            if proc.applied_nice != Some(record.nice_value) {
                proc.base_nice = record.nice_value;
            }

            let waited = now.saturating_duration_since(proc.waiting_since());
            let starved = waited > threshold;

            if starved {
                let since_boost = proc
                    .last_boost_at
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(waited);
                if since_boost > threshold {
                    proc.starvation_boost += STARVATION_BOOST;
                    proc.last_boost_at = Some(now);
                    events.push(Event::StarvationBoosted { pid: proc.pid });
                    boosts += 1;
                }
            }

            let mut priority = proc.base_nice;
            if proc.class == ProcessClass::Interactive {
                priority += 5;
            }
            if record.cpu_percent > 80.0 {
                priority -= 3;
            }
            if starved {
                priority += 10;
            }
            proc.dynamic_priority = (priority + proc.starvation_boost).min(PRIORITY_CEIL);
        }
        state.stats.starvation_boosts += boosts;
    }

    /// Shrink slices under system-wide CPU contention, relax them back when
    /// the load clears.
    fn apply_adaptive_slices(&self, state: &mut SchedState, cpu_total: f64) {
        let shrink = cpu_total > state.adaptive_cpu_threshold;
        let relax = cpu_total < state.relax_cpu_threshold;
        if !shrink && !relax {
            return;
        }
        let default_slice = state.default_slice_ms;
        let policies = state.class_policies.clone();
        let realtime: Vec<i32> = state.realtime.keys().copied().collect();
        for proc in state.procs.values_mut() {
            if realtime.contains(&proc.pid) {
                continue;
            }
            let configured = policies
                .get(&proc.class)
                .map(|p| p.slice_ms)
                .unwrap_or(default_slice);
            if shrink {
                proc.time_slice_ms =
                    ((proc.time_slice_ms as f64 * 0.8) as u64).max(MIN_SLICE_MS);
            } else {
                proc.time_slice_ms =
                    ((proc.time_slice_ms as f64 * 1.2) as u64).min(configured);
            }
        }
    }

    fn check_cpu_limits(
        &self,
        state: &mut SchedState,
        snapshot: &SystemSnapshot,
        events: &mut Vec<Event>,
    ) {
        if state.max_cpu_percent >= 100.0 {
            state.over_limit.clear();
            return;
        }
        let limit = state.max_cpu_percent;
        for record in snapshot.processes.values() {
            if record.cpu_percent > limit {
                if state.over_limit.insert(record.pid) {
                    events.push(Event::ResourceLimitExceeded {
                        pid: record.pid,
                        cpu_percent: record.cpu_percent,
                        limit_percent: limit,
                    });
                }
            } else {
                state.over_limit.remove(&record.pid);
            }
        }
    }

    /// Real-time override first, then the active algorithm.
    fn select_next(&self, state: &mut SchedState, _now: Instant) -> Option<i32> {
        let rt_pick = state
            .realtime
            .iter()
            .filter(|(pid, _)| state.procs.contains_key(*pid))
            .max_by_key(|(pid, prio)| (**prio, -**pid))
            .map(|(pid, _)| *pid);
        if let Some(pid) = rt_pick {
            return Some(pid);
        }

        match state.algorithm {
            SchedulingAlgorithm::Priority => algorithm::select_priority(&state.procs),
            SchedulingAlgorithm::RoundRobin => {
                algorithm::select_round_robin(&mut state.queues.round_robin, &state.procs)
            }
            SchedulingAlgorithm::MultilevelFeedback => {
                let (pid, level) = algorithm::select_mlfq(&mut state.queues.levels, &state.procs)?;
                let requeue_level = {
                    let proc = state.procs.get_mut(&pid)?;
                    proc.queue_level = level;
                    if algorithm::mlfq_should_demote(proc.schedule_count + 1, level) {
                        let demoted = (level + 1).min(MLFQ_LEVELS - 1);
                        proc.queue_level = demoted;
                        demoted
                    } else {
                        level
                    }
                };
                state.queues.levels[requeue_level].push_back(pid);
                Some(pid)
            }
            SchedulingAlgorithm::CompletelyFair => {
                let pid = algorithm::select_cfs(&state.procs)?;
                if let Some(proc) = state.procs.get_mut(&pid) {
                    let cpu = proc.cpu_history.back().copied().unwrap_or(0.0);
                    proc.virtual_runtime += cpu * 0.1 * algorithm::cfs_weight(proc.base_nice);
                }
                Some(pid)
            }
        }
    }

    /// Context-switch and preemption accounting, response-time sampling.
    fn account_selection(&self, state: &mut SchedState, selected: i32, now: Instant) {
        let previous = state.running;
        if previous.map(|r| r.pid) != Some(selected) {
            state.stats.context_switches += 1;
            if let Some(prev) = previous {
                let used = now.saturating_duration_since(prev.since);
                if used < Duration::from_millis(prev.slice_ms) {
                    state.stats.preemptions += 1;
                    if let Some(proc) = state.procs.get_mut(&prev.pid) {
                        proc.preemption_count += 1;
                    }
                }
            }
        }

        if let Some(proc) = state.procs.get_mut(&selected) {
            let waited = now.saturating_duration_since(proc.waiting_since());
            state.stats.response_total_ms += waited.as_secs_f64() * 1000.0;
            state.stats.response_samples += 1;
            proc.schedule_count += 1;
            proc.last_scheduled_at = Some(now);
            proc.starvation_boost = 0;
            proc.last_boost_at = None;
            state.running = Some(RunningSlot {
                pid: selected,
                since: now,
                slice_ms: proc.time_slice_ms,
            });
        }
    }

    /// Favor the selected pid with a small nice drop and restore the nice of
    /// the pid that lost favor. Critical processes keep their own nice.
    fn plan_nice_changes(
        &self,
        state: &mut SchedState,
        selected: i32,
        plan: &mut Vec<(i32, i32)>,
    ) {
        if !state.priority_boosting {
            return;
        }
        let restore: Vec<(i32, i32)> = state
            .procs
            .iter()
            .filter(|(pid, proc)| **pid != selected && proc.applied_nice.is_some())
            .map(|(pid, proc)| (*pid, proc.base_nice))
            .collect();
        for (pid, base) in restore {
            if let Some(proc) = state.procs.get_mut(&pid) {
                proc.applied_nice = None;
            }
            plan.push((pid, base));
        }

        if let Some(proc) = state.procs.get_mut(&selected) {
            if proc.class == ProcessClass::System {
                return;
            }
            let (nice_min, nice_max) = state
                .class_policies
                .get(&proc.class)
                .map(|p| (p.nice_min, p.nice_max))
                .unwrap_or((NICE_MIN, NICE_MAX));
            let target = (proc.base_nice - FAVOR_NICE_DROP).clamp(nice_min, nice_max);
            if proc.applied_nice != Some(target) {
                proc.applied_nice = Some(target);
                plan.push((selected, target));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{record, snapshot, FakeControl};
    use std::sync::Mutex as StdMutex;

    fn engine(algorithm: SchedulingAlgorithm) -> (Scheduler, Arc<FakeControl>, Arc<EventBus>) {
        let control = FakeControl::new();
        let bus = Arc::new(EventBus::new());
        let sched = Scheduler::new(
            SchedulerConfig::default(),
            algorithm,
            control.clone(),
            bus.clone(),
        );
        (sched, control, bus)
    }

    fn collect_events(bus: &EventBus) -> Arc<StdMutex<Vec<Event>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_cb = seen.clone();
        bus.subscribe(move |e| seen_cb.lock().unwrap().push(e.clone()));
        seen
    }

    #[test]
    fn empty_snapshot_tick_is_a_noop() {
        let (sched, _control, _bus) = engine(SchedulingAlgorithm::Priority);
        sched.tick_with(&snapshot(1, 40.0, vec![]));
        let stats = sched.statistics();
        assert_eq!(stats.active_processes, 0);
        assert_eq!(stats.context_switches, 0);
    }

    #[test]
    fn processes_enroll_from_snapshot_and_retire_when_dead() {
        let (sched, control, _bus) = engine(SchedulingAlgorithm::Priority);
        control.add_process(10, "steam", 0);
        control.add_process(11, "make", 0);
        sched.tick_with(&snapshot(
            1,
            40.0,
            vec![record(10, "steam", 20.0, 1000), record(11, "make", 50.0, 1000)],
        ));
        assert_eq!(sched.statistics().active_processes, 2);

        control.kill_process(11);
        sched.tick_with(&snapshot(2, 40.0, vec![record(10, "steam", 20.0, 1000)]));
        assert_eq!(sched.statistics().active_processes, 1);
        assert!(sched.process(11).is_none());
    }

    #[test]
    fn missing_from_snapshot_but_alive_is_kept() {
        let (sched, control, _bus) = engine(SchedulingAlgorithm::Priority);
        control.add_process(10, "steam", 0);
        sched.tick_with(&snapshot(1, 40.0, vec![record(10, "steam", 20.0, 1000)]));
        // Snapshot lags but the process still answers the null signal.
        sched.tick_with(&snapshot(2, 40.0, vec![]));
        assert_eq!(sched.statistics().active_processes, 1);
    }

    #[test]
    fn favored_process_gets_nice_drop_and_restore() {
        let (sched, control, bus) = engine(SchedulingAlgorithm::Priority);
        let events = collect_events(&bus);
        control.add_process(10, "steam", 0);
        control.add_process(11, "mystery", 0);
        // steam: Interactive (+5); mystery idles down to Idle class.
        let snap = snapshot(
            1,
            40.0,
            vec![record(10, "steam", 30.0, 1000), record(11, "mystery", 1.0, 100)],
        );
        sched.tick_with(&snap);
        assert_eq!(control.nice(10), Some(-2));

        // Now pin 11 as real-time: selection flips, 10 is restored to base.
        sched.set_realtime(11, 50);
        sched.tick_with(&snap);
        assert_eq!(control.nice(10), Some(0));
        assert_eq!(control.nice(11), Some(-2));
        let saw_set_priority = events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Event::ProcessAction { pid: 10, action: ProcessActionKind::SetPriority, ok: true, .. }));
        assert!(saw_set_priority);
    }

    #[test]
    fn boosting_disabled_means_no_actuation() {
        let (sched, control, _bus) = engine(SchedulingAlgorithm::Priority);
        control.add_process(10, "steam", 0);
        sched.set_priority_boosting(false);
        sched.tick_with(&snapshot(1, 40.0, vec![record(10, "steam", 30.0, 1000)]));
        assert_eq!(control.nice(10), Some(0));
        assert!(control.call_log().iter().all(|c| !c.starts_with("set_nice")));
    }

    #[test]
    fn round_robin_alternates_between_processes() {
        let (sched, control, _bus) = engine(SchedulingAlgorithm::RoundRobin);
        control.add_process(10, "alpha", 0);
        control.add_process(11, "beta", 0);
        let snap = snapshot(
            1,
            40.0,
            vec![record(10, "alpha", 30.0, 100), record(11, "beta", 30.0, 100)],
        );
        sched.tick_with(&snap);
        sched.tick_with(&snap);
        sched.tick_with(&snap);
        sched.tick_with(&snap);
        let p10 = sched.process(10).unwrap();
        let p11 = sched.process(11).unwrap();
        assert_eq!(p10.schedule_count, 2);
        assert_eq!(p11.schedule_count, 2);
        assert!(sched.statistics().context_switches >= 3);
    }

    #[test]
    fn mlfq_demotes_after_repeated_selection() {
        let (sched, control, _bus) = engine(SchedulingAlgorithm::MultilevelFeedback);
        control.add_process(10, "solo", 0);
        let snap = snapshot(1, 40.0, vec![record(10, "solo", 30.0, 100)]);
        for _ in 0..6 {
            sched.tick_with(&snap);
        }
        let proc = sched.process(10).unwrap();
        assert!(proc.queue_level >= 1, "queue_level = {}", proc.queue_level);
        assert!(proc.queue_level < MLFQ_LEVELS);
    }

    #[test]
    fn cfs_accumulates_virtual_runtime_and_alternates() {
        let (sched, control, _bus) = engine(SchedulingAlgorithm::CompletelyFair);
        control.add_process(10, "alpha", 0);
        control.add_process(11, "beta", 0);
        let snap = snapshot(
            1,
            40.0,
            vec![record(10, "alpha", 50.0, 100), record(11, "beta", 50.0, 100)],
        );
        for _ in 0..4 {
            sched.tick_with(&snap);
        }
        let p10 = sched.process(10).unwrap();
        let p11 = sched.process(11).unwrap();
        assert!(p10.virtual_runtime > 0.0);
        assert!(p11.virtual_runtime > 0.0);
        assert_eq!(p10.schedule_count + p11.schedule_count, 4);
        assert_eq!(p10.schedule_count, 2);
    }

    #[test]
    fn realtime_override_preempts_algorithm() {
        let (sched, control, _bus) = engine(SchedulingAlgorithm::CompletelyFair);
        control.add_process(10, "alpha", 0);
        control.add_process(11, "beta", 0);
        sched.set_realtime(11, 10);
        let snap = snapshot(
            1,
            40.0,
            vec![record(10, "alpha", 50.0, 100), record(11, "beta", 0.5, 100)],
        );
        for _ in 0..3 {
            sched.tick_with(&snap);
        }
        assert_eq!(sched.process(11).unwrap().schedule_count, 3);
        assert_eq!(sched.process(10).unwrap().schedule_count, 0);
    }

    #[test]
    fn starvation_boost_fires_exactly_once_per_interval() {
        let (sched, control, bus) = engine(SchedulingAlgorithm::RoundRobin);
        let events = collect_events(&bus);
        control.add_process(10, "greedy", 0);
        control.add_process(11, "starved", 0);
        sched.set_realtime(10, 1);
        sched.set_starvation_threshold(Duration::from_millis(40));
        let snap = snapshot(
            1,
            40.0,
            vec![record(10, "greedy", 60.0, 100), record(11, "starved", 10.0, 100)],
        );
        sched.tick_with(&snap);
        let before = sched.process(11).unwrap().dynamic_priority;
        std::thread::sleep(Duration::from_millis(50));
        for _ in 0..5 {
            sched.tick_with(&snap);
        }
        let boosts: Vec<_> = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Event::StarvationBoosted { pid: 11 }))
            .cloned()
            .collect();
        assert_eq!(boosts.len(), 1);
        let after = sched.process(11).unwrap().dynamic_priority;
        assert_eq!(after, (before + 10 + STARVATION_BOOST).min(PRIORITY_CEIL));
        assert_eq!(sched.statistics().starvation_boosts, 1);
    }

    #[test]
    fn slices_shrink_under_load_and_relax_after() {
        let (sched, control, _bus) = engine(SchedulingAlgorithm::Priority);
        control.add_process(10, "alpha", 0);
        let mut busy = snapshot(1, 40.0, vec![record(10, "alpha", 30.0, 100)]);
        busy.cpu_total_percent = 95.0;
        sched.tick_with(&busy);
        let shrunk = sched.process(10).unwrap().time_slice_ms;
        assert_eq!(shrunk, 80);

        let mut calm = snapshot(2, 40.0, vec![record(10, "alpha", 30.0, 100)]);
        calm.cpu_total_percent = 10.0;
        sched.tick_with(&calm);
        let relaxed = sched.process(10).unwrap().time_slice_ms;
        assert!(relaxed > shrunk);
        assert!(relaxed <= DEFAULT_SLICE_MS);
    }

    #[test]
    fn slice_never_drops_below_minimum() {
        let (sched, control, _bus) = engine(SchedulingAlgorithm::Priority);
        control.add_process(10, "alpha", 0);
        let mut busy = snapshot(1, 40.0, vec![record(10, "alpha", 30.0, 100)]);
        busy.cpu_total_percent = 95.0;
        for _ in 0..50 {
            sched.tick_with(&busy);
        }
        let proc = sched.process(10).unwrap();
        assert_eq!(proc.time_slice_ms, MIN_SLICE_MS);
    }

    #[test]
    fn set_default_slice_clamps_to_bounds() {
        let (sched, _control, _bus) = engine(SchedulingAlgorithm::Priority);
        sched.set_default_slice(5);
        sched.register(10);
        assert_eq!(sched.process(10).unwrap().time_slice_ms, MIN_SLICE_MS);
        sched.set_default_slice(9999);
        assert_eq!(sched.process(10).unwrap().time_slice_ms, MAX_SLICE_MS);
    }

    #[test]
    fn algorithm_switch_reenrolls_everyone() {
        let (sched, control, _bus) = engine(SchedulingAlgorithm::Priority);
        control.add_process(10, "alpha", 0);
        control.add_process(11, "beta", 0);
        let snap = snapshot(
            1,
            40.0,
            vec![record(10, "alpha", 30.0, 100), record(11, "beta", 30.0, 100)],
        );
        sched.tick_with(&snap);
        sched.set_algorithm(SchedulingAlgorithm::RoundRobin);
        assert_eq!(sched.algorithm(), SchedulingAlgorithm::RoundRobin);
        sched.tick_with(&snap);
        sched.tick_with(&snap);
        let total = sched.process(10).unwrap().schedule_count
            + sched.process(11).unwrap().schedule_count;
        assert!(total >= 2);
    }

    #[test]
    fn register_and_unregister_are_idempotent() {
        let (sched, _control, _bus) = engine(SchedulingAlgorithm::Priority);
        sched.register(10);
        sched.register(10);
        assert_eq!(sched.statistics().active_processes, 1);
        sched.unregister(10);
        sched.unregister(10);
        assert_eq!(sched.statistics().active_processes, 0);
    }

    #[test]
    fn dead_pid_actuation_reports_not_found_event() {
        let (sched, control, bus) = engine(SchedulingAlgorithm::Priority);
        let events = collect_events(&bus);
        control.add_process(10, "alpha", 0);
        let snap = snapshot(1, 40.0, vec![record(10, "alpha", 30.0, 100)]);
        // Dies between snapshot and actuation.
        control.kill_process(10);
        sched.tick_with(&snap);
        let saw_failure = events.lock().unwrap().iter().any(|e| {
            matches!(
                e,
                Event::ProcessAction {
                    pid: 10,
                    action: ProcessActionKind::SetPriority,
                    ok: false,
                    cause: Some(_),
                }
            )
        });
        assert!(saw_failure);
        // Confirmed dead on the next tick with a fresh snapshot.
        sched.tick_with(&snapshot(2, 40.0, vec![]));
        assert!(sched.process(10).is_none());
    }

    #[test]
    fn over_limit_processes_emit_resource_events_once() {
        let (sched, control, bus) = engine(SchedulingAlgorithm::Priority);
        let events = collect_events(&bus);
        control.add_process(10, "hog", 0);
        sched.set_max_cpu_percent(50.0);
        let snap = snapshot(1, 40.0, vec![record(10, "hog", 75.0, 100)]);
        sched.tick_with(&snap);
        sched.tick_with(&snap);
        let count = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Event::ResourceLimitExceeded { pid: 10, .. }))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn class_policy_overrides_slice_and_bounds() {
        let (sched, control, _bus) = engine(SchedulingAlgorithm::Priority);
        control.add_process(10, "steam", 0);
        sched.set_algorithm_for_class(
            ProcessClass::Interactive,
            ClassPolicy {
                algorithm: SchedulingAlgorithm::Priority,
                slice_ms: 30,
                nice_min: -10,
                nice_max: 5,
            },
        );
        sched.tick_with(&snapshot(1, 40.0, vec![record(10, "steam", 30.0, 100)]));
        assert_eq!(sched.process(10).unwrap().time_slice_ms, 30);
        // Favor drop is clamped into the class bounds.
        assert_eq!(control.nice(10), Some(-2));
    }

    #[test]
    fn invariant_slice_and_level_bounds_hold() {
        let (sched, control, _bus) = engine(SchedulingAlgorithm::MultilevelFeedback);
        for pid in 10..20 {
            control.add_process(pid, "worker", 0);
        }
        let records: Vec<_> = (10..20).map(|p| record(p, "worker", 30.0, 100)).collect();
        let snap = snapshot(1, 40.0, records);
        for _ in 0..40 {
            sched.tick_with(&snap);
        }
        for pid in 10..20 {
            let proc = sched.process(pid).unwrap();
            assert!((MIN_SLICE_MS..=MAX_SLICE_MS).contains(&proc.time_slice_ms));
            assert!(proc.queue_level < MLFQ_LEVELS);
        }
    }
}
