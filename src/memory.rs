//! Memory pressure controller.
//!
//! Rides the observer's tick through a subscription, classifies pressure
//! from the snapshot and, when auto actions are enabled, walks the
//! escalation ladder. Critical processes are never reclaimed from.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;

use crate::actuator::{CacheDropKind, SystemControl, NICE_MAX};
use crate::error::ControlError;
use crate::events::{process_action, Event, EventBus, ProcessActionKind, ReclamationKind};
use crate::observer::Observer;
use crate::snapshot::{MemoryPressure, SystemSnapshot};

/// Smoothing factor for the per-process RSS growth trend.
const TREND_EWMA_ALPHA: f64 = 0.2;
const TERMINATE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStrategy {
    Conservative,
    Balanced,
    Aggressive,
}

impl FromStr for MemoryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "conservative" => Ok(MemoryStrategy::Conservative),
            "balanced" => Ok(MemoryStrategy::Balanced),
            "aggressive" => Ok(MemoryStrategy::Aggressive),
            other => Err(format!("unknown memory strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub low_threshold_percent: f64,
    pub critical_threshold_percent: f64,
    /// Stop condition for emergency termination. None means 5% of MemTotal.
    pub minimum_free_kb: Option<u64>,
    /// Master switch for automatic reclamation.
    pub auto_reclaim: bool,
    /// Whether the Medium level may drop the page cache.
    pub cache_trim: bool,
    pub max_kill_attempts: usize,
    pub top_consumers: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            low_threshold_percent: 70.0,
            critical_threshold_percent: 90.0,
            minimum_free_kb: None,
            auto_reclaim: true,
            cache_trim: true,
            max_kill_attempts: 10,
            top_consumers: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemoryStats {
    pub reclamation_steps: u64,
    pub emergency_terminations: u64,
    pub last_pressure: Option<MemoryPressure>,
}

struct MemState {
    strategy: MemoryStrategy,
    config: MemoryConfig,
    swap_enabled: bool,
    trend: HashMap<i32, f64>,
    drop_failure_reported: bool,
    stats: MemoryStats,
}

struct MemInner {
    state: Mutex<MemState>,
    control: Arc<dyn SystemControl>,
    bus: Arc<EventBus>,
}

pub struct MemoryController {
    inner: Arc<MemInner>,
}

impl MemoryController {
    pub fn new(config: MemoryConfig, control: Arc<dyn SystemControl>, bus: Arc<EventBus>) -> Self {
        MemoryController {
            inner: Arc::new(MemInner {
                state: Mutex::new(MemState {
                    strategy: MemoryStrategy::Balanced,
                    config,
                    swap_enabled: true,
                    trend: HashMap::new(),
                    drop_failure_reported: false,
                    stats: MemoryStats::default(),
                }),
                control,
                bus,
            }),
        }
    }

    /// Piggyback on the observer: one handler invocation per snapshot.
    pub fn attach(&self, observer: &Observer) {
        let inner = self.inner.clone();
        observer.subscribe(move |snapshot| inner.on_snapshot(snapshot));
    }

    /// Classify pressure with the controller's thresholds and strategy
    /// modifiers applied.
    pub fn classify(&self, used_percent: f64) -> MemoryPressure {
        let state = self.inner.state.lock().unwrap();
        classify_with(&state, used_percent)
    }

    pub fn set_strategy(&self, strategy: MemoryStrategy) {
        let mut state = self.inner.state.lock().unwrap();
        if state.strategy != strategy {
            info!("[memory] strategy {:?} -> {:?}", state.strategy, strategy);
            state.strategy = strategy;
        }
    }

    pub fn strategy(&self) -> MemoryStrategy {
        self.inner.state.lock().unwrap().strategy
    }

    pub fn set_low_threshold(&self, percent: f64) {
        self.inner.state.lock().unwrap().config.low_threshold_percent = percent.clamp(1.0, 99.0);
    }

    pub fn set_auto_reclaim(&self, enabled: bool) {
        self.inner.state.lock().unwrap().config.auto_reclaim = enabled;
    }

    pub fn set_swap_enabled(&self, enabled: bool) {
        self.inner.state.lock().unwrap().swap_enabled = enabled;
    }

    pub fn swap_enabled(&self) -> bool {
        self.inner.state.lock().unwrap().swap_enabled
    }

    pub fn stats(&self) -> MemoryStats {
        self.inner.state.lock().unwrap().stats
    }

    /// Run one controller pass against a snapshot. Tests drive this
    /// directly; production passes come from the observer subscription.
    pub fn handle(&self, snapshot: &SystemSnapshot) {
        self.inner.on_snapshot(snapshot);
    }
}

fn classify_with(state: &MemState, used_percent: f64) -> MemoryPressure {
    let (low, critical) = match state.strategy {
        MemoryStrategy::Conservative => (
            state.config.low_threshold_percent + 10.0,
            (state.config.critical_threshold_percent + 10.0).min(99.0),
        ),
        MemoryStrategy::Balanced => (
            state.config.low_threshold_percent,
            state.config.critical_threshold_percent,
        ),
        MemoryStrategy::Aggressive => (
            state.config.low_threshold_percent - 5.0,
            state.config.critical_threshold_percent - 5.0,
        ),
    };
    MemoryPressure::classify(used_percent, low, critical)
}

impl MemInner {
    fn on_snapshot(&self, snapshot: &SystemSnapshot) {
        let mut events: Vec<Event> = Vec::new();
        let plan;
        {
            let mut state = self.state.lock().unwrap();
            self.update_trends(&mut state, snapshot);

            let classified = classify_with(&state, snapshot.mem_used_percent());
            let acted = match state.strategy {
                // Aggressive acts one level above what it classified.
                MemoryStrategy::Aggressive => classified.escalate(),
                _ => classified,
            };
            state.stats.last_pressure = Some(classified);

            if !state.config.auto_reclaim {
                return;
            }
            plan = self.build_plan(&state, acted, snapshot);
        }

        self.execute(plan, &mut events);
        for event in events {
            self.bus.emit(event);
        }
    }

    fn update_trends(&self, state: &mut MemState, snapshot: &SystemSnapshot) {
        state.trend.retain(|pid, _| snapshot.contains_pid(*pid));
        for record in snapshot.processes.values() {
            let entry = state.trend.entry(record.pid).or_insert(0.0);
            *entry =
                TREND_EWMA_ALPHA * record.growth_rate_kb_per_s + (1.0 - TREND_EWMA_ALPHA) * *entry;
        }
    }

    fn build_plan(
        &self,
        state: &MemState,
        level: MemoryPressure,
        snapshot: &SystemSnapshot,
    ) -> ReclaimPlan {
        let mut plan = ReclaimPlan::default();
        match level {
            MemoryPressure::Low => {}
            MemoryPressure::Medium => {
                if state.config.cache_trim {
                    plan.drop_caches = Some(CacheDropKind::Page);
                }
            }
            MemoryPressure::High => {
                plan.drop_caches = Some(CacheDropKind::All);
                plan.deprioritize = self.top_consumers(state, snapshot, state.config.top_consumers);
            }
            MemoryPressure::Critical => {
                plan.drop_caches = Some(CacheDropKind::All);
                plan.compact = true;
                let minimum_free = state
                    .config
                    .minimum_free_kb
                    .unwrap_or(snapshot.mem_total_kb / 20);
                let mut available = snapshot.mem_available_kb;
                let candidates =
                    self.top_consumers(state, snapshot, state.config.max_kill_attempts);
                for (pid, rss_kb) in candidates {
                    if available >= minimum_free
                        || plan.terminate.len() >= state.config.max_kill_attempts
                    {
                        break;
                    }
                    plan.terminate.push((pid, rss_kb));
                    // The snapshot is a tick old; credit the estimate so one
                    // pass does not cascade past the stop condition.
                    available = available.saturating_add(rss_kb);
                }
            }
        }
        plan
    }

    /// Largest non-critical residents first; RSS ties go to the process
    /// whose footprint is trending up.
    fn top_consumers(
        &self,
        state: &MemState,
        snapshot: &SystemSnapshot,
        k: usize,
    ) -> Vec<(i32, u64)> {
        let mut candidates: Vec<_> = snapshot
            .processes
            .values()
            .filter(|r| !r.is_critical)
            .map(|r| {
                let trend = state.trend.get(&r.pid).copied().unwrap_or(0.0);
                (r.pid, r.rss_kb, trend)
            })
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.total_cmp(&a.2)));
        candidates
            .into_iter()
            .take(k)
            .map(|(pid, rss, _)| (pid, rss))
            .collect()
    }

    fn execute(&self, plan: ReclaimPlan, events: &mut Vec<Event>) {
        if let Some(kind) = plan.drop_caches {
            let result = self.control.drop_caches(kind);
            let reclamation = match kind {
                CacheDropKind::Page => ReclamationKind::DropPageCache,
                CacheDropKind::All => ReclamationKind::DropAllCaches,
            };
            events.push(Event::ReclamationStep {
                kind: reclamation,
                freed_kb: 0,
                ok: result.is_ok(),
            });
            self.note_drop_result(&result);
            self.state.lock().unwrap().stats.reclamation_steps += 1;
        }

        if plan.compact {
            let result = self.control.compact_memory();
            events.push(Event::ReclamationStep {
                kind: ReclamationKind::CompactMemory,
                freed_kb: 0,
                ok: result.is_ok(),
            });
            self.note_drop_result(&result);
            self.state.lock().unwrap().stats.reclamation_steps += 1;
        }

        for (pid, _rss) in &plan.deprioritize {
            if !self.control.can_modify(*pid) {
                continue;
            }
            let target = self
                .control
                .nice_of(*pid)
                .map(|n| (n + 5).min(NICE_MAX))
                .unwrap_or(NICE_MAX);
            let result = self.control.set_nice(*pid, target);
            if let Err(e) = &result {
                debug!("[memory] deprioritize pid {pid} failed: {e}");
            }
            events.push(process_action(*pid, ProcessActionKind::SetPriority, &result));
        }

        for (pid, rss_kb) in &plan.terminate {
            if !self.control.can_modify(*pid) {
                continue;
            }
            let result = self.control.terminate(*pid, TERMINATE_TIMEOUT);
            if result.is_ok() {
                let mut state = self.state.lock().unwrap();
                state.stats.emergency_terminations += 1;
                state.stats.reclamation_steps += 1;
            } else if let Err(e) = &result {
                warn!("[memory] emergency terminate of pid {pid} failed: {e}");
            }
            events.push(Event::ReclamationStep {
                kind: ReclamationKind::TerminateProcess,
                freed_kb: *rss_kb,
                ok: result.is_ok(),
            });
            events.push(process_action(*pid, ProcessActionKind::Terminate, &result));
        }
    }

    /// A failed cache drop degrades the level to a no-op; report the
    /// failure once per transition and retry next tick.
    fn note_drop_result(&self, result: &crate::error::Result<()>) {
        let mut state = self.state.lock().unwrap();
        match result {
            Err(e @ ControlError::PermissionDenied { .. }) if !state.drop_failure_reported => {
                warn!("[memory] reclamation degraded: {e}");
                state.drop_failure_reported = true;
            }
            Ok(()) if state.drop_failure_reported => {
                info!("[memory] reclamation actuator recovered");
                state.drop_failure_reported = false;
            }
            _ => {}
        }
    }
}

#[derive(Default)]
struct ReclaimPlan {
    drop_caches: Option<CacheDropKind>,
    compact: bool,
    deprioritize: Vec<(i32, u64)>,
    terminate: Vec<(i32, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{record, snapshot, FakeControl};
    use std::sync::atomic::Ordering;
    use std::sync::Mutex as StdMutex;

    fn controller() -> (MemoryController, Arc<FakeControl>, Arc<EventBus>) {
        let control = FakeControl::new();
        let bus = Arc::new(EventBus::new());
        let ctl = MemoryController::new(MemoryConfig::default(), control.clone(), bus.clone());
        (ctl, control, bus)
    }

    fn collect_events(bus: &EventBus) -> Arc<StdMutex<Vec<Event>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_cb = seen.clone();
        bus.subscribe(move |e| seen_cb.lock().unwrap().push(e.clone()));
        seen
    }

    #[test]
    fn strategy_shifts_classification() {
        let (ctl, _control, _bus) = controller();
        assert_eq!(ctl.classify(75.0), MemoryPressure::Medium);
        ctl.set_strategy(MemoryStrategy::Conservative);
        assert_eq!(ctl.classify(75.0), MemoryPressure::Low);
        ctl.set_strategy(MemoryStrategy::Aggressive);
        assert_eq!(ctl.classify(70.0), MemoryPressure::Medium);
        assert_eq!(ctl.classify(75.0), MemoryPressure::High);
        assert_eq!(ctl.classify(86.0), MemoryPressure::Critical);
    }

    #[test]
    fn low_pressure_takes_no_action() {
        let (ctl, control, _bus) = controller();
        ctl.handle(&snapshot(1, 30.0, vec![record(10, "idle", 1.0, 1000)]));
        assert!(control.call_log().is_empty());
    }

    #[test]
    fn medium_pressure_drops_page_cache() {
        let (ctl, control, bus) = controller();
        let events = collect_events(&bus);
        ctl.handle(&snapshot(1, 75.0, vec![]));
        assert_eq!(control.call_log(), vec!["drop_caches(Page)"]);
        assert!(events.lock().unwrap().iter().any(|e| matches!(
            e,
            Event::ReclamationStep { kind: ReclamationKind::DropPageCache, ok: true, .. }
        )));
    }

    #[test]
    fn medium_pressure_with_cache_trim_disabled_is_a_noop() {
        let control = FakeControl::new();
        let bus = Arc::new(EventBus::new());
        let config = MemoryConfig {
            cache_trim: false,
            ..Default::default()
        };
        let ctl = MemoryController::new(config, control.clone(), bus);
        ctl.handle(&snapshot(1, 75.0, vec![]));
        assert!(control.call_log().is_empty());
    }

    #[test]
    fn high_pressure_deprioritizes_top_consumers() {
        let (ctl, control, _bus) = controller();
        for pid in 1..=7 {
            control.add_process(pid, "worker", 0);
        }
        let records = (1..=7)
            .map(|pid| record(pid, "worker", 5.0, pid as u64 * 100_000))
            .collect();
        ctl.handle(&snapshot(1, 85.0, records));
        // Top five by RSS are pids 7..3.
        for pid in 3..=7 {
            assert_eq!(control.nice(pid), Some(5), "pid {pid}");
        }
        assert_eq!(control.nice(1), Some(0));
        assert_eq!(control.nice(2), Some(0));
    }

    #[test]
    fn high_pressure_skips_critical_processes() {
        let (ctl, control, _bus) = controller();
        control.add_process(1, "systemd", 0);
        control.add_process(2, "chrome", 0);
        ctl.handle(&snapshot(
            1,
            85.0,
            vec![record(1, "systemd", 2.0, 900_000), record(2, "chrome", 5.0, 100_000)],
        ));
        assert_eq!(control.nice(1), Some(0));
        assert_eq!(control.nice(2), Some(5));
    }

    #[test]
    fn critical_pressure_escalates_to_termination() {
        let (ctl, control, bus) = controller();
        let events = collect_events(&bus);
        control.add_process(10, "hog", 0);
        control.add_process(11, "medium", 0);
        ctl.handle(&snapshot(
            1,
            97.0,
            vec![record(10, "hog", 10.0, 400_000), record(11, "medium", 5.0, 100_000)],
        ));

        let log = control.call_log();
        assert_eq!(log[0], "drop_caches(All)");
        assert_eq!(log[1], "compact_memory()");
        assert!(log.contains(&"terminate(10)".to_string()));

        let seen = events.lock().unwrap();
        let kinds: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                Event::ReclamationStep { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds[0], ReclamationKind::DropAllCaches);
        assert_eq!(kinds[1], ReclamationKind::CompactMemory);
        assert!(kinds.contains(&ReclamationKind::TerminateProcess));
    }

    #[test]
    fn critical_pressure_never_terminates_critical_processes() {
        let (ctl, control, _bus) = controller();
        control.add_process(1, "systemd", 0);
        ctl.handle(&snapshot(1, 97.0, vec![record(1, "systemd", 2.0, 950_000)]));
        assert!(control.terminated.lock().unwrap().is_empty());
    }

    #[test]
    fn emergency_termination_is_bounded() {
        let (ctl, control, _bus) = controller();
        // Tiny processes: freeing them never reaches minimum_free.
        let mut records = Vec::new();
        for pid in 1..=40 {
            control.add_process(pid, "tiny", 0);
            records.push(record(pid, "tiny", 1.0, 10));
        }
        ctl.handle(&snapshot(1, 99.0, records));
        assert!(control.terminated.lock().unwrap().len() <= 10);
        assert_eq!(ctl.stats().emergency_terminations as usize,
                   control.terminated.lock().unwrap().len());
    }

    #[test]
    fn termination_stops_once_enough_is_free() {
        let (ctl, control, _bus) = controller();
        control.add_process(10, "hog", 0);
        control.add_process(11, "hog2", 0);
        // One kill frees 400 MB, far past the 5% stop condition.
        ctl.handle(&snapshot(
            1,
            97.0,
            vec![record(10, "hog", 5.0, 400_000), record(11, "hog2", 5.0, 300_000)],
        ));
        assert_eq!(*control.terminated.lock().unwrap(), vec![10]);
    }

    #[test]
    fn auto_reclaim_disabled_only_classifies() {
        let (ctl, control, _bus) = controller();
        ctl.set_auto_reclaim(false);
        ctl.handle(&snapshot(1, 95.0, vec![]));
        assert!(control.call_log().is_empty());
        assert_eq!(ctl.stats().last_pressure, Some(MemoryPressure::Critical));
    }

    #[test]
    fn drop_cache_failure_degrades_and_reports_once() {
        let (ctl, control, bus) = controller();
        let events = collect_events(&bus);
        control.fail_set_governor.store(false, Ordering::SeqCst);
        control.fail_drop_caches.store(true, Ordering::SeqCst);
        ctl.handle(&snapshot(1, 75.0, vec![]));
        ctl.handle(&snapshot(2, 75.0, vec![]));
        let failures = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Event::ReclamationStep { ok: false, .. }))
            .count();
        // Both ticks retried and reported the failed step as an event.
        assert_eq!(failures, 2);
        // Recovery clears the latch.
        control.fail_drop_caches.store(false, Ordering::SeqCst);
        ctl.handle(&snapshot(3, 75.0, vec![]));
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Event::ReclamationStep { ok: true, .. })));
    }

    #[test]
    fn equal_rss_prefers_growing_process() {
        let (ctl, control, _bus) = controller();
        control.add_process(10, "flat", 0);
        control.add_process(11, "growing", 0);
        let mut flat = record(10, "flat", 5.0, 200_000);
        flat.growth_rate_kb_per_s = 0.0;
        let mut growing = record(11, "growing", 5.0, 200_000);
        growing.growth_rate_kb_per_s = 5_000.0;

        // Build up the trend at low pressure first.
        ctl.handle(&snapshot(1, 30.0, vec![flat.clone(), growing.clone()]));
        ctl.handle(&snapshot(2, 30.0, vec![flat.clone(), growing.clone()]));
        ctl.handle(&snapshot(3, 97.0, vec![flat, growing]));
        let terminated = control.terminated.lock().unwrap();
        assert_eq!(terminated.first(), Some(&11));
    }
}
