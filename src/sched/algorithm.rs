//! Selection disciplines. Exactly one is active at a time; the engine owns
//! the queues and calls the discipline on every scheduling tick.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;

use serde::Serialize;

use super::ScheduledProcess;

pub const MLFQ_LEVELS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingAlgorithm {
    Priority,
    RoundRobin,
    MultilevelFeedback,
    CompletelyFair,
}

impl FromStr for SchedulingAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "priority" => Ok(SchedulingAlgorithm::Priority),
            "rr" | "round-robin" => Ok(SchedulingAlgorithm::RoundRobin),
            "mlfq" | "multilevel" => Ok(SchedulingAlgorithm::MultilevelFeedback),
            "cfs" | "fair" => Ok(SchedulingAlgorithm::CompletelyFair),
            other => Err(format!("unknown scheduling algorithm: {other}")),
        }
    }
}

/// CFS weight from a nice value. Nice −20 would zero the denominator, so it
/// is floored at the −19 weight step.
pub fn cfs_weight(nice: i32) -> f64 {
    let denominator = (1.0 + nice as f64 / 20.0).max(0.05);
    1.0 / denominator
}

/// FIFO structures for the queue-based disciplines. The map-scanning
/// disciplines (Priority, CompletelyFair) keep no state here.
#[derive(Debug, Default)]
pub struct RunQueues {
    pub round_robin: VecDeque<i32>,
    pub levels: [VecDeque<i32>; MLFQ_LEVELS],
}

impl RunQueues {
    pub fn clear(&mut self) {
        self.round_robin.clear();
        for level in &mut self.levels {
            level.clear();
        }
    }

    pub fn enroll(&mut self, pid: i32, queue_level: usize) {
        self.round_robin.push_back(pid);
        self.levels[queue_level.min(MLFQ_LEVELS - 1)].push_back(pid);
    }

    pub fn remove(&mut self, pid: i32) {
        self.round_robin.retain(|p| *p != pid);
        for level in &mut self.levels {
            level.retain(|p| *p != pid);
        }
    }
}

/// Highest dynamic priority wins; ties go to the least recently scheduled.
pub fn select_priority(procs: &HashMap<i32, ScheduledProcess>) -> Option<i32> {
    procs
        .values()
        .max_by(|a, b| {
            a.dynamic_priority
                .cmp(&b.dynamic_priority)
                // Reverse: the older (or never) last_scheduled_at should win.
                .then_with(|| b.last_scheduled_key().cmp(&a.last_scheduled_key()))
                .then_with(|| b.pid.cmp(&a.pid))
        })
        .map(|p| p.pid)
}

/// Pop the head, requeue it at the tail. Entries for pids no longer known
/// are discarded as they surface.
pub fn select_round_robin(
    queue: &mut VecDeque<i32>,
    procs: &HashMap<i32, ScheduledProcess>,
) -> Option<i32> {
    while let Some(pid) = queue.pop_front() {
        if procs.contains_key(&pid) {
            queue.push_back(pid);
            return Some(pid);
        }
    }
    None
}

/// Head of the lowest-index nonempty queue. The caller decides the requeue
/// level (same or demoted) and pushes the pid back.
pub fn select_mlfq(
    levels: &mut [VecDeque<i32>; MLFQ_LEVELS],
    procs: &HashMap<i32, ScheduledProcess>,
) -> Option<(i32, usize)> {
    for (index, level) in levels.iter_mut().enumerate() {
        while let Some(pid) = level.pop_front() {
            if procs.contains_key(&pid) {
                return Some((pid, index));
            }
        }
    }
    None
}

/// Whether a process selected at `level` has exhausted its stay there.
pub fn mlfq_should_demote(schedule_count: u64, level: usize) -> bool {
    schedule_count > 3 * (level as u64 + 1)
}

/// Minimum virtual runtime wins; ties go to the lower pid for determinism.
pub fn select_cfs(procs: &HashMap<i32, ScheduledProcess>) -> Option<i32> {
    procs
        .values()
        .min_by(|a, b| {
            a.virtual_runtime
                .total_cmp(&b.virtual_runtime)
                .then_with(|| a.pid.cmp(&b.pid))
        })
        .map(|p| p.pid)
}

#[cfg(test)]
mod tests {
    use super::super::ScheduledProcess;
    use super::*;
    use crate::sched::classify::ProcessClass;
    use std::time::Instant;

    fn proc_with(pid: i32, dynamic_priority: i32, vruntime: f64) -> ScheduledProcess {
        let mut p = ScheduledProcess::new(pid, ProcessClass::Interactive, 0, 100);
        p.dynamic_priority = dynamic_priority;
        p.virtual_runtime = vruntime;
        p
    }

    fn map(entries: Vec<ScheduledProcess>) -> HashMap<i32, ScheduledProcess> {
        entries.into_iter().map(|p| (p.pid, p)).collect()
    }

    #[test]
    fn algorithm_parsing() {
        assert_eq!(
            "priority".parse::<SchedulingAlgorithm>().unwrap(),
            SchedulingAlgorithm::Priority
        );
        assert_eq!(
            "rr".parse::<SchedulingAlgorithm>().unwrap(),
            SchedulingAlgorithm::RoundRobin
        );
        assert_eq!(
            "mlfq".parse::<SchedulingAlgorithm>().unwrap(),
            SchedulingAlgorithm::MultilevelFeedback
        );
        assert_eq!(
            "cfs".parse::<SchedulingAlgorithm>().unwrap(),
            SchedulingAlgorithm::CompletelyFair
        );
        assert!("fifo".parse::<SchedulingAlgorithm>().is_err());
    }

    #[test]
    fn priority_picks_highest() {
        let procs = map(vec![proc_with(1, 3, 0.0), proc_with(2, 9, 0.0), proc_with(3, 5, 0.0)]);
        assert_eq!(select_priority(&procs), Some(2));
    }

    #[test]
    fn priority_tie_goes_to_least_recently_scheduled() {
        let mut a = proc_with(1, 5, 0.0);
        let b = proc_with(2, 5, 0.0);
        a.last_scheduled_at = Some(Instant::now());
        let procs = map(vec![a, b]);
        // pid 2 has never been scheduled; it wins the tie.
        assert_eq!(select_priority(&procs), Some(2));
    }

    #[test]
    fn priority_on_empty_map_is_none() {
        assert_eq!(select_priority(&HashMap::new()), None);
    }

    #[test]
    fn round_robin_rotates() {
        let procs = map(vec![proc_with(1, 0, 0.0), proc_with(2, 0, 0.0)]);
        let mut queue: VecDeque<i32> = [1, 2].into_iter().collect();
        assert_eq!(select_round_robin(&mut queue, &procs), Some(1));
        assert_eq!(select_round_robin(&mut queue, &procs), Some(2));
        assert_eq!(select_round_robin(&mut queue, &procs), Some(1));
    }

    #[test]
    fn round_robin_skips_dead_entries() {
        let procs = map(vec![proc_with(2, 0, 0.0)]);
        let mut queue: VecDeque<i32> = [1, 2].into_iter().collect();
        assert_eq!(select_round_robin(&mut queue, &procs), Some(2));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn mlfq_prefers_lowest_level() {
        let procs = map(vec![proc_with(1, 0, 0.0), proc_with(2, 0, 0.0)]);
        let mut queues = RunQueues::default();
        queues.levels[2].push_back(1);
        queues.levels[0].push_back(2);
        assert_eq!(select_mlfq(&mut queues.levels, &procs), Some((2, 0)));
    }

    #[test]
    fn mlfq_all_empty_is_none() {
        let mut queues = RunQueues::default();
        assert_eq!(select_mlfq(&mut queues.levels, &HashMap::new()), None);
    }

    #[test]
    fn mlfq_demotion_threshold() {
        assert!(!mlfq_should_demote(3, 0));
        assert!(mlfq_should_demote(4, 0));
        assert!(!mlfq_should_demote(6, 1));
        assert!(mlfq_should_demote(7, 1));
    }

    #[test]
    fn cfs_picks_minimum_vruntime() {
        let procs = map(vec![proc_with(1, 0, 5.0), proc_with(2, 0, 1.5), proc_with(3, 0, 9.0)]);
        assert_eq!(select_cfs(&procs), Some(2));
    }

    #[test]
    fn cfs_weight_decreases_with_nice() {
        assert_eq!(cfs_weight(0), 1.0);
        assert!(cfs_weight(-10) > cfs_weight(0));
        assert!(cfs_weight(0) > cfs_weight(19));
        assert!(cfs_weight(-20).is_finite());
    }

    #[test]
    fn run_queues_remove_clears_everywhere() {
        let mut queues = RunQueues::default();
        queues.enroll(7, 3);
        queues.remove(7);
        assert!(queues.round_robin.is_empty());
        assert!(queues.levels.iter().all(|l| l.is_empty()));
    }
}
