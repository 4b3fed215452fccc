//! Immutable, versioned view of system and process state.
//!
//! The observer is the only writer. Everyone else takes a handle to the
//! latest snapshot and reads consistent fields from it; a handle stays valid
//! after newer snapshots are published.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::Serialize;

/// Kernel task state letter from `/proc/<pid>/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Running,
    Sleeping,
    DiskSleep,
    Zombie,
    Stopped,
    Unknown,
}

impl ProcessState {
    pub fn from_char(c: char) -> Self {
        match c {
            'R' => ProcessState::Running,
            'S' => ProcessState::Sleeping,
            'D' => ProcessState::DiskSleep,
            'Z' => ProcessState::Zombie,
            'T' | 't' => ProcessState::Stopped,
            _ => ProcessState::Unknown,
        }
    }
}

/// What the observer knows about one live process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessRecord {
    pub pid: i32,
    pub name: String,
    pub cmdline: String,
    /// Smoothed share of one CPU, 0-100.
    pub cpu_percent: f64,
    pub rss_kb: u64,
    pub vsz_kb: u64,
    pub shared_kb: u64,
    pub private_kb: u64,
    pub minor_faults: u64,
    pub major_faults: u64,
    pub nice_value: i32,
    pub state: ProcessState,
    pub parent_pid: i32,
    /// RSS delta between the last two samples, per second.
    pub growth_rate_kb_per_s: f64,
    pub is_critical: bool,
}

/// Coarse label for memory usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    Low,
    Medium,
    High,
    Critical,
}

impl MemoryPressure {
    /// Classify `used_percent` against a low and a critical threshold; the
    /// high threshold sits at their midpoint.
    pub fn classify(used_percent: f64, low: f64, critical: f64) -> Self {
        if used_percent >= critical {
            MemoryPressure::Critical
        } else if used_percent >= (low + critical) / 2.0 {
            MemoryPressure::High
        } else if used_percent >= low {
            MemoryPressure::Medium
        } else {
            MemoryPressure::Low
        }
    }

    pub fn escalate(self) -> Self {
        match self {
            MemoryPressure::Low => MemoryPressure::Medium,
            MemoryPressure::Medium => MemoryPressure::High,
            _ => MemoryPressure::Critical,
        }
    }
}

pub const DEFAULT_LOW_PRESSURE_PERCENT: f64 = 70.0;
pub const DEFAULT_CRITICAL_PRESSURE_PERCENT: f64 = 90.0;

#[derive(Debug, Clone)]
pub struct SystemSnapshot {
    pub taken_at: Instant,
    pub seq: u64,
    pub cpu_total_percent: f64,
    pub load_1m: f64,
    pub load_5m: f64,
    pub load_15m: f64,
    pub mem_total_kb: u64,
    pub mem_used_kb: u64,
    pub mem_available_kb: u64,
    pub swap_total_kb: u64,
    pub swap_used_kb: u64,
    pub processes: HashMap<i32, ProcessRecord>,
    pub pressure: MemoryPressure,
}

impl SystemSnapshot {
    /// An empty snapshot, published before the first sample completes.
    pub fn empty() -> Self {
        SystemSnapshot {
            taken_at: Instant::now(),
            seq: 0,
            cpu_total_percent: 0.0,
            load_1m: 0.0,
            load_5m: 0.0,
            load_15m: 0.0,
            mem_total_kb: 0,
            mem_used_kb: 0,
            mem_available_kb: 0,
            swap_total_kb: 0,
            swap_used_kb: 0,
            processes: HashMap::new(),
            pressure: MemoryPressure::Low,
        }
    }

    pub fn mem_used_percent(&self) -> f64 {
        if self.mem_total_kb == 0 {
            return 0.0;
        }
        100.0 * self.mem_used_kb as f64 / self.mem_total_kb as f64
    }

    pub fn contains_pid(&self, pid: i32) -> bool {
        self.processes.contains_key(&pid)
    }
}

/// Publication point for snapshots. Writers swap the Arc under a short write
/// lock; readers clone the handle and never block each other.
pub struct SnapshotStore {
    current: RwLock<Arc<SystemSnapshot>>,
    seq: AtomicU64,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        SnapshotStore {
            current: RwLock::new(Arc::new(SystemSnapshot::empty())),
            seq: AtomicU64::new(0),
        }
    }

    pub fn latest(&self) -> Arc<SystemSnapshot> {
        self.current.read().unwrap().clone()
    }

    /// Stamp the snapshot with the next sequence number and publish it.
    pub fn publish(&self, mut snapshot: SystemSnapshot) -> Arc<SystemSnapshot> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        snapshot.seq = seq;
        let published = Arc::new(snapshot);
        *self.current.write().unwrap() = published.clone();
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pressure_classification_boundaries() {
        let classify = |p| MemoryPressure::classify(p, 70.0, 90.0);
        assert_eq!(classify(10.0), MemoryPressure::Low);
        assert_eq!(classify(69.9), MemoryPressure::Low);
        assert_eq!(classify(70.0), MemoryPressure::Medium);
        assert_eq!(classify(80.0), MemoryPressure::High);
        assert_eq!(classify(89.9), MemoryPressure::High);
        assert_eq!(classify(90.0), MemoryPressure::Critical);
        assert_eq!(classify(95.0), MemoryPressure::Critical);
    }

    #[test]
    fn publish_assigns_monotonic_seq() {
        let store = SnapshotStore::new();
        let first = store.publish(SystemSnapshot::empty());
        let second = store.publish(SystemSnapshot::empty());
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(store.latest().seq, 2);
    }

    #[test]
    fn old_handle_survives_new_publication() {
        let store = SnapshotStore::new();
        let mut snapshot = SystemSnapshot::empty();
        snapshot.mem_total_kb = 1000;
        snapshot.mem_used_kb = 500;
        let held = store.publish(snapshot);
        store.publish(SystemSnapshot::empty());
        assert_eq!(held.mem_used_kb, 500);
        assert_eq!(held.seq, 1);
    }

    #[test]
    fn used_percent_handles_zero_total() {
        assert_eq!(SystemSnapshot::empty().mem_used_percent(), 0.0);
    }

    #[test]
    fn concurrent_readers_observe_nondecreasing_seq() {
        let store = Arc::new(SnapshotStore::new());
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for _ in 0..500 {
                    store.publish(SystemSnapshot::empty());
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..2000 {
                        let seq = store.latest().seq;
                        assert!(seq >= last, "seq went backwards: {seq} < {last}");
                        last = seq;
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
