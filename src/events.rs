//! Typed event fan-out.
//!
//! Every state-changing decision lands here so consumers (log sink, tests,
//! future exporters) see one ordered stream. Registration takes a short write
//! lock to append; firing iterates over a local clone of the subscriber list,
//! so no subscriber ever runs while the registry lock is held.

use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::mode::Mode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessActionKind {
    Pause,
    Resume,
    Terminate,
    SetPriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclamationKind {
    DropPageCache,
    DropAllCaches,
    CompactMemory,
    TerminateProcess,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Event {
    SnapshotTaken {
        seq: u64,
    },
    ModeChanged {
        old: Mode,
        new: Mode,
    },
    AutoModeSuggested {
        mode: Mode,
        reason: String,
    },
    ProcessAction {
        pid: i32,
        action: ProcessActionKind,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        cause: Option<String>,
    },
    ResourceLimitExceeded {
        pid: i32,
        cpu_percent: f64,
        limit_percent: f64,
    },
    SystemThresholdExceeded {
        what: String,
        value: f64,
        limit: f64,
    },
    StarvationBoosted {
        pid: i32,
    },
    ReclamationStep {
        kind: ReclamationKind,
        freed_kb: u64,
        ok: bool,
    },
}

type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribers.write().unwrap().push(Arc::new(f));
    }

    pub fn emit(&self, event: Event) {
        let subscribers: Vec<Subscriber> = self.subscribers.read().unwrap().clone();
        for subscriber in &subscribers {
            subscriber(&event);
        }
    }
}

/// Convenience constructor used at every actuation site.
pub fn process_action(
    pid: i32,
    action: ProcessActionKind,
    result: &crate::error::Result<()>,
) -> Event {
    Event::ProcessAction {
        pid,
        action,
        ok: result.is_ok(),
        cause: result.as_ref().err().map(|e| e.to_string()),
    }
}
