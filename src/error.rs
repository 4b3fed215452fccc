//! Closed error set shared by every policy component.
//!
//! Per-pid failures are absorbed and logged by the component that hit them;
//! per-tick failures surface as events; mode-apply failures roll back and are
//! returned to the caller. Only configuration errors at startup are fatal.

use serde::Serialize;
use thiserror::Error;

/// The apply step a mode switch failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Scheduler,
    MemoryController,
    ProcessPriorities,
    CpuGovernor,
    SystemServices,
    PowerTuning,
}

#[derive(Debug, Error)]
pub enum ControlError {
    /// Pid vanished between observation and actuation.
    #[error("no such process: {pid}")]
    NotFound { pid: i32 },

    /// Insufficient privilege for the touched resource. Surfaced once per
    /// distinct resource until it succeeds.
    #[error("permission denied: {resource}")]
    PermissionDenied { resource: String },

    /// Validated at the boundary; never reached in normal flow.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// A /proc or /sys entry is missing; the feature degrades to a no-op and
    /// the next tick retries.
    #[error("resource unavailable: {path}")]
    ResourceUnavailable { path: String },

    #[error("another mode switch is in progress")]
    SwitchInProgress,

    #[error("apply failed in {component:?}: {cause}")]
    ApplyFailed {
        component: Component,
        #[source]
        cause: Box<ControlError>,
    },

    /// Short-lived I/O hiccup; next tick.
    #[error("transient: {0}")]
    Transient(String),

    /// A worker's own invariant was violated.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ControlError {
    /// Map an I/O error hit while touching a per-pid kernel interface.
    pub fn from_pid_io(pid: i32, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ControlError::NotFound { pid },
            std::io::ErrorKind::PermissionDenied => ControlError::PermissionDenied {
                resource: format!("pid {pid}"),
            },
            _ => ControlError::Transient(err.to_string()),
        }
    }

    /// Map an I/O error hit while touching a named system file.
    pub fn from_path_io(path: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ControlError::ResourceUnavailable {
                path: path.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => ControlError::PermissionDenied {
                resource: path.to_string(),
            },
            _ => ControlError::Transient(err.to_string()),
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, ControlError::PermissionDenied { .. })
            || matches!(self, ControlError::ApplyFailed { cause, .. } if cause.is_permission_denied())
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
