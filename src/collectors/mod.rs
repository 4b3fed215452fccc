//! Read-only kernel surface.
//!
//! Every reader takes its root path at construction so tests can point it at
//! a fixture tree instead of the live `/proc` and `/sys`. Readers never fail
//! loudly for a single pid; a process exiting mid-read is expected.

pub mod power;
pub mod proc;
pub mod system;

pub use power::{read_battery, read_temperature_c, BatteryStatus};
pub use proc::{list_pids, ProcReader, RawProcess};
pub use system::{
    available_cores, read_cpu_times, read_loadavg, read_meminfo, CpuTimes, LoadAvg, MemInfo,
};
