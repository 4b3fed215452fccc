//! Per-process fields from `/proc/<pid>/{stat,status,statm,cmdline}`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::snapshot::ProcessState;

/// One process as read off the kernel, before the observer derives rates.
#[derive(Debug, Clone, PartialEq)]
pub struct RawProcess {
    pub pid: i32,
    pub name: String,
    pub cmdline: String,
    pub state: ProcessState,
    pub parent_pid: i32,
    pub minor_faults: u64,
    pub major_faults: u64,
    /// user + system jiffies, cumulative.
    pub cpu_jiffies: u64,
    pub nice_value: i32,
    pub vsz_kb: u64,
    pub rss_kb: u64,
    pub shared_kb: u64,
}

impl RawProcess {
    pub fn private_kb(&self) -> u64 {
        self.rss_kb.saturating_sub(self.shared_kb)
    }
}

/// Fields pulled out of one `/proc/<pid>/stat` line.
#[derive(Debug, Clone, PartialEq)]
pub struct StatFields {
    pub comm: String,
    pub state: ProcessState,
    pub parent_pid: i32,
    pub minor_faults: u64,
    pub major_faults: u64,
    pub utime: u64,
    pub stime: u64,
    pub nice_value: i32,
    pub vsize_bytes: u64,
}

/// Parse a stat line. The comm field may itself contain spaces and
/// parentheses, so everything up to the last `)` is the name.
pub fn parse_stat(line: &str) -> Option<StatFields> {
    let close = line.rfind(')')?;
    let open = line.find('(')?;
    let comm = line.get(open + 1..close)?.to_string();
    let rest: Vec<&str> = line.get(close + 1..)?.split_whitespace().collect();
    // rest[0] is the state letter; stat field numbering starts at 3 there.
    let state = ProcessState::from_char(rest.first()?.chars().next()?);
    Some(StatFields {
        comm,
        state,
        parent_pid: rest.get(1)?.parse().ok()?,
        minor_faults: rest.get(7)?.parse().ok()?,
        major_faults: rest.get(9)?.parse().ok()?,
        utime: rest.get(11)?.parse().ok()?,
        stime: rest.get(12)?.parse().ok()?,
        nice_value: rest.get(16)?.parse().ok()?,
        vsize_bytes: rest.get(20)?.parse().ok()?,
    })
}

/// Parse `/proc/<pid>/statm`: sizes in pages, of which we need total,
/// resident and shared.
pub fn parse_statm(content: &str, page_kb: u64) -> Option<(u64, u64, u64)> {
    let mut fields = content.split_whitespace();
    let size: u64 = fields.next()?.parse().ok()?;
    let resident: u64 = fields.next()?.parse().ok()?;
    let shared: u64 = fields.next()?.parse().ok()?;
    Some((size * page_kb, resident * page_kb, shared * page_kb))
}

/// Pull the `Name:` field out of `/proc/<pid>/status`.
pub fn parse_status_name(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        line.strip_prefix("Name:")
            .map(|rest| rest.trim().to_string())
    })
}

/// Enumerate numeric entries of the proc root.
pub fn list_pids(proc_root: &Path) -> Vec<i32> {
    let mut pids = Vec::new();
    let entries = match fs::read_dir(proc_root) {
        Ok(entries) => entries,
        Err(_) => return pids,
    };
    for entry in entries.flatten() {
        if let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
            pids.push(pid);
        }
    }
    pids
}

/// Reads one process at a time from a proc tree.
pub struct ProcReader {
    root: PathBuf,
    page_kb: u64,
}

impl ProcReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let page_kb = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_kb = if page_kb > 0 { page_kb as u64 / 1024 } else { 4 };
        ProcReader {
            root: root.into(),
            page_kb: page_kb.max(1),
        }
    }

    /// Override the page size, for fixture trees written by tests.
    pub fn with_page_kb(mut self, page_kb: u64) -> Self {
        self.page_kb = page_kb;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pids(&self) -> Vec<i32> {
        list_pids(&self.root)
    }

    /// Read one pid. Returns None when any required file is unreadable,
    /// which normally means the process exited mid-read.
    pub fn read(&self, pid: i32) -> Option<RawProcess> {
        let dir = self.root.join(pid.to_string());
        let stat = parse_stat(&fs::read_to_string(dir.join("stat")).ok()?)?;
        let (_, rss_kb, shared_kb) = fs::read_to_string(dir.join("statm"))
            .ok()
            .and_then(|c| parse_statm(&c, self.page_kb))
            .unwrap_or((0, 0, 0));
        let name = fs::read_to_string(dir.join("status"))
            .ok()
            .and_then(|c| parse_status_name(&c))
            .unwrap_or_else(|| stat.comm.clone());
        let cmdline = fs::read(dir.join("cmdline"))
            .map(|raw| {
                raw.split(|b| *b == 0)
                    .filter(|part| !part.is_empty())
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        Some(RawProcess {
            pid,
            name,
            cmdline,
            state: stat.state,
            parent_pid: stat.parent_pid,
            minor_faults: stat.minor_faults,
            major_faults: stat.major_faults,
            cpu_jiffies: stat.utime + stat.stime,
            nice_value: stat.nice_value,
            vsz_kb: stat.vsize_bytes / 1024,
            rss_kb,
            shared_kb,
        })
    }
}
