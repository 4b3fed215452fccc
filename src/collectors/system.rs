//! System-wide accounting from `/proc/{stat,meminfo,loadavg}`.

use std::fs;
use std::path::Path;

/// Aggregate jiffy counters from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    /// Number of `cpuN` lines seen, i.e. online CPUs.
    pub cpus: usize,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    pub fn idle_all(&self) -> u64 {
        self.idle + self.iowait
    }

    /// Busy share of all CPUs between two readings, 0-100.
    pub fn usage_since(&self, prev: &CpuTimes) -> Option<f64> {
        let total = self.total().checked_sub(prev.total())?;
        if total == 0 {
            return None;
        }
        let idle = self.idle_all().saturating_sub(prev.idle_all());
        Some(100.0 * (total - idle) as f64 / total as f64)
    }
}

pub fn parse_cpu_times(content: &str) -> Option<CpuTimes> {
    let mut times = CpuTimes::default();
    let mut seen_aggregate = false;
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("cpu") => {
                let mut next = || fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
                times.user = next();
                times.nice = next();
                times.system = next();
                times.idle = next();
                times.iowait = next();
                times.irq = next();
                times.softirq = next();
                times.steal = next();
                seen_aggregate = true;
            }
            Some(label) if label.starts_with("cpu") => times.cpus += 1,
            _ => {}
        }
    }
    if seen_aggregate {
        times.cpus = times.cpus.max(1);
        Some(times)
    } else {
        None
    }
}

pub fn read_cpu_times(proc_root: &Path) -> Option<CpuTimes> {
    parse_cpu_times(&fs::read_to_string(proc_root.join("stat")).ok()?)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemInfo {
    pub total_kb: u64,
    pub free_kb: u64,
    pub available_kb: u64,
    pub swap_total_kb: u64,
    pub swap_free_kb: u64,
}

impl MemInfo {
    pub fn used_kb(&self) -> u64 {
        self.total_kb.saturating_sub(self.available_kb)
    }

    pub fn swap_used_kb(&self) -> u64 {
        self.swap_total_kb.saturating_sub(self.swap_free_kb)
    }
}

pub fn parse_meminfo(content: &str) -> Option<MemInfo> {
    let mut info = MemInfo::default();
    let mut seen_total = false;
    for line in content.lines() {
        let (key, rest) = match line.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        let value: u64 = match rest.trim().split_whitespace().next().and_then(|v| v.parse().ok()) {
            Some(v) => v,
            None => continue,
        };
        match key {
            "MemTotal" => {
                info.total_kb = value;
                seen_total = true;
            }
            "MemFree" => info.free_kb = value,
            "MemAvailable" => info.available_kb = value,
            "SwapTotal" => info.swap_total_kb = value,
            "SwapFree" => info.swap_free_kb = value,
            _ => {}
        }
    }
    if !seen_total {
        return None;
    }
    // Old kernels have no MemAvailable; fall back to MemFree.
    if info.available_kb == 0 {
        info.available_kb = info.free_kb;
    }
    Some(info)
}

pub fn read_meminfo(proc_root: &Path) -> Option<MemInfo> {
    parse_meminfo(&fs::read_to_string(proc_root.join("meminfo")).ok()?)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadAvg {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

pub fn parse_loadavg(content: &str) -> Option<LoadAvg> {
    let mut fields = content.split_whitespace();
    Some(LoadAvg {
        one: fields.next()?.parse().ok()?,
        five: fields.next()?.parse().ok()?,
        fifteen: fields.next()?.parse().ok()?,
    })
}

pub fn read_loadavg(proc_root: &Path) -> Option<LoadAvg> {
    parse_loadavg(&fs::read_to_string(proc_root.join("loadavg")).ok()?)
}

/// Online core ids from `/proc/cpuinfo` processor entries.
pub fn available_cores(proc_root: &Path) -> Vec<usize> {
    let content = match fs::read_to_string(proc_root.join("cpuinfo")) {
        Ok(content) => content,
        Err(_) => return Vec::new(),
    };
    content
        .lines()
        .filter_map(|line| {
            let rest = line.strip_prefix("processor")?;
            rest.split_once(':')?.1.trim().parse().ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "cpu  8000 200 3000 50000 1200 0 300 0 0 0\n\
cpu0 2000 50 800 12500 300 0 80 0 0 0\n\
cpu1 2000 50 800 12500 300 0 80 0 0 0\n\
cpu2 2000 50 700 12500 300 0 70 0 0 0\n\
cpu3 2000 50 700 12500 300 0 70 0 0 0\n\
intr 12345\nctxt 6789\n";

    #[test]
    fn cpu_times_aggregate_and_count() {
        let times = parse_cpu_times(STAT).unwrap();
        assert_eq!(times.user, 8000);
        assert_eq!(times.idle, 50000);
        assert_eq!(times.cpus, 4);
        assert_eq!(times.total(), 62700);
    }

    #[test]
    fn usage_between_two_readings() {
        let prev = parse_cpu_times(STAT).unwrap();
        let mut next = prev;
        next.user += 800;
        next.idle += 200;
        let usage = next.usage_since(&prev).unwrap();
        assert!((usage - 80.0).abs() < 0.01, "usage = {usage}");
    }

    #[test]
    fn usage_with_no_elapsed_jiffies_is_none() {
        let times = parse_cpu_times(STAT).unwrap();
        assert!(times.usage_since(&times).is_none());
    }

    #[test]
    fn usage_with_clock_gone_backwards_is_none() {
        let prev = parse_cpu_times(STAT).unwrap();
        let mut next = prev;
        next.user -= 500;
        assert!(next.usage_since(&prev).is_none());
    }

    #[test]
    fn meminfo_fields_and_derived_usage() {
        let content = "MemTotal:       16384000 kB\n\
MemFree:         2048000 kB\n\
MemAvailable:    8192000 kB\n\
Buffers:          512000 kB\n\
SwapTotal:       4096000 kB\n\
SwapFree:        3072000 kB\n";
        let info = parse_meminfo(content).unwrap();
        assert_eq!(info.total_kb, 16384000);
        assert_eq!(info.used_kb(), 8192000);
        assert_eq!(info.swap_used_kb(), 1024000);
    }

    #[test]
    fn meminfo_without_available_falls_back_to_free() {
        let content = "MemTotal: 1000 kB\nMemFree: 400 kB\n";
        let info = parse_meminfo(content).unwrap();
        assert_eq!(info.available_kb, 400);
    }

    #[test]
    fn meminfo_without_total_is_rejected() {
        assert!(parse_meminfo("MemFree: 400 kB\n").is_none());
        assert!(parse_meminfo("").is_none());
    }

    #[test]
    fn loadavg_line() {
        let load = parse_loadavg("0.52 1.25 2.00 2/1234 56789\n").unwrap();
        assert_eq!(load.one, 0.52);
        assert_eq!(load.five, 1.25);
        assert_eq!(load.fifteen, 2.00);
    }

    #[test]
    fn cores_from_cpuinfo() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("cpuinfo"),
            "processor\t: 0\nmodel name\t: Test CPU\nprocessor\t: 1\nmodel name\t: Test CPU\n",
        )
        .unwrap();
        assert_eq!(available_cores(dir.path()), vec![0, 1]);
    }

    #[test]
    fn cores_without_cpuinfo_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(available_cores(dir.path()).is_empty());
    }
}
