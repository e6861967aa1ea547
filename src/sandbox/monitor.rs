//! Resource monitoring for a sandboxed process group.
//!
//! The monitor samples `/proc` on a short interval, aggregating CPU time
//! and resident-set size over every process in the group so that a child
//! that forks cannot dodge accounting. Per-pid CPU maxima are retained
//! after a pid disappears, keeping the totals monotonic across short-lived
//! descendants.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;

use super::ExitStatusKind;

/// Milliseconds of CPU delta that count as "measurable progress" for the
/// idleness rule.
const PROGRESS_EPSILON_MS: u64 = 10;

/// Limits the monitor enforces. All optional except wall time.
#[derive(Debug, Clone)]
pub(crate) struct MonitorLimits {
    pub time_limit_ms: Option<u64>,
    pub wall_limit_ms: u64,
    pub memory_limit_bytes: Option<u64>,
    /// Stdout cap with the slack factor already applied
    pub stdout_cap_bytes: u64,
    pub stderr_cap_bytes: u64,
    /// Report a wall breach as `Timeout` instead of `WallTimeout`
    pub wall_breach_is_time_limit: bool,
    pub idleness_wall_floor_ms: u64,
    pub idleness_window_ms: u64,
}

/// Point-in-time resource numbers.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Usage {
    pub cpu_ms: u64,
    pub peak_rss_bytes: u64,
}

pub(crate) struct GroupMonitor {
    pgid: i32,
    clk_tck: u64,
    page_size: u64,
    limits: MonitorLimits,
    stdout_path: Option<PathBuf>,
    stderr_path: Option<PathBuf>,
    /// Max CPU ms ever observed per pid; survives pid exit
    per_pid_cpu: HashMap<i32, u64>,
    peak_rss_bytes: u64,
    last_cpu_total_ms: u64,
    last_progress_at: Instant,
    started_at: Instant,
}

impl GroupMonitor {
    pub fn new(
        pgid: i32,
        limits: MonitorLimits,
        stdout_path: Option<PathBuf>,
        stderr_path: Option<PathBuf>,
    ) -> Self {
        let clk_tck = nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK)
            .ok()
            .flatten()
            .map(|v| v as u64)
            .unwrap_or(100);
        let page_size = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .map(|v| v as u64)
            .unwrap_or(4096);
        let now = Instant::now();
        Self {
            pgid,
            clk_tck,
            page_size,
            limits,
            stdout_path,
            stderr_path,
            per_pid_cpu: HashMap::new(),
            peak_rss_bytes: 0,
            last_cpu_total_ms: 0,
            last_progress_at: now,
            started_at: now,
        }
    }

    /// Take one sample; returns the breached limit, if any.
    pub fn sample(&mut self) -> Option<ExitStatusKind> {
        self.scan_proc();

        let wall_ms = self.started_at.elapsed().as_millis() as u64;
        let cpu_ms = self.cpu_total_ms();

        if cpu_ms > self.last_cpu_total_ms + PROGRESS_EPSILON_MS {
            self.last_cpu_total_ms = cpu_ms;
            self.last_progress_at = Instant::now();
        }

        if let Some(limit) = self.limits.time_limit_ms {
            if cpu_ms > limit {
                return Some(ExitStatusKind::Timeout);
            }
        }
        if wall_ms > self.limits.wall_limit_ms {
            return Some(if self.limits.wall_breach_is_time_limit {
                ExitStatusKind::Timeout
            } else {
                ExitStatusKind::WallTimeout
            });
        }
        if let Some(limit) = self.limits.memory_limit_bytes {
            if self.peak_rss_bytes > limit {
                return Some(ExitStatusKind::MemoryLimit);
            }
        }
        let (stdout_bytes, stderr_bytes) = self.stream_sizes();
        if stdout_bytes > self.limits.stdout_cap_bytes
            || stderr_bytes > self.limits.stderr_cap_bytes
        {
            return Some(ExitStatusKind::OutputLimit);
        }
        if wall_ms > self.limits.idleness_wall_floor_ms
            && self.last_progress_at.elapsed().as_millis() as u64
                >= self.limits.idleness_window_ms
        {
            return Some(ExitStatusKind::IdlenessLimit);
        }
        None
    }

    /// CPU ms summed over every pid ever seen in the group.
    pub fn cpu_total_ms(&self) -> u64 {
        self.per_pid_cpu.values().sum()
    }

    pub fn usage(&self) -> Usage {
        Usage {
            cpu_ms: self.cpu_total_ms(),
            peak_rss_bytes: self.peak_rss_bytes,
        }
    }

    /// Current byte counts of the captured stdout/stderr files.
    pub fn stream_sizes(&self) -> (u64, u64) {
        let size = |path: &Option<PathBuf>| {
            path.as_deref()
                .and_then(|p| std::fs::metadata(p).ok())
                .map(|m| m.len())
                .unwrap_or(0)
        };
        (size(&self.stdout_path), size(&self.stderr_path))
    }

    /// Walk `/proc`, folding every process of the group into the totals.
    fn scan_proc(&mut self) {
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return;
        };
        let mut rss_now: u64 = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };
            // Processes vanish between readdir and read; ignore them
            let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
                continue;
            };
            let Some(parsed) = parse_stat(&stat) else {
                continue;
            };
            if parsed.pgrp != self.pgid {
                continue;
            }
            let cpu_ms = parsed.cpu_ticks * 1000 / self.clk_tck;
            let slot = self.per_pid_cpu.entry(pid).or_insert(0);
            *slot = (*slot).max(cpu_ms);
            rss_now += parsed.rss_pages * self.page_size;
        }
        self.peak_rss_bytes = self.peak_rss_bytes.max(rss_now);
    }
}

struct StatLine {
    pgrp: i32,
    /// utime + stime
    cpu_ticks: u64,
    rss_pages: u64,
}

/// Parse one `/proc/<pid>/stat` line. The comm field may itself contain
/// spaces and parentheses, so fields are taken after the last `)`.
fn parse_stat(stat: &str) -> Option<StatLine> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // After comm: 0=state 1=ppid 2=pgrp ... 11=utime 12=stime ... 21=rss
    let pgrp = fields.get(2)?.parse().ok()?;
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let rss_pages: u64 = fields.get(21)?.parse().ok().unwrap_or(0);
    Some(StatLine {
        pgrp,
        cpu_ticks: utime + stime,
        rss_pages,
    })
}

/// Read the monitor's own notion of the current process's stat line, used
/// to sanity-check the parser against a live `/proc`.
#[allow(dead_code)]
pub(crate) fn self_stat() -> anyhow::Result<()> {
    let stat = std::fs::read_to_string("/proc/self/stat").context("read /proc/self/stat")?;
    parse_stat(&stat).context("parse /proc/self/stat")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits() -> MonitorLimits {
        MonitorLimits {
            time_limit_ms: Some(1000),
            wall_limit_ms: 3000,
            memory_limit_bytes: Some(256 * 1024 * 1024),
            stdout_cap_bytes: 4 * 1024 * 1024,
            stderr_cap_bytes: 4 * 1024 * 1024,
            wall_breach_is_time_limit: false,
            idleness_wall_floor_ms: 5000,
            idleness_window_ms: 2000,
        }
    }

    #[test]
    fn parses_own_stat_line() {
        self_stat().unwrap();
    }

    #[test]
    fn parses_comm_with_spaces_and_parens() {
        let line = "42 (weird (comm) name) S 1 42 42 0 -1 4194304 100 0 0 0 7 3 0 0 20 0 1 0 100 1048576 250 18446744073709551615";
        let parsed = parse_stat(line).unwrap();
        assert_eq!(parsed.pgrp, 42);
        assert_eq!(parsed.cpu_ticks, 10);
        assert_eq!(parsed.rss_pages, 250);
    }

    #[test]
    fn own_group_accumulates_cpu_and_rss() {
        let pgid = nix::unistd::getpgrp().as_raw();
        let mut monitor = GroupMonitor::new(pgid, limits(), None, None);
        monitor.scan_proc();
        let usage = monitor.usage();
        // This test process is in the group and has a nonzero RSS
        assert!(usage.peak_rss_bytes > 0);
    }

    #[test]
    fn wall_breach_detected() {
        let mut l = limits();
        l.wall_limit_ms = 0;
        l.time_limit_ms = None;
        // Group 1 (init) is not ours, so CPU/RSS stay empty and only the
        // wall check can fire
        let mut monitor = GroupMonitor::new(1, l, None, None);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(monitor.sample(), Some(ExitStatusKind::WallTimeout));
    }

    #[test]
    fn wall_breach_can_reclassify_as_timeout() {
        let mut l = limits();
        l.wall_limit_ms = 0;
        l.time_limit_ms = None;
        l.wall_breach_is_time_limit = true;
        let mut monitor = GroupMonitor::new(1, l, None, None);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(monitor.sample(), Some(ExitStatusKind::Timeout));
    }

    #[test]
    fn rss_above_limit_is_a_memory_breach() {
        let mut l = limits();
        l.time_limit_ms = None;
        l.wall_limit_ms = u64::MAX;
        l.memory_limit_bytes = Some(1);
        // Our own process group: this test process's RSS alone exceeds a
        // one-byte cap on the first sample
        let pgid = nix::unistd::getpgrp().as_raw();
        let mut monitor = GroupMonitor::new(pgid, l, None, None);
        assert_eq!(monitor.sample(), Some(ExitStatusKind::MemoryLimit));
    }

    #[test]
    fn stream_cap_breach_detected() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("stdout");
        std::fs::write(&out, vec![b'a'; 128]).unwrap();

        let mut l = limits();
        l.stdout_cap_bytes = 64;
        let mut monitor = GroupMonitor::new(1, l, Some(out), None);
        assert_eq!(monitor.sample(), Some(ExitStatusKind::OutputLimit));
    }
}
