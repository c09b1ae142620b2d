//! Minimal /proc helpers for supervising generator process groups.
//!
//! The supervisor needs to enumerate processes, read command lines, find
//! children, estimate process age and deliver signals. Linux exposes all
//! of that through /proc; the signal plumbing goes through libc.

use std::time::Duration;

use crate::prelude::*;

/// All live PIDs.
pub fn list_pids() -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect()
}

/// The argv of a process, or `None` if it went away.
pub fn cmdline(pid: u32) -> Option<Vec<String>> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let args: Vec<String> = raw
        .split(|byte| *byte == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect();
    if args.is_empty() { None } else { Some(args) }
}

/// PIDs whose parent is `parent`.
pub fn children_of(parent: u32) -> Vec<u32> {
    list_pids()
        .into_iter()
        .filter(|pid| parent_of(*pid) == Some(parent))
        .collect()
}

/// The parent PID, read from /proc/<pid>/stat.
pub fn parent_of(pid: u32) -> Option<u32> {
    let fields = stat_fields(pid)?;
    fields.get(1)?.parse().ok()
}

/// Wall-clock age of a process.
pub fn process_age(pid: u32) -> Option<Duration> {
    let fields = stat_fields(pid)?;
    // Field 22 of /proc/<pid>/stat is starttime in clock ticks; our slice
    // starts at field 3, so it sits at offset 19.
    let start_ticks: u64 = fields.get(19)?.parse().ok()?;
    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks_per_sec <= 0 {
        return None;
    }
    let uptime_raw = std::fs::read_to_string("/proc/uptime").ok()?;
    let uptime_secs: f64 = uptime_raw.split_whitespace().next()?.parse().ok()?;
    let started_secs = start_ticks as f64 / ticks_per_sec as f64;
    if uptime_secs <= started_secs {
        return Some(Duration::ZERO);
    }
    Some(Duration::from_secs_f64(uptime_secs - started_secs))
}

/// /proc/<pid>/stat fields from the process state onward. The comm field
/// may contain spaces and parentheses, so everything up to the last `)`
/// is skipped.
fn stat_fields(pid: u32) -> Option<Vec<String>> {
    let raw = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let after_comm = &raw[raw.rfind(')')? + 1..];
    Some(
        after_comm
            .split_whitespace()
            .map(str::to_owned)
            .collect(),
    )
}

pub fn is_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Graceful termination request (SIGTERM).
pub fn terminate(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

/// Forced kill (SIGKILL).
pub fn kill(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_visible() {
        let me = std::process::id();
        assert!(list_pids().contains(&me));
        assert!(is_alive(me));
        assert!(cmdline(me).is_some());
    }

    #[test]
    fn own_process_has_an_age() {
        let age = process_age(std::process::id()).unwrap();
        assert!(age < Duration::from_secs(60 * 60 * 24));
    }

    #[test]
    fn dead_pid_reports_nothing() {
        // PID 4194304 is above the default pid_max.
        assert!(cmdline(4_194_304).is_none());
        assert!(!is_alive(4_194_304));
    }
}
