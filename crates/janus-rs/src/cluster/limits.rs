//! Per-worker resource limits: pre-exec setup and /proc sampling.

use std::io;
use std::time::Instant;

use crate::models::settings::ClusterResources;

/// Applies niceness and the file-descriptor limit inside the forked child,
/// before exec. Runs in the pre-exec window, so only async-signal-safe
/// calls are allowed.
///
/// # Safety
///
/// Must only be called from a `pre_exec` closure.
pub unsafe fn apply_pre_exec(resources: &ClusterResources) -> io::Result<()> {
    if resources.priority != 0 {
        // Ignore EPERM: raising priority needs privileges we may not have.
        // The `which` argument is a different integer type across libcs.
        let _ = libc::setpriority(libc::PRIO_PROCESS as _, 0, resources.priority);
    }
    if resources.file_descriptor_limit > 0 {
        let limit = libc::rlimit {
            rlim_cur: resources.file_descriptor_limit,
            rlim_max: resources.file_descriptor_limit,
        };
        if libc::setrlimit(libc::RLIMIT_NOFILE, &limit) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Resident set size of a process in MiB, from `/proc/<pid>/status`.
pub fn rss_mb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb / 1024);
        }
    }
    None
}

/// CPU usage sampler over `/proc/<pid>/stat` utime+stime deltas.
#[derive(Debug)]
pub struct CpuSampler {
    last_jiffies: u64,
    last_sample: Instant,
    ticks_per_sec: f64,
}

impl CpuSampler {
    pub fn new() -> Self {
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        Self {
            last_jiffies: 0,
            last_sample: Instant::now(),
            ticks_per_sec: if ticks > 0 { ticks as f64 } else { 100.0 },
        }
    }

    fn read_jiffies(pid: u32) -> Option<u64> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        // The comm field may contain spaces; fields after its closing
        // parenthesis are positional. utime and stime are the 14th and 15th
        // of the full line, i.e. the 12th and 13th after comm.
        let after_comm = &stat[stat.rfind(')')? + 1..];
        let fields: Vec<&str> = after_comm.split_whitespace().collect();
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        Some(utime + stime)
    }

    /// CPU percentage of one core used since the previous sample.
    pub fn sample(&mut self, pid: u32) -> Option<f64> {
        let jiffies = Self::read_jiffies(pid)?;
        let elapsed = self.last_sample.elapsed().as_secs_f64();
        let delta = jiffies.saturating_sub(self.last_jiffies) as f64;
        self.last_jiffies = jiffies;
        self.last_sample = Instant::now();
        if elapsed <= 0.0 {
            return Some(0.0);
        }
        Some(delta / self.ticks_per_sec / elapsed * 100.0)
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_rss_is_readable() {
        let rss = rss_mb(std::process::id());
        assert!(rss.is_some());
    }

    #[test]
    fn own_cpu_is_sampleable() {
        let mut sampler = CpuSampler::new();
        let pct = sampler.sample(std::process::id());
        assert!(pct.is_some());
    }

    #[test]
    fn missing_pid_yields_none() {
        // PID 0 has no /proc entry readable this way.
        assert!(rss_mb(0).is_none());
    }
}
