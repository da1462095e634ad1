//! Per-process resource sampling for `stat` replies and the `list` table.
//!
//! Linux reads `/proc/{pid}/stat` and `/proc/{pid}/status` directly; macOS
//! falls back to `ps`. Other platforms report nothing. CPU percent is the
//! lifetime average since the process started, which is what a fleet
//! listing wants — callers needing a rate should sample twice.

use serde::{Deserialize, Serialize};

/// Resource metrics for one process. Every field is optional because
/// sampling can fail for any number of reasons (process exited, permission
/// denied, unsupported platform); display code renders `N/A` for `None`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Resident set size in bytes.
    pub memory_rss_bytes: Option<u64>,
    /// Lifetime-average CPU percent (can exceed 100 on multi-core hosts).
    pub cpu_percent: Option<f64>,
    /// Number of threads in the process.
    pub thread_count: Option<u64>,
}

impl ResourceUsage {
    /// Sample resource usage for a PID. Returns all-`None` when the process
    /// does not exist or the platform cannot be queried.
    pub async fn query(pid: u32) -> Self {
        if !process_exists(pid) {
            return Self::default();
        }

        #[cfg(target_os = "linux")]
        {
            Self::query_linux(pid).await
        }

        #[cfg(target_os = "macos")]
        {
            Self::query_macos(pid).await
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            let _ = pid;
            Self::default()
        }
    }

    /// Sample the calling process, for `stat` replies.
    pub async fn query_self() -> Self {
        Self::query(std::process::id()).await
    }

    #[cfg(target_os = "linux")]
    async fn query_linux(pid: u32) -> Self {
        let stat_content =
            match tokio::fs::read_to_string(format!("/proc/{}/stat", pid)).await {
                Ok(content) => content,
                Err(_) => return Self::default(),
            };

        let fields = parse_proc_stat(&stat_content);
        if fields.is_empty() {
            return Self::default();
        }

        // Field numbering follows man 5 proc; indices here are relative to
        // the text after the `(comm)` field, so stat field 14 (utime) is
        // index 11, field 20 (num_threads) is index 17, and so on.
        let utime = fields.get(11).and_then(|s| s.parse::<u64>().ok());
        let stime = fields.get(12).and_then(|s| s.parse::<u64>().ok());
        let thread_count = fields.get(17).and_then(|s| s.parse::<u64>().ok());
        let starttime = fields.get(19).and_then(|s| s.parse::<u64>().ok());
        let rss_pages = fields.get(21).and_then(|s| s.parse::<u64>().ok());

        let cpu_percent = match (utime, stime, starttime) {
            (Some(u), Some(s), Some(start)) => lifetime_cpu_percent(u, s, start).await,
            _ => None,
        };

        // Prefer VmRSS from /proc/{pid}/status; the stat file counts pages.
        let memory_rss_bytes =
            match tokio::fs::read_to_string(format!("/proc/{}/status", pid)).await {
                Ok(content) => parse_vmrss(&content),
                Err(_) => None,
            }
            .or_else(|| rss_pages.map(|pages| pages * 4096));

        Self {
            memory_rss_bytes,
            cpu_percent,
            thread_count,
        }
    }

    #[cfg(target_os = "macos")]
    async fn query_macos(pid: u32) -> Self {
        let output = tokio::process::Command::new("ps")
            .args(["-p", &pid.to_string(), "-o", "rss=,%cpu="])
            .output()
            .await;

        let Ok(output) = output else {
            return Self::default();
        };

        if !output.status.success() {
            return Self::default();
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parts: Vec<&str> = stdout.split_whitespace().collect();

        if parts.len() < 2 {
            return Self::default();
        }

        Self {
            memory_rss_bytes: parts[0].parse::<u64>().ok().map(|kb| kb * 1024),
            cpu_percent: parts[1].parse::<f64>().ok(),
            thread_count: None,
        }
    }

    /// Format resident memory as the `list` table shows it.
    pub fn format_memory(bytes: u64) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if bytes >= GB {
            format!("{:.2} GB", bytes as f64 / GB as f64)
        } else if bytes >= MB {
            format!("{:.2} MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2} KB", bytes as f64 / KB as f64)
        } else {
            format!("{} B", bytes)
        }
    }
}

/// Cheap existence probe before touching /proc or spawning ps.
fn process_exists(pid: u32) -> bool {
    #[cfg(unix)]
    {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }

        // EPERM still means the process exists; we just cannot signal it.
        match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Lifetime-average CPU percent from jiffy counters and system uptime.
#[cfg(target_os = "linux")]
async fn lifetime_cpu_percent(utime: u64, stime: u64, starttime: u64) -> Option<f64> {
    let uptime_content = tokio::fs::read_to_string("/proc/uptime").await.ok()?;
    let uptime_secs: f64 = uptime_content.split_whitespace().next()?.parse().ok()?;

    // 100 jiffies per second is the kernel default everywhere that matters.
    let hertz: f64 = 100.0;
    let elapsed_secs = uptime_secs - starttime as f64 / hertz;

    if elapsed_secs <= 0.0 {
        return None;
    }

    let cpu_time_secs = (utime + stime) as f64 / hertz;
    Some(100.0 * cpu_time_secs / elapsed_secs)
}

/// Parse `/proc/{pid}/stat`, skipping past the `(comm)` field which may
/// contain spaces and parentheses.
#[cfg(target_os = "linux")]
fn parse_proc_stat(content: &str) -> Vec<String> {
    let Some(comm_end) = content.rfind(')') else {
        return Vec::new();
    };

    content[comm_end + 1..]
        .split_whitespace()
        .map(|s| s.to_string())
        .collect()
}

/// Parse the `VmRSS:    12345 kB` line of `/proc/{pid}/status`.
#[cfg(target_os = "linux")]
fn parse_vmrss(content: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}
