/// Per-process CPU and memory accounting read from `/proc`.
///
/// Reads are racy by nature: the process may exit between any two file
/// reads. Callers treat `NotFound` as a normal outcome.
use nix::sys::resource::{getrusage, UsageWho};
use nix::sys::time::{TimeVal, TimeValLike};
use nix::unistd::{sysconf, SysconfVar};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Clock-tick rate assumed when the system will not report one.
pub const DEFAULT_CLOCK_TICKS: u64 = 100;

/// One process's accounting entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcStats {
    /// User + kernel CPU time in seconds.
    pub cpu_time_secs: f64,
    /// Resident set size in kilobytes.
    pub memory_kb: u64,
    /// Direct children, in the order the kernel lists them.
    pub children: Vec<u32>,
}

/// Errors from reading a process's accounting entry.
#[derive(Debug)]
pub enum ProcError {
    /// No accounting entry: the process exited or never existed.
    NotFound { pid: u32 },
    /// The entry exists but does not have the expected shape.
    Malformed { pid: u32, detail: String },
    /// Any other I/O failure while reading the entry.
    Io { pid: u32, source: std::io::Error },
}

impl std::fmt::Display for ProcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcError::NotFound { pid } => write!(f, "process {pid} not found"),
            ProcError::Malformed { pid, detail } => {
                write!(f, "malformed accounting data for process {pid}: {detail}")
            }
            ProcError::Io { pid, source } => {
                write!(f, "failed to read accounting data for process {pid}: {source}")
            }
        }
    }
}

impl std::error::Error for ProcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Anything that can answer "how much does this pid use, and who are its children".
pub trait ProcSource: Send + Sync {
    fn read(&self, pid: u32) -> Result<ProcStats, ProcError>;
}

/// Reader backed by a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
    ticks_per_sec: u64,
}

impl ProcFs {
    /// Reader for the host's `/proc`, using the system clock-tick rate.
    pub fn new() -> Self {
        Self::with_root("/proc", clock_ticks_per_sec())
    }

    /// Reader for an arbitrary procfs-shaped directory.
    pub fn with_root(root: impl Into<PathBuf>, ticks_per_sec: u64) -> Self {
        Self {
            root: root.into(),
            ticks_per_sec: ticks_per_sec.max(1),
        }
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    fn read_cpu_time(&self, pid: u32, dir: &Path) -> Result<f64, ProcError> {
        let stat = read_entry(pid, &dir.join("stat"))?;
        let (utime, stime) = parse_stat_times(&stat).map_err(|detail| ProcError::Malformed {
            pid,
            detail,
        })?;
        Ok((utime + stime) as f64 / self.ticks_per_sec as f64)
    }

    fn read_memory_kb(&self, pid: u32, dir: &Path) -> Result<u64, ProcError> {
        let status = read_entry(pid, &dir.join("status"))?;
        parse_vm_rss(&status).map_err(|detail| ProcError::Malformed { pid, detail })
    }

    fn read_children(&self, pid: u32, dir: &Path) -> Vec<u32> {
        let path = dir.join("task").join(pid.to_string()).join("children");
        match std::fs::read_to_string(&path) {
            Ok(contents) => contents
                .split_whitespace()
                .filter_map(|s| s.parse().ok())
                .collect(),
            // Not every kernel exposes the children listing.
            Err(_) => Vec::new(),
        }
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcSource for ProcFs {
    fn read(&self, pid: u32) -> Result<ProcStats, ProcError> {
        let dir = self.pid_dir(pid);
        let cpu_time_secs = self.read_cpu_time(pid, &dir)?;
        let memory_kb = self.read_memory_kb(pid, &dir)?;
        let children = self.read_children(pid, &dir);
        Ok(ProcStats {
            cpu_time_secs,
            memory_kb,
            children,
        })
    }
}

/// Clock ticks per second as reported by `sysconf(_SC_CLK_TCK)`.
pub fn clock_ticks_per_sec() -> u64 {
    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as u64,
        other => {
            tracing::debug!(result = ?other, "CLK_TCK unavailable, assuming {DEFAULT_CLOCK_TICKS}");
            DEFAULT_CLOCK_TICKS
        }
    }
}

/// User + kernel CPU seconds of every child this process has reaped,
/// including descendants those children waited for.
///
/// Grows monotonically, so the difference across a cycle covers CPU the
/// sampler missed after its last tick. Returns 0 if the call fails.
pub fn reaped_children_cpu_secs() -> f64 {
    match getrusage(UsageWho::RUSAGE_CHILDREN) {
        Ok(usage) => timeval_secs(usage.user_time()) + timeval_secs(usage.system_time()),
        Err(e) => {
            tracing::debug!(error = %e, "getrusage(RUSAGE_CHILDREN) failed");
            0.0
        }
    }
}

fn timeval_secs(tv: TimeVal) -> f64 {
    tv.num_microseconds() as f64 / 1_000_000.0
}

fn read_entry(pid: u32, path: &Path) -> Result<String, ProcError> {
    std::fs::read_to_string(path).map_err(|e| {
        // ESRCH shows up when the process is reaped mid-read.
        if e.kind() == ErrorKind::NotFound || e.raw_os_error() == Some(libc::ESRCH) {
            ProcError::NotFound { pid }
        } else {
            ProcError::Io { pid, source: e }
        }
    })
}

/// Extract (utime, stime) in clock ticks from a `/proc/<pid>/stat` line.
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
fn parse_stat_times(stat: &str) -> Result<(u64, u64), String> {
    let close = stat
        .rfind(')')
        .ok_or_else(|| "missing command name terminator".to_string())?;
    let fields: Vec<&str> = stat[close + 1..].split_whitespace().collect();
    // fields[0] is the state (stat field 3); utime and stime are fields 14 and 15.
    if fields.len() < 13 {
        return Err(format!("expected at least 15 stat fields, got {}", fields.len() + 2));
    }
    let utime = fields[11]
        .parse::<u64>()
        .map_err(|e| format!("invalid utime {:?}: {e}", fields[11]))?;
    let stime = fields[12]
        .parse::<u64>()
        .map_err(|e| format!("invalid stime {:?}: {e}", fields[12]))?;
    Ok((utime, stime))
}

/// Resident set size from `/proc/<pid>/status`. Zombies and kernel threads
/// carry no `VmRSS` line and count as zero.
fn parse_vm_rss(status: &str) -> Result<u64, String> {
    let Some(line) = status.lines().find(|l| l.starts_with("VmRSS:")) else {
        return Ok(0);
    };
    let value = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| format!("VmRSS line has no value: {line:?}"))?;
    value
        .parse::<u64>()
        .map_err(|e| format!("invalid VmRSS value {value:?}: {e}"))
}
