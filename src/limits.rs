/// Kernel resource limits for a supervised process (the hard tier).
///
/// Installed as a `pre_exec` hook, so the limits are in place before the
/// binary runs and every process it forks inherits them. The child cannot
/// report a failed `setrlimit`, so the parent reads the limits back with
/// `prlimit(2)` after spawn and logs any that did not take. The CPU limit
/// sits above the polling ceiling so the sampler records the breach
/// first. Hosts without rlimit support fall back to polling only.
use std::io;
use tokio::process::Command;

/// Seconds added on top of the remaining CPU budget before the kernel steps in.
pub const CPU_RLIMIT_SLACK_SECS: u64 = 2;

/// Limits to apply to one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RlimitPlan {
    /// Soft RLIMIT_CPU in seconds; the hard limit is one second higher.
    pub cpu_secs: Option<u64>,
    /// RLIMIT_AS in bytes.
    pub address_space_bytes: Option<u64>,
}

impl RlimitPlan {
    /// Build a plan from the remaining CPU budget and the memory ceiling
    /// (0 = unlimited).
    pub fn new(remaining_cpu_secs: f64, memory_limit_kb: u64) -> Self {
        let cpu_secs = if remaining_cpu_secs.is_finite() {
            Some((remaining_cpu_secs.max(0.0).ceil() as u64).saturating_add(CPU_RLIMIT_SLACK_SECS))
        } else {
            None
        };
        let address_space_bytes = (memory_limit_kb > 0).then(|| memory_limit_kb.saturating_mul(1024));
        Self {
            cpu_secs,
            address_space_bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cpu_secs.is_none() && self.address_space_bytes.is_none()
    }
}

/// Errors from checking kernel limits. Never fatal to a cycle.
#[derive(Debug)]
pub enum LimitError {
    /// The host has no per-process limit facility we can drive.
    Unsupported,
    /// The limit could not be read back from the process.
    Query {
        pid: u32,
        resource: &'static str,
        source: io::Error,
    },
    /// The process is running with a different soft limit than planned.
    Mismatch {
        pid: u32,
        resource: &'static str,
        expected: u64,
        actual: u64,
    },
}

impl std::fmt::Display for LimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitError::Unsupported => {
                write!(f, "per-process resource limits are not supported on this host")
            }
            LimitError::Query {
                pid,
                resource,
                source,
            } => write!(f, "failed to read {resource} for process {pid}: {source}"),
            LimitError::Mismatch {
                pid,
                resource,
                expected,
                actual,
            } => write!(
                f,
                "{resource} for process {pid} is {actual}, expected {expected}"
            ),
        }
    }
}

impl std::error::Error for LimitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LimitError::Query { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
enum Resource {
    Cpu,
    AddressSpace,
}

#[cfg(target_os = "linux")]
impl Resource {
    fn name(self) -> &'static str {
        match self {
            Resource::Cpu => "RLIMIT_CPU",
            Resource::AddressSpace => "RLIMIT_AS",
        }
    }

    fn id(self) -> libc::__rlimit_resource_t {
        match self {
            Resource::Cpu => libc::RLIMIT_CPU,
            Resource::AddressSpace => libc::RLIMIT_AS,
        }
    }

    /// (resource, soft, hard) pairs the plan asks for.
    fn planned(plan: &RlimitPlan) -> [Option<(Resource, u64, u64)>; 2] {
        [
            plan.cpu_secs
                .map(|secs| (Resource::Cpu, secs, secs.saturating_add(1))),
            plan.address_space_bytes
                .map(|bytes| (Resource::AddressSpace, bytes, bytes)),
        ]
    }
}

/// Set the plan's limits on the calling process. Runs in the forked child,
/// so it only makes `setrlimit` calls and ignores their result.
#[cfg(target_os = "linux")]
fn set_own_limits(plan: &RlimitPlan) {
    for (resource, soft, hard) in Resource::planned(plan).into_iter().flatten() {
        let limit = libc::rlimit {
            rlim_cur: soft as libc::rlim_t,
            rlim_max: hard as libc::rlim_t,
        };
        // SAFETY: `limit` is a valid rlimit and the resource is a valid constant.
        unsafe {
            libc::setrlimit(resource.id(), &limit);
        }
    }
}

/// Arrange for `command`'s child to start under `plan`.
#[cfg(target_os = "linux")]
pub fn install(command: &mut Command, plan: RlimitPlan) {
    if plan.is_empty() {
        return;
    }
    // SAFETY: the hook only calls setrlimit, which is async-signal-safe,
    // and does not allocate.
    unsafe {
        command.pre_exec(move || {
            set_own_limits(&plan);
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
pub fn install(_command: &mut Command, _plan: RlimitPlan) {}

/// Check that `pid` runs with the soft limits in `plan`.
///
/// A process that has already exited passes.
#[cfg(target_os = "linux")]
pub fn verify(pid: u32, plan: &RlimitPlan) -> Result<(), LimitError> {
    for (resource, expected, _) in Resource::planned(plan).into_iter().flatten() {
        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: a null new-limit pointer only reads; `current` is valid for writes.
        let rc = unsafe {
            libc::prlimit(
                pid as libc::pid_t,
                resource.id(),
                std::ptr::null(),
                &mut current,
            )
        };
        if rc != 0 {
            let source = io::Error::last_os_error();
            if source.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(LimitError::Query {
                pid,
                resource: resource.name(),
                source,
            });
        }
        let actual = current.rlim_cur as u64;
        if actual != expected {
            return Err(LimitError::Mismatch {
                pid,
                resource: resource.name(),
                expected,
                actual,
            });
        }
    }
    tracing::debug!(pid, plan = ?plan, "kernel resource limits in place");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn verify(_pid: u32, _plan: &RlimitPlan) -> Result<(), LimitError> {
    Err(LimitError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_rounds_up_and_adds_slack() {
        let plan = RlimitPlan::new(1.2, 0);
        assert_eq!(plan.cpu_secs, Some(2 + CPU_RLIMIT_SLACK_SECS));
        assert_eq!(plan.address_space_bytes, None);
    }

    #[test]
    fn test_plan_exhausted_budget_still_has_slack() {
        let plan = RlimitPlan::new(-4.0, 0);
        assert_eq!(plan.cpu_secs, Some(CPU_RLIMIT_SLACK_SECS));
    }

    #[test]
    fn test_plan_memory_in_bytes() {
        let plan = RlimitPlan::new(10.0, 2048);
        assert_eq!(plan.address_space_bytes, Some(2048 * 1024));
        assert!(!plan.is_empty());
    }

    #[test]
    fn test_plan_infinite_budget_has_no_cpu_limit() {
        let plan = RlimitPlan::new(f64::INFINITY, 0);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_error_display() {
        let err = LimitError::Mismatch {
            pid: 7,
            resource: "RLIMIT_CPU",
            expected: 3,
            actual: u64::MAX,
        };
        let msg = err.to_string();
        assert!(msg.contains("RLIMIT_CPU"));
        assert!(msg.contains("process 7"));
        assert!(msg.contains("expected 3"));
    }

    fn cpu_limits(pid: u32) -> (String, String) {
        let limits = std::fs::read_to_string(format!("/proc/{pid}/limits")).unwrap();
        let line = limits
            .lines()
            .find(|l| l.starts_with("Max cpu time"))
            .unwrap();
        let fields: Vec<&str> = line.split_whitespace().collect();
        (fields[3].to_string(), fields[4].to_string())
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_installed_limits_reach_child_and_its_forks() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("bg.pid");
        let plan = RlimitPlan {
            cpu_secs: Some(7),
            address_space_bytes: Some(1 << 32),
        };
        let mut command = Command::new("sh");
        command.arg("-c").arg(format!(
            "sleep 30 & echo $! > {}; wait",
            pid_file.display()
        ));
        install(&mut command, plan);
        let mut child = command.spawn().unwrap();
        let pid = child.id().unwrap();

        let mut bg_pid = None;
        for _ in 0..100 {
            if let Ok(s) = std::fs::read_to_string(&pid_file) {
                if let Ok(p) = s.trim().parse::<u32>() {
                    bg_pid = Some(p);
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let bg_pid = bg_pid.expect("background pid written");

        let leader = cpu_limits(pid);
        let forked = cpu_limits(bg_pid);
        let verified = verify(pid, &plan);
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(bg_pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        );
        child.kill().await.unwrap();

        assert_eq!(leader, ("7".to_string(), "8".to_string()));
        assert_eq!(forked, ("7".to_string(), "8".to_string()));
        verified.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_verify_reports_missing_limit() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let pid = child.id().unwrap();
        let plan = RlimitPlan {
            cpu_secs: Some(7),
            address_space_bytes: None,
        };
        let result = verify(pid, &plan);
        child.kill().await.unwrap();

        assert!(matches!(
            result,
            Err(LimitError::Mismatch {
                resource: "RLIMIT_CPU",
                expected: 7,
                ..
            })
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_verify_on_exited_process_passes() {
        let plan = RlimitPlan {
            cpu_secs: Some(1),
            address_space_bytes: None,
        };
        assert!(verify(u32::MAX / 2, &plan).is_ok());
    }
}
