/// Process lifecycle: spawn the target binary as a process-group leader,
/// kill the whole group, and wait for the exit code.
///
/// The child is owned by a background task that blocks on its exit and
/// publishes the decoded code on a watch channel. Every `wait` and
/// `check_liveness` reads that channel, so the code is observed the same
/// way no matter how often or in what order they are called.
use crate::limits::{self, RlimitPlan};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
#[cfg(test)]
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Exit code recorded when a killed process never reports its exit.
pub const KILLED_EXIT_CODE: i32 = 128 + libc::SIGKILL;

#[derive(Debug, Clone, PartialEq)]
enum ExitOutcome {
    Code(i32),
    WaitFailed(String),
}

/// A running (or finished) child process.
///
/// Dropping the handle aborts the exit waiter, which drops the child and
/// with it sends SIGKILL to the leader if it is somehow still alive.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    exit: watch::Receiver<Option<ExitOutcome>>,
    waiter: JoinHandle<()>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.waiter.abort();
    }
}

/// Non-blocking view of a process's state, for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Exited(i32),
}

/// Errors from process lifecycle operations.
#[derive(Debug)]
pub enum ExecError {
    /// The binary could not be spawned.
    Launch {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Waiting on the process failed for a reason other than a non-zero exit.
    Wait { pid: u32, detail: String },
    /// The handle no longer refers to a trackable process.
    InvalidHandle { pid: u32 },
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::Launch { path, source } => {
                write!(f, "failed to start {}: {source}", path.display())
            }
            ExecError::Wait { pid, detail } => {
                write!(f, "failed to wait for process {pid}: {detail}")
            }
            ExecError::InvalidHandle { pid } => write!(f, "invalid process handle for pid {pid}"),
        }
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecError::Launch { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Starts, kills and waits on supervised processes.
#[derive(Debug, Clone)]
pub struct Executor {
    /// How long `kill` waits after SIGTERM before sending SIGKILL.
    term_grace: Duration,
    #[cfg(test)]
    kills: Arc<AtomicUsize>,
}

impl Executor {
    pub fn new(term_grace: Duration) -> Self {
        Self {
            term_grace,
            #[cfg(test)]
            kills: Arc::default(),
        }
    }

    /// Spawn `binary` as the leader of a new process group.
    ///
    /// Standard streams are inherited from the supervisor. Must be called
    /// from within a tokio runtime.
    pub fn start(&self, binary: &Path, args: &[String]) -> Result<ProcessHandle, ExecError> {
        self.start_with_limits(binary, args, &RlimitPlan::default())
    }

    /// Like [`Executor::start`], with kernel resource limits set in the
    /// child before it execs, so every process it forks inherits them.
    pub fn start_with_limits(
        &self,
        binary: &Path,
        args: &[String],
        plan: &RlimitPlan,
    ) -> Result<ProcessHandle, ExecError> {
        tracing::info!(binary = %binary.display(), args = ?args, "starting process");

        let mut command = Command::new(binary);
        command
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0) // New process group so kill reaches every descendant
            .kill_on_drop(true);
        if !plan.is_empty() {
            limits::install(&mut command, *plan);
        }
        let mut child = command
            .spawn()
            .map_err(|e| ExecError::Launch {
                path: binary.to_path_buf(),
                source: e,
            })?;

        let pid = child.id().ok_or_else(|| ExecError::Launch {
            path: binary.to_path_buf(),
            source: std::io::Error::other("process exited before its pid was read"),
        })?;
        tracing::info!(pid, "process started");

        let (tx, rx) = watch::channel(None);
        let waiter = tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => ExitOutcome::Code(decode_status(status)),
                Err(e) => ExitOutcome::WaitFailed(e.to_string()),
            };
            tracing::debug!(pid, outcome = ?outcome, "process exit observed");
            tx.send_replace(Some(outcome));
        });

        Ok(ProcessHandle {
            pid,
            exit: rx,
            waiter,
        })
    }

    /// Terminate the process group: SIGTERM, a short grace, then SIGKILL.
    ///
    /// Falls back to signalling the leader alone when group addressing
    /// fails. Never returns an error; failures are logged. A handle whose
    /// process has already exited is left alone.
    pub async fn kill(&self, handle: &ProcessHandle) {
        #[cfg(test)]
        self.kills.fetch_add(1, Ordering::SeqCst);
        let pid = handle.pid;
        if handle.has_exited() {
            tracing::debug!(pid, "kill requested for exited process, nothing to do");
            return;
        }
        let group = Pid::from_raw(pid as i32);

        tracing::info!(pid, "terminating process group");
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            log_signal_error(pid, "SIGTERM to group", e);
        }

        let mut exit = handle.exit.clone();
        let exited = tokio::time::timeout(self.term_grace, exit.wait_for(|o| o.is_some()))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);

        // Descendants that ignored SIGTERM outlive the leader; sweep the group.
        if let Err(e) = killpg(group, Signal::SIGKILL) {
            log_signal_error(pid, "SIGKILL to group", e);
            if !exited && !handle.has_exited() {
                tracing::warn!(pid, "group kill failed, killing leader directly");
                if let Err(e) = kill(group, Signal::SIGKILL) {
                    log_signal_error(pid, "SIGKILL to leader", e);
                }
            }
        }
    }

    /// Block until the process exits and return its exit code.
    ///
    /// Processes ended by a signal report `128 + signal`.
    pub async fn wait(&self, handle: &ProcessHandle) -> Result<i32, ExecError> {
        let mut exit = handle.exit.clone();
        let outcome = exit
            .wait_for(|o| o.is_some())
            .await
            .map_err(|_| ExecError::Wait {
                pid: handle.pid,
                detail: "exit waiter stopped before the process exited".to_string(),
            })?
            .clone();
        match outcome {
            Some(ExitOutcome::Code(code)) => Ok(code),
            Some(ExitOutcome::WaitFailed(detail)) => Err(ExecError::Wait {
                pid: handle.pid,
                detail,
            }),
            None => Err(ExecError::InvalidHandle { pid: handle.pid }),
        }
    }

    /// Number of `kill` calls made through this executor or its clones.
    #[cfg(test)]
    pub(crate) fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Report whether the process is still running without blocking.
    pub fn check_liveness(&self, handle: &ProcessHandle) -> Result<Liveness, ExecError> {
        if handle.pid == 0 {
            return Err(ExecError::InvalidHandle { pid: handle.pid });
        }
        let outcome = handle.exit.borrow().clone();
        match outcome {
            Some(ExitOutcome::Code(code)) => Ok(Liveness::Exited(code)),
            Some(ExitOutcome::WaitFailed(detail)) => Err(ExecError::Wait {
                pid: handle.pid,
                detail,
            }),
            None if handle.waiter.is_finished() => Err(ExecError::InvalidHandle { pid: handle.pid }),
            None => Ok(Liveness::Running),
        }
    }
}

/// Decode a wait status into a single exit code.
fn decode_status(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else if let Some(signal) = status.signal() {
        128 + signal
    } else {
        -1
    }
}

fn log_signal_error(pid: u32, what: &str, err: Errno) {
    if err == Errno::ESRCH {
        tracing::debug!(pid, "{what}: no such process");
    } else {
        tracing::warn!(pid, error = %err, "{what} failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> (PathBuf, Vec<String>) {
        (PathBuf::from("sh"), vec!["-c".to_string(), script.to_string()])
    }

    fn executor() -> Executor {
        Executor::new(Duration::from_millis(200))
    }

    fn is_gone(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            // A zombie still has an entry but is no longer running.
            Ok(stat) => stat
                .rfind(')')
                .and_then(|i| stat[i + 1..].split_whitespace().next())
                .map(|state| state == "Z" || state == "X")
                .unwrap_or(false),
            Err(_) => true,
        }
    }

    #[test]
    fn test_decode_status() {
        assert_eq!(decode_status(ExitStatus::from_raw(0)), 0);
        assert_eq!(decode_status(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(decode_status(ExitStatus::from_raw(libc::SIGTERM)), 143);
        assert_eq!(decode_status(ExitStatus::from_raw(libc::SIGKILL)), KILLED_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_start_failure_is_launch_error() {
        let err = executor()
            .start(Path::new("/nonexistent/binary-xyz"), &[])
            .unwrap_err();
        assert!(matches!(err, ExecError::Launch { .. }));
        assert!(err.to_string().contains("failed to start"));
    }

    #[tokio::test]
    async fn test_wait_returns_exit_code() {
        let exec = executor();
        let (bin, args) = sh("exit 42");
        let handle = exec.start(&bin, &args).unwrap();
        assert!(handle.pid() > 0);
        assert_eq!(exec.wait(&handle).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_wait_unaffected_by_liveness_polling() {
        let exec = executor();
        let (bin, args) = sh("sleep 0.2; exit 3");
        let handle = exec.start(&bin, &args).unwrap();

        let mut saw_running = false;
        for _ in 0..30 {
            if exec.check_liveness(&handle).unwrap() == Liveness::Running {
                saw_running = true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(saw_running);
        assert_eq!(exec.wait(&handle).await.unwrap(), 3);
        assert_eq!(exec.wait(&handle).await.unwrap(), 3);
        assert_eq!(exec.check_liveness(&handle).unwrap(), Liveness::Exited(3));
    }

    #[tokio::test]
    async fn test_kill_after_exit_is_noop() {
        let exec = executor();
        let (bin, args) = sh("exit 0");
        let handle = exec.start(&bin, &args).unwrap();
        assert_eq!(exec.wait(&handle).await.unwrap(), 0);

        tokio::time::timeout(Duration::from_secs(2), exec.kill(&handle))
            .await
            .expect("kill on exited process must not hang");
        tokio::time::timeout(Duration::from_secs(2), exec.kill(&handle))
            .await
            .expect("second kill must not hang");
        assert_eq!(exec.wait(&handle).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_kill_terminates_running_process() {
        let exec = executor();
        let (bin, args) = sh("sleep 30");
        let handle = exec.start(&bin, &args).unwrap();

        exec.kill(&handle).await;
        let code = tokio::time::timeout(Duration::from_secs(5), exec.wait(&handle))
            .await
            .unwrap()
            .unwrap();
        assert!(code == 143 || code == KILLED_EXIT_CODE, "got {code}");
    }

    #[tokio::test]
    async fn test_kill_escalates_when_term_ignored() {
        let exec = executor();
        let (bin, args) = sh("trap '' TERM; while :; do sleep 0.05; done");
        let handle = exec.start(&bin, &args).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        exec.kill(&handle).await;
        let code = tokio::time::timeout(Duration::from_secs(5), exec.wait(&handle))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, KILLED_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_kill_reaches_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("bg.pid");
        let exec = executor();
        let (bin, args) = sh(&format!(
            "sleep 30 & echo $! > {}; wait",
            pid_file.display()
        ));
        let handle = exec.start(&bin, &args).unwrap();

        let mut bg_pid = None;
        for _ in 0..100 {
            if let Ok(s) = std::fs::read_to_string(&pid_file) {
                if let Ok(pid) = s.trim().parse::<i32>() {
                    bg_pid = Some(pid);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let bg_pid = bg_pid.expect("background pid written");

        exec.kill(&handle).await;
        let _ = tokio::time::timeout(Duration::from_secs(5), exec.wait(&handle)).await;

        let mut gone = false;
        for _ in 0..100 {
            if is_gone(bg_pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "background child {bg_pid} survived the group kill");
    }

    #[tokio::test]
    async fn test_kill_count_tracks_calls() {
        let exec = executor();
        let (bin, args) = sh("exit 0");
        let handle = exec.start(&bin, &args).unwrap();
        exec.wait(&handle).await.unwrap();
        assert_eq!(exec.kill_count(), 0);

        let shared = exec.clone();
        shared.kill(&handle).await;
        exec.kill(&handle).await;
        assert_eq!(exec.kill_count(), 2);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_start_with_limits_applies_plan() {
        let exec = executor();
        let plan = RlimitPlan {
            cpu_secs: Some(9),
            address_space_bytes: None,
        };
        let (bin, args) = sh("sleep 5");
        let handle = exec.start_with_limits(&bin, &args, &plan).unwrap();
        let verified = limits::verify(handle.pid(), &plan);
        exec.kill(&handle).await;
        verified.unwrap();
    }

    #[tokio::test]
    async fn test_liveness_reports_running_then_exited() {
        let exec = executor();
        let (bin, args) = sh("sleep 0.3");
        let handle = exec.start(&bin, &args).unwrap();
        assert_eq!(exec.check_liveness(&handle).unwrap(), Liveness::Running);
        exec.wait(&handle).await.unwrap();
        assert_eq!(exec.check_liveness(&handle).unwrap(), Liveness::Exited(0));
    }
}
