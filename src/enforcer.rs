/// Resource enforcement for one execution cycle.
///
/// Three concurrent units race per cycle: the exit waiter (owned by the
/// executor), a periodic sampler and an optional deadline timer. Either
/// limit watcher that detects a breach claims the cycle's result cell
/// before anything else happens, so at most one reason is recorded and at
/// most one kill is issued. Whatever resolves the cycle, the watchers are
/// aborted before `run` returns.
use crate::budget::Budget;
use crate::executor::{Executor, ProcessHandle, KILLED_EXIT_CODE};
use crate::limits::{self, LimitError, RlimitPlan};
use crate::procfs::{ProcError, ProcSource};
use crate::stats::{CycleReport, CycleStats, TerminationReason};
use crate::tree;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Limits and timings the enforcer applies to every cycle.
#[derive(Debug, Clone)]
pub struct EnforcerSettings {
    /// 0 = unlimited.
    pub memory_limit_kb: u64,
    pub timeout: Option<Duration>,
    pub sample_interval: Duration,
    /// How long to wait for a killed process to report its exit.
    pub kill_grace: Duration,
    pub apply_rlimits: bool,
}

/// One tree-wide usage reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_time_secs: f64,
    pub memory_kb: u64,
    pub observed_at: Instant,
}

/// Enforcer state for the cycle being monitored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sampling,
    NaturallyExited,
    Terminating,
    Terminated,
}

/// Decide whether a sample breaches a limit. Memory is checked first.
///
/// `charged` is CPU already billed by earlier cycles, so the check runs
/// against the same total the loop controller uses.
pub fn evaluate(
    sample: &ResourceSample,
    memory_limit_kb: u64,
    budget: &Budget,
    charged: f64,
) -> Option<TerminationReason> {
    if memory_limit_kb > 0 && sample.memory_kb > memory_limit_kb {
        return Some(TerminationReason::MemoryLimitExceeded);
    }
    if budget.quota_exceeded(charged + sample.cpu_time_secs) {
        return Some(TerminationReason::CpuQuotaExceeded);
    }
    None
}

/// Aborts the cycle's watcher tasks when dropped.
struct Watchers(Vec<JoinHandle<()>>);

impl Drop for Watchers {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

pub struct Enforcer {
    settings: EnforcerSettings,
    budget: Budget,
    source: Arc<dyn ProcSource>,
    executor: Executor,
}

impl Enforcer {
    pub fn new(
        settings: EnforcerSettings,
        budget: Budget,
        source: Arc<dyn ProcSource>,
        executor: Executor,
    ) -> Self {
        Self {
            settings,
            budget,
            source,
            executor,
        }
    }

    /// Monitor `handle` until it exits or is killed for breaching a limit.
    ///
    /// `charged` is the CPU already billed to the run before this cycle.
    /// Live figures are written into `cycle` as they are sampled.
    pub async fn run(
        &self,
        handle: &ProcessHandle,
        charged: f64,
        cycle: Arc<CycleStats>,
    ) -> CycleReport {
        let pid = handle.pid();
        let mut phase = Phase::Idle;
        transition(pid, &mut phase, Phase::Sampling);

        if let Some(plan) = self.rlimit_plan(charged) {
            check_rlimits(pid, &plan);
        }

        let breach = Arc::new(Notify::new());
        let mut tasks = vec![tokio::spawn(sample_loop(Sampler {
            pid,
            interval: self.settings.sample_interval,
            memory_limit_kb: self.settings.memory_limit_kb,
            budget: self.budget,
            charged,
            source: Arc::clone(&self.source),
            cycle: Arc::clone(&cycle),
            breach: Arc::clone(&breach),
        }))];
        if let Some(timeout) = self.settings.timeout {
            tasks.push(tokio::spawn(deadline(
                pid,
                timeout,
                Arc::clone(&cycle),
                Arc::clone(&breach),
            )));
        }
        let watchers = Watchers(tasks);

        let exited = tokio::select! {
            result = self.executor.wait(handle) => Some(result),
            _ = breach.notified() => None,
        };
        drop(watchers);

        match exited {
            Some(result) => {
                if cycle.try_mark_exited() {
                    transition(pid, &mut phase, Phase::NaturallyExited);
                } else {
                    // A watcher claimed the cycle as the process was exiting.
                    transition(pid, &mut phase, Phase::Terminated);
                }
                match result {
                    Ok(code) => {
                        cycle.set_exit_code(code);
                    }
                    Err(e) => tracing::warn!(pid, error = %e, "could not collect exit status"),
                }
            }
            None => {
                tracing::debug!(
                    pid,
                    liveness = ?self.executor.check_liveness(handle),
                    "cycle claimed by watcher"
                );
                transition(pid, &mut phase, Phase::Terminating);
                self.executor.kill(handle).await;
                let code = match tokio::time::timeout(
                    self.settings.kill_grace,
                    self.executor.wait(handle),
                )
                .await
                {
                    Ok(Ok(code)) => code,
                    Ok(Err(e)) => {
                        tracing::warn!(pid, error = %e, "could not collect exit status after kill");
                        KILLED_EXIT_CODE
                    }
                    Err(_) => {
                        tracing::warn!(
                            pid,
                            grace_ms = self.settings.kill_grace.as_millis() as u64,
                            "process did not exit after kill"
                        );
                        KILLED_EXIT_CODE
                    }
                };
                cycle.set_exit_code(code);
                transition(pid, &mut phase, Phase::Terminated);
            }
        }

        let report = cycle.report(pid);
        tracing::info!(
            pid,
            exit_code = ?report.exit_code,
            reason = ?report.termination_reason,
            cpu_secs = report.cpu_time_used,
            max_memory_kb = report.max_memory_kb,
            "cycle resolved"
        );
        report
    }

    /// Kernel limits to start the next process under, if any.
    ///
    /// `charged` is the CPU already billed, so the CPU limit covers only
    /// what remains of the budget.
    pub fn rlimit_plan(&self, charged: f64) -> Option<RlimitPlan> {
        if !self.settings.apply_rlimits {
            return None;
        }
        let plan = RlimitPlan::new(self.budget.remaining(charged), self.settings.memory_limit_kb);
        (!plan.is_empty()).then_some(plan)
    }
}

/// Confirm the limits installed at spawn took hold. Never fatal.
fn check_rlimits(pid: u32, plan: &RlimitPlan) {
    match limits::verify(pid, plan) {
        Ok(()) => {}
        Err(LimitError::Unsupported) => {
            tracing::warn!(pid, "kernel resource limits unsupported, enforcing by polling only")
        }
        Err(e) => tracing::warn!(pid, error = %e, "kernel resource limits not in effect"),
    }
}

fn transition(pid: u32, phase: &mut Phase, next: Phase) {
    tracing::debug!(pid, from = ?*phase, to = ?next, "enforcer phase");
    *phase = next;
}

struct Sampler {
    pid: u32,
    interval: Duration,
    memory_limit_kb: u64,
    budget: Budget,
    charged: f64,
    source: Arc<dyn ProcSource>,
    cycle: Arc<CycleStats>,
    breach: Arc<Notify>,
}

async fn sample_loop(sampler: Sampler) {
    let pid = sampler.pid;
    let mut ticker = tokio::time::interval(sampler.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut previous: Option<Instant> = None;
    loop {
        ticker.tick().await;
        let usage = match tree::aggregate(sampler.source.as_ref(), pid) {
            Ok(usage) => usage,
            Err(ProcError::NotFound { .. }) => {
                // Exiting; the exit waiter will resolve the cycle.
                tracing::debug!(pid, "root process no longer readable");
                continue;
            }
            Err(e) => {
                tracing::debug!(pid, error = %e, "sample skipped");
                continue;
            }
        };
        let (cpu, max_memory_kb) = sampler.cycle.observe(usage.cpu_time_secs, usage.memory_kb);
        let sample = ResourceSample {
            cpu_time_secs: cpu,
            memory_kb: usage.memory_kb,
            observed_at: Instant::now(),
        };
        tracing::debug!(
            pid,
            cpu_secs = cpu,
            memory_kb = usage.memory_kb,
            max_memory_kb,
            processes = usage.processes,
            gap_ms = previous.map(|p| sample.observed_at.duration_since(p).as_millis() as u64),
            "sample"
        );
        previous = Some(sample.observed_at);

        if let Some(reason) = evaluate(
            &sample,
            sampler.memory_limit_kb,
            &sampler.budget,
            sampler.charged,
        ) {
            if sampler.cycle.try_terminate(reason) {
                tracing::warn!(
                    pid,
                    %reason,
                    cpu_secs = cpu,
                    memory_kb = usage.memory_kb,
                    memory_limit_kb = sampler.memory_limit_kb,
                    "limit breached, terminating"
                );
                sampler.breach.notify_one();
            }
            return;
        }
    }
}

async fn deadline(pid: u32, timeout: Duration, cycle: Arc<CycleStats>, breach: Arc<Notify>) {
    tokio::time::sleep(timeout).await;
    if cycle.try_terminate(TerminationReason::Timeout) {
        tracing::warn!(pid, timeout_secs = timeout.as_secs_f64(), "deadline reached, terminating");
        breach.notify_one();
    }
}
