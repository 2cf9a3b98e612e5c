/// Loop controller: launches the target binary cycle after cycle, hands
/// each process to the enforcer and folds the results into one record.
///
/// The cumulative record is owned here and only touched between cycles.
/// While a cycle runs, snapshots merging it with the live cycle figures
/// are published on a watch channel for progress display.
use crate::budget::Budget;
use crate::config::{LoopMode, WardenConfig};
use crate::enforcer::{Enforcer, EnforcerSettings};
use crate::executor::{Executor, ProcessHandle};
use crate::procfs::{self, ProcSource};
use crate::stats::{CycleReport, CycleStats, ExecutionStats};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub mode: LoopMode,
    /// Pause between cycles in multi-cycle mode.
    pub pacing_delay: Duration,
    pub max_cycles: Option<u32>,
    /// How often a live snapshot is published while a cycle runs.
    pub progress_interval: Duration,
}

pub struct Supervisor {
    settings: SupervisorSettings,
    budget: Budget,
    executor: Executor,
    enforcer: Enforcer,
    progress: watch::Sender<ExecutionStats>,
    shutdown: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        budget: Budget,
        executor: Executor,
        enforcer: Enforcer,
    ) -> Self {
        let (progress, _) = watch::channel(ExecutionStats::new(Utc::now()));
        Self {
            settings,
            budget,
            executor,
            enforcer,
            progress,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wire up executor, enforcer and loop settings from a validated config.
    pub fn from_config(config: &WardenConfig, source: Arc<dyn ProcSource>) -> Self {
        let budget = config.budget();
        let executor = Executor::new(config.term_grace());
        let enforcer = Enforcer::new(
            EnforcerSettings {
                memory_limit_kb: config.limits.memory_limit_kb,
                timeout: config.timeout(),
                sample_interval: config.sample_interval(),
                kill_grace: config.kill_grace(),
                apply_rlimits: config.limits.apply_rlimits,
            },
            budget,
            source,
            executor.clone(),
        );
        let settings = SupervisorSettings {
            binary: config.binary.path.clone(),
            args: config.binary.args.clone(),
            mode: config.run_loop.mode,
            pacing_delay: config.pacing_delay(),
            max_cycles: config.run_loop.max_cycles,
            progress_interval: config.sample_interval(),
        };
        Self::new(settings, budget, executor, enforcer)
    }

    /// Stop starting new cycles once `flag` is raised.
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    /// Receive cumulative snapshots, including live figures mid-cycle.
    pub fn subscribe(&self) -> watch::Receiver<ExecutionStats> {
        self.progress.subscribe()
    }

    /// Run cycles until the loop has to stop, then return the final record.
    ///
    /// Never fails: a binary that cannot be launched is recorded as a
    /// start failure and ends the run.
    pub async fn run(&self) -> ExecutionStats {
        let mut stats = ExecutionStats::new(Utc::now());
        self.progress.send_replace(stats.clone());
        let single = self.settings.mode == LoopMode::Single;
        tracing::info!(
            binary = %self.settings.binary.display(),
            mode = ?self.settings.mode,
            budget = ?self.budget.mode(),
            "supervisor starting"
        );

        let mut stopped = if single { None } else { self.stop_reason(&stats) };
        while stopped.is_none() {
            let reaped_before = procfs::reaped_children_cpu_secs();
            let started = match self.enforcer.rlimit_plan(stats.cpu_time_used) {
                Some(plan) => {
                    self.executor
                        .start_with_limits(&self.settings.binary, &self.settings.args, &plan)
                }
                None => self.executor.start(&self.settings.binary, &self.settings.args),
            };
            let handle = match started {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::error!(error = %e, "could not launch binary");
                    stats.record_start_failure();
                    stopped = Some("start failure");
                    break;
                }
            };

            let mut report = self.drive_cycle(&handle, &stats).await;
            drop(handle);
            // The sampler misses CPU burned after its last tick.
            report.charge_reaped(procfs::reaped_children_cpu_secs() - reaped_before);
            stats.fold(&report);
            tracing::info!(
                pid = report.pid,
                cycle = stats.loop_count,
                cycle_cpu_secs = report.cpu_time_used,
                total_cpu_secs = stats.cpu_time_used,
                remaining_secs = self.budget.remaining(stats.cpu_time_used),
                succeeded = report.succeeded(),
                "cycle folded"
            );
            self.progress.send_replace(stats.clone());

            if single {
                stopped = Some("single cycle complete");
                break;
            }
            stopped = self.stop_reason(&stats);
            if stopped.is_none() {
                tokio::time::sleep(self.settings.pacing_delay).await;
            }
        }

        stats.end_time = Some(Utc::now());
        tracing::info!(
            reason = stopped.unwrap_or("unknown"),
            cycles = stats.loop_count,
            successes = stats.success_count,
            cpu_secs = stats.cpu_time_used,
            "supervisor finished"
        );
        self.progress.send_replace(stats.clone());
        stats
    }

    /// Why no further cycle may start, if anything.
    fn stop_reason(&self, stats: &ExecutionStats) -> Option<&'static str> {
        if !self.budget.should_continue(stats.cpu_time_used) {
            Some("cpu budget exhausted")
        } else if self
            .settings
            .max_cycles
            .is_some_and(|max| stats.loop_count >= max)
        {
            Some("max cycles reached")
        } else if self.shutdown.load(Ordering::SeqCst) {
            Some("shutdown requested")
        } else {
            None
        }
    }

    /// Run the enforcer for one cycle while publishing live snapshots.
    async fn drive_cycle(&self, handle: &ProcessHandle, stats: &ExecutionStats) -> CycleReport {
        let cycle = Arc::new(CycleStats::new());
        let run = self
            .enforcer
            .run(handle, stats.cpu_time_used, Arc::clone(&cycle));
        tokio::pin!(run);

        let mut ticker = tokio::time::interval(self.settings.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                report = &mut run => return report,
                _ = ticker.tick() => {
                    let live = stats.with_live(cycle.cpu_time_used(), cycle.max_memory_kb());
                    self.progress.send_replace(live);
                }
            }
        }
    }
}
