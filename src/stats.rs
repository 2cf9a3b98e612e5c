/// Run statistics: the cumulative record handed to the reporter, and the
/// per-cycle cell shared between the sampler and the exit/termination path.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::OnceLock;

/// Why a cycle was forcibly ended instead of exiting on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    ProcessStartFailure,
    MemoryLimitExceeded,
    CpuQuotaExceeded,
    Timeout,
}

impl TerminationReason {
    fn code(self) -> u8 {
        match self {
            TerminationReason::ProcessStartFailure => 2,
            TerminationReason::MemoryLimitExceeded => 3,
            TerminationReason::CpuQuotaExceeded => 4,
            TerminationReason::Timeout => 5,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            2 => Some(TerminationReason::ProcessStartFailure),
            3 => Some(TerminationReason::MemoryLimitExceeded),
            4 => Some(TerminationReason::CpuQuotaExceeded),
            5 => Some(TerminationReason::Timeout),
            _ => None,
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::ProcessStartFailure => write!(f, "process start failure"),
            TerminationReason::MemoryLimitExceeded => write!(f, "memory limit exceeded"),
            TerminationReason::CpuQuotaExceeded => write!(f, "CPU quota exceeded"),
            TerminationReason::Timeout => write!(f, "timeout"),
        }
    }
}

/// The cumulative record for one supervisor run.
///
/// Owned by the loop controller and only mutated between cycles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStats {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds of CPU charged against the budget across all cycles.
    pub cpu_time_used: f64,
    pub max_memory_kb: u64,
    /// Exit code of the most recent cycle (None if no process ran).
    pub exit_code: Option<i32>,
    pub termination_reason: Option<TerminationReason>,
    pub loop_count: u32,
    pub success_count: u32,
}

impl ExecutionStats {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time: None,
            cpu_time_used: 0.0,
            max_memory_kb: 0,
            exit_code: None,
            termination_reason: None,
            loop_count: 0,
            success_count: 0,
        }
    }

    /// Fold one resolved cycle into the cumulative record.
    ///
    /// CPU is added exactly once; memory keeps the running peak.
    pub fn fold(&mut self, cycle: &CycleReport) {
        self.cpu_time_used += cycle.cpu_time_used;
        self.max_memory_kb = self.max_memory_kb.max(cycle.max_memory_kb);
        self.loop_count += 1;
        if cycle.exit_code.is_some() {
            self.exit_code = cycle.exit_code;
        }
        if cycle.termination_reason.is_some() {
            self.termination_reason = cycle.termination_reason;
        }
        if cycle.succeeded() {
            self.success_count += 1;
        }
    }

    /// Record a cycle that never got a process.
    pub fn record_start_failure(&mut self) {
        self.loop_count += 1;
        self.termination_reason = Some(TerminationReason::ProcessStartFailure);
    }

    /// A view of the record as if the live cycle were folded in now.
    ///
    /// Used for progress display; does not count the cycle as attempted.
    pub fn with_live(&self, cpu_time_used: f64, max_memory_kb: u64) -> ExecutionStats {
        let mut snapshot = self.clone();
        snapshot.cpu_time_used += cpu_time_used;
        snapshot.max_memory_kb = snapshot.max_memory_kb.max(max_memory_kb);
        snapshot
    }
}

/// Immutable summary of one resolved cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub pid: u32,
    pub cpu_time_used: f64,
    pub max_memory_kb: u64,
    pub exit_code: Option<i32>,
    pub termination_reason: Option<TerminationReason>,
}

impl CycleReport {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.termination_reason.is_none()
    }

    /// Raise the cycle's CPU to `secs` measured after the process was
    /// reaped, when that exceeds what sampling saw.
    pub fn charge_reaped(&mut self, secs: f64) {
        if secs.is_finite() && secs > self.cpu_time_used {
            self.cpu_time_used = secs;
        }
    }
}

const OPEN: u8 = 0;
const EXITED: u8 = 1;

/// How a cycle was settled, as recorded by the first writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Open,
    Exited,
    Terminated(TerminationReason),
}

/// Per-cycle result cell.
///
/// The sampler, the deadline timer and the exit waiter all write here.
/// Resource figures only ever grow. The outcome and exit code are
/// single-assignment: the first compare-and-set wins, later writers see
/// the winner and back off.
#[derive(Debug, Default)]
pub struct CycleStats {
    /// `f64::to_bits` of the CPU seconds. Non-negative floats order the
    /// same as their bit patterns, so `fetch_max` on the bits is a float max.
    cpu_bits: AtomicU64,
    max_memory_kb: AtomicU64,
    settlement: AtomicU8,
    exit_code: OnceLock<i32>,
}

impl CycleStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample; returns the monotonic (cpu, memory) after the update.
    pub fn observe(&self, cpu_time_secs: f64, memory_kb: u64) -> (f64, u64) {
        let cpu = if cpu_time_secs.is_finite() {
            cpu_time_secs.max(0.0)
        } else {
            0.0
        };
        let prev_cpu = self.cpu_bits.fetch_max(cpu.to_bits(), Ordering::AcqRel);
        let prev_mem = self.max_memory_kb.fetch_max(memory_kb, Ordering::AcqRel);
        (f64::from_bits(prev_cpu).max(cpu), prev_mem.max(memory_kb))
    }

    pub fn cpu_time_used(&self) -> f64 {
        f64::from_bits(self.cpu_bits.load(Ordering::Acquire))
    }

    pub fn max_memory_kb(&self) -> u64 {
        self.max_memory_kb.load(Ordering::Acquire)
    }

    /// Claim the cycle for a limit breach. Only the first claimant gets `true`.
    pub fn try_terminate(&self, reason: TerminationReason) -> bool {
        self.settlement
            .compare_exchange(OPEN, reason.code(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the cycle for a natural exit. Fails if a breach was claimed first.
    pub fn try_mark_exited(&self) -> bool {
        self.settlement
            .compare_exchange(OPEN, EXITED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn settlement(&self) -> Settlement {
        match self.settlement.load(Ordering::Acquire) {
            OPEN => Settlement::Open,
            EXITED => Settlement::Exited,
            code => match TerminationReason::from_code(code) {
                Some(reason) => Settlement::Terminated(reason),
                None => Settlement::Open,
            },
        }
    }

    pub fn termination_reason(&self) -> Option<TerminationReason> {
        match self.settlement() {
            Settlement::Terminated(reason) => Some(reason),
            _ => None,
        }
    }

    /// Set the exit code once. Returns `false` if one was already recorded.
    pub fn set_exit_code(&self, code: i32) -> bool {
        self.exit_code.set(code).is_ok()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    pub fn report(&self, pid: u32) -> CycleReport {
        CycleReport {
            pid,
            cpu_time_used: self.cpu_time_used(),
            max_memory_kb: self.max_memory_kb(),
            exit_code: self.exit_code(),
            termination_reason: self.termination_reason(),
        }
    }
}
