/// Human-readable rendering of run statistics.
///
/// Derived figures (success rate, CPU efficiency) are computed here; the
/// supervisor only records raw values.
use crate::stats::ExecutionStats;
use chrono::{DateTime, Utc};
use std::fmt::Write;

/// One-line outcome. A termination reason outranks the exit code.
pub fn outcome_line(stats: &ExecutionStats) -> String {
    match (stats.termination_reason, stats.exit_code) {
        (Some(reason), _) => format!("terminated: {reason}"),
        (None, Some(code)) if code != 0 => format!("exited with non-zero code {code}"),
        (None, Some(_)) => "completed successfully".to_string(),
        (None, None) => "no process was run".to_string(),
    }
}

/// Successful cycles as a percentage of attempted cycles.
pub fn success_rate(stats: &ExecutionStats) -> Option<f64> {
    (stats.loop_count > 0)
        .then(|| stats.success_count as f64 / stats.loop_count as f64 * 100.0)
}

/// CPU seconds used as a percentage of wall-clock time.
pub fn cpu_efficiency(stats: &ExecutionStats, wall_secs: f64) -> Option<f64> {
    (wall_secs > 0.0).then(|| stats.cpu_time_used / wall_secs * 100.0)
}

fn elapsed_secs(stats: &ExecutionStats, now: DateTime<Utc>) -> f64 {
    let end = stats.end_time.unwrap_or(now);
    (end - stats.start_time)
        .to_std()
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Multi-line final report.
pub fn render(stats: &ExecutionStats) -> String {
    let wall = elapsed_secs(stats, Utc::now());
    let mut out = String::new();
    let _ = writeln!(out, "=========== cpuwarden report ===========");
    let _ = writeln!(out, "Duration:          {wall:.3}s");
    let _ = writeln!(out, "CPU time used:     {:.2}s", stats.cpu_time_used);
    let _ = writeln!(out, "Peak memory:       {} KB", stats.max_memory_kb);
    let _ = writeln!(out, "Outcome:           {}", outcome_line(stats));
    let _ = writeln!(out, "Cycles:            {}", stats.loop_count);
    let _ = writeln!(out, "Successful cycles: {}", stats.success_count);
    if let Some(rate) = success_rate(stats) {
        let _ = writeln!(out, "Success rate:      {rate:.1}%");
    }
    if let Some(efficiency) = cpu_efficiency(stats, wall) {
        let _ = writeln!(out, "CPU efficiency:    {efficiency:.1}%");
    }
    let _ = write!(out, "========================================");
    out
}

/// The final record as pretty JSON.
pub fn render_json(stats: &ExecutionStats) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(stats)
}

/// Single-line progress summary for a live snapshot.
pub fn progress_line(stats: &ExecutionStats, now: DateTime<Utc>) -> String {
    format!(
        "[running {:.0}s] cpu {:.2}s | mem {} KB | cycles {}",
        elapsed_secs(stats, now),
        stats.cpu_time_used,
        stats.max_memory_kb,
        stats.loop_count
    )
}
