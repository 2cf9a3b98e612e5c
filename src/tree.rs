/// Resource usage summed over a whole process tree.
use crate::procfs::{ProcError, ProcSource};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TreeUsage {
    pub cpu_time_secs: f64,
    pub memory_kb: u64,
    /// Number of processes that contributed to the totals.
    pub processes: usize,
}

/// Sum CPU time and resident memory for `root` and every descendant
/// reachable through the children listings at read time.
///
/// Only an unreadable root is an error. A descendant that vanishes
/// mid-walk drops out along with its subtree; nothing is retried.
pub fn aggregate(source: &dyn ProcSource, root: u32) -> Result<TreeUsage, ProcError> {
    let stats = source.read(root)?;
    let mut usage = TreeUsage {
        cpu_time_secs: stats.cpu_time_secs,
        memory_kb: stats.memory_kb,
        processes: 1,
    };
    for child in stats.children {
        add_subtree(source, child, &mut usage);
    }
    Ok(usage)
}

fn add_subtree(source: &dyn ProcSource, pid: u32, usage: &mut TreeUsage) {
    let stats = match source.read(pid) {
        Ok(stats) => stats,
        Err(e) => {
            tracing::debug!(pid, error = %e, "descendant unreadable, skipping branch");
            return;
        }
    };
    usage.cpu_time_secs += stats.cpu_time_secs;
    usage.memory_kb = usage.memory_kb.saturating_add(stats.memory_kb);
    usage.processes += 1;
    for child in stats.children {
        add_subtree(source, child, usage);
    }
}
