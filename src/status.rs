/// Status file: writes the latest run snapshot as JSON while the supervisor runs.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::stats::ExecutionStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Supervisor states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WardenState {
    Running,
    Finished,
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData<'a> {
    pub pid: u32,
    pub state: WardenState,
    pub last_update: DateTime<Utc>,
    pub stats: &'a ExecutionStats,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// so readers never see a partial write.
    pub fn write(&self, data: &StatusData<'_>) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".cpuwarden.status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    /// Write a snapshot, logging instead of failing.
    pub fn update(&self, state: WardenState, stats: &ExecutionStats) {
        let data = StatusData {
            pid: std::process::id(),
            state,
            last_update: Utc::now(),
            stats,
        };
        if let Err(e) = self.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::TerminationReason;
    use tempfile::tempdir;

    fn sample_stats() -> ExecutionStats {
        let mut stats = ExecutionStats::new(Utc::now());
        stats.cpu_time_used = 1.5;
        stats.max_memory_kb = 20480;
        stats.loop_count = 3;
        stats.success_count = 2;
        stats.exit_code = Some(137);
        stats.termination_reason = Some(TerminationReason::Timeout);
        stats
    }

    #[test]
    fn test_status_file_atomic_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cpuwarden.status");
        let sf = StatusFile::new(path.clone());
        let stats = sample_stats();

        sf.write(&StatusData {
            pid: 12345,
            state: WardenState::Running,
            last_update: Utc::now(),
            stats: &stats,
        })
        .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["pid"], 12345);
        assert_eq!(parsed["state"], "running");
        assert_eq!(parsed["stats"]["cpu_time_used"], 1.5);
        assert_eq!(parsed["stats"]["max_memory_kb"], 20480);
        assert_eq!(parsed["stats"]["loop_count"], 3);
        assert_eq!(parsed["stats"]["success_count"], 2);
        assert_eq!(parsed["stats"]["exit_code"], 137);
        assert_eq!(parsed["stats"]["termination_reason"], "timeout");
        assert!(parsed["stats"]["end_time"].is_null());

        let tmp_path = dir
            .path()
            .join(format!(".cpuwarden.status.tmp.{}", std::process::id()));
        assert!(
            !tmp_path.exists(),
            "temp file should be cleaned up by rename"
        );
    }

    #[test]
    fn test_update_overwrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cpuwarden.status");
        let sf = StatusFile::new(path.clone());
        let mut stats = sample_stats();

        sf.update(WardenState::Running, &stats);
        stats.end_time = Some(Utc::now());
        stats.loop_count = 4;
        sf.update(WardenState::Finished, &stats);

        let contents = std::fs::read_to_string(&sf.path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["state"], "finished");
        assert_eq!(parsed["stats"]["loop_count"], 4);
        assert!(parsed["stats"]["end_time"].is_string());
    }

    #[test]
    fn test_status_file_write_to_nonexistent_dir_fails() {
        let sf = StatusFile::new(PathBuf::from("/nonexistent/dir/cpuwarden.status"));
        let stats = sample_stats();
        let result = sf.write(&StatusData {
            pid: 1,
            state: WardenState::Running,
            last_update: Utc::now(),
            stats: &stats,
        });
        assert!(matches!(result, Err(StatusError::Write { .. })));
    }

    #[test]
    fn test_status_error_display() {
        let err = StatusError::Write {
            path: PathBuf::from("/tmp/test"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no perms"),
        };
        let msg = err.to_string();
        assert!(msg.contains("failed to write temp status file"));
        assert!(msg.contains("no perms"));
    }
}
