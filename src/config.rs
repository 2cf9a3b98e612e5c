use crate::budget::Budget;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from cpuwarden.toml.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct WardenConfig {
    pub binary: BinaryConfig,
    pub limits: LimitsConfig,
    pub billing: BillingConfig,
    pub monitor: MonitorConfig,
    #[serde(rename = "loop")]
    pub run_loop: LoopConfig,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct BinaryConfig {
    pub path: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    pub cpu_limit_secs: u64,
    /// 0 = unlimited.
    pub memory_limit_kb: u64,
    /// 0 = no deadline.
    pub timeout_secs: u64,
    /// Also ask the kernel to enforce limits (polling always runs).
    pub apply_rlimits: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BillingConfig {
    pub prepaid: bool,
    pub cpu_credit_secs: f64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub sample_interval_ms: u64,
    /// Gap between SIGTERM and SIGKILL when killing a process group.
    pub term_grace_ms: u64,
    /// How long to wait for a killed process to report its exit.
    pub kill_grace_ms: u64,
    pub status_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    /// Run the binary once.
    #[default]
    Single,
    /// Keep re-running the binary while budget remains.
    Multi,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    pub mode: LoopMode,
    /// Pause between cycles in multi-cycle mode.
    pub pacing_delay_ms: u64,
    pub max_cycles: Option<u32>,
}

// --- Default implementations ---

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            cpu_limit_secs: 10,
            memory_limit_kb: 1024 * 1024,
            timeout_secs: 30,
            apply_rlimits: true,
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            prepaid: true,
            cpu_credit_secs: 5.0,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1000,
            term_grace_ms: 500,
            kill_grace_ms: 2000,
            status_file: None,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            mode: LoopMode::Single,
            pacing_delay_ms: 100,
            max_cycles: None,
        }
    }
}

impl WardenConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the defaults unless `required` is set.
    pub fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Reject settings the supervisor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.binary.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("binary path is required".to_string()));
        }
        let credit = self.billing.cpu_credit_secs;
        if !credit.is_finite() || credit < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "cpu credit must be a non-negative number of seconds, got {credit}"
            )));
        }
        if self.monitor.sample_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sample interval must be greater than 0".to_string(),
            ));
        }
        if self.run_loop.max_cycles == Some(0) {
            return Err(ConfigError::Invalid(
                "max cycles must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn budget(&self) -> Budget {
        if self.billing.prepaid {
            Budget::prepaid(self.billing.cpu_credit_secs)
        } else {
            Budget::postpaid(self.limits.cpu_limit_secs as f64)
        }
    }

    /// Wall-clock deadline per cycle, if any.
    pub fn timeout(&self) -> Option<Duration> {
        (self.limits.timeout_secs > 0).then(|| Duration::from_secs(self.limits.timeout_secs))
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.sample_interval_ms)
    }

    pub fn term_grace(&self) -> Duration {
        Duration::from_millis(self.monitor.term_grace_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.monitor.kill_grace_ms)
    }

    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.run_loop.pacing_delay_ms)
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}
