mod budget;
mod config;
mod enforcer;
mod executor;
mod limits;
mod procfs;
mod report;
mod signals;
mod stats;
mod status;
mod supervisor;
mod tree;

use clap::Parser;
use config::{LoopMode, WardenConfig};
use procfs::ProcFs;
use signals::SignalHandler;
use stats::ExecutionStats;
use status::{StatusFile, WardenState};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use supervisor::Supervisor;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "cpuwarden.toml";

/// Run a binary under CPU, memory and wall-clock limits, killing its
/// whole process tree on a breach, and report what it used.
#[derive(Parser, Debug)]
#[command(name = "cpuwarden", version, about)]
pub struct Cli {
    /// Binary to supervise (overrides config)
    #[arg(value_name = "BINARY")]
    binary: Option<PathBuf>,

    /// Arguments passed to the binary
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Config file path [default: cpuwarden.toml, optional]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// CPU limit in seconds for postpaid billing
    #[arg(long, value_name = "SECS")]
    cpu: Option<u64>,

    /// Memory limit in KB (0 = unlimited)
    #[arg(long, value_name = "KB")]
    mem: Option<u64>,

    /// Wall-clock timeout per cycle in seconds (0 = none)
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Bill against a prepaid CPU credit
    #[arg(long, conflicts_with = "postpaid")]
    prepaid: bool,

    /// Bill against the CPU limit
    #[arg(long)]
    postpaid: bool,

    /// Prepaid CPU credit in seconds
    #[arg(long, value_name = "SECS")]
    credit: Option<f64>,

    /// Keep re-running the binary while budget remains
    #[arg(long)]
    multi: bool,

    /// Stop after this many cycles in multi-cycle mode
    #[arg(long)]
    max_cycles: Option<u32>,

    /// Write live JSON snapshots to this file
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Skip kernel resource limits and enforce by polling only
    #[arg(long)]
    no_rlimits: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,

    /// Extra logging (every sample, phase transitions)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings, errors and the report
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Cli {
    /// Overlay command-line settings on the loaded config.
    fn apply_to(&self, config: &mut WardenConfig) {
        if let Some(binary) = &self.binary {
            config.binary.path = binary.clone();
            config.binary.args = self.args.clone();
        }
        if let Some(cpu) = self.cpu {
            config.limits.cpu_limit_secs = cpu;
        }
        if let Some(mem) = self.mem {
            config.limits.memory_limit_kb = mem;
        }
        if let Some(timeout) = self.timeout {
            config.limits.timeout_secs = timeout;
        }
        if self.prepaid {
            config.billing.prepaid = true;
        }
        if self.postpaid {
            config.billing.prepaid = false;
        }
        if let Some(credit) = self.credit {
            config.billing.cpu_credit_secs = credit;
        }
        if self.multi {
            config.run_loop.mode = LoopMode::Multi;
        }
        if self.max_cycles.is_some() {
            config.run_loop.max_cycles = self.max_cycles;
        }
        if let Some(path) = &self.status_file {
            config.monitor.status_file = Some(path.clone());
        }
        if self.no_rlimits {
            config.limits.apply_rlimits = false;
        }
    }
}

fn print_settings(config: &WardenConfig) {
    println!("cpuwarden v{}", env!("CARGO_PKG_VERSION"));
    println!("Binary:          {}", config.binary.path.display());
    println!("Arguments:       {:?}", config.binary.args);
    println!("Billing:         {:?}", config.budget().mode());
    println!("Memory limit:    {} KB", config.limits.memory_limit_kb);
    match config.timeout() {
        Some(timeout) => println!("Timeout:         {}s", timeout.as_secs()),
        None => println!("Timeout:         none"),
    }
    println!("Kernel limits:   {}", config.limits.apply_rlimits);
    println!("Sample interval: {}ms", config.monitor.sample_interval_ms);
    println!("Loop mode:       {:?}", config.run_loop.mode);
    if let Some(max) = config.run_loop.max_cycles {
        println!("Max cycles:      {max}");
    }
    println!("Dry run: config validated, not running.");
}

/// Mirror snapshots to the status file and the terminal until the run ends.
async fn follow_progress(
    mut rx: watch::Receiver<ExecutionStats>,
    status: Option<StatusFile>,
    show: bool,
) {
    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();
        let finished = snapshot.end_time.is_some();
        if let Some(file) = &status {
            let state = if finished {
                WardenState::Finished
            } else {
                WardenState::Running
            };
            file.update(state, &snapshot);
        }
        if finished {
            break;
        }
        if show {
            eprint!("\r{}", report::progress_line(&snapshot, chrono::Utc::now()));
        }
    }
    if show {
        eprintln!();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let mut config = match WardenConfig::load(&config_path, cli.config.is_some()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            std::process::exit(1);
        }
    };
    cli.apply_to(&mut config);
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "configuration error");
        std::process::exit(1);
    }

    if cli.dry_run {
        print_settings(&config);
        return;
    }

    let mut supervisor = Supervisor::from_config(&config, Arc::new(ProcFs::new()));
    let signals = match SignalHandler::install() {
        Ok(handler) => {
            supervisor = supervisor.with_shutdown(handler.flag());
            Some(handler)
        }
        Err(e) => {
            tracing::warn!(error = %e, "could not install signal handlers");
            None
        }
    };

    let show_progress = !cli.quiet && !cli.json && std::io::stderr().is_terminal();
    let status = config.monitor.status_file.clone().map(StatusFile::new);
    let progress = tokio::spawn(follow_progress(
        supervisor.subscribe(),
        status,
        show_progress,
    ));

    let stats = supervisor.run().await;
    drop(supervisor);
    if let Err(e) = progress.await {
        tracing::warn!(error = %e, "progress task failed");
    }
    if signals.as_ref().is_some_and(|h| h.shutdown_requested()) {
        tracing::info!("stopped early on signal");
    }

    if cli.json {
        match report::render_json(&stats) {
            Ok(json) => println!("{json}"),
            Err(e) => tracing::error!(error = %e, "failed to serialize report"),
        }
    } else {
        println!("{}", report::render(&stats));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("cpuwarden").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_binary_and_trailing_args() {
        let cli = parse(&["--timeout", "5", "--", "/bin/echo", "--flag", "x"]);
        let mut config = WardenConfig::default();
        cli.apply_to(&mut config);
        assert_eq!(config.binary.path, PathBuf::from("/bin/echo"));
        assert_eq!(config.binary.args, vec!["--flag", "x"]);
        assert_eq!(config.limits.timeout_secs, 5);
    }

    #[test]
    fn test_overrides_apply() {
        let cli = parse(&[
            "--cpu", "3", "--mem", "0", "--postpaid", "--multi", "--max-cycles", "2",
            "--no-rlimits", "--status-file", "s.json", "/bin/true",
        ]);
        let mut config = WardenConfig::default();
        cli.apply_to(&mut config);
        assert_eq!(config.limits.cpu_limit_secs, 3);
        assert_eq!(config.limits.memory_limit_kb, 0);
        assert!(!config.billing.prepaid);
        assert_eq!(config.run_loop.mode, LoopMode::Multi);
        assert_eq!(config.run_loop.max_cycles, Some(2));
        assert!(!config.limits.apply_rlimits);
        assert_eq!(config.monitor.status_file, Some(PathBuf::from("s.json")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_values_kept_without_overrides() {
        let cli = parse(&[]);
        let mut config = WardenConfig::default();
        config.binary.path = PathBuf::from("/from/config");
        config.binary.args = vec!["a".to_string()];
        cli.apply_to(&mut config);
        assert_eq!(config.binary.path, PathBuf::from("/from/config"));
        assert_eq!(config.binary.args, vec!["a"]);
        assert!(config.billing.prepaid);
    }

    #[test]
    fn test_prepaid_conflicts_with_postpaid() {
        assert!(Cli::try_parse_from(["cpuwarden", "--prepaid", "--postpaid", "x"]).is_err());
    }

    #[test]
    fn test_credit_override() {
        let cli = parse(&["--prepaid", "--credit", "2.5", "x"]);
        let mut config = WardenConfig::default();
        cli.apply_to(&mut config);
        assert_eq!(config.budget().ceiling(), 2.5);
    }
}
