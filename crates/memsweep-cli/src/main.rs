//! memsweep - find the highest stable GPU memory clock offset

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

mod commands;
mod config;
mod output;

use config::CliConfig;
use memsweep_adapter_gpu::MemoryTarget;
use memsweep_core::LoggingConfig;
use output::OutputFormat;

/// Find the highest stable GPU memory clock offset
#[derive(Debug, Parser)]
#[command(name = "memsweep")]
#[command(about = "Find the highest stable GPU memory clock offset")]
#[command(version)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MEMSWEEP_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Enable JSON output (overrides --output)
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Sweep the memory clock offset of one GPU
    Sweep(SweepArgs),

    /// Show the current clock settings of one GPU
    Status {
        /// GPU index
        #[arg(short, long, default_value = "0")]
        gpu: u32,
    },

    /// Reset every clock of one GPU to stock
    Reset {
        /// GPU index
        #[arg(short, long, default_value = "0")]
        gpu: u32,
    },

    /// Run one memory pattern test at the current offset
    Memtest(MemtestArgs),

    /// Inspect or clear the device capability cache
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },

    /// Show or apply saved overclock profiles
    Profile {
        #[command(subcommand)]
        action: ProfileCommands,
    },
}

#[derive(Debug, Clone, Default, Args)]
pub struct SweepArgs {
    /// GPU index
    #[arg(short, long, default_value = "0")]
    pub gpu: u32,

    /// First offset to test in MHz (default: cached last-known-good, then 0)
    #[arg(long, allow_hyphen_values = true)]
    pub start: Option<i32>,

    /// Highest offset to test in MHz
    #[arg(long)]
    pub max: Option<i32>,

    /// Step between offsets in MHz
    #[arg(long)]
    pub step: Option<u32>,

    /// Test duration per step in milliseconds
    #[arg(long)]
    pub duration_ms: Option<u64>,

    /// Watchdog timeout per step in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Settle time after each offset change in milliseconds
    #[arg(long)]
    pub settle_ms: Option<u64>,

    /// Stop when bandwidth falls below this fraction of the baseline
    #[arg(long)]
    pub cliff_fraction: Option<f64>,

    /// Step-over-step drop reported as a regression
    #[arg(long)]
    pub regression_threshold: Option<f64>,

    /// Wall-clock limit for the whole session in seconds
    #[arg(long)]
    pub max_session_secs: Option<u64>,

    /// Save the recommended offset as a profile at PATH
    #[arg(long, value_name = "PATH")]
    pub save: Option<PathBuf>,

    /// Reset the memory clock to stock when done
    #[arg(long)]
    pub restore_stock: bool,

    /// Neither read nor write the capability cache
    #[arg(long)]
    pub no_cache: bool,

    /// Memory to exercise (device, host)
    #[arg(long)]
    pub memory: Option<MemoryTarget>,
}

#[derive(Debug, Clone, Args)]
pub struct MemtestArgs {
    /// GPU index
    #[arg(short, long, default_value = "0")]
    pub gpu: u32,

    /// Test duration in milliseconds
    #[arg(long)]
    pub duration_ms: Option<u64>,

    /// Watchdog timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Memory to exercise (device, host)
    #[arg(long)]
    pub memory: Option<MemoryTarget>,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommands {
    /// List cached device capabilities
    Show,

    /// Delete the cache file
    Clear,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    /// Show a saved profile
    Show {
        /// Profile file
        path: PathBuf,
    },

    /// Apply a saved profile to one GPU
    Apply {
        /// Profile file
        path: PathBuf,

        /// GPU index
        #[arg(short, long, default_value = "0")]
        gpu: u32,
    },
}

fn init_logging(logging_config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging_config.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(logging_config.show_target)
        .with_thread_ids(logging_config.show_thread_ids)
        .with_line_number(logging_config.show_line_numbers);

    match logging_config.format.as_str() {
        "json" => subscriber.json().init(),
        _ => subscriber.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = CliConfig::load(cli.config.as_deref())?;
    if let Some(level) = &cli.log_level {
        config.engine.logging.level = level.clone();
    }
    init_logging(&config.engine.logging);

    debug!("Starting memsweep with {:?}", cli);
    if let Some(source) = config.source() {
        debug!("Loaded configuration from {}", source.display());
    }

    let output_format = if cli.json {
        OutputFormat::Json
    } else {
        cli.output
    };

    match cli.command {
        Commands::Sweep(args) => {
            commands::sweep::run_sweep(config, args, output_format).await?;
        }
        Commands::Status { gpu } => {
            commands::device::run_status(&config, gpu, output_format).await?;
        }
        Commands::Reset { gpu } => {
            commands::device::run_reset(&config, gpu, output_format).await?;
        }
        Commands::Memtest(args) => {
            commands::device::run_memtest(config, args, output_format).await?;
        }
        Commands::Cache { action } => {
            commands::cache::handle_cache_command(&config, action, output_format).await?;
        }
        Commands::Profile { action } => {
            commands::profile::handle_profile_command(&config, action, output_format).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert()
    }

    #[test]
    fn test_sweep_parsing() {
        let cli = Cli::try_parse_from([
            "memsweep",
            "sweep",
            "--gpu",
            "1",
            "--start",
            "-200",
            "--max",
            "900",
            "--memory",
            "host",
            "--no-cache",
        ])
        .unwrap();

        match cli.command {
            Commands::Sweep(args) => {
                assert_eq!(args.gpu, 1);
                assert_eq!(args.start, Some(-200));
                assert_eq!(args.max, Some(900));
                assert_eq!(args.memory, Some(MemoryTarget::Host));
                assert!(args.no_cache);
                assert!(!args.restore_stock);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_subcommand_parsing() {
        let cli = Cli::try_parse_from(["memsweep", "cache", "clear"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Cache {
                action: CacheCommands::Clear
            }
        ));

        let cli = Cli::try_parse_from(["memsweep", "profile", "show", "best.json"]).unwrap();
        assert!(matches!(cli.command, Commands::Profile { .. }));

        let cli =
            Cli::try_parse_from(["memsweep", "profile", "apply", "best.json", "--gpu", "1"]).unwrap();
        match cli.command {
            Commands::Profile {
                action: ProfileCommands::Apply { path, gpu },
            } => {
                assert_eq!(path, PathBuf::from("best.json"));
                assert_eq!(gpu, 1);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_device_command_parsing() {
        let cli = Cli::try_parse_from(["memsweep", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { gpu: 0 }));

        let cli = Cli::try_parse_from(["memsweep", "reset", "-g", "2"]).unwrap();
        assert!(matches!(cli.command, Commands::Reset { gpu: 2 }));

        let cli = Cli::try_parse_from([
            "memsweep",
            "memtest",
            "--duration-ms",
            "1500",
            "--memory",
            "host",
        ])
        .unwrap();
        match cli.command {
            Commands::Memtest(args) => {
                assert_eq!(args.gpu, 0);
                assert_eq!(args.duration_ms, Some(1500));
                assert_eq!(args.timeout_ms, None);
                assert_eq!(args.memory, Some(MemoryTarget::Host));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_output_format() {
        let cli = Cli::try_parse_from(["memsweep", "--json", "cache", "show"]).unwrap();
        assert!(cli.json);

        let cli = Cli::try_parse_from(["memsweep", "--output", "json", "cache", "show"]).unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
    }
}
