//! xe-sim: run dispatch workloads against the simulated GPU.
//!
//! Configuration comes from a TOML file (`--config`), then `XE_*`
//! environment overrides, then command-line flags.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use xe_common::config::LogFormat;
use xe_common::{HwFamily, RuntimeConfig, family_traits};

mod workload;

use workload::{WorkloadPlan, run};

/// Simulated GPU dispatch driver
#[derive(Parser)]
#[command(name = "xe-sim")]
#[command(about = "Drive kernel dispatch workloads through xe-runtime on a simulated GPU")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "PATH", global = true, env = "XE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Log format (pretty, compact, json)
    #[arg(long, value_name = "FORMAT", global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic kernel workload
    Run(RunArgs),

    /// Print the effective configuration as TOML
    Config {
        /// Print the built-in defaults instead
        #[arg(long)]
        defaults: bool,
    },

    /// Show the per-family traits table
    Families,
}

#[derive(Clone, Copy, ValueEnum)]
enum ReportFormat {
    Text,
    Json,
}

#[derive(clap::Args)]
struct RunArgs {
    /// GPU family (gen9, gen12lp, xehpg, xehpc)
    #[arg(long, default_value = "gen12lp")]
    family: HwFamily,

    /// Number of kernel enqueues
    #[arg(long, default_value_t = 4)]
    kernels: u32,

    /// Global work size
    #[arg(long, default_value_t = 1024)]
    global_size: u32,

    /// Local work size; suggested by the runtime when omitted
    #[arg(long)]
    local_size: Option<u32>,

    /// SIMD width of the kernel (8, 16 or 32)
    #[arg(long, default_value_t = 16)]
    simd: u32,

    #[arg(long)]
    out_of_order: bool,

    /// Collect per-kernel timestamps
    #[arg(long)]
    profiling: bool,

    /// Gate the first half of the kernels behind a user event
    #[arg(long)]
    user_event: bool,

    /// Also execute one recorded command list
    #[arg(long)]
    command_list: bool,

    /// Write one JSON record per dispatch into this directory
    #[arg(long, value_name = "DIR")]
    dump_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "text")]
    format: ReportFormat,
}

impl RunArgs {
    fn plan(&self) -> WorkloadPlan {
        WorkloadPlan {
            family: self.family,
            kernels: self.kernels,
            global_size: self.global_size,
            local_size: self.local_size,
            simd: self.simd,
            out_of_order: self.out_of_order,
            profiling: self.profiling,
            user_event: self.user_event,
            command_list: self.command_list,
            ..WorkloadPlan::default()
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
    };
    setup_logging(&config);

    if let Err(e) = execute(cli.command, config) {
        error!("command failed: {e}");
        for cause in e.chain().skip(1) {
            error!("  caused by: {cause}");
        }
        std::process::exit(1);
    }
}

fn execute(command: Commands, mut config: RuntimeConfig) -> Result<()> {
    match command {
        Commands::Run(args) => {
            if let Some(dir) = &args.dump_dir {
                config.debug.dump_dispatch_dir = Some(dir.clone());
            }
            let report = run(&args.plan(), config)?;
            match args.format {
                ReportFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                ReportFormat::Text => println!("{report}"),
            }
        }
        Commands::Config { defaults } => {
            let rendered = if defaults {
                RuntimeConfig::default_toml()?
            } else {
                toml::to_string_pretty(&config).context("failed to render configuration")?
            };
            print!("{rendered}");
        }
        Commands::Families => {
            for family in HwFamily::ALL {
                let traits = family_traits(family);
                println!(
                    "{family:<8} {:<10} walker={:?} grf={}B timestamp_packets={} aux_translation={}",
                    traits.name,
                    traits.walker,
                    traits.grf_size,
                    traits.supports_timestamp_packets,
                    traits.supports_aux_translation
                );
            }
        }
    }
    Ok(())
}

/// File (or defaults), then environment, then flags.
fn load_configuration(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => RuntimeConfig::from_env().context("invalid XE_* environment override")?,
    };
    if let Some(level) = &cli.log_level {
        config.debug.log_level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.debug.log_format = format;
    }
    config.validate()?;
    Ok(config)
}

fn setup_logging(config: &RuntimeConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.debug.log_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match config.debug.log_format {
        LogFormat::Json => {
            subscriber
                .json()
                .with_timer(tracing_subscriber::fmt::time::uptime())
                .init();
        }
        LogFormat::Compact => subscriber.compact().init(),
        LogFormat::Pretty => subscriber.pretty().init(),
    }
    info!(
        dispatch_mode = ?config.csr.dispatch_mode,
        log_format = %config.debug.log_format,
        "xe-sim starting"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_reach_the_plan() {
        let cli = Cli::parse_from([
            "xe-sim",
            "run",
            "--family",
            "xehpc",
            "--kernels",
            "8",
            "--local-size",
            "32",
            "--user-event",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected the run subcommand");
        };
        let plan = args.plan();
        assert_eq!(plan.family, HwFamily::XeHpc);
        assert_eq!(plan.kernels, 8);
        assert_eq!(plan.local_size, Some(32));
        assert!(plan.user_event);
        assert!(!plan.command_list);
    }

    #[test]
    fn config_file_and_flags_are_layered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xe.toml");
        std::fs::write(&path, "[csr]\nwait_timeout_us = 1000\n").unwrap();
        let cli = Cli::parse_from([
            "xe-sim",
            "--config",
            path.to_str().unwrap(),
            "--log-level",
            "debug",
            "families",
        ]);
        let config = load_configuration(&cli).unwrap();
        assert_eq!(config.csr.wait_timeout_us, 1000);
        assert_eq!(config.debug.log_level, "debug");
    }
}
