mod cmd;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{BuildArgs, cmd_build, cmd_info, cmd_inspect, cmd_plan};
use output::OutputFormat;

/// strata - layered build graph orchestrator
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build output stages from a build file
  Build(BuildArgs),

  /// Show the stages a build would run, grouped into waves
  Plan {
    /// Build file (default: strata.json)
    file: Option<PathBuf>,

    /// Output stage to plan for; repeatable (default: the last declared stage)
    #[arg(short = 't', long = "target")]
    targets: Vec<String>,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// List the contents of a cached snapshot
  Inspect {
    /// Snapshot id
    snapshot: String,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// Show platform and directory information
  Info {
    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match cli.command {
    Commands::Build(args) => {
      if !cmd_build(args)? {
        std::process::exit(1);
      }
      Ok(())
    }
    Commands::Plan { file, targets, output } => cmd_plan(file.as_deref(), &targets, output),
    Commands::Inspect { snapshot, output } => cmd_inspect(&snapshot, output),
    Commands::Info { output } => cmd_info(output),
  }
}
