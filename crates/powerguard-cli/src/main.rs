mod challenge;
mod cmd;
mod executor;
mod output;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use powerguard_core::config::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "powerguard",
    about = "Power-loss theft deterrence: arm, watch for unplugging, respond",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: ~/.config/powerguard/config.yaml)
    #[arg(long, global = true, env = "POWERGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, inspect, and validate the config file
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Show the ordered actions a trigger would run
    Actions,

    /// Run the guard, reading commands from stdin
    Run {
        /// Log actions instead of performing them
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = Config::resolve_path(cli.config.as_deref())
        .map_err(anyhow::Error::from)
        .and_then(|path| match cli.command {
            Commands::Config { subcommand } => cmd::config::run(&path, subcommand, cli.json),
            Commands::Actions => cmd::actions::run(&path, cli.json),
            Commands::Run { dry_run } => cmd::run::run(&path, dry_run, cli.json),
        });

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
