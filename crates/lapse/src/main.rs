//! Lapse - distributed HTTP session store on Redis
//!
//! Main entry point for the Lapse CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{config, delete, listen, ping, show, sweep};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Lapse - distributed HTTP session store on Redis
#[derive(Parser)]
#[command(name = "lapse")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Config file (default: ./lapse.toml, then the user config dir)
    #[arg(short, long, global = true, env = lapse_config::CONFIG_ENV)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the expiration listener until interrupted
    Listen(listen::ListenArgs),

    /// Run one index sweep and report what it did
    Sweep(sweep::SweepArgs),

    /// Print a stored session
    Show(show::ShowArgs),

    /// Delete a stored session
    Delete(delete::DeleteArgs),

    /// Check that Redis is reachable
    Ping(ping::PingArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = lapse_config::load_config(cli.config.as_deref())?;
    init_tracing(&loaded.config.logging, cli.verbose, cli.json);

    match &loaded.source {
        Some(path) => tracing::debug!(path = %path.display(), "Loaded config"),
        None => tracing::debug!("No config file found, using defaults"),
    }

    let ctx = commands::Context {
        config: loaded.config,
        config_source: loaded.source,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Listen(args) => listen::run(args, &ctx).await,
        Commands::Sweep(args) => sweep::run(args, &ctx).await,
        Commands::Show(args) => show::run(args, &ctx).await,
        Commands::Delete(args) => delete::run(args, &ctx).await,
        Commands::Ping(args) => ping::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    }
}

/// Console logging on stderr. `RUST_LOG` wins over the config file, which
/// wins over `--verbose`.
fn init_tracing(logging: &lapse_config::LoggingSection, verbose: bool, json: bool) {
    let default = if verbose {
        "lapse=debug,lapse_session=debug,lapse_redis=debug,lapse_config=debug,info"
    } else {
        "lapse=info,lapse_session=info,lapse_redis=info,warn"
    };
    let directives = std::env::var("RUST_LOG")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| logging.filter.clone())
        .unwrap_or_else(|| default.to_string());

    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_env_filter(EnvFilter::new(directives));

    if json || logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
