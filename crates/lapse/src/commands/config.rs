//! Config command - configuration management.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use lapse_config::LapseConfig;

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the resolved configuration as TOML
    Show,

    /// Show which config file is loaded
    Which,

    /// Check that the configuration is usable
    Validate,

    /// Write a config file with defaults
    Init {
        /// Create project-local config (./lapse.toml) instead of user config
        #[arg(long)]
        local: bool,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Which => cmd_which(ctx),
        ConfigCommand::Validate => cmd_validate(ctx),
        ConfigCommand::Init { local, force } => cmd_init(local, force),
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    match &ctx.config_source {
        Some(path) => println!("# Loaded from {}\n", path.display()),
        None => println!("# No config file loaded (using defaults)\n"),
    }
    print!("{}", ctx.config.to_toml()?);
    Ok(())
}

fn cmd_which(ctx: &Context) -> Result<()> {
    match &ctx.config_source {
        Some(path) => println!("{}", path.display()),
        None => {
            println!("No config file loaded (using defaults)");
            if ctx.verbose {
                println!("Searched: ./lapse.toml");
                if let Some(user) = lapse_config::user_config_path() {
                    println!("          {}", user.display());
                }
            }
        }
    }
    Ok(())
}

fn cmd_validate(ctx: &Context) -> Result<()> {
    let repo = ctx.config.repository_config()?;
    let redis = ctx.config.redis_config();
    redis.connection_info()?;
    println!("OK: namespace {}, Redis at {}", repo.namespace, redis.url);
    Ok(())
}

fn cmd_init(local: bool, force: bool) -> Result<()> {
    let path = if local {
        PathBuf::from("lapse.toml")
    } else {
        match lapse_config::user_config_path() {
            Some(path) => path,
            None => bail!("could not determine the user config directory; use --local"),
        }
    };

    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    lapse_config::save_config(&LapseConfig::default(), &path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
