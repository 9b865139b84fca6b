//! Listen command - run the expiration listener.

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use lapse_session::TracingListener;
use tracing::info;

use super::Context;

/// Arguments for the listen command.
#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Override the sweep interval in milliseconds
    #[arg(long)]
    pub sweep_interval_ms: Option<u64>,
}

/// Run the listen command.
pub async fn run(args: ListenArgs, ctx: &Context) -> Result<()> {
    let mut ctx = ctx.clone();
    if let Some(ms) = args.sweep_interval_ms {
        ctx.config.expiration.sweep_interval_ms = ms;
    }

    let repo = ctx.repository().await?;
    repo.events().register(TracingListener::new());

    let handle = repo.expiration_listener().start();
    info!(
        namespace = %repo.config().namespace,
        sweep_interval = ?Duration::from_millis(ctx.config.expiration.sweep_interval_ms),
        "Expiration listener running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!(state = %handle.state(), "Shutting down");
    handle.shutdown().await;
    Ok(())
}
