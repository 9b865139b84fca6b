//! Sweep command - run one pass over the expiring-set index.

use anyhow::Result;
use clap::Args;
use lapse_session::TracingListener;

use super::Context;

/// Arguments for the sweep command.
#[derive(Args, Debug)]
pub struct SweepArgs {}

/// Run the sweep command.
pub async fn run(_args: SweepArgs, ctx: &Context) -> Result<()> {
    let repo = ctx.repository().await?;
    repo.events().register(TracingListener::new());

    let report = repo.expiration_listener().sweep().await?;

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.is_empty() {
        println!("Nothing to do ({} buckets checked)", report.buckets);
    } else {
        println!("{report}");
    }
    Ok(())
}
