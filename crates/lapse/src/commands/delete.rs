//! Delete command - remove a stored session.

use anyhow::Result;
use clap::Args;

use super::Context;

/// Arguments for the delete command.
#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Session id
    pub id: String,
}

/// Run the delete command.
///
/// Deleting an unknown id succeeds; listeners elsewhere will see a
/// destroyed event only if the session existed.
pub async fn run(args: DeleteArgs, ctx: &Context) -> Result<()> {
    let repo = ctx.repository().await?;
    repo.delete(&args.id).await?;

    if ctx.json_output {
        println!("{}", serde_json::json!({ "deleted": args.id }));
    } else {
        println!("Deleted session {}", args.id);
    }
    Ok(())
}
