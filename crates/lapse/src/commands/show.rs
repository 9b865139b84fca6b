//! Show command - print a stored session.

use anyhow::{Result, bail};
use clap::Args;
use lapse_session::Session;
use serde_json::{Map, Value, json};

use super::Context;

/// Arguments for the show command.
#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Session id
    pub id: String,
}

/// Run the show command.
///
/// Loading counts as an access, so the session's expiry moves forward.
pub async fn run(args: ShowArgs, ctx: &Context) -> Result<()> {
    let repo = ctx.repository().await?;
    let Some(session) = repo.get_session(&args.id).await? else {
        bail!("session {} not found", args.id);
    };

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&session_json(&session))?);
        return Ok(());
    }

    println!("Session {}", session.id());
    println!("  created:       {}", session.creation_time().to_rfc3339());
    println!("  last accessed: {}", session.last_accessed_time().to_rfc3339());
    match session.expires_at() {
        Some(at) => println!("  expires:       {}", at.to_rfc3339()),
        None => println!("  expires:       never"),
    }

    let mut names = session.attribute_names();
    names.sort_unstable();
    println!("  attributes ({}):", names.len());
    for name in names {
        let value = session.attribute_value(name).cloned().unwrap_or(Value::Null);
        println!("    {name} = {value}");
    }
    for warning in session.load_warnings() {
        println!("  warning: {warning}");
    }
    Ok(())
}

fn session_json(session: &Session) -> Value {
    let attributes: Map<String, Value> = session
        .attribute_names()
        .into_iter()
        .map(|name| {
            let value = session.attribute_value(name).cloned().unwrap_or(Value::Null);
            (name.to_string(), value)
        })
        .collect();

    json!({
        "id": session.id(),
        "creation_time": session.creation_time(),
        "last_accessed_time": session.last_accessed_time(),
        "max_inactive_interval_secs": session.max_inactive_interval().map(|d| d.as_secs()),
        "expires_at": session.expires_at(),
        "attributes": attributes,
        "warnings": session.load_warnings(),
    })
}
