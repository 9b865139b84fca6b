//! Ping command - check that Redis is reachable.

use std::time::Instant;

use anyhow::Result;
use clap::Args;
use lapse_redis::RedisStore;

use super::Context;

/// Arguments for the ping command.
#[derive(Args, Debug)]
pub struct PingArgs {}

/// Run the ping command.
pub async fn run(_args: PingArgs, ctx: &Context) -> Result<()> {
    let redis = ctx.config.redis_config();
    let started = Instant::now();
    let store = RedisStore::connect(&redis).await?;
    store.ping().await?;
    let elapsed = started.elapsed();

    if ctx.json_output {
        println!(
            "{}",
            serde_json::json!({ "url": redis.url, "ok": true, "elapsed_ms": elapsed.as_millis() as u64 })
        );
    } else {
        println!("OK: {} answered in {}ms", redis.url, elapsed.as_millis());
    }
    Ok(())
}
