//! CLI command handlers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use lapse_config::LapseConfig;
use lapse_redis::RedisStore;
use lapse_session::SessionRepository;

pub mod config;
pub mod delete;
pub mod listen;
pub mod ping;
pub mod show;
pub mod sweep;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Resolved configuration.
    pub config: LapseConfig,
    /// File the configuration came from, if any.
    pub config_source: Option<PathBuf>,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    /// Connect to Redis and build a repository over it.
    pub async fn repository(&self) -> Result<SessionRepository> {
        let repo_config = self.config.repository_config()?;
        let store = RedisStore::connect(&self.config.redis_config()).await?;
        Ok(SessionRepository::new(Arc::new(store), repo_config)?)
    }
}
