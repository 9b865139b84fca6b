//! Configuration for Lapse.
//!
//! Provides TOML-based configuration with:
//! - `[session]`, `[expiration]`, `[redis]` and `[logging]` sections
//! - Config file discovery (flag → `LAPSE_CONFIG` → `./lapse.toml` → user config dir)
//! - Conversion into [`lapse_session::RepositoryConfig`] and [`lapse_redis::RedisConfig`]

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    CONFIG_ENV, Candidate, LoadedConfig, candidates, load_config, load_config_file,
    load_config_with_options, save_config, user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
