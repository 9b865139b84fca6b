//! # Lapse Redis
//!
//! Redis backend for the Lapse session repository.
//!
//! Sessions are stored as Redis hashes with per-key TTLs; the expiration
//! listener is fed from keyevent notifications (`__keyevent@<db>__:expired`
//! and `__keyevent@<db>__:del`).
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use lapse_redis::{RedisConfig, RedisStore};
//! use lapse_session::{RepositoryConfig, SessionRepository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = RedisStore::connect(&RedisConfig::new("redis://localhost:6379")).await?;
//!     let repo = SessionRepository::new(Arc::new(store), RepositoryConfig::default())?;
//!
//!     let mut session = repo.create_session();
//!     session.set_attribute("user", "alice")?;
//!     repo.save(&mut session).await?;
//!     Ok(())
//! }
//! ```

mod config;
mod store;

pub use config::{DEFAULT_URL, KEYSPACE_NOTIFICATION_FLAGS, RedisConfig};
pub use store::RedisStore;
