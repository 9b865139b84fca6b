//! Error types for session repository operations.

/// Error type for session repository operations.
///
/// An absent session is not an error: lookups return `Ok(None)` both for ids
/// that never existed and for sessions that expired and were reaped.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backing store could not be reached or the operation timed out.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// An attribute value could not be encoded.
    #[error("Failed to serialize attribute '{name}': {reason}")]
    Serialization { name: String, reason: String },

    /// A stored field could not be decoded.
    #[error("Failed to deserialize '{name}': {reason}")]
    Deserialization { name: String, reason: String },

    /// The repository configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn serialization(name: &str, reason: impl ToString) -> Self {
        Self::Serialization {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn deserialization(name: &str, reason: impl ToString) -> Self {
        Self::Deserialization {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error means the store is unreachable (worth a retry).
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

/// Result type for session repository operations.
pub type Result<T> = std::result::Result<T, Error>;
