//! Attribute encoding for cache entry fields.
//!
//! Session attributes are held in memory as [`serde_json::Value`] and encoded
//! into bytes only when a session is saved. The [`AttributeCodec`] trait lets
//! deployments swap the byte format; [`JsonCodec`] is the default.

use serde_json::Value;

use crate::error::{Error, Result};

/// Format tag written as the first byte of every [`JsonCodec`] payload.
pub const JSON_FORMAT_TAG: u8 = 0x01;

/// Encodes attribute values to bytes and back.
pub trait AttributeCodec: Send + Sync + 'static {
    /// Encode the value of attribute `name`.
    fn encode(&self, name: &str, value: &Value) -> Result<Vec<u8>>;

    /// Decode the stored bytes of attribute `name`.
    fn decode(&self, name: &str, bytes: &[u8]) -> Result<Value>;
}

/// JSON codec with a one-byte format tag.
#[derive(Debug, Clone, Default)]
pub struct JsonCodec {
    max_value_bytes: Option<usize>,
}

impl JsonCodec {
    /// Create a codec without a size limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject encoded values larger than `max` bytes.
    pub fn with_max_value_bytes(mut self, max: usize) -> Self {
        self.max_value_bytes = Some(max);
        self
    }
}

impl AttributeCodec for JsonCodec {
    fn encode(&self, name: &str, value: &Value) -> Result<Vec<u8>> {
        let mut out = vec![JSON_FORMAT_TAG];
        serde_json::to_writer(&mut out, value).map_err(|e| Error::serialization(name, e))?;

        if let Some(max) = self.max_value_bytes
            && out.len() > max
        {
            return Err(Error::serialization(
                name,
                format!("encoded size {} exceeds limit of {max} bytes", out.len()),
            ));
        }

        Ok(out)
    }

    fn decode(&self, name: &str, bytes: &[u8]) -> Result<Value> {
        match bytes.split_first() {
            Some((&JSON_FORMAT_TAG, body)) => {
                serde_json::from_slice(body).map_err(|e| Error::deserialization(name, e))
            }
            Some((tag, _)) => Err(Error::deserialization(
                name,
                format!("unrecognized format tag 0x{tag:02x}"),
            )),
            None => Err(Error::deserialization(name, "empty payload")),
        }
    }
}
