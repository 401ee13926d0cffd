//! Codec port: converts argument lists to and from a message body.

use crate::domain::CodecError;

pub trait Codec: Send + Sync {
    fn encode(&self, args: &[serde_json::Value]) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, body: &[u8]) -> Result<Vec<serde_json::Value>, CodecError>;
}
