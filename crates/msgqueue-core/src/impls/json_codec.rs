//! JSON argument codec: a body is a JSON array of arguments.

use crate::domain::CodecError;
use crate::ports::Codec;

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, args: &[serde_json::Value]) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(args).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, body: &[u8]) -> Result<Vec<serde_json::Value>, CodecError> {
        serde_json::from_slice(body).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
