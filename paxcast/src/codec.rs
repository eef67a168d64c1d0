//! Pluggable serialization for protocol messages.
//!
//! The [`MessageCodec`] trait turns [`Message`](crate::message::Message)s into
//! datagram payloads and back. [`JsonCodec`] is the default: human readable,
//! easy to inspect in packet captures, good enough for group sizes this
//! protocol targets.
//!
//! # Example
//!
//! ```rust
//! use paxcast::{JsonCodec, MessageCodec};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Ping { seq: u32 }
//!
//! let codec = JsonCodec;
//! let bytes = codec.encode(&Ping { seq: 1 }).unwrap();
//! assert_eq!(&bytes, br#"{"seq":1}"#);
//!
//! let decoded: Ping = codec.decode(&bytes).unwrap();
//! assert_eq!(decoded, Ping { seq: 1 });
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Failed to encode a message to bytes.
    #[error("encode error: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// Failed to decode bytes to a message.
    #[error("decode error: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Pluggable message serialization format.
///
/// The trait requires `Clone + Send + Sync + 'static` so codec instances can
/// live inside transports shared with the runtime task.
pub trait MessageCodec: Clone + Send + Sync + 'static {
    /// Encode a serializable message to bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable message.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json.
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::types::{MsgId, SeqNo, Value};

    #[test]
    fn test_json_codec_protocol_message() {
        let codec = JsonCodec;
        let msg = Message::Success {
            seq_no: SeqNo::new(3),
            value: Value::App(b"hello".to_vec()),
            msg_id: MsgId(1_000_001),
        };

        let bytes = codec.encode(&msg).expect("encode should succeed");
        let decoded: Message = codec.decode(&bytes).expect("decode should succeed");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_json_codec_decode_garbage() {
        let codec = JsonCodec;
        let result: Result<Message, _> = codec.decode(b"\x00\x01not json");
        let err = result.unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
        assert!(err.to_string().starts_with("decode error"));
    }
}
