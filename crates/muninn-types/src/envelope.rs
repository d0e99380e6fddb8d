use serde_json::Value;

use crate::CacheError;

/// The wire record every stored value is wrapped in.
///
/// Serialized as a self-describing JSON document so that any replica can
/// decode values written by any node:
///
/// ```json
/// {"timestamp": 1714000000123, "data": <client value>}
/// ```
///
/// `timestamp` is milliseconds since the Unix epoch, monotonic at the
/// originating node. It drives last-writer-wins conflict resolution: the
/// highest timestamp wins regardless of arrival order.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    pub timestamp: u64,
    pub data: Value,
}

impl Envelope {
    pub fn new(timestamp: u64, data: Value) -> Self {
        Envelope { timestamp, data }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        serde_json::to_vec(self).map_err(|e| CacheError::Codec(e.to_string()))
    }

    /// Decode stored bytes into an envelope.
    ///
    /// Unwrapped legacy values are tolerated: anything that does not parse
    /// as a `{timestamp, data}` record is treated as an envelope with
    /// `timestamp == 0` carrying the raw payload (parsed as JSON when
    /// possible, otherwise as a lossy UTF-8 string).
    pub fn decode(bytes: &[u8]) -> Envelope {
        if let Ok(env) = serde_json::from_slice::<Envelope>(bytes) {
            return env;
        }
        let data = serde_json::from_slice::<Value>(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()));
        Envelope { timestamp: 0, data }
    }
}
