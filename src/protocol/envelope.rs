//! JSON envelope carried inside a primary frame.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProtocolError, ProtocolResult};

/// Header announcing that a payload follows as chunk records.
pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub const CHUNKED: &str = "chunked";

/// A decoded protocol message: a verb (`uri`) plus verb-specific headers.
///
/// Unknown top-level fields are kept in `extra` so a stored envelope is the
/// message the agent actually sent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub uri: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub headers: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }

    /// Builder-style header insertion.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    /// Header value if it is a JSON string.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(Value::as_str)
    }

    /// Whether a chunked payload follows this envelope on the wire.
    pub fn is_chunked(&self) -> bool {
        self.header_str(TRANSFER_ENCODING)
            .is_some_and(|v| v.eq_ignore_ascii_case(CHUNKED))
    }

    /// Compact JSON bytes for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        // A struct of strings and JSON values always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse a deciphered frame body.
    pub fn from_slice(bytes: &[u8]) -> ProtocolResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::FramingError {
            message: e.to_string(),
        })
    }
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{{\"uri\":{:?}}}", self.uri),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_envelope_has_no_headers_key() {
        let env = Envelope::new("handshake");
        assert_eq!(env.to_bytes(), br#"{"uri":"handshake"}"#);
    }

    #[test]
    fn parses_survey() {
        let env = Envelope::from_slice(
            br#"{"uri":"survey","headers":{"Trojan-ID":"abc123","Trojan-Hostname":"h1"}}"#,
        )
        .unwrap();
        assert_eq!(env.uri, "survey");
        assert_eq!(env.header_str("Trojan-ID"), Some("abc123"));
        assert!(!env.is_chunked());
    }

    #[test]
    fn detects_chunked_transfer() {
        let env = Envelope::new("download").with_header(TRANSFER_ENCODING, "chunked");
        assert!(env.is_chunked());
        let env = Envelope::new("download").with_header(TRANSFER_ENCODING, "identity");
        assert!(!env.is_chunked());
    }

    #[test]
    fn keeps_unknown_top_level_fields() {
        let env = Envelope::from_slice(br#"{"uri":"command","status":0}"#).unwrap();
        assert_eq!(env.extra.get("status"), Some(&Value::from(0)));
        let again = Envelope::from_slice(&env.to_bytes()).unwrap();
        assert_eq!(again, env);
    }

    #[test]
    fn non_json_is_a_framing_error() {
        assert!(matches!(
            Envelope::from_slice(b"\x01\x02not json"),
            Err(ProtocolError::FramingError { .. })
        ));
        assert!(matches!(
            Envelope::from_slice(b"[1,2,3]"),
            Err(ProtocolError::FramingError { .. })
        ));
    }
}
