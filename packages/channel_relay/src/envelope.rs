use serde::{Deserialize, Serialize};

use crate::connection::Payload;

pub const DISCONNECT_MESSAGE: &str = "bye";

/// Messages originated by the relay itself, as opposed to relayed payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlEnvelope {
    /// Identity assignment, sent once to a freshly joined connection.
    #[serde(rename = "uuid")]
    Identity { data: String },
    /// Departure notice broadcast to the rest of the channel.
    Disconnect { message: String },
}

impl ControlEnvelope {
    pub fn identity(token: impl Into<String>) -> Self {
        ControlEnvelope::Identity { data: token.into() }
    }

    pub fn disconnect() -> Self {
        ControlEnvelope::Disconnect {
            message: DISCONNECT_MESSAGE.to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Serialize into a text payload ready to queue on a connection.
    pub fn to_payload(&self) -> serde_json::Result<Payload> {
        self.to_json().map(Payload::text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_wire_format() {
        let value: serde_json::Value =
            serde_json::from_str(&ControlEnvelope::identity("abc").to_json().unwrap()).unwrap();
        assert_eq!(value, json!({ "type": "uuid", "data": "abc" }));
    }

    #[test]
    fn test_disconnect_wire_format() {
        let value: serde_json::Value =
            serde_json::from_str(&ControlEnvelope::disconnect().to_json().unwrap()).unwrap();
        assert_eq!(value, json!({ "type": "disconnect", "message": "bye" }));
    }

    #[test]
    fn test_parse_from_client_json() {
        let parsed: ControlEnvelope =
            serde_json::from_str(r#"{"type":"disconnect","message":"bye"}"#).unwrap();
        assert_eq!(parsed, ControlEnvelope::disconnect());
    }

    #[test]
    fn test_to_payload_is_text() {
        let payload = ControlEnvelope::identity("t-1").to_payload().unwrap();
        assert!(payload.as_text().unwrap().contains("\"uuid\""));
    }
}
