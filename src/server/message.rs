//! Messages exchanged between nodes
//!
//! Encoded as JSON, tagged by `type`. Binary data travels hex-encoded.

use serde::{Deserialize, Serialize};

/// One logical message carried inside an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Listen address of the sending node
    pub from: String,
    pub payload: Payload,
}

/// Message payload kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Store `data` under `key`
    StoreFile {
        key: String,
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
    },
    /// Any payload type this node does not know about
    #[serde(other)]
    Unknown,
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::StoreFile { .. } => "store_file",
            Payload::Unknown => "unknown",
        }
    }
}

impl Message {
    pub fn new(from: impl Into<String>, payload: Payload) -> Self {
        Self {
            from: from.into(),
            payload,
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_file_wire_format() {
        let message = Message::new(
            "127.0.0.1:3000",
            Payload::StoreFile {
                key: "hello.txt".to_string(),
                data: b"hi".to_vec(),
            },
        );

        let json: serde_json::Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();
        assert_eq!(json["from"], "127.0.0.1:3000");
        assert_eq!(json["payload"]["type"], "store_file");
        assert_eq!(json["payload"]["key"], "hello.txt");
        assert_eq!(json["payload"]["data"], "6869");

        assert_eq!(Message::decode(&message.encode().unwrap()).unwrap(), message);
    }

    #[test]
    fn test_unknown_payload_type() {
        let raw = br#"{"from":"10.0.0.1:4000","payload":{"type":"replicate_index","since":7}}"#;
        let message = Message::decode(raw).unwrap();
        assert_eq!(message.from, "10.0.0.1:4000");
        assert_eq!(message.payload, Payload::Unknown);
    }

    #[test]
    fn test_malformed_messages() {
        assert!(Message::decode(b"not json").is_err());
        assert!(Message::decode(br#"{"from":"a","payload":{"type":"store_file","key":"k","data":"zz"}}"#).is_err());
        assert!(Message::decode(br#"{"from":"a"}"#).is_err());
    }
}
