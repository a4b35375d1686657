// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame codec.
//!
//! Turns envelopes into the JSON bytes of one frame and back. Framing on the
//! stream itself lives in [`crate::connection`].

use crate::protocol::{DataGram, RawDataGram};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Codec error types.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialize error: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The frame is not an envelope. `tag` is set when it could still be
    /// recovered, so the receiver can answer the sender.
    #[error("Invalid envelope: {source}")]
    Envelope {
        tag: Option<String>,
        key: i64,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid JSON: {0}")]
    Json(#[source] serde_json::Error),
}

/// Encode an envelope into frame bytes.
pub fn encode(gram: &DataGram) -> Result<Vec<u8>, CodecError> {
    let raw = gram.to_raw().map_err(CodecError::Serialize)?;
    serde_json::to_vec(&raw).map_err(CodecError::Serialize)
}

/// Decode frame bytes into a wire envelope.
///
/// Unknown fields are ignored. The body is left raw; see
/// [`DataGram::try_from`] for the typed second stage.
pub fn decode(bytes: &[u8]) -> Result<RawDataGram, CodecError> {
    serde_json::from_slice(bytes).map_err(|source| {
        let salvage = serde_json::from_slice::<TagSalvage>(bytes).ok();
        CodecError::Envelope {
            key: salvage.as_ref().and_then(|p| p.data.as_ref()).map_or(0, |d| d.key),
            tag: salvage.map(|p| p.tag),
            source,
        }
    })
}

/// Encode any protocol record (handshakes, link frames).
pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(CodecError::Serialize)
}

/// Decode any protocol record.
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Json)
}

/// Minimal view used to salvage the tag of an unparseable envelope.
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TagSalvage {
    tag: String,
    #[serde(default)]
    data: Option<KeySalvage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeySalvage {
    #[serde(default)]
    key: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnApply, MessageKind, Payload};
    use serde_json::json;

    #[test]
    fn test_encode_preserves_field_names() {
        let gram = DataGram::new("ABC-1", 1, 42, Payload::Get { key: 42 });
        let bytes = encode(&gram).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["Tag"], "ABC-1");
        assert_eq!(value["ServiceId"], 1);
        assert_eq!(value["Data"]["Title"], 1);
        assert_eq!(value["Data"]["Key"], 42);
        assert!(value["Data"]["TimeStamp"].is_string());
        assert_eq!(value["Data"]["Body"], 42);
    }

    #[test]
    fn test_decode_tolerates_unknown_fields() {
        let frame = json!({
            "Tag": "XYZ-2",
            "ServiceId": 2,
            "Version": 3,
            "Data": {
                "Title": 4,
                "Key": 0,
                "TimeStamp": "2025-06-01T12:00:00Z",
                "Body": "ABC-1",
                "Trace": {"hops": 2}
            }
        });
        let raw = decode(frame.to_string().as_bytes()).unwrap();
        let gram = DataGram::try_from(raw).unwrap();
        assert_eq!(
            gram.payload,
            Payload::Confirm {
                tag: "ABC-1".into()
            }
        );
    }

    #[test]
    fn test_decode_missing_timestamp_defaults() {
        let frame = br#"{"Tag":"T-1","ServiceId":1,"Data":{"Title":"IS_ACTIVE"}}"#;
        let raw = decode(frame).unwrap();
        assert_eq!(raw.data.title, MessageKind::IsActive);
        assert_eq!(raw.data.key, 0);
    }

    #[test]
    fn test_decode_unknown_title_salvages_tag() {
        let frame = br#"{"Tag":"T-9","ServiceId":9,"Data":{"Title":"REBOOT","Key":5}}"#;
        match decode(frame) {
            Err(CodecError::Envelope { tag, key, .. }) => {
                assert_eq!(tag.as_deref(), Some("T-9"));
                assert_eq!(key, 5);
            }
            other => panic!("expected envelope error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_garbage() {
        match decode(b"\x00\x01not json") {
            Err(CodecError::Envelope { tag, .. }) => assert!(tag.is_none()),
            other => panic!("expected envelope error, got {:?}", other),
        }
    }

    #[test]
    fn test_conn_apply_json() {
        let apply = ConnApply {
            id: 7,
            token: "secret".into(),
        };
        let bytes = encode_json(&apply).unwrap();
        assert_eq!(bytes, br#"{"Id":7,"Token":"secret"}"#.to_vec());
        let back: ConnApply = decode_json(&bytes).unwrap();
        assert_eq!(back, apply);
    }
}
