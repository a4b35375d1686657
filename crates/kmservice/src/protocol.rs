// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! kmservice wire protocol.
//!
//! Envelopes (`DataGram`) are JSON records that keep their field names on the
//! wire. Decoding happens in two stages:
//!
//! 1. [`RawDataGram`] parses the envelope and keeps `Body` as raw JSON.
//! 2. [`DataGram::try_from`] dispatches on `Title` and decodes the body into a
//!    typed [`Payload`], one shape per [`MessageKind`].
//!
//! Keeping the stages apart lets a receiver answer a malformed body with the
//! request's own tag.
//!
//! `Title` travels as the kind's numeric code (`GET` is 1, `LINK_SUBMIT` 13).
//! Receivers also accept the upper-case name.
//!
//! ```text
//! {"Tag":"QWERTY...-7","ServiceId":7,
//!  "Data":{"Title":1,"Key":42,"TimeStamp":"2025-01-01T00:00:00Z","Body":42}}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Service id the center stamps on envelopes it originates.
pub const CENTER_SERVICE_ID: i64 = 0;

/// Envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "TitleRepr")]
pub enum MessageKind {
    Get,
    Link,
    Update,
    Confirm,
    Success,
    Connect,
    Failure,
    ApiList,
    Exception,
    IsActive,
    FindLink,
    Subscribes,
    LinkSubmit,
}

impl MessageKind {
    pub const ALL: [MessageKind; 13] = [
        Self::Get,
        Self::Link,
        Self::Update,
        Self::Confirm,
        Self::Success,
        Self::Connect,
        Self::Failure,
        Self::ApiList,
        Self::Exception,
        Self::IsActive,
        Self::FindLink,
        Self::Subscribes,
        Self::LinkSubmit,
    ];

    /// Numeric wire code of the kind.
    pub fn code(&self) -> u8 {
        match self {
            Self::Get => 1,
            Self::Link => 2,
            Self::Update => 3,
            Self::Confirm => 4,
            Self::Success => 5,
            Self::Connect => 6,
            Self::Failure => 7,
            Self::ApiList => 8,
            Self::Exception => 9,
            Self::IsActive => 10,
            Self::FindLink => 11,
            Self::Subscribes => 12,
            Self::LinkSubmit => 13,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    /// Name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Link => "LINK",
            Self::Update => "UPDATE",
            Self::Confirm => "CONFIRM",
            Self::Success => "SUCCESS",
            Self::Connect => "CONNECT",
            Self::Failure => "FAILURE",
            Self::ApiList => "API_LIST",
            Self::Exception => "EXCEPTION",
            Self::IsActive => "IS_ACTIVE",
            Self::FindLink => "FIND_LINK",
            Self::Subscribes => "SUBSCRIBES",
            Self::LinkSubmit => "LINK_SUBMIT",
        }
    }

    /// Kinds a peer sends as requests. The center confirms each one and the
    /// peer keeps it pending until then.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::Get
                | Self::Update
                | Self::ApiList
                | Self::FindLink
                | Self::Subscribes
                | Self::LinkSubmit
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown message kind name or code.
#[derive(Debug, Clone, Error)]
#[error("Unknown message kind: {0}")]
pub struct UnknownKind(pub String);

/// `Title` as found on the wire.
#[derive(Deserialize)]
#[serde(untagged)]
enum TitleRepr {
    Code(u8),
    Name(String),
}

impl TryFrom<TitleRepr> for MessageKind {
    type Error = UnknownKind;

    fn try_from(repr: TitleRepr) -> Result<Self, Self::Error> {
        match repr {
            TitleRepr::Code(code) => {
                Self::from_code(code).ok_or_else(|| UnknownKind(code.to_string()))
            }
            TitleRepr::Name(name) => name.parse(),
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        kind.code()
    }
}

impl FromStr for MessageKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// Error kinds carried in the body of an `EXCEPTION` envelope.
///
/// The wire strings (including their historical spellings) are fixed;
/// anything else round-trips through [`ExceptionKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExceptionKind {
    NoSubscribeInfo,
    KeyNotExist,
    DataLocked,
    LinkNotExist,
    WithoutPermission,
    OriginalDataExpired,
    RequestTypeException,
    GetDataFormException,
    ApiDataFormException,
    LinkDataFormException,
    UpdateDataFormException,
    FindLinkDataFormException,
    Other(String),
}

impl ExceptionKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::NoSubscribeInfo => "NO_SUBSCRIBE_INFO",
            Self::KeyNotExist => "KEY_NOT_EXIST",
            Self::DataLocked => "DATA_LOCKED",
            Self::LinkNotExist => "LINK_NOT_EXIST",
            Self::WithoutPermission => "WITHOUT_PERMISSION",
            Self::OriginalDataExpired => "ORIGINAL_DATA_EXPIRED",
            Self::RequestTypeException => "REQUEST_TYPE_EXCEPTION",
            Self::GetDataFormException => "GET_DATA_FORM_EXECPTION",
            Self::ApiDataFormException => "API_DATA_FORM_EXECPTION",
            Self::LinkDataFormException => "LINK_DATA_FORM_EXECPTION",
            Self::UpdateDataFormException => "UPDATE_DATA_FORM_EXCEPTION",
            Self::FindLinkDataFormException => "FINDLINK_DATA_FORM_EXECPTION",
            Self::Other(s) => s,
        }
    }

    /// The data-form exception a malformed body of `kind` is answered with.
    pub fn data_form_for(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Get => Self::GetDataFormException,
            MessageKind::Update => Self::UpdateDataFormException,
            MessageKind::ApiList => Self::ApiDataFormException,
            MessageKind::LinkSubmit | MessageKind::Link => Self::LinkDataFormException,
            MessageKind::FindLink => Self::FindLinkDataFormException,
            _ => Self::RequestTypeException,
        }
    }
}

impl From<String> for ExceptionKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "NO_SUBSCRIBE_INFO" => Self::NoSubscribeInfo,
            "KEY_NOT_EXIST" => Self::KeyNotExist,
            "DATA_LOCKED" => Self::DataLocked,
            "LINK_NOT_EXIST" => Self::LinkNotExist,
            "WITHOUT_PERMISSION" => Self::WithoutPermission,
            "ORIGINAL_DATA_EXPIRED" => Self::OriginalDataExpired,
            "REQUEST_TYPE_EXCEPTION" => Self::RequestTypeException,
            "GET_DATA_FORM_EXECPTION" => Self::GetDataFormException,
            "API_DATA_FORM_EXECPTION" => Self::ApiDataFormException,
            "LINK_DATA_FORM_EXECPTION" => Self::LinkDataFormException,
            "UPDATE_DATA_FORM_EXCEPTION" => Self::UpdateDataFormException,
            "FINDLINK_DATA_FORM_EXECPTION" => Self::FindLinkDataFormException,
            _ => Self::Other(s),
        }
    }
}

impl From<ExceptionKind> for String {
    fn from(kind: ExceptionKind) -> Self {
        match kind {
            ExceptionKind::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Wire records
// ============================================================================

/// Envelope as it appears on the wire, body still undecoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawDataGram {
    pub tag: String,
    #[serde(default)]
    pub service_id: i64,
    pub data: RawData,
}

/// `Data` section of a wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawData {
    pub title: MessageKind,
    #[serde(default)]
    pub key: i64,
    #[serde(default = "Utc::now")]
    pub time_stamp: DateTime<Utc>,
    #[serde(default)]
    pub body: Value,
}

/// First frame a peer sends after dialing the center.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnApply {
    pub id: i64,
    pub token: String,
}

/// Body of an `UPDATE` envelope.
///
/// `origin` is the value the writer based its change on. The center refuses
/// the write when it no longer matches. Fan-out updates carry the previous
/// value there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateRequest {
    #[serde(default)]
    pub origin: Option<Value>,
    pub new: Value,
}

/// One subscription the requester may read and/or write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscriptionGrant {
    pub id: i64,
    pub key: String,
    pub read: bool,
    pub write: bool,
}

/// API descriptor published by a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Api {
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub route: String,
    #[serde(default)]
    pub request_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Body of `API_LIST`: requests leave `apis` empty, replies fill it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiList {
    #[serde(rename = "ServiceId")]
    pub service_id: i64,
    #[serde(rename = "APIs", default)]
    pub apis: Vec<Api>,
}

/// Where a link listener can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub struct LinkInfo {
    pub key: String,
    pub host: String,
    pub port: u16,
    pub token: String,
}

/// Body of `LINK_SUBMIT`; the center fills in the host from the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub struct LinkApply {
    pub key: String,
    pub port: u16,
    #[serde(default)]
    pub token: String,
}

// ============================================================================
// Typed envelope
// ============================================================================

/// Decoded envelope body, one shape per kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Request the current value of a key.
    Get { key: i64 },
    /// Link introduction returned for `FIND_LINK`.
    Link(LinkInfo),
    Update(UpdateRequest),
    /// Acknowledges the envelope with this tag.
    Confirm { tag: String },
    Success,
    Connect,
    Failure { reason: String },
    ApiList(ApiList),
    Exception(ExceptionKind),
    IsActive,
    FindLink { key: String },
    Subscribes(Vec<SubscriptionGrant>),
    LinkSubmit(LinkApply),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Get { .. } => MessageKind::Get,
            Self::Link(_) => MessageKind::Link,
            Self::Update(_) => MessageKind::Update,
            Self::Confirm { .. } => MessageKind::Confirm,
            Self::Success => MessageKind::Success,
            Self::Connect => MessageKind::Connect,
            Self::Failure { .. } => MessageKind::Failure,
            Self::ApiList(_) => MessageKind::ApiList,
            Self::Exception(_) => MessageKind::Exception,
            Self::IsActive => MessageKind::IsActive,
            Self::FindLink { .. } => MessageKind::FindLink,
            Self::Subscribes(_) => MessageKind::Subscribes,
            Self::LinkSubmit(_) => MessageKind::LinkSubmit,
        }
    }

    /// Encode the body as raw JSON.
    pub fn to_body(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Get { key } => Ok(Value::from(*key)),
            Self::Link(info) => serde_json::to_value(info),
            Self::Update(request) => serde_json::to_value(request),
            Self::Confirm { tag } => Ok(Value::from(tag.as_str())),
            Self::Success | Self::Connect | Self::IsActive => Ok(Value::Null),
            Self::Failure { reason } => Ok(Value::from(reason.as_str())),
            Self::ApiList(list) => serde_json::to_value(list),
            Self::Exception(kind) => Ok(Value::from(kind.as_str())),
            Self::FindLink { key } => Ok(Value::from(key.as_str())),
            Self::Subscribes(grants) => serde_json::to_value(grants),
            Self::LinkSubmit(apply) => serde_json::to_value(apply),
        }
    }

    /// Decode a raw body according to `kind`.
    pub fn from_body(kind: MessageKind, body: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            MessageKind::Get => Self::Get {
                key: serde_json::from_value(body)?,
            },
            MessageKind::Link => Self::Link(serde_json::from_value(body)?),
            MessageKind::Update => Self::Update(serde_json::from_value(body)?),
            MessageKind::Confirm => Self::Confirm {
                tag: serde_json::from_value(body)?,
            },
            MessageKind::Success => Self::Success,
            MessageKind::Connect => Self::Connect,
            MessageKind::Failure => Self::Failure {
                reason: serde_json::from_value(body)?,
            },
            MessageKind::ApiList => Self::ApiList(serde_json::from_value(body)?),
            MessageKind::Exception => Self::Exception(serde_json::from_value(body)?),
            MessageKind::IsActive => Self::IsActive,
            MessageKind::FindLink => Self::FindLink {
                key: serde_json::from_value(body)?,
            },
            MessageKind::Subscribes if body.is_null() => Self::Subscribes(Vec::new()),
            MessageKind::Subscribes => Self::Subscribes(serde_json::from_value(body)?),
            MessageKind::LinkSubmit => Self::LinkSubmit(serde_json::from_value(body)?),
        })
    }
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct DataGram {
    pub tag: String,
    pub service_id: i64,
    pub key: i64,
    pub time_stamp: DateTime<Utc>,
    pub payload: Payload,
}

impl DataGram {
    /// Build an envelope stamped with the current time.
    pub fn new(tag: impl Into<String>, service_id: i64, key: i64, payload: Payload) -> Self {
        Self {
            tag: tag.into(),
            service_id,
            key,
            time_stamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Wire form of this envelope.
    pub fn to_raw(&self) -> Result<RawDataGram, serde_json::Error> {
        Ok(RawDataGram {
            tag: self.tag.clone(),
            service_id: self.service_id,
            data: RawData {
                title: self.kind(),
                key: self.key,
                time_stamp: self.time_stamp,
                body: self.payload.to_body()?,
            },
        })
    }
}

/// Body did not match the shape its kind requires.
#[derive(Debug, Error)]
#[error("Malformed {kind} body in {tag}: {source}")]
pub struct PayloadError {
    pub tag: String,
    pub service_id: i64,
    pub kind: MessageKind,
    pub key: i64,
    #[source]
    pub source: serde_json::Error,
}

impl TryFrom<RawDataGram> for DataGram {
    type Error = PayloadError;

    fn try_from(raw: RawDataGram) -> Result<Self, Self::Error> {
        let RawDataGram {
            tag,
            service_id,
            data,
        } = raw;

        match Payload::from_body(data.title, data.body) {
            Ok(payload) => Ok(Self {
                tag,
                service_id,
                key: data.key,
                time_stamp: data.time_stamp,
                payload,
            }),
            Err(source) => Err(PayloadError {
                tag,
                service_id,
                kind: data.title,
                key: data.key,
                source,
            }),
        }
    }
}

// ============================================================================
// Link tunnel frames
// ============================================================================

/// Link frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkType {
    Stop,
    Start,
    Custom,
    Confirm,
    Success,
    Transfer,
}

impl LinkType {
    /// Whether the sender keeps the frame pending until confirmed.
    pub fn is_tracked(&self) -> bool {
        matches!(self, Self::Custom | Self::Transfer)
    }
}

/// Frame exchanged on a link field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LinkGram {
    pub tag: String,
    #[serde(rename = "Type")]
    pub kind: LinkType,
    #[serde(default)]
    pub custom_key: String,
    #[serde(default)]
    pub body: Value,
}

impl LinkGram {
    pub fn new(tag: impl Into<String>, kind: LinkType, custom_key: impl Into<String>, body: Value) -> Self {
        Self {
            tag: tag.into(),
            kind,
            custom_key: custom_key.into(),
            body,
        }
    }

    /// Acknowledgment for a received frame.
    pub fn confirm(tag: impl Into<String>, acked: &str) -> Self {
        Self::new(tag, LinkType::Confirm, "", Value::from(acked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_kind_wire_codes() {
        assert_eq!(serde_json::to_string(&MessageKind::Get).unwrap(), "1");
        assert_eq!(serde_json::to_string(&MessageKind::ApiList).unwrap(), "8");
        assert_eq!(serde_json::to_string(&MessageKind::LinkSubmit).unwrap(), "13");

        let by_code: MessageKind = serde_json::from_str("10").unwrap();
        assert_eq!(by_code, MessageKind::IsActive);
        let by_name: MessageKind = serde_json::from_str("\"IS_ACTIVE\"").unwrap();
        assert_eq!(by_name, MessageKind::IsActive);
        assert!(serde_json::from_str::<MessageKind>("0").is_err());
        assert!(serde_json::from_str::<MessageKind>("14").is_err());

        for kind in MessageKind::ALL {
            let parsed: MessageKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("NOPE".parse::<MessageKind>().is_err());
    }

    #[test]
    fn test_request_kinds() {
        assert!(MessageKind::Get.is_request());
        assert!(MessageKind::LinkSubmit.is_request());
        assert!(!MessageKind::Confirm.is_request());
        assert!(!MessageKind::IsActive.is_request());
        assert!(!MessageKind::Exception.is_request());
    }

    #[test]
    fn test_exception_kind_keeps_historical_spelling() {
        let json = serde_json::to_string(&ExceptionKind::GetDataFormException).unwrap();
        assert_eq!(json, "\"GET_DATA_FORM_EXECPTION\"");

        let parsed: ExceptionKind = serde_json::from_str("\"FINDLINK_DATA_FORM_EXECPTION\"").unwrap();
        assert_eq!(parsed, ExceptionKind::FindLinkDataFormException);

        let unknown: ExceptionKind = serde_json::from_str("\"SOMETHING_NEW\"").unwrap();
        assert_eq!(unknown, ExceptionKind::Other("SOMETHING_NEW".into()));
        assert_eq!(unknown.as_str(), "SOMETHING_NEW");
    }

    #[test]
    fn test_get_body_is_the_key() {
        let gram = DataGram::new("TAG-1", 1, 42, Payload::Get { key: 42 });
        let raw = gram.to_raw().unwrap();
        assert_eq!(raw.data.title, MessageKind::Get);
        assert_eq!(raw.data.body, json!(42));

        let back = DataGram::try_from(raw).unwrap();
        assert_eq!(back, gram);
    }

    #[test]
    fn test_update_body_shape() {
        let gram = DataGram::new(
            "TAG-1",
            1,
            42,
            Payload::Update(UpdateRequest {
                origin: None,
                new: json!("v1"),
            }),
        );
        let raw = gram.to_raw().unwrap();
        assert_eq!(raw.data.body, json!({"Origin": null, "New": "v1"}));
    }

    #[test]
    fn test_body_kind_mismatch_keeps_tag() {
        let raw = RawDataGram {
            tag: "BROKEN-3".into(),
            service_id: 3,
            data: RawData {
                title: MessageKind::Get,
                key: 9,
                time_stamp: Utc::now(),
                body: json!({"not": "a key"}),
            },
        };

        let err = DataGram::try_from(raw).unwrap_err();
        assert_eq!(err.tag, "BROKEN-3");
        assert_eq!(err.kind, MessageKind::Get);
        assert_eq!(err.key, 9);
        assert_eq!(
            ExceptionKind::data_form_for(err.kind),
            ExceptionKind::GetDataFormException
        );
    }

    #[test]
    fn test_unit_kinds_ignore_body() {
        let payload = Payload::from_body(MessageKind::IsActive, json!({"anything": 1})).unwrap();
        assert_eq!(payload, Payload::IsActive);

        let payload = Payload::from_body(MessageKind::Subscribes, Value::Null).unwrap();
        assert_eq!(payload, Payload::Subscribes(Vec::new()));
    }

    #[test]
    fn test_link_gram_field_names() {
        let gram = LinkGram::new("T-1", LinkType::Custom, "chat", json!("hello"));
        let json = serde_json::to_value(&gram).unwrap();
        assert_eq!(json["Type"], "CUSTOM");
        assert_eq!(json["CustomKey"], "chat");
        assert_eq!(json["Body"], "hello");
    }
}
