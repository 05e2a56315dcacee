// src/protocol.rs - Tunnel envelope and payload types

use hyper::HeaderMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Header multimap carried across the tunnel: canonical name to values.
pub type Headers = BTreeMap<String, Vec<String>>;

/// First sequence number of a numbered SSE stream. Zero marks an
/// unnumbered (legacy) sender.
pub const SSE_SEQUENCE_BASE: u64 = 1;

/// Connection-scoped headers that never cross the tunnel.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid message encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("expected {expected} reply, got {got}")]
    UnexpectedKind { expected: MessageKind, got: MessageKind },
}

/// Discriminates what a [`Message`] payload holds. Encoded as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageKind {
    Text,
    HttpRequest,
    HttpResponse,
    WebsocketCreateRequest,
    WebsocketCreateResponse,
    WebsocketMessage,
    WebsocketClose,
    SseRequest,
    SseMessage,
    SseClose,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        match kind {
            MessageKind::Text => 0,
            MessageKind::HttpRequest => 1,
            MessageKind::HttpResponse => 2,
            MessageKind::WebsocketCreateRequest => 3,
            MessageKind::WebsocketCreateResponse => 4,
            MessageKind::WebsocketMessage => 5,
            MessageKind::WebsocketClose => 6,
            MessageKind::SseRequest => 7,
            MessageKind::SseMessage => 8,
            MessageKind::SseClose => 9,
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MessageKind::Text,
            1 => MessageKind::HttpRequest,
            2 => MessageKind::HttpResponse,
            3 => MessageKind::WebsocketCreateRequest,
            4 => MessageKind::WebsocketCreateResponse,
            5 => MessageKind::WebsocketMessage,
            6 => MessageKind::WebsocketClose,
            7 => MessageKind::SseRequest,
            8 => MessageKind::SseMessage,
            9 => MessageKind::SseClose,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Text => "text",
            MessageKind::HttpRequest => "http_request",
            MessageKind::HttpResponse => "http_response",
            MessageKind::WebsocketCreateRequest => "websocket_create_request",
            MessageKind::WebsocketCreateResponse => "websocket_create_response",
            MessageKind::WebsocketMessage => "websocket_message",
            MessageKind::WebsocketClose => "websocket_close",
            MessageKind::SseRequest => "sse_request",
            MessageKind::SseMessage => "sse_message",
            MessageKind::SseClose => "sse_close",
        };
        f.write_str(name)
    }
}

/// Envelope exchanged over the tunnel WebSocket, one per frame.
///
/// `re` is empty for unsolicited messages and holds the originating `id`
/// for replies. `payload` is kind-specific JSON, base64-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    #[serde(default, deserialize_with = "null_as_default")]
    pub re: String,
    #[serde(default, with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl Message {
    /// New unsolicited message with a fresh id.
    pub fn new<P: Serialize>(kind: MessageKind, payload: &P) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            re: String::new(),
            payload: serde_json::to_vec(payload)?,
        })
    }

    /// Reply correlated to `self`.
    pub fn reply<P: Serialize>(&self, kind: MessageKind, payload: &P) -> Result<Self, ProtocolError> {
        let mut message = Self::new(kind, payload)?;
        message.re = self.id.clone();
        Ok(message)
    }

    pub fn text(text: impl Into<String>) -> Result<Self, ProtocolError> {
        Self::new(MessageKind::Text, &TextPayload { text: text.into() })
    }

    pub fn is_reply(&self) -> bool {
        !self.re.is_empty()
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Decode the payload after checking the message is of `kind`.
    pub fn expect<T: DeserializeOwned>(&self, kind: MessageKind) -> Result<T, ProtocolError> {
        if self.kind != kind {
            return Err(ProtocolError::UnexpectedKind {
                expected: kind,
                got: self.kind,
            });
        }
        self.decode_payload()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPayload {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestPayload {
    pub method: String,
    pub path: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: Headers,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: Headers,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpResponsePayload {
    #[serde(default, deserialize_with = "lenient_error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub response: HttpResponse,
}

impl HttpResponsePayload {
    pub fn failed(error: impl fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            response: HttpResponse::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebsocketCreateRequestPayload {
    #[serde(default)]
    pub origin: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebsocketCreateResponsePayload {
    #[serde(default)]
    pub session_id: String,
    #[serde(default, deserialize_with = "lenient_error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_response: Option<HttpResponse>,
}

/// WebSocket frame kinds, numbered after the RFC 6455 opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FrameKind {
    Text,
    Binary,
}

impl From<FrameKind> for u8 {
    fn from(kind: FrameKind) -> u8 {
        match kind {
            FrameKind::Text => 1,
            FrameKind::Binary => 2,
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameKind::Text),
            2 => Ok(FrameKind::Binary),
            other => Err(format!("unsupported websocket frame kind {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsocketMessagePayload {
    pub session_id: String,
    pub kind: FrameKind,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsocketClosePayload {
    pub session_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SseRequestPayload {
    pub path: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: Headers,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SseMessagePayload {
    #[serde(default)]
    pub data: String,
    /// Zero means the sender does not number its events.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub sequence: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SseClosePayload {
    #[serde(default, deserialize_with = "lenient_error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Canonical MIME header form: `x-foo-bar` becomes `X-Foo-Bar`.
pub fn canonical_header_key(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// Collect a hyper header map into the wire representation.
pub fn headers_from(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        let Ok(value) = value.to_str() else {
            continue;
        };
        headers
            .entry(canonical_header_key(name.as_str()))
            .or_default()
            .push(value.to_string());
    }
    headers
}

/// True for headers tied to a single hop, which each side recomputes.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Errors may arrive as a string, null, or an opaque object.
fn lenient_error<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD.decode(encoded).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
