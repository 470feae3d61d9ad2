//! Canonical capture records and their persistence.
//!
//! Every exchange that passes through the proxy ends up as a
//! [`CapturedExchange`]: a method/path plus four independent parameter maps on
//! the request side, and status/headers/body on the response side. Records are
//! insert-only snapshots; anything derived from them (replays, scan attempts)
//! works on an owned clone.

pub mod codec;
mod jsonl;
mod sink;

pub use jsonl::JsonlStore;
pub use sink::{CaptureSink, MemoryStore};

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Key -> single value. Repeated keys are pre-joined, see [`codec::join_values`].
pub type ParamMap = BTreeMap<String, String>;

/// Identifier assigned by a [`CaptureSink`] on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(RecordId)
    }
}

/// The four independent parameter namespaces of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamClass {
    Query,
    Form,
    Headers,
    Cookies,
}

impl ParamClass {
    pub const ALL: [ParamClass; 4] = [
        ParamClass::Query,
        ParamClass::Form,
        ParamClass::Headers,
        ParamClass::Cookies,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamClass::Query => "query",
            ParamClass::Form => "form",
            ParamClass::Headers => "headers",
            ParamClass::Cookies => "cookies",
        }
    }
}

impl fmt::Display for ParamClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical request.
///
/// For plaintext traffic `path` is the request target as the proxy received it
/// (the absolute URL for proxied requests). For tunnels it is the placeholder
/// `https://<host>/`, since the real path travels encrypted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub get_params: ParamMap,
    #[serde(default)]
    pub headers: ParamMap,
    #[serde(default)]
    pub cookies: ParamMap,
    #[serde(default)]
    pub post_params: ParamMap,
}

impl Request {
    pub fn params(&self, class: ParamClass) -> &ParamMap {
        match class {
            ParamClass::Query => &self.get_params,
            ParamClass::Form => &self.post_params,
            ParamClass::Headers => &self.headers,
            ParamClass::Cookies => &self.cookies,
        }
    }

    pub fn params_mut(&mut self, class: ParamClass) -> &mut ParamMap {
        match class {
            ParamClass::Query => &mut self.get_params,
            ParamClass::Form => &mut self.post_params,
            ParamClass::Headers => &mut self.headers,
            ParamClass::Cookies => &mut self.cookies,
        }
    }

    /// Return an owned copy of this request with `suffix` appended to one
    /// parameter value. `self` is left untouched; a missing key is created.
    pub fn with_appended(&self, class: ParamClass, key: &str, suffix: &str) -> Request {
        let mut mutated = self.clone();
        mutated
            .params_mut(class)
            .entry(key.to_string())
            .or_default()
            .push_str(suffix);
        mutated
    }
}

/// Canonical response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub code: u16,
    pub message: String,
    #[serde(default)]
    pub headers: ParamMap,
    #[serde(default)]
    pub body: String,
}

/// Bytes relayed through a tunnel without interpretation.
///
/// Serialized as standard base64 so that binary (usually TLS) traffic survives
/// a text store intact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpaqueBytes(pub Bytes);

impl OpaqueBytes {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for OpaqueBytes {
    fn from(v: Vec<u8>) -> Self {
        OpaqueBytes(Bytes::from(v))
    }
}

impl Serialize for OpaqueBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for OpaqueBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(OpaqueBytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Raw capture of both directions of a CONNECT tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelPayload {
    pub client_to_target: OpaqueBytes,
    pub target_to_client: OpaqueBytes,
}

/// One persisted request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedExchange {
    pub id: RecordId,
    pub request: Request,
    pub response: Response,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelPayload>,
}

/// Returns the current UTC time as an RFC 3339 string.
pub fn now_rfc3339() -> String {
    let now = time::OffsetDateTime::now_utc();
    now.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
