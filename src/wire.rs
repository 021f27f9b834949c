//! DM wire shapes.
//!
//! Every DM payload is a base64-wrapped JSON object with a `type` field.
//! Inbound payloads are parsed leniently as [`serde_json::Value`] (peers are
//! not always well-behaved); outbound payloads are typed here.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use serde_json::Value;

use crate::Result;

/// An outbound DM payload.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum OutboundDm {
    /// Liveness reply.
    #[serde(rename = "pong")]
    Pong {
        id: String,
        ts: u64,
        addr: Option<String>,
    },
    /// The reply envelope for a proxied HTTP request.
    #[serde(rename = "http.response")]
    HttpResponse(HttpResponseDm),
    /// One numbered piece of a chunked reply body.
    #[serde(rename = "http.chunk")]
    HttpChunk(HttpChunkDm),
}

/// Body of an `http.response` DM. The `chunked` family of fields is only
/// present when the body was split into `http.chunk` DMs.
#[derive(Clone, Debug, Serialize)]
pub struct HttpResponseDm {
    pub id: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub duration_ms: u64,
    pub body_b64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_digest: Option<String>,
}

impl HttpResponseDm {
    /// A plain, unchunked response envelope.
    pub fn new(
        id: String,
        status: u16,
        headers: HashMap<String, String>,
        duration_ms: u64,
        body_b64: String,
    ) -> HttpResponseDm {
        HttpResponseDm {
            id,
            status,
            headers,
            duration_ms,
            body_b64,
            chunked: None,
            chunk_count: None,
            bytes_total: None,
            body_digest: None,
        }
    }

    /// A synthetic error envelope with a JSON `{"error": …}` body.
    pub fn synthetic(id: String, status: u16, message: &str) -> HttpResponseDm {
        let body = serde_json::json!({ "error": message }).to_string();
        HttpResponseDm::new(
            id,
            status,
            json_content_type(),
            0,
            STANDARD.encode(body.as_bytes()),
        )
    }
}

/// Body of one `http.chunk` DM.
#[derive(Clone, Debug, Serialize)]
pub struct HttpChunkDm {
    pub id: String,
    pub chunk_index: usize,
    pub chunk_count: usize,
    pub bytes_total: usize,
    pub body_b64: String,
}

/// Serialize a DM payload and wrap it in base64 for the wire.
pub fn encode_dm(dm: &OutboundDm) -> Result<String> {
    let json = serde_json::to_string(dm)?;
    Ok(STANDARD.encode(json.as_bytes()))
}

/// Decode a base64 DM payload into a JSON value. Returns `None` for
/// anything malformed; inbound garbage is dropped, never fatal.
pub fn decode_dm(payload_b64: &str) -> Option<Value> {
    if payload_b64.is_empty() {
        return None;
    }
    let raw = STANDARD.decode(payload_b64).ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Decode a `body_b64` field, treating absent or malformed values as empty.
pub fn decode_body_b64(body_b64: &str) -> Vec<u8> {
    STANDARD.decode(body_b64).unwrap_or_default()
}

/// A headers map holding only `content-type: application/json`.
pub fn json_content_type() -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert("content-type".to_owned(), "application/json".to_owned());
    headers
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pong_round_trips_through_base64() {
        let dm = OutboundDm::Pong {
            id: "p1".to_owned(),
            ts: 1_700_000_000_000,
            addr: Some("forwarder.abc".to_owned()),
        };
        let wire = encode_dm(&dm).unwrap();
        let value = decode_dm(&wire).unwrap();
        assert_eq!(value["type"], "pong");
        assert_eq!(value["id"], "p1");
        assert_eq!(value["addr"], "forwarder.abc");
    }

    #[test]
    fn plain_response_omits_chunk_fields() {
        let dm = OutboundDm::HttpResponse(HttpResponseDm::new(
            "r1".to_owned(),
            200,
            json_content_type(),
            12,
            STANDARD.encode(b"{}"),
        ));
        let json = serde_json::to_string(&dm).unwrap();
        assert!(!json.contains("chunked"));
        assert!(!json.contains("body_digest"));
        assert!(json.contains("\"type\":\"http.response\""));
    }

    #[test]
    fn synthetic_envelope_carries_error_body() {
        let dm = HttpResponseDm::synthetic("x".to_owned(), 400, "bad request: nope");
        assert_eq!(dm.status, 400);
        assert_eq!(dm.duration_ms, 0);
        let body = decode_body_b64(&dm.body_b64);
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "bad request: nope");
    }

    #[test]
    fn malformed_payloads_decode_to_none() {
        assert!(decode_dm("").is_none());
        assert!(decode_dm("!!!not base64!!!").is_none());
        assert!(decode_dm(&STANDARD.encode(b"not json")).is_none());
    }
}
