//! Splitting reply bodies into numbered DM chunks.
//!
//! Overlay DMs have a practical size ceiling, so when a chunk limit is in
//! force a non-empty reply body goes out as `ceil(len / S)` `http.chunk`
//! DMs followed by the `http.response` envelope carrying `chunked:true`,
//! the chunk count, and a SHA-256 digest of the whole body. A body that
//! fits in one chunk still takes this path (`ceil(n/n) = 1`: one chunk
//! plus the envelope). Concatenating the chunks in index order reproduces
//! the body exactly.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use metrics::counter;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::outbound::SendQueue;
use crate::wire::{decode_body_b64, encode_dm, HttpChunkDm, HttpResponseDm, OutboundDm};
use crate::Result;

/// Effective chunk size for one request.
///
/// A request may lower the configured ceiling via `max_chunk_bytes` or
/// `chunk_bytes`, never raise it. `0` disables chunking entirely.
pub fn chunk_limit_for(msg: &Value, configured: usize) -> usize {
    let base = configured as i64;
    // `max_chunk_bytes` wins when it carries a usable value; otherwise
    // `chunk_bytes` is consulted, and a present-but-zero `chunk_bytes`
    // explicitly disables chunking for this request.
    let max = msg.get("max_chunk_bytes").filter(|v| !v.is_null());
    let chunk = msg.get("chunk_bytes").filter(|v| !v.is_null());
    let requested = match max {
        Some(v) if is_truthy_number(v) => Some(v),
        _ => chunk,
    };
    let limit = match requested {
        Some(v) => value_as_i64(v).unwrap_or(base),
        None => base,
    };
    if limit <= 0 {
        return 0;
    }
    if base > 0 {
        limit.min(base) as usize
    } else {
        limit as usize
    }
}

fn is_truthy_number(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn value_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Send a reply envelope to `dest`. When `chunk_limit` is nonzero and the
/// body is non-empty the body goes out chunked; otherwise the envelope is
/// a single DM. The envelope's `id` correlates every emitted DM.
pub async fn send_http_response(
    queue: &SendQueue,
    dest: &str,
    dm: HttpResponseDm,
    chunk_limit: usize,
) -> Result<()> {
    if chunk_limit > 0 {
        let body = decode_body_b64(&dm.body_b64);
        if !body.is_empty() {
            return send_chunked(queue, dest, dm, body, chunk_limit).await;
        }
    }
    let id = dm.id.clone();
    let wire = encode_dm(&OutboundDm::HttpResponse(dm))?;
    queue.enqueue(dest, wire, &id).await
}

/// Emit the numbered chunks, then the summary envelope.
async fn send_chunked(
    queue: &SendQueue,
    dest: &str,
    mut dm: HttpResponseDm,
    body: Vec<u8>,
    chunk_limit: usize,
) -> Result<()> {
    let chunk_size = chunk_limit.max(1);
    let bytes_total = body.len();
    let chunk_count = bytes_total.div_ceil(chunk_size).max(1);
    let digest = sha256_hex(&body);
    let rid = dm.id.clone();

    for (index, chunk) in body.chunks(chunk_size).enumerate() {
        let chunk_dm = HttpChunkDm {
            id: rid.clone(),
            chunk_index: index,
            chunk_count,
            bytes_total,
            body_b64: STANDARD.encode(chunk),
        };
        let wire = encode_dm(&OutboundDm::HttpChunk(chunk_dm))?;
        queue
            .enqueue(dest, wire, &format!("{}-chunk-{}", rid, index))
            .await?;
        counter!("forwarder.chunks_sent.total", 1);
    }

    dm.chunked = Some(true);
    dm.chunk_count = Some(chunk_count);
    dm.bytes_total = Some(bytes_total);
    dm.body_digest = Some(digest);
    dm.body_b64 = String::new();
    let wire = encode_dm(&OutboundDm::HttpResponse(dm))?;
    queue.enqueue(dest, wire, &rid).await
}

fn sha256_hex(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
