//! Classifying and answering inbound DMs.
//!
//! A single task consumes the sidecar's event stream. Liveness pings and
//! reply correlation are handled inline so they never queue behind an
//! upstream call; elevation queries run on spawned tasks bounded by the
//! upstream concurrency gate. Every query receives exactly one reply
//! envelope carrying its id, even when handling fails.

use std::sync::Arc;

use metrics::counter;
use percent_encoding::percent_decode_str;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunks::{chunk_limit_for, send_http_response};
use crate::elevation::ElevationSource;
use crate::locations::{self, ParsedQuery, QueryMode};
use crate::outbound::SendQueue;
use crate::pending::PendingRegistry;
use crate::repack::repack_geohash_results;
use crate::sidecar::protocol::Event;
use crate::sidecar::{read_addr, SharedAddr};
use crate::wire::{decode_dm, encode_dm, now_ms, HttpResponseDm, OutboundDm};
use crate::Result;

/// A fresh 128-bit hex message id.
pub fn new_dm_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Everything the dispatcher needs to answer a DM.
pub struct Dispatcher {
    pub addr: SharedAddr,
    pub pending: Arc<PendingRegistry>,
    pub queue: SendQueue,
    pub elevation: Arc<dyn ElevationSource>,
    pub default_dataset: String,
    pub chunk_limit: usize,
}

impl Dispatcher {
    /// Start the event loop consuming sidecar events.
    pub fn spawn(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    Event::Ready { addr } => info!(addr = %addr, "overlay address published"),
                    Event::Message { src, payload_b64 } => {
                        let _task = self.handle_message(&src, &payload_b64).await;
                    }
                    Event::Sent { id, dest } => debug!(id = %id, dest = %dest, "send acknowledged"),
                    Event::Error { id, message } => {
                        error!(id = ?id, "sidecar error: {}", message)
                    }
                }
            }
        })
    }

    /// Handle one inbound DM. Queries are answered on a spawned task; the
    /// returned handle lets tests await them.
    pub async fn handle_message(
        self: &Arc<Self>,
        src: &str,
        payload_b64: &str,
    ) -> Option<JoinHandle<()>> {
        let msg = decode_dm(payload_b64)?;
        let kind = msg
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_lowercase();
        let mid = message_id(&msg);
        let chunk_limit = chunk_limit_for(&msg, self.chunk_limit);
        counter!("forwarder.dms_received.total", 1);

        match kind.as_str() {
            "ping" => {
                let id = or_fresh_id(&mid);
                let pong = OutboundDm::Pong {
                    id: id.clone(),
                    ts: now_ms(),
                    addr: read_addr(&self.addr),
                };
                self.send_dm(src, &pong, &id).await;
                None
            }
            "http.response" => {
                if !mid.is_empty() && self.pending.complete(&mid, msg) {
                    debug!(id = %mid, "completed pending forward");
                } else {
                    debug!(id = %mid, "unmatched http.response discarded");
                }
                None
            }
            "elev.query" => {
                let this = self.clone();
                let src = src.to_owned();
                Some(tokio::spawn(async move {
                    this.answer_elev_query(&src, &mid, &msg, chunk_limit).await;
                }))
            }
            "http.request" => {
                let this = self.clone();
                let src = src.to_owned();
                Some(tokio::spawn(async move {
                    this.answer_http_request(&src, &mid, &msg, chunk_limit).await;
                }))
            }
            _ => {
                debug!(kind = %kind, "unrecognized DM type discarded");
                None
            }
        }
    }

    /// Answer an `elev.query` DM.
    async fn answer_elev_query(&self, src: &str, mid: &str, msg: &Value, chunk_limit: usize) {
        let dataset = dataset_of(msg, &self.default_dataset);
        let null = Value::Null;
        let parsed = locations::parse_query(
            msg.get("locations").unwrap_or(&null),
            msg.get("geohashes").unwrap_or(&null),
        );
        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                self.reply_error(src, mid, 400, &format!("bad request: {}", err), chunk_limit)
                    .await;
                return;
            }
        };
        self.query_and_reply(src, mid, &dataset, parsed, chunk_limit)
            .await;
    }

    /// Answer an `http.request` DM. Only `GET /v1/<dataset>?locations=…`
    /// is honored; the locations value is classified geohash when it has
    /// `|` separators and no commas.
    async fn answer_http_request(&self, src: &str, mid: &str, msg: &Value, chunk_limit: usize) {
        let method = msg
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let url = msg.get("url").and_then(Value::as_str).unwrap_or("").trim();
        if method != "GET" || !url.starts_with("/v1/") {
            self.reply_error(
                src,
                mid,
                400,
                "only GET /v1/<dataset>?locations=... supported",
                chunk_limit,
            )
            .await;
            return;
        }

        let (dataset, locs_q) = match split_request_url(url) {
            Some(parts) => parts,
            None => {
                self.reply_error(src, mid, 400, "missing locations", chunk_limit)
                    .await;
                return;
            }
        };

        match parse_request_locations(&locs_q) {
            Ok(parsed) => {
                self.query_and_reply(src, mid, &dataset, parsed, chunk_limit)
                    .await;
            }
            Err(err) => {
                self.reply_error(src, mid, 400, &format!("bad locations: {}", err), chunk_limit)
                    .await;
            }
        }
    }

    /// Run the upstream lookup, repack geohash-mode results, and send the
    /// reply envelope.
    async fn query_and_reply(
        &self,
        src: &str,
        mid: &str,
        dataset: &str,
        parsed: ParsedQuery,
        chunk_limit: usize,
    ) {
        let mut resp = self.elevation.lookup(dataset, &parsed.points).await;
        if parsed.mode == QueryMode::Geohash {
            if let Some(geohashes) = &parsed.geohashes {
                repack_geohash_results(&mut resp, geohashes, &parsed.points);
            }
        }
        let dm = HttpResponseDm::new(
            or_fresh_id(mid),
            resp.status,
            resp.headers,
            resp.duration_ms,
            resp.body_b64,
        );
        if let Err(err) = send_http_response(&self.queue, src, dm, chunk_limit).await {
            warn!(id = %mid, "could not send reply: {}", err);
        }
    }

    /// Send a synthetic error envelope carrying the request id.
    async fn reply_error(&self, src: &str, mid: &str, status: u16, message: &str, chunk_limit: usize) {
        let dm = HttpResponseDm::synthetic(or_fresh_id(mid), status, message);
        if let Err(err) = send_http_response(&self.queue, src, dm, chunk_limit).await {
            warn!(id = %mid, "could not send error reply: {}", err);
        }
    }

    async fn send_dm(&self, dest: &str, dm: &OutboundDm, id: &str) {
        let result: Result<()> = async {
            let wire = encode_dm(dm)?;
            self.queue.enqueue(dest, wire, id).await
        }
        .await;
        if let Err(err) = result {
            warn!(dest = %dest, "could not send DM: {}", err);
        }
    }
}

/// Read the message id, stringifying numeric ids the way peers sometimes
/// send them.
fn message_id(msg: &Value) -> String {
    match msg.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Use the request id, or mint one when the peer sent none.
fn or_fresh_id(mid: &str) -> String {
    if mid.is_empty() {
        new_dm_id()
    } else {
        mid.to_owned()
    }
}

fn dataset_of(msg: &Value, default: &str) -> String {
    msg.get("dataset")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_owned()
}

/// Split `/v1/<dataset>?locations=<value>` into its parts, percent-decoding
/// the locations value. `None` means the URL is not in that shape.
fn split_request_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("/v1/")?;
    let (dataset, query) = rest.split_once('?')?;
    let value = query.strip_prefix("locations=")?;
    if dataset.is_empty() || value.is_empty() {
        return None;
    }
    let decoded = percent_decode_str(value).decode_utf8_lossy().into_owned();
    Some((dataset.to_owned(), decoded))
}

/// Classify an `http.request` locations value: `|` with no `,` means a
/// geohash list, anything else parses as `lat,lng` pairs.
fn parse_request_locations(locs_q: &str) -> Result<ParsedQuery> {
    let tokens: Vec<String> = locs_q
        .split('|')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect();
    if locs_q.contains('|') && !locs_q.contains(',') {
        let points = tokens
            .iter()
            .map(|gh| crate::geohash::decode(gh))
            .collect::<Result<Vec<_>>>()?;
        return Ok(ParsedQuery {
            mode: QueryMode::Geohash,
            points,
            geohashes: Some(tokens),
        });
    }
    let points = tokens
        .iter()
        .map(|t| locations::parse_latlng_pair(t))
        .collect::<Result<Vec<_>>>()?;
    Ok(ParsedQuery {
        mode: QueryMode::Latlng,
        points,
        geohashes: None,
    })
}
