//! The HTTP surface: `/healthz` and `/forward`.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{format_err, Context};
use axum::{
    extract::ConnectInfo,
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatch::new_dm_id;
use crate::locations::{self, QueryMode};
use crate::outbound::SendQueue;
use crate::pending::PendingRegistry;
use crate::rate_limit::{client_ip, RateGuard};
use crate::sidecar::{read_addr, SharedAddr};
use crate::wire::{decode_body_b64, now_ms};
use crate::Result;

/// Shared state behind the HTTP handlers.
pub struct AppState {
    pub addr: SharedAddr,
    pub queue: SendQueue,
    pub pending: Arc<PendingRegistry>,
    pub guard: RateGuard,
    pub elev_base: String,
    pub default_dataset: String,
    /// How long `/forward` waits for the DM reply.
    pub forward_wait: Duration,
}

/// An error message to serialize as JSON on error.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl ErrorResponse {
    fn new(message: impl Into<String>) -> Json<ErrorResponse> {
        Json(ErrorResponse {
            error: message.into(),
        })
    }
}

/// Build the application router. Split out so tests can serve it on an
/// ephemeral port.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_healthz))
        .route("/forward", post(handle_forward))
        .layer(middleware::from_fn(rate_guard))
        .layer(Extension(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Run the server until `shutdown` resolves.
pub async fn run_server(
    config: &Config,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let bind = resolve_bind(config);
    let port = find_free_port(&bind, config.forward_port, 100)?;
    let addr = (bind.as_str(), port)
        .to_socket_addrs()
        .with_context(|| format!("could not resolve {}:{}", bind, port))?
        .next()
        .ok_or_else(|| format_err!("no address for {}:{}", bind, port))?;

    let app = build_router(state);
    info!("forwarder listening on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
        .context("web server failed")
}

/// A loopback bind is promoted to `0.0.0.0` for LAN access unless the
/// operator pinned it with `FORWARD_FORCE_LOCAL=1`.
fn resolve_bind(config: &Config) -> String {
    let bind = config.forward_bind.as_str();
    if matches!(bind, "127.0.0.1" | "localhost" | "::1") && !config.forward_force_local {
        warn!(
            "FORWARD_BIND was {}; switching to 0.0.0.0 for LAN access \
             (set FORWARD_FORCE_LOCAL=1 to keep local-only)",
            bind
        );
        return "0.0.0.0".to_owned();
    }
    bind.to_owned()
}

/// Find the first bindable port in `[preferred, preferred + tries]`.
fn find_free_port(bind: &str, preferred: u16, tries: u16) -> Result<u16> {
    for port in preferred..=preferred.saturating_add(tries) {
        if std::net::TcpListener::bind((bind, port)).is_ok() {
            return Ok(port);
        }
    }
    Err(format_err!(
        "no free port in range {}..{}",
        preferred,
        preferred.saturating_add(tries)
    ))
}

/// Admission control, applied to every route.
async fn rate_guard<B>(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request<B>,
    next: Next<B>,
) -> Response {
    let client = client_ip(req.headers(), peer);
    if state.guard.check(&client) {
        next.run(req).await
    } else {
        (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "1")],
            ErrorResponse::new("rate limit"),
        )
            .into_response()
    }
}

#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
    addr: Option<String>,
    elev_base: String,
    dataset: String,
    ts: u64,
}

/// GET /healthz
async fn handle_healthz(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        ok: true,
        addr: read_addr(&state.addr),
        elev_base: state.elev_base.clone(),
        dataset: state.default_dataset.clone(),
        ts: now_ms(),
    })
}

/// Our /forward request format. `locations`/`geohashes` stay dynamic; the
/// coordinate parser sorts their many shapes out.
#[derive(Debug, Deserialize)]
struct ForwardRequest {
    #[serde(default)]
    dest: String,
    #[serde(default)]
    dataset: Option<String>,
    #[serde(default)]
    locations: Value,
    #[serde(default)]
    geohashes: Value,
}

/// Our /forward response format: the peer's reply envelope, plus the body
/// decoded to UTF-8 when possible.
#[derive(Serialize)]
struct ForwardResponse {
    ok: bool,
    id: String,
    status: Value,
    headers: Value,
    duration_ms: Value,
    body_b64: Value,
    body_utf8: Option<String>,
}

/// POST /forward
async fn handle_forward(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<ForwardRequest>,
) -> std::result::Result<(StatusCode, Json<ForwardResponse>), (StatusCode, Json<ErrorResponse>)>
{
    let dest = body.dest.trim();
    if dest.is_empty() {
        return Err((StatusCode::BAD_REQUEST, ErrorResponse::new("dest required")));
    }

    let parsed = locations::parse_query(&body.locations, &body.geohashes).map_err(|err| {
        (
            StatusCode::BAD_REQUEST,
            ErrorResponse::new(format!("bad payload: {}", err)),
        )
    })?;
    let dataset = body
        .dataset
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(&state.default_dataset);

    let dm_id = new_dm_id();
    let mut payload = serde_json::json!({
        "id": dm_id,
        "type": "elev.query",
        "dataset": dataset,
    });
    match parsed.mode {
        QueryMode::Geohash => {
            payload["geohashes"] = serde_json::json!(parsed.geohashes);
        }
        QueryMode::Latlng => {
            let points: Vec<Value> = parsed
                .points
                .iter()
                .map(|(lat, lng)| serde_json::json!({ "lat": lat, "lng": lng }))
                .collect();
            payload["locations"] = Value::Array(points);
        }
    }
    let wire = STANDARD.encode(payload.to_string().as_bytes());

    // Register the waiter before sending, so a fast reply cannot race the
    // registration.
    let waiter = state.pending.register(&dm_id);
    if let Err(err) = state.queue.enqueue(dest, wire, &dm_id).await {
        state.pending.remove(&dm_id);
        return Err((
            StatusCode::BAD_GATEWAY,
            ErrorResponse::new(format!("send failed: {}", err)),
        ));
    }

    let reply = match timeout(state.forward_wait, waiter).await {
        Ok(Ok(reply)) => reply,
        _ => {
            state.pending.remove(&dm_id);
            debug!(id = %dm_id, in_flight = state.pending.len(), "forward timed out");
            return Err((
                StatusCode::GATEWAY_TIMEOUT,
                ErrorResponse::new("dm response timeout"),
            ));
        }
    };

    let body_b64 = reply.get("body_b64").and_then(Value::as_str).unwrap_or("");
    let decoded = decode_body_b64(body_b64);
    let body_utf8 = if decoded.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&decoded).into_owned())
    };

    Ok((
        StatusCode::OK,
        Json(ForwardResponse {
            ok: true,
            id: dm_id,
            status: reply.get("status").cloned().unwrap_or(Value::Null),
            headers: reply.get("headers").cloned().unwrap_or(Value::Null),
            duration_ms: reply.get("duration_ms").cloned().unwrap_or(Value::Null),
            body_b64: reply.get("body_b64").cloned().unwrap_or(Value::Null),
            body_utf8,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode_dm;
    use hyper::{Body, Client};
    use std::num::NonZeroU32;
    use std::sync::RwLock;
    use tokio::sync::mpsc;

    struct TestServer {
        base: String,
        rx: mpsc::Receiver<crate::outbound::OutboundMessage>,
        state: Arc<AppState>,
    }

    /// Serve the router on an ephemeral port with a stub state.
    async fn serve(burst: u32, forward_wait: Duration) -> TestServer {
        let (queue, rx) = SendQueue::new(16);
        let state = Arc::new(AppState {
            addr: Arc::new(RwLock::new(None)),
            queue,
            pending: Arc::new(PendingRegistry::new()),
            guard: RateGuard::new(
                NonZeroU32::new(1).unwrap(),
                NonZeroU32::new(burst).unwrap(),
            ),
            elev_base: "http://localhost:5000".to_owned(),
            default_dataset: "mapzen".to_owned(),
            forward_wait,
        });
        let app = build_router(state.clone());
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });
        TestServer {
            base: format!("http://{}", addr),
            rx,
            state,
        }
    }

    async fn get_json(url: &str) -> (StatusCode, Value) {
        let res = Client::new().get(url.parse().unwrap()).await.unwrap();
        let status = res.status();
        let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn post_json(url: String, body: Value) -> (StatusCode, Value) {
        let req = hyper::Request::builder()
            .method("POST")
            .uri(url)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let res = Client::new().request(req).await.unwrap();
        let status = res.status();
        let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn healthz_works_before_the_sidecar_is_ready() {
        let server = serve(12, Duration::from_secs(1)).await;
        let (status, body) = get_json(&format!("{}/healthz", server.base)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["addr"], Value::Null);
        assert_eq!(body["dataset"], "mapzen");
        assert!(body["ts"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn forward_requires_a_dest() {
        let server = serve(12, Duration::from_secs(1)).await;
        let (status, body) = post_json(
            format!("{}/forward", server.base),
            serde_json::json!({ "locations": "1,2" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "dest required");
    }

    #[tokio::test]
    async fn forward_rejects_unparseable_payloads() {
        let server = serve(12, Duration::from_secs(1)).await;
        let (status, body) = post_json(
            format!("{}/forward", server.base),
            serde_json::json!({ "dest": "peer.0x1" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("bad payload:"));
    }

    #[tokio::test]
    async fn forward_round_trip() {
        let mut server = serve(12, Duration::from_secs(5)).await;
        let pending = server.state.pending.clone();

        let forward = tokio::spawn(post_json(
            format!("{}/forward", server.base),
            serde_json::json!({
                "dest": "peer.0xABC",
                "locations": [{ "lat": 0.0, "lng": 0.0 }],
            }),
        ));

        // Play the dispatcher: take the outbound DM and complete the
        // waiter with the peer's reply.
        let msg = server.rx.recv().await.unwrap();
        assert_eq!(msg.dest, "peer.0xABC");
        let query = decode_dm(&msg.payload_b64).unwrap();
        assert_eq!(query["type"], "elev.query");
        assert_eq!(query["id"].as_str().unwrap(), msg.id);
        assert_eq!(query["locations"][0]["lat"], 0.0);

        let reply_body = r#"{"results":[{"elevation":-4.0,"location":{"lat":0,"lng":0}}]}"#;
        assert!(pending.complete(
            &msg.id,
            serde_json::json!({
                "type": "http.response",
                "id": msg.id,
                "status": 200,
                "headers": { "content-type": "application/json" },
                "duration_ms": 12,
                "body_b64": STANDARD.encode(reply_body.as_bytes()),
            }),
        ));

        let (status, body) = forward.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["status"], 200);
        assert_eq!(body["id"], msg.id);
        assert_eq!(body["body_utf8"], reply_body);
    }

    #[tokio::test]
    async fn forward_times_out_and_reclaims_the_waiter() {
        let mut server = serve(12, Duration::from_millis(200)).await;
        let (status, body) = post_json(
            format!("{}/forward", server.base),
            serde_json::json!({ "dest": "peer.silent", "geohashes": ["ezs42"] }),
        )
        .await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["error"], "dm response timeout");
        assert!(server.state.pending.is_empty());
        // The query itself was still enqueued.
        assert!(server.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn rate_limit_rejects_with_retry_after() {
        let server = serve(2, Duration::from_secs(1)).await;
        let url: hyper::Uri = format!("{}/healthz", server.base).parse().unwrap();
        let mut codes = Vec::new();
        for _ in 0..4 {
            let res = Client::new().get(url.clone()).await.unwrap();
            if res.status() == StatusCode::TOO_MANY_REQUESTS {
                assert_eq!(
                    res.headers().get("retry-after").unwrap().to_str().unwrap(),
                    "1"
                );
            }
            codes.push(res.status());
        }
        assert_eq!(codes[0], StatusCode::OK);
        assert_eq!(codes[1], StatusCode::OK);
        assert_eq!(codes[2], StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(codes[3], StatusCode::TOO_MANY_REQUESTS);
    }
}
