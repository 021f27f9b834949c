//! Interface to the local OpenTopoData-compatible elevation service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::stream::StreamExt;
use hyper::{client::HttpConnector, Body, Client, Request};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tokio::sync::Semaphore;
use tracing::debug;
use url::Url;

use crate::wire::json_content_type;
use crate::Result;

/// A `hyper` client shared between workers, with keep-alive.
pub type SharedHttpClient = Arc<Client<HttpsConnector<HttpConnector>>>;

pub fn shared_http_client(concurrency: usize) -> SharedHttpClient {
    Arc::new(
        Client::builder().pool_max_idle_per_host(concurrency).build(
            HttpsConnectorBuilder::new()
                .with_native_roots()
                // The elevation backend is typically plain-HTTP localhost.
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .build(),
        ),
    )
}

/// Percent-encoding for the `locations` query value: `|` and `,` stay
/// literal, as the upstream service expects.
const LOCATIONS_QUERY: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'`');

/// What came back from (or stands in for) the elevation service. This is
/// the `status`/`headers`/`body_b64`/`duration_ms` block that reply
/// envelopes are built from.
#[derive(Clone, Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body_b64: String,
    pub duration_ms: u64,
}

impl UpstreamResponse {
    /// The synthetic `502` used for every transport-level failure. The
    /// upstream client never returns an error; it returns this.
    pub fn failure(cause: impl std::fmt::Display) -> UpstreamResponse {
        let body = serde_json::json!({
            "error": format!("upstream failure: {}", cause)
        })
        .to_string();
        UpstreamResponse {
            status: 502,
            headers: json_content_type(),
            body_b64: STANDARD.encode(body.as_bytes()),
            duration_ms: 0,
        }
    }
}

/// Where elevation lookups go. The HTTP implementation below is the real
/// one; tests substitute canned sources.
#[async_trait]
pub trait ElevationSource: Send + Sync + 'static {
    /// Resolve elevations for `points` against `dataset`. Infallible by
    /// contract: failures come back as a synthetic `502` response.
    async fn lookup(&self, dataset: &str, points: &[(f64, f64)]) -> UpstreamResponse;
}

/// The real client: `GET {base}/v1/{dataset}?locations=lat,lng|…`.
pub struct HttpElevationSource {
    base: String,
    client: SharedHttpClient,
    timeout: Duration,
    /// Gates concurrent upstream calls.
    gate: Arc<Semaphore>,
}

impl HttpElevationSource {
    pub fn new(base: &str, timeout_ms: u64, concurrency: usize) -> HttpElevationSource {
        HttpElevationSource {
            base: base.trim_end_matches('/').to_owned(),
            client: shared_http_client(concurrency),
            timeout: Duration::from_millis(timeout_ms),
            gate: Arc::new(Semaphore::new(concurrency)),
        }
    }

    fn request_url(&self, dataset: &str, points: &[(f64, f64)]) -> Result<Url> {
        let locations = format_locations(points);
        let encoded = utf8_percent_encode(&locations, LOCATIONS_QUERY);
        let url = format!("{}/v1/{}?locations={}", self.base, dataset, encoded);
        Ok(Url::parse(&url)?)
    }
}

#[async_trait]
impl ElevationSource for HttpElevationSource {
    async fn lookup(&self, dataset: &str, points: &[(f64, f64)]) -> UpstreamResponse {
        let _permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(_) => return UpstreamResponse::failure("concurrency gate closed"),
        };

        let url = match self.request_url(dataset, points) {
            Ok(url) => url,
            Err(err) => return UpstreamResponse::failure(err),
        };
        debug!(url = %url, "querying elevation service");

        let start = Instant::now();
        let fetch = async {
            let req = Request::builder()
                .method("GET")
                .uri(url.as_str())
                .body(Body::empty())?;
            let res = self.client.request(req).await?;
            let status = res.status().as_u16();
            let headers = res
                .headers()
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_owned(),
                        String::from_utf8_lossy(v.as_bytes()).into_owned(),
                    )
                })
                .collect::<HashMap<_, _>>();
            let mut body = res.into_body();
            let mut body_data = vec![];
            while let Some(chunk_result) = body.next().await {
                let chunk = chunk_result?;
                body_data.extend(&chunk[..]);
            }
            Ok::<_, anyhow::Error>((status, headers, body_data))
        };

        match tokio::time::timeout(self.timeout, fetch).await {
            Ok(Ok((status, headers, body))) => UpstreamResponse {
                status,
                headers,
                body_b64: STANDARD.encode(&body),
                duration_ms: start.elapsed().as_millis() as u64,
            },
            Ok(Err(err)) => UpstreamResponse::failure(err),
            Err(_) => UpstreamResponse::failure(format!(
                "timed out after {}ms",
                self.timeout.as_millis()
            )),
        }
    }
}

/// Join points as six-decimal `lat,lng` pairs separated by `|`.
pub fn format_locations(points: &[(f64, f64)]) -> String {
    points
        .iter()
        .map(|(lat, lng)| format!("{:.6},{:.6}", lat, lng))
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode_body_b64;
    use serde_json::Value;

    #[test]
    fn locations_use_six_decimals() {
        assert_eq!(
            format_locations(&[(37.775, -122.419), (0.0, 0.0)]),
            "37.775000,-122.419000|0.000000,0.000000"
        );
    }

    #[test]
    fn url_preserves_pipe_and_comma() {
        let source = HttpElevationSource::new("http://localhost:5000/", 1000, 2);
        let url = source
            .request_url("mapzen", &[(1.0, 2.0), (3.0, 4.0)])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:5000/v1/mapzen?locations=1.000000,2.000000|3.000000,4.000000"
        );
    }

    #[tokio::test]
    async fn unreachable_upstream_becomes_synthetic_502() {
        // Nothing listens on this port of the discard prefix.
        let source = HttpElevationSource::new("http://127.0.0.1:9", 2000, 1);
        let resp = source.lookup("mapzen", &[(0.0, 0.0)]).await;
        assert_eq!(resp.status, 502);
        assert_eq!(resp.duration_ms, 0);
        let body: Value = serde_json::from_slice(&decode_body_b64(&resp.body_b64)).unwrap();
        let error = body["error"].as_str().unwrap();
        assert!(error.starts_with("upstream failure: "), "got: {}", error);
    }

    #[tokio::test]
    async fn upstream_status_and_body_pass_through() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            let body = r#"{"results":[{"elevation":10.0,"location":{"lat":0.0,"lng":0.0}}]}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        let source = HttpElevationSource::new(&format!("http://{}", addr), 5000, 1);
        let resp = source.lookup("mapzen", &[(0.0, 0.0)]).await;
        server.await.unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(
            resp.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        let body: Value = serde_json::from_slice(&decode_body_b64(&resp.body_b64)).unwrap();
        assert_eq!(body["results"][0]["elevation"], 10.0);
    }
}
