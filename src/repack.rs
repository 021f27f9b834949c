//! Rebuilding geohash-keyed results from an upstream elevation reply.
//!
//! Geohash-mode callers asked about cells, not coordinates, so the reply
//! body is rewritten to one `{geohash, elevation}` record per input, in
//! input order. Repacking is best-effort: on any failure the upstream body
//! goes back unchanged.

use std::collections::HashMap;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::elevation::UpstreamResponse;
use crate::Result;

/// The shape the OpenTopoData-compatible service replies with.
#[derive(Debug, Deserialize)]
struct UpstreamBody {
    #[serde(default)]
    results: Vec<UpstreamResult>,
}

#[derive(Debug, Deserialize)]
struct UpstreamResult {
    #[serde(default)]
    elevation: Option<f64>,
    #[serde(default)]
    location: Option<UpstreamLocation>,
}

#[derive(Debug, Deserialize)]
struct UpstreamLocation {
    #[serde(default)]
    lat: f64,
    #[serde(default)]
    lng: f64,
}

/// One record of the rewritten body.
#[derive(Debug, PartialEq, Serialize)]
struct GeohashRecord {
    geohash: String,
    elevation: Option<f64>,
}

#[derive(Serialize)]
struct GeohashBody {
    results: Vec<GeohashRecord>,
}

/// Rewrite `resp`'s body to geohash-keyed records. `points` are the
/// decoded coordinates of `geohashes`, in the same order.
pub fn repack_geohash_results(
    resp: &mut UpstreamResponse,
    geohashes: &[String],
    points: &[(f64, f64)],
) {
    match repacked_body(&resp.body_b64, geohashes, points) {
        Ok(body) => {
            resp.body_b64 = STANDARD.encode(&body);
            resp.headers
                .insert("content-type".to_owned(), "application/json".to_owned());
        }
        Err(err) => {
            // Non-fatal: the caller still gets the raw upstream body.
            warn!("repack failed (geohash mode): {}", err);
        }
    }
}

fn repacked_body(
    body_b64: &str,
    geohashes: &[String],
    points: &[(f64, f64)],
) -> Result<Vec<u8>> {
    let raw = STANDARD
        .decode(body_b64)
        .context("upstream body is not valid base64")?;
    let upstream: UpstreamBody =
        serde_json::from_slice(&raw).context("upstream body is not valid JSON")?;

    let results = if upstream.results.len() == geohashes.len() {
        // Positional correspondence.
        geohashes
            .iter()
            .zip(&upstream.results)
            .map(|(gh, r)| GeohashRecord {
                geohash: gh.clone(),
                elevation: r.elevation,
            })
            .collect()
    } else {
        // Count mismatch: resolve each input through its coordinates.
        let by_coords: HashMap<String, Option<f64>> = upstream
            .results
            .iter()
            .filter_map(|r| {
                r.location
                    .as_ref()
                    .map(|loc| (coord_key(loc.lat, loc.lng), r.elevation))
            })
            .collect();
        geohashes
            .iter()
            .zip(points)
            .map(|(gh, &(lat, lng))| GeohashRecord {
                geohash: gh.clone(),
                elevation: by_coords.get(&coord_key(lat, lng)).copied().flatten(),
            })
            .collect()
    };

    Ok(serde_json::to_vec(&GeohashBody { results })?)
}

/// Six-decimal coordinate key, matching the upstream query format.
fn coord_key(lat: f64, lng: f64) -> String {
    format!("{:.6},{:.6}", lat, lng)
}
