//! Normalizing the `locations` / `geohashes` payload shapes.
//!
//! Peers and HTTP callers get a lot of latitude (sorry) in how they spell
//! a query: explicit `{lat, lng}` objects, `lat,lng` strings, geohash
//! tokens, arrays or `|`-separated strings. We sort that out once, at the
//! boundary, and hand the rest of the system typed values.

use anyhow::{format_err, Context};
use serde_json::Value;
use strum_macros::{Display, EnumString};

use crate::geohash;
use crate::Result;

/// Which shape did the caller use? Geohash-mode queries get their results
/// repacked to be keyed by the original geohashes.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum QueryMode {
    Geohash,
    Latlng,
}

/// A normalized query: decoded points, plus the original geohashes when the
/// caller spoke geohash.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedQuery {
    pub mode: QueryMode,
    pub points: Vec<(f64, f64)>,
    pub geohashes: Option<Vec<String>>,
}

/// Parse the `locations` / `geohashes` fields of a query payload.
///
/// Resolution order:
///
/// 1. A truthy `geohashes` (array or `|`-separated string) always wins.
/// 2. `locations` as an array of `{lat, lng}` objects.
/// 3. `locations` as an array of strings: all-geohash, or all `lat,lng`.
/// 4. `locations` as a `|`-separated string, classified the same way.
///
/// Mixed token sets are all-or-nothing: one comma anywhere and the whole
/// set must parse as `lat,lng` pairs.
pub fn parse_query(locations: &Value, geohashes: &Value) -> Result<ParsedQuery> {
    if is_truthy(geohashes) {
        let tokens = string_tokens(geohashes)?;
        return geohash_query(tokens);
    }

    if let Value::Array(items) = locations {
        match items.first() {
            Some(Value::Object(first)) if first.contains_key("lat") && first.contains_key("lng") => {
                let points = items
                    .iter()
                    .map(|item| {
                        let lat = number_field(item, "lat")?;
                        let lng = number_field(item, "lng")?;
                        Ok((lat, lng))
                    })
                    .collect::<Result<Vec<_>>>()?;
                return Ok(ParsedQuery {
                    mode: QueryMode::Latlng,
                    points,
                    geohashes: None,
                });
            }
            Some(Value::String(_)) => {
                let tokens = items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => Ok(s.trim().to_owned()),
                        other => Err(format_err!("locations[] mixes strings with {}", other)),
                    })
                    .collect::<Result<Vec<_>>>()?;
                let tokens =
                    tokens.into_iter().filter(|t| !t.is_empty()).collect::<Vec<_>>();
                return classify_tokens(tokens);
            }
            _ => {}
        }
    }

    if let Value::String(s) = locations {
        if !s.trim().is_empty() {
            let tokens = split_pipe(s);
            return classify_tokens(tokens);
        }
    }

    Err(format_err!("no locations/geohashes provided"))
}

/// Decide whether a set of tokens is geohashes or `lat,lng` pairs, and
/// parse accordingly.
fn classify_tokens(tokens: Vec<String>) -> Result<ParsedQuery> {
    if tokens.is_empty() {
        return Err(format_err!("no locations/geohashes provided"));
    }
    if tokens.iter().all(|t| geohash::looks_like_geohash_token(t)) {
        return geohash_query(tokens);
    }
    let points = tokens
        .iter()
        .map(|t| parse_latlng_pair(t))
        .collect::<Result<Vec<_>>>()?;
    Ok(ParsedQuery {
        mode: QueryMode::Latlng,
        points,
        geohashes: None,
    })
}

/// Build a geohash-mode query, decoding every token.
fn geohash_query(tokens: Vec<String>) -> Result<ParsedQuery> {
    if tokens.is_empty() {
        return Err(format_err!("no locations/geohashes provided"));
    }
    let points = tokens
        .iter()
        .map(|gh| geohash::decode(gh))
        .collect::<Result<Vec<_>>>()?;
    Ok(ParsedQuery {
        mode: QueryMode::Geohash,
        points,
        geohashes: Some(tokens),
    })
}

/// Parse one `lat,lng` token.
pub fn parse_latlng_pair(tok: &str) -> Result<(f64, f64)> {
    let (lat, lng) = tok
        .split_once(',')
        .ok_or_else(|| format_err!("locations[] token missing comma: {:?}", tok))?;
    let lat = lat
        .trim()
        .parse::<f64>()
        .with_context(|| format!("bad latitude in {:?}", tok))?;
    let lng = lng
        .trim()
        .parse::<f64>()
        .with_context(|| format!("bad longitude in {:?}", tok))?;
    Ok((lat, lng))
}

/// Split a `|`-separated string, discarding empty tokens.
fn split_pipe(s: &str) -> Vec<String> {
    s.split('|')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Extract a list of string tokens from an array or `|`-separated string.
fn string_tokens(v: &Value) -> Result<Vec<String>> {
    match v {
        Value::String(s) => Ok(split_pipe(s)),
        Value::Array(items) => Ok(items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.trim().to_owned(),
                other => other.to_string(),
            })
            .filter(|t| !t.is_empty())
            .collect()),
        other => Err(format_err!("expected a list or string, got {}", other)),
    }
}

/// Read a numeric field that may be spelled as a JSON number or a string.
fn number_field(item: &Value, key: &str) -> Result<f64> {
    let v = item
        .get(key)
        .ok_or_else(|| format_err!("locations[] entry missing {:?}", key))?;
    match v {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format_err!("bad {:?} value: {}", key, n)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .with_context(|| format!("bad {:?} value: {:?}", key, s)),
        other => Err(format_err!("bad {:?} value: {}", key, other)),
    }
}

/// JSON truthiness in the Python sense: `null`, `false`, `0`, `""`, `[]`
/// and `{}` are all falsy.
fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
