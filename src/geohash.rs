//! Base-32 geohash decoding.
//!
//! Only decoding is needed: peers address cells by geohash, and the
//! upstream elevation service wants plain `lat,lng` pairs.

use anyhow::format_err;

use crate::Result;

/// The standard geohash alphabet. Note the missing `a`, `i`, `l` and `o`.
const ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Look up the 5-bit value of a single geohash character.
fn char_value(c: char) -> Option<u32> {
    if !c.is_ascii() {
        return None;
    }
    ALPHABET
        .iter()
        .position(|&a| a == c as u8)
        .map(|idx| idx as u32)
}

/// Decode a geohash to the `(lat, lng)` midpoint of its cell.
///
/// Each character contributes five bits (MSB first), alternating between
/// longitude and latitude bisections, starting with longitude.
pub fn decode(gh: &str) -> Result<(f64, f64)> {
    let mut even = true;
    let (mut lat_min, mut lat_max) = (-90.0_f64, 90.0_f64);
    let (mut lon_min, mut lon_max) = (-180.0_f64, 180.0_f64);
    for c in gh.trim().chars() {
        let val = char_value(c)
            .ok_or_else(|| format_err!("invalid geohash char: {:?}", c))?;
        for mask in [16, 8, 4, 2, 1] {
            if even {
                let mid = (lon_min + lon_max) / 2.0;
                if val & mask != 0 {
                    lon_min = mid;
                } else {
                    lon_max = mid;
                }
            } else {
                let mid = (lat_min + lat_max) / 2.0;
                if val & mask != 0 {
                    lat_min = mid;
                } else {
                    lat_max = mid;
                }
            }
            even = !even;
        }
    }
    Ok(((lat_min + lat_max) / 2.0, (lon_min + lon_max) / 2.0))
}

/// Does `tok` look like a geohash, as opposed to a `lat,lng` pair?
///
/// This is a classifier, not a validator: it lowercases its own copy, so an
/// uppercase geohash still "looks like" one (and will then fail in
/// [`decode`], which is strict).
pub fn looks_like_geohash_token(tok: &str) -> bool {
    let tok = tok.trim().to_lowercase();
    if tok.is_empty() || tok.contains(',') || tok.chars().any(char::is_whitespace) {
        return false;
    }
    tok.chars().all(|c| char_value(c).is_some())
}
