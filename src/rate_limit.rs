//! Per-client-IP admission control.
//!
//! A keyed GCRA limiter: burst `B` requests up front, refilling at `R`
//! requests per second per client. Clients are keyed by the first
//! `X-Forwarded-For` entry when a proxy supplies one, else the socket peer.
//! The key table grows with distinct clients and is never pruned, which is
//! fine for the LAN-scale deployments this runs in.

use std::net::SocketAddr;
use std::num::NonZeroU32;

use axum::http::HeaderMap;
use governor::{DefaultKeyedRateLimiter, Quota};

/// Keyed rate limiter shared by every HTTP request.
pub struct RateGuard {
    limiter: DefaultKeyedRateLimiter<String>,
}

impl RateGuard {
    /// Build a guard admitting `burst` requests immediately and `rps`
    /// per second thereafter, per client.
    pub fn new(rps: NonZeroU32, burst: NonZeroU32) -> RateGuard {
        let quota = Quota::per_second(rps).allow_burst(burst);
        RateGuard {
            limiter: DefaultKeyedRateLimiter::keyed(quota),
        }
    }

    /// Admit or reject one request from `client`.
    pub fn check(&self, client: &str) -> bool {
        self.limiter.check_key(&client.to_owned()).is_ok()
    }
}

/// Pick the client key for rate limiting: first `X-Forwarded-For` token if
/// present and non-empty, else the peer address.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| peer.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn nz(v: u32) -> NonZeroU32 {
        NonZeroU32::new(v).unwrap()
    }

    #[test]
    fn burst_admits_then_rejects() {
        let guard = RateGuard::new(nz(2), nz(3));
        let mut admitted = 0;
        for _ in 0..10 {
            if guard.check("10.0.0.1") {
                admitted += 1;
            }
        }
        // Ten back-to-back requests: the burst of three is admitted and
        // nothing refills within microseconds.
        assert_eq!(admitted, 3);
    }

    #[test]
    fn clients_are_limited_independently() {
        let guard = RateGuard::new(nz(1), nz(1));
        assert!(guard.check("10.0.0.1"));
        assert!(!guard.check("10.0.0.1"));
        assert!(guard.check("10.0.0.2"));
    }

    #[test]
    fn forwarded_header_wins_over_peer() {
        let peer: SocketAddr = "192.168.1.5:1234".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, peer), "203.0.113.9");
    }

    #[test]
    fn empty_forwarded_header_falls_back_to_peer() {
        let peer: SocketAddr = "192.168.1.5:1234".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("  "));
        assert_eq!(client_ip(&headers, peer), "192.168.1.5");
        assert_eq!(client_ip(&HeaderMap::new(), peer), "192.168.1.5");
    }
}
