//! Client identity derivation.
//!
//! Rate limits key on the identity returned here, so the derivation must be
//! the same on every path that touches limiter state.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

/// Header set by intermediaries carrying the original client address chain.
const FORWARDED_FOR: &str = "x-forwarded-for";

/// Derive the client identity for a request.
///
/// The left-most `X-Forwarded-For` entry wins when it is a well-formed IP
/// address; a malformed or absent header falls back to the direct peer
/// address rather than rejecting the request.
pub fn client_identity(peer: SocketAddr, headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get(FORWARDED_FOR) {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return ip.to_string();
                }
            }
        }
    }
    peer.ip().to_string()
}
