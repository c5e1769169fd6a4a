//! Client address resolution behind reverse proxies.
//!
//! Forwarding headers are only believed when the direct peer is a trusted
//! proxy.

use std::net::IpAddr;

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use ipnet::IpNet;

use crate::config::contains_ip;
use crate::error::AppError;

/// Resolved client address, inserted into request extensions by the guard
/// middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .copied()
            .ok_or_else(|| AppError::Internal("client address not resolved".to_owned()))
    }
}

/// Determine the real client address for a request from `peer`.
///
/// When `peer` is trusted, `X-Forwarded-For` is walked right to left and
/// the first hop that is not itself a trusted proxy wins. If every hop is
/// trusted the leftmost one is used. `X-Real-IP` is the fallback when the
/// forwarded chain is missing or unparsable.
#[must_use]
pub fn resolve_client_ip(peer: IpAddr, headers: &HeaderMap, trusted: &[IpNet]) -> IpAddr {
    if !contains_ip(trusted, peer) {
        return peer;
    }

    if let Some(chain) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        let hops: Option<Vec<IpAddr>> = chain
            .split(',')
            .map(|hop| hop.trim().parse::<IpAddr>().ok())
            .collect();
        if let Some(hops) = hops.filter(|h| !h.is_empty()) {
            let untrusted = hops.iter().rev().find(|ip| !contains_ip(trusted, **ip));
            if let Some(ip) = untrusted.or_else(|| hops.first()) {
                return *ip;
            }
        }
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(peer)
}
