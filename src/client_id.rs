//! Caller identification from proxy headers or the socket peer.

use http::header::HeaderName;
use http::{Extensions, HeaderMap};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// `X-Forwarded-For`.
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Identifier used when neither a forwarding header nor a peer address is known.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// How much to trust `X-Forwarded-For`.
///
/// Any client can send the header, so `TrustFirstHop` is only sound when every
/// request arrives through a proxy that overwrites it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForwardedHeaders {
    /// Use the first address listed in `X-Forwarded-For`.
    #[default]
    TrustFirstHop,
    /// Ignore the header and use the socket peer.
    Ignore,
}

/// Peer address of the connection, inserted into request extensions by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Peer address from a [`PeerAddr`] or bare `SocketAddr` extension.
pub fn peer_addr(extensions: &Extensions) -> Option<SocketAddr> {
    extensions
        .get::<PeerAddr>()
        .map(|peer| peer.0)
        .or_else(|| extensions.get::<SocketAddr>().copied())
}

/// Derive a stable identifier for the caller. Never fails.
///
/// Order: first `X-Forwarded-For` hop (when trusted), then the peer IP, then
/// [`UNKNOWN_CLIENT`].
pub fn resolve_client_id(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    forwarded: ForwardedHeaders,
) -> String {
    if forwarded == ForwardedHeaders::TrustFirstHop {
        let first_hop = headers
            .get(&X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());
        if let Some(hop) = first_hop {
            return hop.to_string();
        }
    }
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => UNKNOWN_CLIENT.to_string(),
    }
}
