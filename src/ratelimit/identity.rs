//! Client identity resolution.
//!
//! Proxies and CDNs rewrite the transport address, so application headers
//! are consulted first in a fixed trust order.

use std::fmt;

use axum::http::HeaderMap;

/// Single client IP injected by Cloudflare.
pub const CF_CONNECTING_IP: &str = "cf-connecting-ip";
/// Single client IP set by a reverse proxy.
pub const X_REAL_IP: &str = "x-real-ip";
/// Comma-separated proxy chain, client first.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Identity used when nothing at all is known about the peer.
const UNKNOWN_IDENTITY: &str = "unknown";

/// The key that partitions rate-limit state per requester.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Wrap a raw identity. Blank input becomes `"unknown"`.
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.trim().is_empty() {
            Self(UNKNOWN_IDENTITY.to_string())
        } else {
            Self(raw)
        }
    }

    /// Borrow the identity as a registry key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClientIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Resolve the identity of a request. Never fails.
///
/// Order: `CF-Connecting-IP`, `X-Real-IP`, first hop of `X-Forwarded-For`,
/// then the remote address without its port (or verbatim if it has none).
pub fn resolve(headers: &HeaderMap, remote_addr: Option<&str>) -> ClientIdentity {
    if let Some(ip) = header_value(headers, CF_CONNECTING_IP) {
        return ClientIdentity::new(ip);
    }

    if let Some(ip) = header_value(headers, X_REAL_IP) {
        return ClientIdentity::new(ip);
    }

    if let Some(chain) = header_value(headers, X_FORWARDED_FOR) {
        let first = chain.split(',').next().unwrap_or(chain).trim();
        if !first.is_empty() {
            return ClientIdentity::new(first);
        }
    }

    match remote_addr {
        Some(addr) => ClientIdentity::new(strip_port(addr).unwrap_or(addr)),
        None => ClientIdentity::new(UNKNOWN_IDENTITY),
    }
}

/// Split the host out of a `host:port` pair.
///
/// The port is not validated, only located. Returns `None` when the address
/// has no port separator or is an unbracketed IPv6 address.
pub fn strip_port(addr: &str) -> Option<&str> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        return (!port.contains(':')).then_some(host);
    }

    let (host, _port) = addr.rsplit_once(':')?;
    // A bare IPv6 address has colons but no port.
    if host.contains(':') {
        return None;
    }
    Some(host)
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
