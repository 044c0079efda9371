//! Request metadata used to derive rate limit identifiers.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use http::{HeaderMap, Request};

/// Identifier used when no client address can be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Proxy headers consulted for the client address, in order.
pub const PROXY_HEADERS: [&str; 3] = ["x-forwarded-for", "x-real-ip", "cf-connecting-ip"];

/// The parts of a request an identifier strategy may look at.
#[derive(Debug, Clone, Copy)]
pub struct RequestMeta<'a> {
    path: &'a str,
    headers: &'a HeaderMap,
    peer: Option<IpAddr>,
    trust_proxy_headers: bool,
}

impl<'a> RequestMeta<'a> {
    pub fn new(path: &'a str, headers: &'a HeaderMap, peer: Option<IpAddr>) -> Self {
        Self {
            path,
            headers,
            peer,
            trust_proxy_headers: true,
        }
    }

    /// Read path, headers and the peer address recorded by axum's
    /// `ConnectInfo`, if the server was started with it.
    pub fn from_request<B>(request: &'a Request<B>) -> Self {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        Self::new(request.uri().path(), request.headers(), peer)
    }

    /// Ignore forwarding headers when the service is reachable directly.
    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    pub fn path(&self) -> &'a str {
        self.path
    }

    pub fn headers(&self) -> &'a HeaderMap {
        self.headers
    }

    /// A header value, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Best-effort client address.
    ///
    /// The first entry of `X-Forwarded-For`, then `X-Real-IP`, then
    /// `CF-Connecting-IP`, then the socket peer, else `"unknown"`.
    pub fn client_ip(&self) -> String {
        if self.trust_proxy_headers {
            for name in PROXY_HEADERS {
                let candidate = self
                    .header(name)
                    .and_then(|value| value.split(',').next())
                    .map(str::trim)
                    .filter(|value| !value.is_empty());
                if let Some(ip) = candidate {
                    return ip.to_string();
                }
            }
        }

        self.peer
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }
}
