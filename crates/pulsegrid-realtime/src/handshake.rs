//! Connection handshake metadata and fingerprinting

use axum::http::{HeaderMap, header};
use sha2::{Digest, Sha256};
use std::net::{IpAddr, SocketAddr};

/// Header carrying the token as a dedicated auth field
pub const AUTH_TOKEN_HEADER: &str = "x-auth-token";

/// What the gate sees of an incoming connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    pub ip: String,
    pub user_agent: Option<String>,
    pub accept: Option<String>,
    pub accept_language: Option<String>,
    pub accept_encoding: Option<String>,
    /// `Sec-WebSocket-Version`
    pub protocol_version: Option<String>,
    /// `x-auth-token` header
    pub auth_token: Option<String>,
    /// `token` query parameter
    pub query_token: Option<String>,
    /// `Authorization: Bearer` header
    pub bearer_token: Option<String>,
}

fn header_str(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Client IP for rate limiting and bans.
///
/// `X-Forwarded-For` (first entry) and `X-Real-IP` are only read when the
/// socket peer is one of `trusted_proxies`; any other peer is taken at its
/// socket address.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_proxies: &[IpAddr],
) -> String {
    let Some(peer) = peer else {
        return "unknown".to_string();
    };
    if !trusted_proxies.contains(&peer.ip()) {
        return peer.ip().to_string();
    }
    if let Some(forwarded_for) = header_str(headers, "x-forwarded-for") {
        let first = forwarded_for.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        return real_ip;
    }
    peer.ip().to_string()
}

/// Token from an `Authorization: Bearer` header
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = header_str(headers, header::AUTHORIZATION)?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim().to_string())
    } else {
        None
    }
}

impl Handshake {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            ..Self::default()
        }
    }

    /// Build from upgrade request headers, the `token` query parameter and the peer address
    pub fn from_request(
        headers: &HeaderMap,
        query_token: Option<String>,
        peer: Option<SocketAddr>,
        trusted_proxies: &[IpAddr],
    ) -> Self {
        Self {
            ip: client_ip(headers, peer, trusted_proxies),
            user_agent: header_str(headers, header::USER_AGENT),
            accept: header_str(headers, header::ACCEPT),
            accept_language: header_str(headers, header::ACCEPT_LANGUAGE),
            accept_encoding: header_str(headers, header::ACCEPT_ENCODING),
            protocol_version: header_str(headers, header::SEC_WEBSOCKET_VERSION),
            auth_token: header_str(headers, AUTH_TOKEN_HEADER),
            query_token: query_token.filter(|t| !t.is_empty()),
            bearer_token: bearer_token(headers),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_query_token(mut self, token: impl Into<String>) -> Self {
        self.query_token = Some(token.into());
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Auth field, then query parameter, then bearer header
    pub fn token(&self) -> Option<&str> {
        self.auth_token
            .as_deref()
            .or(self.query_token.as_deref())
            .or(self.bearer_token.as_deref())
    }

    /// SHA-256 over address, user agent, accept headers and protocol version
    pub fn fingerprint(&self) -> String {
        let parts = [
            self.ip.as_str(),
            self.user_agent.as_deref().unwrap_or(""),
            self.accept.as_deref().unwrap_or(""),
            self.accept_language.as_deref().unwrap_or(""),
            self.accept_encoding.as_deref().unwrap_or(""),
            self.protocol_version.as_deref().unwrap_or(""),
        ];
        let mut hasher = Sha256::new();
        hasher.update(parts.join("|").as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_token_precedence() {
        let all = Handshake::new("1.1.1.1")
            .with_bearer_token("bearer")
            .with_query_token("query")
            .with_auth_token("field");
        assert_eq!(all.token(), Some("field"));

        let no_field = Handshake::new("1.1.1.1")
            .with_bearer_token("bearer")
            .with_query_token("query");
        assert_eq!(no_field.token(), Some("query"));

        let bearer_only = Handshake::new("1.1.1.1").with_bearer_token("bearer");
        assert_eq!(bearer_only.token(), Some("bearer"));

        assert_eq!(Handshake::new("1.1.1.1").token(), None);
    }

    #[test]
    fn test_from_request_reads_headers() {
        let map = headers(&[
            ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
            ("user-agent", "test-client/1.0"),
            ("authorization", "Bearer abc.def.ghi"),
            ("sec-websocket-version", "13"),
        ]);
        let proxy: SocketAddr = "10.0.0.1:443".parse().unwrap();
        let hs = Handshake::from_request(&map, Some(String::new()), Some(proxy), &[proxy.ip()]);
        assert_eq!(hs.ip, "203.0.113.7");
        assert_eq!(hs.user_agent.as_deref(), Some("test-client/1.0"));
        assert_eq!(hs.protocol_version.as_deref(), Some("13"));
        assert_eq!(hs.query_token, None);
        assert_eq!(hs.token(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_forwarding_headers_ignored_from_untrusted_peer() {
        let peer: SocketAddr = "192.0.2.10:5555".parse().unwrap();
        let forged = headers(&[
            ("x-forwarded-for", "203.0.113.7"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        assert_eq!(client_ip(&forged, Some(peer), &[]), "192.0.2.10");

        let other_proxy: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(client_ip(&forged, Some(peer), &[other_proxy]), "192.0.2.10");
        assert_eq!(client_ip(&forged, None, &[other_proxy]), "unknown");
    }

    #[test]
    fn test_client_ip_fallbacks() {
        let proxy: SocketAddr = "192.0.2.10:5555".parse().unwrap();
        let trusted = [proxy.ip()];
        assert_eq!(
            client_ip(&headers(&[("x-real-ip", "198.51.100.2")]), Some(proxy), &trusted),
            "198.51.100.2"
        );
        assert_eq!(
            client_ip(&headers(&[("x-forwarded-for", " , ")]), Some(proxy), &trusted),
            "192.0.2.10"
        );
        assert_eq!(client_ip(&HeaderMap::new(), Some(proxy), &trusted), "192.0.2.10");
        assert_eq!(client_ip(&HeaderMap::new(), None, &trusted), "unknown");
    }

    #[test]
    fn test_bearer_requires_scheme() {
        assert_eq!(
            bearer_token(&headers(&[("authorization", "bearer tok")])),
            Some("tok".to_string())
        );
        assert_eq!(bearer_token(&headers(&[("authorization", "Basic dXNlcg==")])), None);
        assert_eq!(bearer_token(&headers(&[("authorization", "Bearer ")])), None);
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = Handshake::new("10.0.0.1").with_user_agent("ua");
        let b = Handshake::new("10.0.0.1").with_user_agent("ua");
        let c = Handshake::new("10.0.0.1").with_user_agent("other");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_fingerprint_ignores_token() {
        let a = Handshake::new("10.0.0.1").with_auth_token("one");
        let b = Handshake::new("10.0.0.1").with_auth_token("two");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
