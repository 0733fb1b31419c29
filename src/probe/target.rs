//! Target address parsing.

use http::uri::{Scheme, Uri};
use std::net::{IpAddr, Ipv6Addr};

use super::ProbeError;

/// A parsed probe target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host without IPv6 brackets.
    pub host: String,
    pub port: u16,
    pub secure: bool,
    /// Request path and query, always starting with `/`.
    pub path: String,
}

impl Endpoint {
    /// Parse a URL or bare `host[:port]`.
    ///
    /// Without a scheme the target is plain HTTP unless the port is 443.
    /// A bare IPv6 literal such as `::1` needs no brackets.
    pub fn parse(address: &str) -> Result<Self, ProbeError> {
        let address = address.trim();
        let has_scheme = address.contains("://");
        let url = if has_scheme {
            address.to_string()
        } else if address.parse::<Ipv6Addr>().is_ok() {
            format!("http://[{}]", address)
        } else {
            format!("http://{}", address)
        };

        let uri: Uri = url
            .parse()
            .map_err(|e| ProbeError::Connect(format!("malformed target {:?}: {}", address, e)))?;

        let secure = match uri.scheme() {
            Some(s) if *s == Scheme::HTTPS => true,
            Some(s) if *s == Scheme::HTTP => false,
            Some(s) => {
                return Err(ProbeError::Connect(format!("unsupported scheme {:?}", s.as_str())))
            }
            None => false,
        };

        let host = uri
            .host()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProbeError::Connect(format!("missing host in {:?}", address)))?
            .to_string();

        let port = uri.port_u16();
        let secure = secure || (!has_scheme && port == Some(443));
        let port = port.unwrap_or(if secure { 443 } else { 80 });

        let path = uri
            .path_and_query()
            .map(|p| p.as_str())
            .filter(|p| p.starts_with('/'))
            .unwrap_or("/")
            .to_string();

        Ok(Self { host, port, secure, path })
    }

    /// Whether the host is an IP literal, in which case no DNS lookup happens.
    pub fn is_ip_addr(&self) -> bool {
        is_ip_addr(&self.host)
    }

    /// Value for the HTTP `Host` header.
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

pub fn is_ip_addr(host: &str) -> bool {
    host.parse::<IpAddr>().is_ok()
}
