/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use http::Uri;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamAddrParseError {
    #[error("empty host")]
    EmptyHost,
    #[error("invalid host")]
    InvalidHost,
    #[error("invalid port")]
    InvalidPort,
}

/// Either a raw IP address or a domain name still to be resolved.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Host {
    Ip(IpAddr),
    Domain(String),
}

impl Host {
    pub fn is_empty(&self) -> bool {
        match self {
            Host::Ip(_) => false,
            Host::Domain(domain) => domain.is_empty(),
        }
    }

    fn parse(s: &str) -> Result<Self, UpstreamAddrParseError> {
        if s.is_empty() {
            return Err(UpstreamAddrParseError::EmptyHost);
        }
        if let Some(stripped) = s.strip_prefix('[') {
            let inner = stripped
                .strip_suffix(']')
                .ok_or(UpstreamAddrParseError::InvalidHost)?;
            let ip6 = std::net::Ipv6Addr::from_str(inner)
                .map_err(|_| UpstreamAddrParseError::InvalidHost)?;
            return Ok(Host::Ip(IpAddr::V6(ip6)));
        }
        if let Ok(ip) = IpAddr::from_str(s) {
            return Ok(Host::Ip(ip));
        }
        if s.contains(|c: char| c.is_ascii_whitespace() || c == '/') {
            return Err(UpstreamAddrParseError::InvalidHost);
        }
        Ok(Host::Domain(s.to_ascii_lowercase()))
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Ip(IpAddr::V6(ip6)) => write!(f, "[{ip6}]"),
            Host::Ip(IpAddr::V4(ip4)) => write!(f, "{ip4}"),
            Host::Domain(domain) => f.write_str(domain),
        }
    }
}

/// The `host:port` pair a proxied request targets.
///
/// This is the key for upstream connection reuse and the authority form used
/// in CONNECT requests. The port may be 0 when parsed from a Host header that
/// carried no explicit port.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UpstreamAddr {
    host: Host,
    port: u16,
}

impl UpstreamAddr {
    pub fn new(host: Host, port: u16) -> Self {
        UpstreamAddr { host, port }
    }

    pub fn from_ip_and_port(ip: IpAddr, port: u16) -> Self {
        UpstreamAddr {
            host: Host::Ip(ip),
            port,
        }
    }

    #[inline]
    pub fn host(&self) -> &Host {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_default_port(&mut self, port: u16) {
        if self.port == 0 {
            self.port = port;
        }
    }

    pub fn host_str(&self) -> String {
        self.host.to_string()
    }

    pub fn host_eq(&self, other: &UpstreamAddr) -> bool {
        self.host == other.host
    }

    /// Build from the authority of a request URI, as seen in absolute-form
    /// and CONNECT request targets.
    pub fn from_uri_authority(uri: &Uri) -> Result<Self, UpstreamAddrParseError> {
        let authority = uri
            .authority()
            .ok_or(UpstreamAddrParseError::EmptyHost)?;
        let host = Host::parse(authority.host())?;
        let port = uri.port_u16().unwrap_or(0);
        Ok(UpstreamAddr { host, port })
    }
}

impl FromStr for UpstreamAddr {
    type Err = UpstreamAddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(UpstreamAddrParseError::EmptyHost);
        }
        if let Some(stripped) = s.strip_prefix('[') {
            // ipv6 with optional port
            return match stripped.find(']') {
                Some(p) => {
                    let host = Host::parse(&s[0..p + 2])?;
                    let port = match s[p + 2..].strip_prefix(':') {
                        Some(port_s) => u16::from_str(port_s)
                            .map_err(|_| UpstreamAddrParseError::InvalidPort)?,
                        None if s.len() == p + 2 => 0,
                        None => return Err(UpstreamAddrParseError::InvalidHost),
                    };
                    Ok(UpstreamAddr { host, port })
                }
                None => Err(UpstreamAddrParseError::InvalidHost),
            };
        }
        match s.rfind(':') {
            Some(p) if s[..p].contains(':') => {
                // bare ipv6 without port
                let host = Host::parse(s)?;
                Ok(UpstreamAddr { host, port: 0 })
            }
            Some(p) => {
                let host = Host::parse(&s[..p])?;
                let port =
                    u16::from_str(&s[p + 1..]).map_err(|_| UpstreamAddrParseError::InvalidPort)?;
                Ok(UpstreamAddr { host, port })
            }
            None => {
                let host = Host::parse(s)?;
                Ok(UpstreamAddr { host, port: 0 })
            }
        }
    }
}

impl fmt::Display for UpstreamAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 0 {
            write!(f, "{}", self.host)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for UpstreamAddr {
    fn from(addr: SocketAddr) -> Self {
        UpstreamAddr {
            host: Host::Ip(addr.ip()),
            port: addr.port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_domain_with_port() {
        let addr = UpstreamAddr::from_str("www.example.com:8080").unwrap();
        assert_eq!(addr.host(), &Host::Domain("www.example.com".to_string()));
        assert_eq!(addr.port(), 8080);
        assert_eq!(addr.to_string(), "www.example.com:8080");
    }

    #[test]
    fn parse_domain_no_port() {
        let mut addr = UpstreamAddr::from_str("Example.COM").unwrap();
        assert_eq!(addr.port(), 0);
        addr.set_default_port(80);
        assert_eq!(addr.to_string(), "example.com:80");
    }

    #[test]
    fn parse_ipv6_with_port() {
        let addr = UpstreamAddr::from_str("[2001:db8::1]:443").unwrap();
        assert_eq!(addr.port(), 443);
        assert_eq!(addr.to_string(), "[2001:db8::1]:443");
    }

    #[test]
    fn parse_ipv4_with_port() {
        let addr = UpstreamAddr::from_str("192.0.2.7:80").unwrap();
        assert_eq!(addr.host(), &Host::Ip("192.0.2.7".parse().unwrap()));
        assert_eq!(addr.port(), 80);
    }

    #[test]
    fn reject_invalid() {
        assert!(UpstreamAddr::from_str("").is_err());
        assert!(UpstreamAddr::from_str("host:badport").is_err());
        assert!(UpstreamAddr::from_str("[2001:db8::1").is_err());
    }
}
