/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;

use crate::types::{Host, UpstreamAddr};

/// Narrow resolution seam. Alternate backends (DNSSEC validators, caches)
/// plug in here; the engine only ever asks for one usable address.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr>;

    async fn resolve_upstream(&self, upstream: &UpstreamAddr) -> io::Result<SocketAddr> {
        match upstream.host() {
            Host::Ip(ip) => Ok(SocketAddr::new(*ip, upstream.port())),
            Host::Domain(domain) => self.resolve(domain, upstream.port()).await,
        }
    }
}

/// Resolver backed by the platform resolver, running on the runtime's
/// blocking pool.
#[derive(Default)]
pub struct SystemHostResolver;

#[async_trait]
impl HostResolver for SystemHostResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        let mut last_v6 = None;
        let addrs = tokio::net::lookup_host((host, port)).await?;
        for addr in addrs {
            match addr {
                SocketAddr::V4(_) => return Ok(addr),
                SocketAddr::V6(_) => {
                    if last_v6.is_none() {
                        last_v6 = Some(addr);
                    }
                }
            }
        }
        last_v6.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address resolved for host {host}"),
            )
        })
    }
}

/// Fixed host table, mostly useful in tests and for pinning.
#[derive(Default)]
pub struct StaticHostResolver {
    hosts: HashMap<String, IpAddr>,
}

impl StaticHostResolver {
    pub fn new() -> Self {
        StaticHostResolver {
            hosts: HashMap::new(),
        }
    }

    pub fn insert(&mut self, host: impl Into<String>, ip: IpAddr) {
        self.hosts.insert(host.into(), ip);
    }
}

#[async_trait]
impl HostResolver for StaticHostResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        self.hosts
            .get(host)
            .map(|ip| SocketAddr::new(*ip, port))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("host {host} is not in the static table"),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn static_table() {
        let mut resolver = StaticHostResolver::new();
        resolver.insert("origin.test", IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));

        let addr = resolver.resolve("origin.test", 8080).await.unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 8080)));

        assert!(resolver.resolve("other.test", 80).await.is_err());
    }

    #[tokio::test]
    async fn upstream_with_raw_ip_skips_lookup() {
        let resolver = StaticHostResolver::new();
        let upstream = UpstreamAddr::from_ip_and_port("127.0.0.1".parse().unwrap(), 80);
        let addr = resolver.resolve_upstream(&upstream).await.unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 80)));
    }
}
