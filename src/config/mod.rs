/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! Immutable proxy configuration and its validating builder.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;

use crate::auth::ProxyAuthenticator;
use crate::connect::ChainedProxyManager;
use crate::filter::{HttpFiltersSource, NoopFiltersSource};
use crate::http::ClientRequest;
use crate::io::ThrottleRates;
use crate::proxy_proto::ProxyProtocolVersion;
use crate::resolve::{HostResolver, SystemHostResolver};
use crate::runtime::ServerGroup;
use crate::serve::Proxy;
use crate::tracker::ActivityTracker;
use crate::types::UpstreamAddr;

/// Source of TLS configs for an encrypted client-facing leg.
pub trait TlsEngineSource: Send + Sync {
    fn server_config(&self) -> anyhow::Result<Arc<rustls::ServerConfig>>;
}

/// What the proxy learned from its own TLS session to the origin, handed to
/// the MITM manager when it forges the client-facing session.
pub struct UpstreamTlsSession {
    pub upstream: UpstreamAddr,
    pub peer_certificates: Vec<rustls_pki_types::CertificateDer<'static>>,
}

/// Certificate authority for TLS interception.
///
/// `server_tls_config` drives the proxy's own session to the origin;
/// `client_tls_config_for` forges the client-facing session for the
/// intercepted host, typically by minting a leaf certificate on the fly.
pub trait MitmManager: Send + Sync {
    fn server_tls_config(&self, upstream: &UpstreamAddr)
        -> anyhow::Result<Arc<rustls::ClientConfig>>;

    fn client_tls_config_for(
        &self,
        request: &ClientRequest,
        server_session: &UpstreamTlsSession,
    ) -> anyhow::Result<Arc<rustls::ServerConfig>>;
}

/// Client-facing security posture. TLS termination and MITM interception
/// are mutually exclusive by construction.
#[derive(Clone, Default)]
pub enum ClientSideSecurity {
    #[default]
    Plain,
    Tls(Arc<dyn TlsEngineSource>),
    Mitm(Arc<dyn MitmManager>),
}

impl ClientSideSecurity {
    pub fn mitm_manager(&self) -> Option<&Arc<dyn MitmManager>> {
        match self {
            ClientSideSecurity::Mitm(m) => Some(m),
            _ => None,
        }
    }
}

/// Worker thread counts for the three runtimes of a [`ServerGroup`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadPoolConfig {
    pub acceptor_threads: usize,
    pub client_worker_threads: usize,
    pub server_worker_threads: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        ThreadPoolConfig {
            acceptor_threads: 2,
            client_worker_threads: 8,
            server_worker_threads: 8,
        }
    }
}

impl ThreadPoolConfig {
    pub fn single_threaded() -> Self {
        ThreadPoolConfig {
            acceptor_threads: 1,
            client_worker_threads: 1,
            server_worker_threads: 1,
        }
    }
}

const DEFAULT_IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(70);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(40);
const DEFAULT_MAX_INITIAL_LINE_LENGTH: usize = 8192;
const DEFAULT_MAX_HEADER_SIZE: usize = 16384;
const DEFAULT_MAX_CHUNK_SIZE: usize = 16384;

/// Validated, immutable per-proxy configuration.
#[derive(Clone)]
pub struct ProxyConfig {
    pub name: String,
    pub address: SocketAddr,
    pub allow_local_only: bool,
    pub client_security: ClientSideSecurity,
    pub authenticate_ssl_clients: bool,
    pub proxy_authenticator: Option<Arc<dyn ProxyAuthenticator>>,
    pub chained_proxy_manager: Option<Arc<dyn ChainedProxyManager>>,
    pub filters_source: Arc<dyn HttpFiltersSource>,
    pub resolver: Arc<dyn HostResolver>,
    pub transparent: bool,
    pub idle_connection_timeout: Duration,
    pub connect_timeout: Duration,
    pub throttle: ThrottleRates,
    pub network_interface: Option<IpAddr>,
    pub max_initial_line_length: usize,
    pub max_header_size: usize,
    pub max_chunk_size: usize,
    pub allow_requests_to_origin_server: bool,
    pub proxy_alias: String,
    pub accept_proxy_protocol: bool,
    pub send_proxy_protocol: Option<ProxyProtocolVersion>,
    pub thread_pool: ThreadPoolConfig,
    pub trackers: Vec<Arc<dyn ActivityTracker>>,
    pub task_logger: Option<slog::Logger>,
}

impl ProxyConfig {
    pub fn mitm_manager(&self) -> Option<&Arc<dyn MitmManager>> {
        self.client_security.mitm_manager()
    }

    pub fn with_port(&self, port: u16) -> ProxyConfig {
        let mut config = self.clone();
        config.address.set_port(port);
        config
    }
}

/// Builder for [`ProxyConfig`]. `start` binds the listen socket and brings
/// the proxy up on a [`ServerGroup`].
pub struct ProxyConfigBuilder {
    name: String,
    address: SocketAddr,
    allow_local_only: bool,
    tls_engine_source: Option<Arc<dyn TlsEngineSource>>,
    mitm_manager: Option<Arc<dyn MitmManager>>,
    authenticate_ssl_clients: bool,
    proxy_authenticator: Option<Arc<dyn ProxyAuthenticator>>,
    chained_proxy_manager: Option<Arc<dyn ChainedProxyManager>>,
    filters_source: Option<Arc<dyn HttpFiltersSource>>,
    resolver: Option<Arc<dyn HostResolver>>,
    transparent: bool,
    idle_connection_timeout: Duration,
    connect_timeout: Duration,
    throttle: ThrottleRates,
    network_interface: Option<IpAddr>,
    max_initial_line_length: usize,
    max_header_size: usize,
    max_chunk_size: usize,
    allow_requests_to_origin_server: bool,
    proxy_alias: Option<String>,
    accept_proxy_protocol: bool,
    send_proxy_protocol: Option<ProxyProtocolVersion>,
    thread_pool: ThreadPoolConfig,
    trackers: Vec<Arc<dyn ActivityTracker>>,
    task_logger: Option<slog::Logger>,
    server_group: Option<ServerGroup>,
}

impl Default for ProxyConfigBuilder {
    fn default() -> Self {
        ProxyConfigBuilder::new()
    }
}

impl ProxyConfigBuilder {
    pub fn new() -> Self {
        ProxyConfigBuilder {
            name: "interpose".to_string(),
            address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            allow_local_only: true,
            tls_engine_source: None,
            mitm_manager: None,
            authenticate_ssl_clients: true,
            proxy_authenticator: None,
            chained_proxy_manager: None,
            filters_source: None,
            resolver: None,
            transparent: false,
            idle_connection_timeout: DEFAULT_IDLE_CONNECTION_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            throttle: ThrottleRates::default(),
            network_interface: None,
            max_initial_line_length: DEFAULT_MAX_INITIAL_LINE_LENGTH,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            allow_requests_to_origin_server: false,
            proxy_alias: None,
            accept_proxy_protocol: false,
            send_proxy_protocol: None,
            thread_pool: ThreadPoolConfig::default(),
            trackers: Vec::new(),
            task_logger: None,
            server_group: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.address.set_port(port);
        self
    }

    pub fn with_allow_local_only(mut self, allow_local_only: bool) -> Self {
        self.allow_local_only = allow_local_only;
        self
    }

    pub fn with_tls_engine_source(mut self, source: Arc<dyn TlsEngineSource>) -> Self {
        self.tls_engine_source = Some(source);
        self
    }

    pub fn with_authenticate_ssl_clients(mut self, authenticate: bool) -> Self {
        self.authenticate_ssl_clients = authenticate;
        self
    }

    pub fn with_mitm_manager(mut self, manager: Arc<dyn MitmManager>) -> Self {
        self.mitm_manager = Some(manager);
        self
    }

    pub fn with_proxy_authenticator(mut self, authenticator: Arc<dyn ProxyAuthenticator>) -> Self {
        self.proxy_authenticator = Some(authenticator);
        self
    }

    pub fn with_chained_proxy_manager(mut self, manager: Arc<dyn ChainedProxyManager>) -> Self {
        self.chained_proxy_manager = Some(manager);
        self
    }

    pub fn with_filters_source(mut self, source: Arc<dyn HttpFiltersSource>) -> Self {
        self.filters_source = Some(source);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_transparent(mut self, transparent: bool) -> Self {
        self.transparent = transparent;
        self
    }

    pub fn with_idle_connection_timeout(mut self, timeout: Duration) -> Self {
        self.idle_connection_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_throttling(mut self, read_bytes_per_sec: u64, write_bytes_per_sec: u64) -> Self {
        self.throttle = ThrottleRates {
            read_bytes_per_sec,
            write_bytes_per_sec,
        };
        self
    }

    pub fn with_network_interface(mut self, source_ip: IpAddr) -> Self {
        self.network_interface = Some(source_ip);
        self
    }

    pub fn with_max_initial_line_length(mut self, len: usize) -> Self {
        self.max_initial_line_length = len;
        self
    }

    pub fn with_max_header_size(mut self, size: usize) -> Self {
        self.max_header_size = size;
        self
    }

    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    pub fn with_allow_requests_to_origin_server(mut self, allow: bool) -> Self {
        self.allow_requests_to_origin_server = allow;
        self
    }

    pub fn with_proxy_alias(mut self, alias: impl Into<String>) -> Self {
        self.proxy_alias = Some(alias.into());
        self
    }

    pub fn with_accept_proxy_protocol(mut self, accept: bool) -> Self {
        self.accept_proxy_protocol = accept;
        self
    }

    pub fn with_send_proxy_protocol(mut self, version: ProxyProtocolVersion) -> Self {
        self.send_proxy_protocol = Some(version);
        self
    }

    pub fn with_thread_pool(mut self, thread_pool: ThreadPoolConfig) -> Self {
        self.thread_pool = thread_pool;
        self
    }

    pub fn with_activity_tracker(mut self, tracker: Arc<dyn ActivityTracker>) -> Self {
        self.trackers.push(tracker);
        self
    }

    pub fn with_task_logger(mut self, logger: slog::Logger) -> Self {
        self.task_logger = Some(logger);
        self
    }

    pub fn with_server_group(mut self, group: ServerGroup) -> Self {
        self.server_group = Some(group);
        self
    }

    pub fn build(self) -> anyhow::Result<(ProxyConfig, Option<ServerGroup>)> {
        let client_security = match (self.tls_engine_source, self.mitm_manager) {
            (Some(_), Some(_)) => {
                return Err(anyhow!(
                    "tls engine source and mitm manager are mutually exclusive"
                ));
            }
            (Some(source), None) => ClientSideSecurity::Tls(source),
            (None, Some(manager)) => ClientSideSecurity::Mitm(manager),
            (None, None) => ClientSideSecurity::Plain,
        };

        if self.max_initial_line_length == 0 || self.max_header_size == 0 {
            return Err(anyhow!("http parser limits may not be zero"));
        }
        if self.thread_pool.acceptor_threads == 0
            || self.thread_pool.client_worker_threads == 0
            || self.thread_pool.server_worker_threads == 0
        {
            return Err(anyhow!("thread pool sizes may not be zero"));
        }

        let proxy_alias = self.proxy_alias.unwrap_or_else(|| self.name.clone());

        let config = ProxyConfig {
            name: self.name,
            address: self.address,
            allow_local_only: self.allow_local_only,
            client_security,
            authenticate_ssl_clients: self.authenticate_ssl_clients,
            proxy_authenticator: self.proxy_authenticator,
            chained_proxy_manager: self.chained_proxy_manager,
            filters_source: self
                .filters_source
                .unwrap_or_else(|| Arc::new(NoopFiltersSource)),
            resolver: self.resolver.unwrap_or_else(|| Arc::new(SystemHostResolver)),
            transparent: self.transparent,
            idle_connection_timeout: self.idle_connection_timeout,
            connect_timeout: self.connect_timeout,
            throttle: self.throttle,
            network_interface: self.network_interface,
            max_initial_line_length: self.max_initial_line_length,
            max_header_size: self.max_header_size,
            max_chunk_size: self.max_chunk_size,
            allow_requests_to_origin_server: self.allow_requests_to_origin_server,
            proxy_alias,
            accept_proxy_protocol: self.accept_proxy_protocol,
            send_proxy_protocol: self.send_proxy_protocol,
            thread_pool: self.thread_pool,
            trackers: self.trackers,
            task_logger: self.task_logger,
        };
        Ok((config, self.server_group))
    }

    /// Validate, bind and start serving.
    pub fn start(self) -> anyhow::Result<Proxy> {
        let (config, group) = self.build()?;
        let group = match group {
            Some(group) => group,
            None => ServerGroup::new(&config.name, config.thread_pool)?,
        };
        Proxy::start(Arc::new(config), group)
    }
}
