/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! Upstream connection setup: chain candidate iteration with direct
//! fallback, resolution, bounded dial on the server-worker runtime, TLS on
//! chained hops and on MITM sessions, CONNECT negotiation through HTTP
//! chain hops, and PROXY protocol emission.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;

use crate::config::{ProxyConfig, UpstreamTlsSession};
use crate::filter::HttpFilters;
use crate::http::{ClientRequest, RemoteResponse};
use crate::io::OnceBufReader;
use crate::proxy_proto::ProxyProtocolEncoder;
use crate::serve::FlowContext;
use crate::types::{Host, UpstreamAddr};

mod error;
pub use error::TcpConnectError;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CHAIN_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
const NEGOTIATION_RSP_HDR_MAX_SIZE: usize = 8192;

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}
pub(crate) type BoxAsyncStream = Box<dyn AsyncStream>;

/// One upstream proxy hop the chain manager may hand out.
#[allow(unused_variables)]
pub trait ChainedProxy: Send + Sync {
    /// Address of the chained proxy itself; no resolution happens for chain
    /// hops.
    fn address(&self) -> SocketAddr;

    /// Whether the hop to this proxy runs over TLS.
    fn requires_encryption(&self) -> bool {
        false
    }

    /// TLS client config for an encrypted hop. Required when
    /// `requires_encryption` returns true.
    fn tls_client_config(&self) -> Option<Arc<rustls::ClientConfig>> {
        None
    }

    /// Server name for certificate verification on an encrypted hop,
    /// defaults to the hop address.
    fn tls_server_name(&self) -> Option<String> {
        None
    }

    fn connection_succeeded(&self) {}

    fn connection_failed(&self, error: &TcpConnectError) {}

    fn disconnected(&self) {}
}

/// An entry in the fallback queue built by the [`ChainedProxyManager`].
#[derive(Clone)]
pub enum ChainCandidate {
    Proxy(Arc<dyn ChainedProxy>),
    /// Sentinel: dial the origin directly once the candidates before it are
    /// exhausted.
    Direct,
}

/// Supplies the ordered chain candidates for one request. An empty vec
/// means "direct only".
pub trait ChainedProxyManager: Send + Sync {
    fn lookup_chained_proxies(
        &self,
        req: &ClientRequest,
        ctx: &FlowContext,
    ) -> Vec<ChainCandidate>;
}

/// A connected (and possibly TLS-wrapped, possibly chain-negotiated)
/// upstream byte stream, before the HTTP layer is put on top.
pub(crate) struct EstablishedConnection {
    pub(crate) stream: BoxAsyncStream,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) local_addr: SocketAddr,
    pub(crate) chained: Option<Arc<dyn ChainedProxy>>,
    /// requests on this connection use absolute-form targets
    pub(crate) via_http_proxy: bool,
    pub(crate) tls_session: Option<UpstreamTlsSession>,
}

pub(crate) struct ConnectTask<'a> {
    config: &'a ProxyConfig,
    server_handle: tokio::runtime::Handle,
    flow: &'a FlowContext,
    upstream: &'a UpstreamAddr,
    /// CONNECT semantics: negotiate a tunnel through chain hops
    tunnel: bool,
    /// TLS toward the origin (MITM), applied after any chain negotiation
    origin_tls: Option<Arc<rustls::ClientConfig>>,
}

impl<'a> ConnectTask<'a> {
    pub(crate) fn new(
        config: &'a ProxyConfig,
        server_handle: tokio::runtime::Handle,
        flow: &'a FlowContext,
        upstream: &'a UpstreamAddr,
        tunnel: bool,
        origin_tls: Option<Arc<rustls::ClientConfig>>,
    ) -> Self {
        ConnectTask {
            config,
            server_handle,
            flow,
            upstream,
            tunnel,
            origin_tls,
        }
    }

    /// Walk the candidate queue until one connection succeeds.
    ///
    /// Every refused candidate gets exactly one `connection_failed` call and
    /// one `proxy_to_server_connection_failed` filter event; the winning one
    /// gets `connection_succeeded`.
    pub(crate) async fn setup(
        &self,
        req: &ClientRequest,
        filters: &mut dyn HttpFilters,
    ) -> Result<EstablishedConnection, TcpConnectError> {
        let mut queue = match &self.config.chained_proxy_manager {
            Some(manager) => manager.lookup_chained_proxies(req, self.flow),
            None => Vec::new(),
        };
        if queue.is_empty() {
            queue.push(ChainCandidate::Direct);
        }

        filters.proxy_to_server_connection_queued();

        let mut last_error = TcpConnectError::NoCandidateUsable;
        for candidate in queue {
            match self.try_candidate(&candidate, req, filters).await {
                Ok(c) => {
                    if let ChainCandidate::Proxy(p) = &candidate {
                        p.connection_succeeded();
                    }
                    return Ok(c);
                }
                Err(e) => {
                    debug!(
                        "conn {} upstream {} candidate failed: {e}",
                        self.flow.connection_id, self.upstream
                    );
                    if let ChainCandidate::Proxy(p) = &candidate {
                        p.connection_failed(&e);
                    }
                    filters.proxy_to_server_connection_failed();
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn try_candidate(
        &self,
        candidate: &ChainCandidate,
        req: &ClientRequest,
        filters: &mut dyn HttpFilters,
    ) -> Result<EstablishedConnection, TcpConnectError> {
        match candidate {
            ChainCandidate::Direct => self.connect_direct(filters).await,
            ChainCandidate::Proxy(p) => self.connect_chained(p.clone(), req, filters).await,
        }
    }

    async fn connect_direct(
        &self,
        filters: &mut dyn HttpFilters,
    ) -> Result<EstablishedConnection, TcpConnectError> {
        let peer_addr = match filters.proxy_to_server_resolution_started(self.upstream) {
            Some(addr) => addr,
            None => {
                let r = if let Host::Ip(ip) = self.upstream.host() {
                    Ok(SocketAddr::new(*ip, self.upstream.port()))
                } else {
                    self.config.resolver.resolve_upstream(self.upstream).await
                };
                match r {
                    Ok(addr) => {
                        filters.proxy_to_server_resolution_succeeded(self.upstream, addr);
                        addr
                    }
                    Err(e) => {
                        filters.proxy_to_server_resolution_failed(self.upstream);
                        return Err(TcpConnectError::ResolveFailed(e));
                    }
                }
            }
        };

        filters.proxy_to_server_connection_started();
        let stream = self.dial(peer_addr).await?;
        let local_addr = stream
            .local_addr()
            .map_err(TcpConnectError::SetupSocketFailed)?;

        let mut stream: BoxAsyncStream = Box::new(stream);
        if let Some(version) = self.config.send_proxy_protocol {
            let mut encoder = ProxyProtocolEncoder::new(version);
            let data = encoder
                .encode_tcp(self.flow.client_addr, peer_addr)
                .map_err(|_| TcpConnectError::InternalServerError("unencodable proxy addr"))?;
            stream
                .write_all(data)
                .await
                .map_err(TcpConnectError::ProxyProtocolWriteFailed)?;
        }

        let tls_session = match &self.origin_tls {
            Some(tls_config) => {
                filters.proxy_to_server_connection_ssl_handshake_started();
                let (wrapped, session) = self
                    .origin_tls_handshake(tls_config.clone(), stream)
                    .await?;
                stream = wrapped;
                Some(session)
            }
            None => None,
        };

        Ok(EstablishedConnection {
            stream,
            peer_addr,
            local_addr,
            chained: None,
            via_http_proxy: false,
            tls_session,
        })
    }

    async fn connect_chained(
        &self,
        chained: Arc<dyn ChainedProxy>,
        req: &ClientRequest,
        filters: &mut dyn HttpFilters,
    ) -> Result<EstablishedConnection, TcpConnectError> {
        let peer_addr = chained.address();
        filters.proxy_to_server_connection_started();
        let stream = self.dial(peer_addr).await?;
        let local_addr = stream
            .local_addr()
            .map_err(TcpConnectError::SetupSocketFailed)?;

        let mut stream: BoxAsyncStream = Box::new(stream);

        if chained.requires_encryption() {
            filters.proxy_to_server_connection_ssl_handshake_started();
            let tls_config = chained
                .tls_client_config()
                .ok_or(TcpConnectError::InternalServerError(
                    "encrypted chain hop without tls client config",
                ))?;
            let name = chained
                .tls_server_name()
                .unwrap_or_else(|| peer_addr.ip().to_string());
            stream = self.chain_tls_handshake(tls_config, name, stream).await?;
        }

        let mut via_http_proxy = true;
        if self.tunnel {
            // ask the chained proxy for a tunnel to the origin
            stream = self.negotiate_connect(stream, req).await?;
            via_http_proxy = false;
        }

        let tls_session = match &self.origin_tls {
            Some(tls_config) => {
                filters.proxy_to_server_connection_ssl_handshake_started();
                let (wrapped, session) = self
                    .origin_tls_handshake(tls_config.clone(), stream)
                    .await?;
                stream = wrapped;
                Some(session)
            }
            None => None,
        };

        Ok(EstablishedConnection {
            stream,
            peer_addr,
            local_addr,
            chained: Some(chained),
            via_http_proxy,
            tls_session,
        })
    }

    async fn dial(&self, peer: SocketAddr) -> Result<TcpStream, TcpConnectError> {
        let bind_ip = self.config.network_interface;
        let timeout = self.config.connect_timeout;
        let dial = self.server_handle.spawn(async move {
            let socket = match peer {
                SocketAddr::V4(_) => TcpSocket::new_v4(),
                SocketAddr::V6(_) => TcpSocket::new_v6(),
            }
            .map_err(TcpConnectError::SetupSocketFailed)?;
            if let Some(ip) = bind_ip {
                socket
                    .bind(SocketAddr::new(ip, 0))
                    .map_err(TcpConnectError::SetupSocketFailed)?;
            }
            match tokio::time::timeout(timeout, socket.connect(peer)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    Ok(stream)
                }
                Ok(Err(e)) => Err(TcpConnectError::ConnectFailed(e)),
                Err(_) => Err(TcpConnectError::TimeoutByRule),
            }
        });
        dial.await
            .map_err(|_| TcpConnectError::InternalServerError("dial task vanished"))?
    }

    async fn chain_tls_handshake(
        &self,
        tls_config: Arc<rustls::ClientConfig>,
        server_name: String,
        stream: BoxAsyncStream,
    ) -> Result<BoxAsyncStream, TcpConnectError> {
        let name = rustls_pki_types::ServerName::try_from(server_name)
            .map_err(|_| TcpConnectError::InternalServerError("invalid tls server name"))?;
        let connector = TlsConnector::from(tls_config);
        match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(name, stream)).await {
            Ok(Ok(tls_stream)) => Ok(Box::new(tls_stream)),
            Ok(Err(e)) => Err(TcpConnectError::TlsHandshakeFailed(e)),
            Err(_) => Err(TcpConnectError::TlsHandshakeTimeout),
        }
    }

    async fn origin_tls_handshake(
        &self,
        tls_config: Arc<rustls::ClientConfig>,
        stream: BoxAsyncStream,
    ) -> Result<(BoxAsyncStream, UpstreamTlsSession), TcpConnectError> {
        let name = match self.upstream.host() {
            Host::Ip(ip) => rustls_pki_types::ServerName::from(*ip),
            Host::Domain(domain) => rustls_pki_types::ServerName::try_from(domain.clone())
                .map_err(|_| TcpConnectError::InternalServerError("invalid tls server name"))?,
        };
        let connector = TlsConnector::from(tls_config);
        match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(name, stream)).await {
            Ok(Ok(tls_stream)) => {
                let peer_certificates = tls_stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .map(|certs| certs.to_vec())
                    .unwrap_or_default();
                let session = UpstreamTlsSession {
                    upstream: self.upstream.clone(),
                    peer_certificates,
                };
                Ok((Box::new(tls_stream), session))
            }
            Ok(Err(e)) => Err(TcpConnectError::TlsHandshakeFailed(e)),
            Err(_) => Err(TcpConnectError::TlsHandshakeTimeout),
        }
    }

    /// Send a CONNECT for the origin through the chained proxy and wait for
    /// its 2xx before treating the stream as a tunnel.
    async fn negotiate_connect(
        &self,
        mut stream: BoxAsyncStream,
        req: &ClientRequest,
    ) -> Result<BoxAsyncStream, TcpConnectError> {
        let head = format!(
            "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\nConnection: keep-alive\r\n\r\n",
            self.upstream
        );
        stream
            .write_all(head.as_bytes())
            .await
            .map_err(|e| TcpConnectError::NegotiationFailed(format!("write failed: {e}")))?;
        stream
            .flush()
            .await
            .map_err(|e| TcpConnectError::NegotiationFailed(format!("write failed: {e}")))?;

        let mut buf_stream = BufReader::new(stream);
        let rsp = match tokio::time::timeout(
            CHAIN_NEGOTIATION_TIMEOUT,
            RemoteResponse::parse(
                &mut buf_stream,
                &req.method,
                true,
                NEGOTIATION_RSP_HDR_MAX_SIZE,
            ),
        )
        .await
        {
            Ok(Ok(rsp)) => rsp,
            Ok(Err(e)) => {
                return Err(TcpConnectError::NegotiationFailed(format!(
                    "invalid response: {e}"
                )))
            }
            Err(_) => {
                return Err(TcpConnectError::NegotiationFailed(
                    "response timed out".to_string(),
                ))
            }
        };
        if rsp.code < 200 || rsp.code >= 300 {
            return Err(TcpConnectError::NegotiationRejected(rsp.code));
        }

        // any bytes the chained proxy already relayed stay with the stream
        let leftover = buf_stream.buffer().to_vec();
        let inner = buf_stream.into_inner();
        Ok(Box::new(OnceBufReader::new(inner, leftover)))
    }
}
