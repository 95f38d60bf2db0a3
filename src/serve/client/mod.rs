/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! The client-to-proxy connection driver: parses requests off the client
//! leg, applies the authentication gate and the filter chain, and hands off
//! to the forward or CONNECT task. Requests on one connection are strictly
//! serialized.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use futures_util::FutureExt;
use http::{Method, Uri, Version};
use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};

use crate::connect::{ChainedProxy, EstablishedConnection};
use crate::filter::HttpFilters;
use crate::http::header::append_via;
use crate::http::{ClientRequest, HttpBodyDecodeReader, HttpBodyReader, HttpRequestParseError};
use crate::io::{LimitedReader, LimitedWriter, NilLimitedReaderStats, NilLimitedWriterStats};
use crate::types::UpstreamAddr;

use super::local_reply::HttpLocalReply;
use super::stats::{CltReadWrapperStats, CltWriteWrapperStats, UpsReadWrapperStats, UpsWriteWrapperStats};
use super::{CommonTaskContext, ConnState, FullFlowContext};

mod forward;
use forward::HttpForwardTask;

mod connect;

pub(crate) type BoxAsyncRead = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxAsyncWrite = Box<dyn AsyncWrite + Send + Unpin>;
pub(crate) type HttpServerReader = BufReader<LimitedReader<BoxAsyncRead>>;
pub(crate) type HttpServerWriter = LimitedWriter<BoxAsyncWrite>;

/// One upstream connection, reusable across requests of its owning client
/// connection while both sides keep the connection alive.
pub(crate) struct ServerConnection {
    pub(crate) reader: HttpServerReader,
    pub(crate) writer: HttpServerWriter,
    pub(crate) upstream: UpstreamAddr,
    pub(crate) chained: Option<Arc<dyn ChainedProxy>>,
    pub(crate) via_http_proxy: bool,
    pub(crate) full_ctx: FullFlowContext,
}

impl ServerConnection {
    pub(crate) fn from_established(
        established: EstablishedConnection,
        ctx: &CommonTaskContext,
        upstream: UpstreamAddr,
    ) -> Self {
        let mut full_ctx = FullFlowContext::new(&ctx.flow, upstream.clone());
        if established.chained.is_some() {
            full_ctx.chained_proxy_addr = Some(established.peer_addr);
        }

        let (ups_r, ups_w) = tokio::io::split(established.stream);
        let reader = LimitedReader::new(
            Box::new(ups_r) as BoxAsyncRead,
            ctx.limiter.clone(),
            UpsReadWrapperStats::new(&ctx.stats, &ctx.trackers, &full_ctx),
        );
        let writer = LimitedWriter::new(
            Box::new(ups_w) as BoxAsyncWrite,
            ctx.limiter.clone(),
            UpsWriteWrapperStats::new(&ctx.stats, &ctx.trackers, &full_ctx),
        );

        ServerConnection {
            reader: BufReader::new(reader),
            writer,
            upstream,
            chained: established.chained,
            via_http_proxy: established.via_http_proxy,
            full_ctx,
        }
    }

    /// A pooled connection the upstream closed (or wrote unsolicited bytes
    /// on) is dead; probe without waiting.
    pub(crate) fn probe_dead(&mut self) -> bool {
        match self.reader.fill_buf().now_or_never() {
            Some(_) => true,
            None => false,
        }
    }

    pub(crate) fn notify_disconnected(&self) {
        if let Some(chained) = &self.chained {
            chained.disconnected();
        }
    }
}

enum RequestTarget {
    Connect(UpstreamAddr),
    Forward(UpstreamAddr),
}

pub(crate) struct ClientConnection<CDR, CDW> {
    ctx: Arc<CommonTaskContext>,
    clt_r: BufReader<LimitedReader<CDR>>,
    clt_w: LimitedWriter<CDW>,
    state: ConnState,
    server_pool: HashMap<String, ServerConnection>,
    mitm_upstream: Option<UpstreamAddr>,
    reused_server_connections: u64,
}

impl<CDR, CDW> ClientConnection<CDR, CDW>
where
    CDR: AsyncRead + Send + Unpin + 'static,
    CDW: AsyncWrite + Send + Unpin + 'static,
{
    pub(crate) fn new(ctx: Arc<CommonTaskContext>, clt_r: CDR, clt_w: CDW) -> Self {
        let clt_r = LimitedReader::new(
            clt_r,
            ctx.limiter.clone(),
            CltReadWrapperStats::new(&ctx.stats, &ctx.trackers, &ctx.flow),
        );
        let clt_w = LimitedWriter::new(
            clt_w,
            ctx.limiter.clone(),
            CltWriteWrapperStats::new(&ctx.stats, &ctx.trackers, &ctx.flow),
        );
        ClientConnection {
            ctx,
            clt_r: BufReader::new(clt_r),
            clt_w,
            state: ConnState::AwaitingInitial,
            server_pool: HashMap::new(),
            mitm_upstream: None,
            reused_server_connections: 0,
        }
    }

    /// Inner driver for a decrypted MITM session. Byte accounting and rate
    /// limiting already happen on the outer (ciphertext) wrappers.
    pub(crate) fn new_mitm(
        ctx: Arc<CommonTaskContext>,
        clt_r: CDR,
        clt_w: CDW,
        upstream: UpstreamAddr,
        server_conn: ServerConnection,
    ) -> Self {
        let clt_r =
            LimitedReader::new_unlimited(clt_r, Arc::new(NilLimitedReaderStats::default()));
        let clt_w =
            LimitedWriter::new_unlimited(clt_w, Arc::new(NilLimitedWriterStats::default()));
        let mut server_pool = HashMap::new();
        server_pool.insert(upstream.to_string(), server_conn);
        ClientConnection {
            ctx,
            clt_r: BufReader::new(clt_r),
            clt_w,
            state: ConnState::AwaitingInitial,
            server_pool,
            mitm_upstream: Some(upstream),
            reused_server_connections: 0,
        }
    }

    pub(crate) fn run(mut self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
        loop {
            self.state = ConnState::AwaitingInitial;
            let mut version = Version::HTTP_11;
            let parsed = tokio::time::timeout(
                self.ctx.config.idle_connection_timeout,
                ClientRequest::parse(
                    &mut self.clt_r,
                    self.ctx.config.max_initial_line_length,
                    self.ctx.config.max_header_size,
                    &mut version,
                ),
            )
            .await;

            let mut req = match parsed {
                Ok(Ok(req)) => req,
                Ok(Err(e)) => {
                    self.handle_parse_error(&e, version).await;
                    break;
                }
                Err(_) => {
                    debug!(
                        "conn {} idle for {:?}, closing",
                        self.ctx.flow.connection_id, self.ctx.config.idle_connection_timeout
                    );
                    break;
                }
            };
            self.ctx.stats.add_task();

            let target = match self.request_target(&mut req).await {
                Ok(target) => target,
                Err(close) => {
                    if close {
                        break;
                    }
                    continue;
                }
            };

            if !self.check_authentication(&req).await {
                if self.drain_request_body(&req).await.is_err() {
                    break;
                }
                continue;
            }

            debug_assert!(!self.state.frames_are_opaque());
            let mut filters = self
                .ctx
                .config
                .filters_source
                .filter_request(&req, &self.ctx.flow);
            self.ctx
                .trackers
                .request_received_from_client(&self.ctx.flow, &req);

            // buffered mode: filters see the head and the whole body at once
            let buffer_limit = self.ctx.config.filters_source.max_request_buffer_size();
            if buffer_limit > 0 && req.body_type().is_some() && !req.method.eq(&Method::CONNECT) {
                match self.aggregate_request_body(&mut req, buffer_limit).await {
                    Ok(()) => {}
                    Err(reply) => {
                        let _ = reply.reply(version, &mut self.clt_w).await;
                        break;
                    }
                }
            }

            if let Some(rsp) = filters.client_to_proxy_request(&mut req) {
                if !self.reply_short_circuit(&req, rsp, version).await {
                    break;
                }
                continue;
            }

            if !self.ctx.config.transparent {
                append_via(
                    &mut req.end_to_end_headers,
                    version,
                    &self.ctx.config.proxy_alias,
                );
            }

            match target {
                RequestTarget::Connect(upstream) => {
                    self.state = ConnState::NegotiatingConnect;
                    match self.run_connect(req, upstream, filters).await {
                        Some(conn) => {
                            self = conn;
                            continue;
                        }
                        None => return,
                    }
                }
                RequestTarget::Forward(upstream) => {
                    if req.body.is_none() && req.body_type().is_some() {
                        self.state = ConnState::AwaitingChunk;
                    }
                    let mut forward_task =
                        HttpForwardTask::new(&self.ctx, upstream, self.mitm_upstream.is_some());
                    let should_close = forward_task
                        .run(
                            &mut self.clt_r,
                            &mut self.clt_w,
                            filters.as_mut(),
                            &mut self.server_pool,
                            &mut req,
                        )
                        .await;
                    if forward_task.reused_connection() {
                        self.reused_server_connections += 1;
                        self.ctx.stats.add_reused_server_conn();
                    }
                    if should_close {
                        break;
                    }
                }
            }
        }

        self.shutdown();
        })
    }

    fn shutdown(&mut self) {
        self.state = ConnState::DisconnectRequested;
        for (_, conn) in self.server_pool.drain() {
            conn.notify_disconnected();
        }
        debug!(
            "conn {} closing, reused {} upstream connections",
            self.ctx.flow.connection_id, self.reused_server_connections
        );
        self.state = ConnState::Disconnected;
    }

    async fn handle_parse_error(&mut self, e: &HttpRequestParseError, version: Version) {
        match e {
            HttpRequestParseError::ClientClosed => {}
            _ => {
                debug!(
                    "conn {} invalid request: {e}",
                    self.ctx.flow.connection_id
                );
                if let Some(reply) = HttpLocalReply::from_request_parse_error(e) {
                    let _ = reply.reply(version, &mut self.clt_w).await;
                }
            }
        }
    }

    /// Work out where this request goes, replying locally when it cannot go
    /// anywhere. `Err(true)` closes the connection, `Err(false)` keeps it.
    async fn request_target(
        &mut self,
        req: &mut ClientRequest,
    ) -> Result<RequestTarget, bool> {
        if req.method.eq(&Method::CONNECT) {
            if self.mitm_upstream.is_some() {
                // no re-interception inside an intercepted session
                let _ = HttpLocalReply::bad_request(true)
                    .reply(req.version, &mut self.clt_w)
                    .await;
                return Err(true);
            }
            let mut upstream = match UpstreamAddr::from_uri_authority(&req.uri) {
                Ok(v) => v,
                Err(_) => {
                    let _ = HttpLocalReply::bad_request(true)
                        .reply(req.version, &mut self.clt_w)
                        .await;
                    return Err(true);
                }
            };
            upstream.set_default_port(443);
            return Ok(RequestTarget::Connect(upstream));
        }

        if let Some(upstream) = &self.mitm_upstream {
            // rebuild the plaintext URI the client originally addressed
            if req.uri.authority().is_none() {
                let pa = req
                    .uri
                    .path_and_query()
                    .map(|pa| pa.as_str())
                    .unwrap_or("/");
                if let Ok(uri) = Uri::from_str(&format!("https://{}{}", upstream, pa)) {
                    req.uri = uri;
                }
            }
            return Ok(RequestTarget::Forward(upstream.clone()));
        }

        if let Some(scheme) = req.uri.scheme() {
            if scheme.eq(&http::uri::Scheme::HTTP) {
                let mut upstream = match UpstreamAddr::from_uri_authority(&req.uri) {
                    Ok(v) => v,
                    Err(_) => {
                        let _ = HttpLocalReply::bad_request(true)
                            .reply(req.version, &mut self.clt_w)
                            .await;
                        return Err(true);
                    }
                };
                upstream.set_default_port(80);
                return Ok(RequestTarget::Forward(upstream));
            }
            let _ = HttpLocalReply::bad_request(true)
                .reply(req.version, &mut self.clt_w)
                .await;
            return Err(true);
        }

        // origin-form target, only meaningful when acting as a gateway
        if !self.ctx.config.allow_requests_to_origin_server {
            debug!(
                "conn {} origin-form request to the proxy itself",
                self.ctx.flow.connection_id
            );
            let _ = HttpLocalReply::bad_request(true)
                .reply(req.version, &mut self.clt_w)
                .await;
            return Err(true);
        }
        match &req.host {
            Some(host) => {
                let mut upstream = host.clone();
                upstream.set_default_port(80);
                Ok(RequestTarget::Forward(upstream))
            }
            None => {
                let _ = HttpLocalReply::bad_request(true)
                    .reply(req.version, &mut self.clt_w)
                    .await;
                Err(true)
            }
        }
    }

    /// Basic gate on the client leg. Inside a MITM session the CONNECT was
    /// already authenticated.
    async fn check_authentication(&mut self, req: &ClientRequest) -> bool {
        if self.mitm_upstream.is_some() {
            return true;
        }
        let Some(authenticator) = &self.ctx.config.proxy_authenticator else {
            return true;
        };
        if let crate::http::HttpAuth::Basic { username, password } = &req.auth_info {
            if authenticator.authenticate(username, password) {
                return true;
            }
        }
        let reply = HttpLocalReply::auth_required(authenticator.realm());
        let _ = reply.reply(req.version, &mut self.clt_w).await;
        false
    }

    /// Buffer the whole decoded request body onto the head, bounded by the
    /// filter source's limit.
    async fn aggregate_request_body(
        &mut self,
        req: &mut ClientRequest,
        limit: usize,
    ) -> Result<(), HttpLocalReply> {
        let Some(body_type) = req.body_type() else {
            return Ok(());
        };
        let mut body_reader = HttpBodyDecodeReader::new(
            &mut self.clt_r,
            body_type,
            self.ctx.config.max_chunk_size,
        );
        let mut body = Vec::with_capacity(4096);
        let mut chunk = vec![0u8; 16 * 1024];
        loop {
            let nr = tokio::time::timeout(
                self.ctx.config.idle_connection_timeout,
                body_reader.read(&mut chunk),
            )
            .await
            .map_err(|_| HttpLocalReply::bad_request(true))?
            .map_err(|_| HttpLocalReply::bad_request(true))?;
            if nr == 0 {
                req.set_aggregated_body(body);
                return Ok(());
            }
            if body.len() + nr > limit {
                return Err(HttpLocalReply::payload_too_large());
            }
            body.extend_from_slice(&chunk[0..nr]);
        }
    }

    /// Discard an unread request body so the next head parse starts at a
    /// message boundary.
    async fn drain_request_body(&mut self, req: &ClientRequest) -> Result<(), ()> {
        let Some(body_type) = req.body_type() else {
            return Ok(());
        };
        let mut body_reader = HttpBodyReader::new(
            &mut self.clt_r,
            body_type,
            self.ctx.config.max_chunk_size,
        );
        let mut sink = [0u8; 4096];
        loop {
            match body_reader.read(&mut sink).await {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(_) => return Err(()),
            }
        }
    }

    /// Deliver a filter short-circuit response. Returns false when the
    /// connection must close.
    async fn reply_short_circuit(
        &mut self,
        req: &ClientRequest,
        rsp: crate::filter::LocalResponse,
        version: Version,
    ) -> bool {
        let mut close = rsp.close_connection || !req.keep_alive();
        if req.body.is_none()
            && req.body_type().is_some()
            && self.drain_request_body(req).await.is_err()
        {
            close = true;
        }
        let mut rsp = rsp;
        rsp.close_connection = close;
        let reply = HttpLocalReply::from_local_response(rsp);
        if reply.reply(version, &mut self.clt_w).await.is_err() {
            return false;
        }
        !close
    }
}
