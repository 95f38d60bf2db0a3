/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! CONNECT handling: opaque tunnels, and TLS interception (MITM) where the
//! proxy terminates the client's TLS with a forged certificate and resumes
//! HTTP framing on the decrypted stream.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;

use crate::connect::ConnectTask;
use crate::filter::HttpFilters;
use crate::http::ClientRequest;
use crate::io::{LimitedCopy, LimitedCopyConfig, LimitedCopyError, OnceBufReader};
use crate::types::UpstreamAddr;

use super::{BoxAsyncRead, BoxAsyncWrite, ClientConnection, ServerConnection};
use crate::serve::local_reply::HttpLocalReply;
use crate::serve::{CommonTaskContext, ConnState, ServerTaskError, ServerTaskResult};

const CLIENT_TLS_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

impl<CDR, CDW> ClientConnection<CDR, CDW>
where
    CDR: AsyncRead + Send + Unpin + 'static,
    CDW: AsyncWrite + Send + Unpin + 'static,
{
    /// Drive one CONNECT request. Returns the connection to continue the
    /// request loop on failure replies, or `None` once the connection was
    /// consumed by a tunnel or MITM session.
    pub(crate) async fn run_connect(
        mut self,
        req: ClientRequest,
        upstream: UpstreamAddr,
        mut filters: Box<dyn HttpFilters>,
    ) -> Option<Self> {
        let mitm_manager = match self.ctx.config.mitm_manager() {
            Some(manager) if filters.proxy_to_server_allow_mitm() => Some(manager.clone()),
            _ => None,
        };

        let origin_tls = match &mitm_manager {
            Some(manager) => match manager.server_tls_config(&upstream) {
                Ok(config) => Some(config),
                Err(e) => {
                    debug!(
                        "conn {} no usable mitm client config for {upstream}: {e}",
                        self.ctx.flow.connection_id
                    );
                    let _ = HttpLocalReply::bad_gateway("tls interception unavailable\n")
                        .reply(req.version, &mut self.clt_w)
                        .await;
                    return None;
                }
            },
            None => None,
        };

        self.state = ConnState::AwaitingConnectOk;
        let connect_task = ConnectTask::new(
            &self.ctx.config,
            self.ctx.server_handle.clone(),
            &self.ctx.flow,
            &upstream,
            true,
            origin_tls,
        );
        let mut established = match connect_task.setup(&req, filters.as_mut()).await {
            Ok(c) => {
                let mut full_ctx =
                    crate::serve::FullFlowContext::new(&self.ctx.flow, upstream.clone());
                if c.chained.is_some() {
                    full_ctx.chained_proxy_addr = Some(c.peer_addr);
                }
                filters.proxy_to_server_connection_succeeded(&full_ctx);
                c
            }
            Err(e) => {
                debug!(
                    "conn {} CONNECT to {upstream} failed: {e}",
                    self.ctx.flow.connection_id
                );
                // a failed CONNECT is answered in place and the connection
                // returns to reading the next request head
                let mut rsp = crate::filter::LocalResponse::with_body(
                    http::StatusCode::BAD_GATEWAY,
                    "failed to establish tunnel\n",
                );
                rsp.close_connection = false;
                let reply = HttpLocalReply::from_local_response(rsp);
                if reply.reply(req.version, &mut self.clt_w).await.is_err() {
                    return None;
                }
                return Some(self);
            }
        };

        match mitm_manager {
            None => {
                self.run_tunnel(req, upstream, established).await;
                None
            }
            Some(manager) => {
                let Some(tls_session) = established.tls_session.take() else {
                    debug!(
                        "conn {} mitm session without upstream tls state",
                        self.ctx.flow.connection_id
                    );
                    return None;
                };
                let client_tls_config =
                    match manager.client_tls_config_for(&req, &tls_session) {
                        Ok(config) => config,
                        Err(e) => {
                            debug!(
                                "conn {} no client-facing tls config for {upstream}: {e}",
                                self.ctx.flow.connection_id
                            );
                            let _ = HttpLocalReply::bad_gateway("tls interception unavailable\n")
                                .reply(req.version, &mut self.clt_w)
                                .await;
                            return None;
                        }
                    };
                self.run_mitm(req, upstream, established, client_tls_config)
                    .await;
                None
            }
        }
    }

    /// Opaque byte pipe after a 2xx CONNECT. Nothing on either side is
    /// parsed as HTTP from here on.
    async fn run_tunnel(
        mut self,
        req: ClientRequest,
        upstream: UpstreamAddr,
        established: crate::connect::EstablishedConnection,
    ) {
        if HttpLocalReply::reply_connect_ok(req.version, &mut self.clt_w)
            .await
            .is_err()
        {
            return;
        }
        self.state = ConnState::Tunneling;

        let mut ups_c =
            ServerConnection::from_established(established, &self.ctx, upstream.clone());

        // bytes the client pipelined behind the CONNECT head belong to the
        // tunnel
        let leftover = self.clt_r.buffer().to_vec();
        let mut clt_r = OnceBufReader::new(self.clt_r.into_inner(), leftover);

        let r = relay_streams(
            &mut clt_r,
            &mut self.clt_w,
            &mut ups_c.reader,
            &mut ups_c.writer,
            &self.ctx,
        )
        .await;
        match r {
            Ok(()) => {
                debug!(
                    "conn {} tunnel to {upstream} finished",
                    self.ctx.flow.connection_id
                );
            }
            Err(e) => {
                debug!(
                    "conn {} tunnel to {upstream} aborted: {e}",
                    self.ctx.flow.connection_id
                );
            }
        }
        ups_c.notify_disconnected();
    }

    /// Terminate the client's TLS with a forged certificate and resume the
    /// request loop on the decrypted stream.
    async fn run_mitm(
        mut self,
        req: ClientRequest,
        upstream: UpstreamAddr,
        established: crate::connect::EstablishedConnection,
        client_tls_config: Arc<rustls::ServerConfig>,
    ) {
        if HttpLocalReply::reply_connect_ok(req.version, &mut self.clt_w)
            .await
            .is_err()
        {
            return;
        }
        self.state = ConnState::HandshakingTls;

        let ups_c = ServerConnection::from_established(established, &self.ctx, upstream.clone());

        let leftover = self.clt_r.buffer().to_vec();
        let clt_r = OnceBufReader::new(self.clt_r.into_inner(), leftover);
        let io = tokio::io::join(clt_r, self.clt_w);

        let acceptor = TlsAcceptor::from(client_tls_config);
        let tls_stream =
            match tokio::time::timeout(CLIENT_TLS_ACCEPT_TIMEOUT, acceptor.accept(io)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    // client-leg TLS failures get no HTTP answer, the socket
                    // just goes away
                    debug!(
                        "conn {} client tls handshake failed: {e}",
                        self.ctx.flow.connection_id
                    );
                    ups_c.notify_disconnected();
                    return;
                }
                Err(_) => {
                    debug!(
                        "conn {} client tls handshake timed out",
                        self.ctx.flow.connection_id
                    );
                    ups_c.notify_disconnected();
                    return;
                }
            };
        self.ctx
            .trackers
            .client_ssl_handshake_succeeded(&self.ctx.flow);

        let mut flow = self.ctx.flow.clone();
        flow.client_tls = true;
        let inner_ctx = Arc::new(CommonTaskContext {
            config: self.ctx.config.clone(),
            stats: self.ctx.stats.clone(),
            quit_policy: self.ctx.quit_policy.clone(),
            limiter: self.ctx.limiter.clone(),
            server_handle: self.ctx.server_handle.clone(),
            task_logger: self.ctx.task_logger.clone(),
            trackers: self.ctx.trackers.clone(),
            flow,
        });

        let (clt_r, clt_w) = tokio::io::split(tls_stream);
        let inner = ClientConnection::new_mitm(
            inner_ctx,
            Box::new(clt_r) as BoxAsyncRead,
            Box::new(clt_w) as BoxAsyncWrite,
            upstream,
            ups_c,
        );
        inner.run().await;
    }
}

/// Bidirectional relay between the two halves; used for CONNECT tunnels and
/// upgraded (WebSocket) exchanges. Read-idle is intentionally not enforced
/// here, a tunnel may idle by design.
pub(crate) async fn relay_streams<CR, CW, UR, UW>(
    clt_r: &mut CR,
    clt_w: &mut CW,
    ups_r: &mut UR,
    ups_w: &mut UW,
    ctx: &CommonTaskContext,
) -> ServerTaskResult<()>
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    UR: AsyncRead + Unpin,
    UW: AsyncWrite + Unpin,
{
    let copy_config = LimitedCopyConfig::default();
    let mut clt_to_ups = LimitedCopy::new(clt_r, ups_w, &copy_config);
    let mut ups_to_clt = LimitedCopy::new(ups_r, clt_w, &copy_config);

    let mut quit_interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            biased;

            r = &mut clt_to_ups => {
                return match r {
                    Ok(_) => Ok(()),
                    Err(LimitedCopyError::ReadFailed(e)) => Err(ServerTaskError::ClientTcpReadFailed(e)),
                    Err(LimitedCopyError::WriteFailed(e)) => Err(ServerTaskError::UpstreamWriteFailed(e)),
                };
            }
            r = &mut ups_to_clt => {
                return match r {
                    Ok(_) => Ok(()),
                    Err(LimitedCopyError::ReadFailed(e)) => Err(ServerTaskError::UpstreamReadFailed(e)),
                    Err(LimitedCopyError::WriteFailed(e)) => Err(ServerTaskError::ClientTcpWriteFailed(e)),
                };
            }
            _ = quit_interval.tick() => {
                if ctx.quit_policy.force_quit() {
                    return Err(ServerTaskError::CanceledAsServerQuit);
                }
            }
        }
    }
}
