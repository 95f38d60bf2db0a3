/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::collections::HashMap;
use std::sync::Arc;

use http::Version;
use log::debug;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::connect::ConnectTask;
use crate::filter::HttpFilters;
use crate::http::header::append_via;
use crate::http::{
    ClientRequest, HttpBodyDecodeReader, HttpBodyReader, HttpBodyType, RemoteResponse,
    StreamToChunkedTransfer,
};
use crate::io::{LimitedCopy, LimitedCopyConfig, LimitedCopyError};
use crate::log::TaskLogForHttpForward;

use super::ServerConnection;
use crate::serve::local_reply::HttpLocalReply;
use crate::serve::{CommonTaskContext, ServerTaskError, ServerTaskResult};
use crate::types::UpstreamAddr;

/// Forwards one plain (or MITM-decrypted) request to its upstream and
/// relays the response back, deciding keep-alive on both legs.
pub(crate) struct HttpForwardTask<'a> {
    ctx: &'a Arc<CommonTaskContext>,
    upstream: UpstreamAddr,
    mitm: bool,
    should_close: bool,
    send_error_response: bool,
    reused_connection: bool,
    retry_new_connection: bool,
    rsp_status: u16,
    origin_status: u16,
    started: Instant,
}

impl<'a> HttpForwardTask<'a> {
    pub(crate) fn new(
        ctx: &'a Arc<CommonTaskContext>,
        upstream: UpstreamAddr,
        mitm: bool,
    ) -> Self {
        HttpForwardTask {
            ctx,
            upstream,
            mitm,
            should_close: false,
            send_error_response: true,
            reused_connection: false,
            retry_new_connection: false,
            rsp_status: 0,
            origin_status: 0,
            started: Instant::now(),
        }
    }

    #[inline]
    pub(crate) fn reused_connection(&self) -> bool {
        self.reused_connection
    }

    fn log_task(&self, req: &ClientRequest, e: &ServerTaskError) {
        if let Some(logger) = &self.ctx.task_logger {
            TaskLogForHttpForward {
                connection_id: self.ctx.flow.connection_id,
                client_addr: self.ctx.flow.client_addr,
                upstream: &self.upstream,
                method: req.method.as_str(),
                uri_len_capped: req.uri.to_string(),
                reused_connection: self.reused_connection,
                origin_status: self.origin_status,
                rsp_status: self.rsp_status,
                total_time: self.started.elapsed(),
            }
            .log(logger, e);
        }
    }

    pub(crate) async fn run<CDR, CDW>(
        &mut self,
        clt_r: &mut CDR,
        clt_w: &mut CDW,
        filters: &mut dyn HttpFilters,
        pool: &mut HashMap<String, ServerConnection>,
        req: &mut ClientRequest,
    ) -> bool
    where
        CDR: AsyncBufRead + Send + Unpin,
        CDW: AsyncWrite + Send + Unpin,
    {
        self.should_close = !req.keep_alive();
        match self.run_forward(clt_r, clt_w, filters, pool, req).await {
            Ok(()) => {
                self.log_task(req, &ServerTaskError::Finished);
            }
            Err(e) => {
                self.should_close = true;
                if self.send_error_response {
                    if let Some(reply) = HttpLocalReply::from_task_error(&e) {
                        if reply.reply(req.version, clt_w).await.is_ok() {
                            self.rsp_status = reply.status();
                        }
                    }
                }
                self.log_task(req, &e);
            }
        }
        self.should_close
    }

    async fn acquire_connection(
        &mut self,
        filters: &mut dyn HttpFilters,
        pool: &mut HashMap<String, ServerConnection>,
        req: &ClientRequest,
    ) -> ServerTaskResult<ServerConnection> {
        let key = self.upstream.to_string();
        if let Some(mut conn) = pool.remove(&key) {
            if conn.probe_dead() {
                debug!(
                    "conn {} pooled connection to {} is dead, dialing a fresh one",
                    self.ctx.flow.connection_id, key
                );
                conn.notify_disconnected();
            } else {
                self.reused_connection = true;
                // a head-send failure on a reused connection gets one fresh
                // dial before giving up
                self.retry_new_connection = true;
                return Ok(conn);
            }
        }

        let origin_tls = if self.mitm {
            let manager = self
                .ctx
                .config
                .mitm_manager()
                .ok_or(ServerTaskError::InternalServerError(
                    "mitm session without mitm manager",
                ))?;
            Some(
                manager
                    .server_tls_config(&self.upstream)
                    .map_err(|_| {
                        ServerTaskError::InternalServerError("unusable mitm tls client config")
                    })?,
            )
        } else {
            None
        };

        let connect_task = ConnectTask::new(
            &self.ctx.config,
            self.ctx.server_handle.clone(),
            &self.ctx.flow,
            &self.upstream,
            false,
            origin_tls,
        );
        match connect_task.setup(req, filters).await {
            Ok(established) => {
                let conn = ServerConnection::from_established(
                    established,
                    self.ctx,
                    self.upstream.clone(),
                );
                filters.proxy_to_server_connection_succeeded(&conn.full_ctx);
                Ok(conn)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn run_forward<CDR, CDW>(
        &mut self,
        clt_r: &mut CDR,
        clt_w: &mut CDW,
        filters: &mut dyn HttpFilters,
        pool: &mut HashMap<String, ServerConnection>,
        req: &mut ClientRequest,
    ) -> ServerTaskResult<()>
    where
        CDR: AsyncBufRead + Send + Unpin,
        CDW: AsyncWrite + Send + Unpin,
    {
        let mut ups_c = self.acquire_connection(filters, pool, req).await?;

        if let Some(rsp) = filters.proxy_to_server_request(req) {
            let close =
                rsp.close_connection || (req.body.is_none() && req.body_type().is_some());
            let mut rsp = rsp;
            rsp.close_connection = close;
            let reply = HttpLocalReply::from_local_response(rsp);
            self.rsp_status = reply.status();
            self.send_error_response = false;
            reply
                .reply(req.version, clt_w)
                .await
                .map_err(ServerTaskError::ClientTcpWriteFailed)?;
            self.should_close = close;
            ups_c.notify_disconnected();
            return Ok(());
        }

        let mut r = self
            .run_with_connection(clt_r, clt_w, filters, req, &mut ups_c)
            .await;
        if r.is_err() && self.retry_new_connection {
            debug!(
                "conn {} reused connection to {} failed early, retrying on a fresh dial",
                self.ctx.flow.connection_id, self.upstream
            );
            ups_c.notify_disconnected();
            self.retry_new_connection = false;
            ups_c = self.acquire_connection(filters, pool, req).await?;
            r = self
                .run_with_connection(clt_r, clt_w, filters, req, &mut ups_c)
                .await;
        }
        match r {
            Ok(reusable) => {
                if reusable && !self.should_close {
                    pool.insert(ups_c.upstream.to_string(), ups_c);
                } else {
                    ups_c.notify_disconnected();
                }
                Ok(())
            }
            Err(e) => {
                ups_c.notify_disconnected();
                Err(e)
            }
        }
    }

    /// Send the request, read the response, relay the body. Returns whether
    /// the upstream connection may go back to the pool.
    async fn run_with_connection<CDR, CDW>(
        &mut self,
        clt_r: &mut CDR,
        clt_w: &mut CDW,
        filters: &mut dyn HttpFilters,
        req: &mut ClientRequest,
        ups_c: &mut ServerConnection,
    ) -> ServerTaskResult<bool>
    where
        CDR: AsyncBufRead + Send + Unpin,
        CDW: AsyncWrite + Send + Unpin,
    {
        self.send_request(clt_r, filters, req, ups_c).await?;

        let mut rsp = self.recv_response_head(filters, req, ups_c, clt_w).await?;
        self.origin_status = rsp.code;
        self.ctx
            .trackers
            .response_received_from_server(&ups_c.full_ctx, &rsp);
        filters.server_to_proxy_response(&mut rsp);
        filters.server_to_proxy_response_receiving();

        if !self.ctx.config.transparent {
            append_via(
                &mut rsp.end_to_end_headers,
                rsp.version,
                &self.ctx.config.proxy_alias,
            );
        }

        if rsp.is_upgrade() && req.is_upgrade() {
            return self.run_upgraded(clt_r, clt_w, filters, req, ups_c, rsp).await;
        }

        let reusable = self
            .send_response(clt_w, filters, req, ups_c, &mut rsp)
            .await?;

        filters.server_to_proxy_response_received();
        self.ctx
            .trackers
            .response_sent_to_client(&self.ctx.flow, &rsp);
        Ok(reusable)
    }

    async fn send_request<CDR>(
        &mut self,
        clt_r: &mut CDR,
        filters: &mut dyn HttpFilters,
        req: &mut ClientRequest,
        ups_c: &mut ServerConnection,
    ) -> ServerTaskResult<()>
    where
        CDR: AsyncBufRead + Send + Unpin,
    {
        // the Host header must survive toward the next hop
        if req.host.is_none() && !req.end_to_end_headers.contains_key(http::header::HOST) {
            if let Ok(value) = http::HeaderValue::from_str(&self.upstream.to_string()) {
                req.end_to_end_headers.insert(http::header::HOST, value);
            }
        }

        let streamed_body_type = if req.body.is_some() {
            None
        } else {
            req.body_type()
        };
        let reframe_chunked = streamed_body_type.is_some() && filters.wants_content();
        if reframe_chunked {
            req.set_chunked_transfer();
        }

        let head = if ups_c.via_http_proxy
            || (self.ctx.config.transparent && req.uri.scheme().is_some())
        {
            req.serialize_for_proxy(&self.upstream)
        } else {
            req.serialize_for_origin()
        };

        filters.proxy_to_server_request_sending();
        ups_c
            .writer
            .write_all(&head)
            .await
            .map_err(ServerTaskError::UpstreamWriteFailed)?;
        // past this point a failure is not safely retryable
        self.retry_new_connection = false;

        if let Some(body) = &req.body {
            ups_c
                .writer
                .write_all(body)
                .await
                .map_err(ServerTaskError::UpstreamWriteFailed)?;
        } else if let Some(body_type) = streamed_body_type {
            if reframe_chunked {
                self.send_request_body_filtered(clt_r, filters, body_type, ups_c)
                    .await?;
            } else {
                self.send_request_body_verbatim(clt_r, body_type, ups_c)
                    .await?;
            }
        }
        ups_c
            .writer
            .flush()
            .await
            .map_err(ServerTaskError::UpstreamWriteFailed)?;

        filters.proxy_to_server_request_sent();
        self.ctx
            .trackers
            .request_sent_to_server(&ups_c.full_ctx, req);
        Ok(())
    }

    async fn send_request_body_verbatim<CDR>(
        &mut self,
        clt_r: &mut CDR,
        body_type: HttpBodyType,
        ups_c: &mut ServerConnection,
    ) -> ServerTaskResult<()>
    where
        CDR: AsyncBufRead + Send + Unpin,
    {
        let mut body_reader =
            HttpBodyReader::new(clt_r, body_type, self.ctx.config.max_chunk_size);
        let copy_config = self.copy_config();
        let mut clt_to_ups = LimitedCopy::new(&mut body_reader, &mut ups_c.writer, &copy_config);

        let idle_duration = self.ctx.config.idle_connection_timeout;
        let mut idle_interval =
            tokio::time::interval_at(Instant::now() + idle_duration, idle_duration);
        loop {
            tokio::select! {
                biased;

                r = &mut clt_to_ups => {
                    return r.map(|_| ()).map_err(|e| match e {
                        LimitedCopyError::ReadFailed(e) => ServerTaskError::ClientTcpReadFailed(e),
                        LimitedCopyError::WriteFailed(e) => ServerTaskError::UpstreamWriteFailed(e),
                    });
                }
                _ = idle_interval.tick() => {
                    if clt_to_ups.is_idle() {
                        return if clt_to_ups.no_cached_data() {
                            Err(ServerTaskError::ClientAppTimeout("idle while reading request body"))
                        } else {
                            Err(ServerTaskError::UpstreamAppTimeout("idle while sending request body"))
                        };
                    }
                    clt_to_ups.reset_active();

                    if self.ctx.quit_policy.force_quit() {
                        return Err(ServerTaskError::CanceledAsServerQuit);
                    }
                }
            }
        }
    }

    async fn send_request_body_filtered<CDR>(
        &mut self,
        clt_r: &mut CDR,
        filters: &mut dyn HttpFilters,
        body_type: HttpBodyType,
        ups_c: &mut ServerConnection,
    ) -> ServerTaskResult<()>
    where
        CDR: AsyncBufRead + Send + Unpin,
    {
        use tokio::io::AsyncReadExt;

        let mut body_reader =
            HttpBodyDecodeReader::new(clt_r, body_type, self.ctx.config.max_chunk_size);
        let mut chunk = vec![0u8; self.ctx.config.max_chunk_size];
        loop {
            let nr = tokio::time::timeout(
                self.ctx.config.idle_connection_timeout,
                body_reader.read(&mut chunk),
            )
            .await
            .map_err(|_| ServerTaskError::ClientAppTimeout("idle while reading request body"))?
            .map_err(ServerTaskError::ClientTcpReadFailed)?;
            if nr == 0 {
                break;
            }
            let mut data = chunk[0..nr].to_vec();
            if let Some(_rsp) = filters.client_to_proxy_request_chunk(&mut data) {
                // a chunk-level short circuit mid-stream cannot be delivered
                // cleanly, drop both legs
                return Err(ServerTaskError::InternalServerError(
                    "filter aborted request mid-body",
                ));
            }
            if data.is_empty() {
                continue;
            }
            let framed = format!("{:x}\r\n", data.len());
            ups_c
                .writer
                .write_all(framed.as_bytes())
                .await
                .map_err(ServerTaskError::UpstreamWriteFailed)?;
            ups_c
                .writer
                .write_all(&data)
                .await
                .map_err(ServerTaskError::UpstreamWriteFailed)?;
            ups_c
                .writer
                .write_all(b"\r\n")
                .await
                .map_err(ServerTaskError::UpstreamWriteFailed)?;
        }
        ups_c
            .writer
            .write_all(b"0\r\n\r\n")
            .await
            .map_err(ServerTaskError::UpstreamWriteFailed)?;
        Ok(())
    }

    async fn recv_response_head<CDW>(
        &mut self,
        filters: &mut dyn HttpFilters,
        req: &ClientRequest,
        ups_c: &mut ServerConnection,
        clt_w: &mut CDW,
    ) -> ServerTaskResult<RemoteResponse>
    where
        CDW: AsyncWrite + Send + Unpin,
    {
        loop {
            let rsp = match tokio::time::timeout(
                self.ctx.config.idle_connection_timeout,
                RemoteResponse::parse(
                    &mut ups_c.reader,
                    &req.method,
                    req.keep_alive(),
                    self.ctx.config.max_header_size,
                ),
            )
            .await
            {
                Ok(Ok(rsp)) => rsp,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    filters.server_to_proxy_response_timed_out();
                    return Err(ServerTaskError::UpstreamAppTimeout(
                        "timeout to receive response header",
                    ));
                }
            };
            if rsp.code == 100 {
                // forward the interim response and read on
                let buf = rsp.serialize();
                clt_w
                    .write_all(&buf)
                    .await
                    .map_err(ServerTaskError::ClientTcpWriteFailed)?;
                clt_w
                    .flush()
                    .await
                    .map_err(ServerTaskError::ClientTcpWriteFailed)?;
                continue;
            }
            return Ok(rsp);
        }
    }

    async fn run_upgraded<CDR, CDW>(
        &mut self,
        clt_r: &mut CDR,
        clt_w: &mut CDW,
        _filters: &mut dyn HttpFilters,
        _req: &ClientRequest,
        ups_c: &mut ServerConnection,
        mut rsp: RemoteResponse,
    ) -> ServerTaskResult<bool>
    where
        CDR: AsyncBufRead + Send + Unpin,
        CDW: AsyncWrite + Send + Unpin,
    {
        self.rsp_status = rsp.code;
        let buf = rsp.serialize();
        self.send_error_response = false;
        clt_w
            .write_all(&buf)
            .await
            .map_err(ServerTaskError::ClientTcpWriteFailed)?;
        clt_w
            .flush()
            .await
            .map_err(ServerTaskError::ClientTcpWriteFailed)?;

        // from here both legs are an opaque byte relay
        self.should_close = true;
        super::connect::relay_streams(
            clt_r,
            clt_w,
            &mut ups_c.reader,
            &mut ups_c.writer,
            self.ctx,
        )
        .await?;
        Ok(false)
    }

    fn copy_config(&self) -> LimitedCopyConfig {
        let mut config = LimitedCopyConfig::default();
        config.set_buffer_size(self.ctx.config.max_chunk_size);
        config
    }

    /// Relay the response toward the client, converting framing where
    /// needed. Returns whether the upstream connection stays usable.
    async fn send_response<CDW>(
        &mut self,
        clt_w: &mut CDW,
        filters: &mut dyn HttpFilters,
        req: &ClientRequest,
        ups_c: &mut ServerConnection,
        rsp: &mut RemoteResponse,
    ) -> ServerTaskResult<bool>
    where
        CDW: AsyncWrite + Send + Unpin,
    {
        let body_type = rsp.body_type(&req.method);
        let ups_reusable = rsp.keep_alive();

        // aggregated mode: buffer the whole body and fix the framing
        let aggregate_limit = self.ctx.config.filters_source.max_response_buffer_size();
        if aggregate_limit > 0 {
            if let Some(body_type) = body_type {
                let mut body = self
                    .read_aggregated_body(ups_c, body_type, aggregate_limit)
                    .await?;
                filters.server_to_proxy_response_chunk(&mut body);
                filters.proxy_to_client_response_chunk(&mut body);
                rsp.set_aggregated_body(body);
            }
            let client_close = self.should_close || !req.keep_alive();
            rsp.set_keep_alive(!client_close);
            self.should_close = client_close;
            filters.proxy_to_client_response(rsp);
            self.rsp_status = rsp.code;
            let mut buf = rsp.serialize();
            if let Some(body) = &rsp.body {
                buf.extend_from_slice(body);
            }
            self.send_error_response = false;
            clt_w
                .write_all(&buf)
                .await
                .map_err(ServerTaskError::ClientTcpWriteFailed)?;
            clt_w
                .flush()
                .await
                .map_err(ServerTaskError::ClientTcpWriteFailed)?;
            return Ok(ups_reusable);
        }

        match body_type {
            None => {
                let client_close = self.should_close || !req.keep_alive();
                rsp.set_keep_alive(!client_close);
                self.should_close = client_close;
                filters.proxy_to_client_response(rsp);
                self.rsp_status = rsp.code;
                let buf = rsp.serialize();
                self.send_error_response = false;
                clt_w
                    .write_all(&buf)
                    .await
                    .map_err(ServerTaskError::ClientTcpWriteFailed)?;
                clt_w
                    .flush()
                    .await
                    .map_err(ServerTaskError::ClientTcpWriteFailed)?;
                Ok(ups_reusable)
            }
            Some(HttpBodyType::ReadUntilEnd) => {
                self.send_close_delimited_response(clt_w, filters, req, ups_c, rsp)
                    .await?;
                // the upstream signaled end-of-response by close
                Ok(false)
            }
            Some(body_type) => {
                if filters.wants_content() {
                    self.send_response_body_filtered(clt_w, filters, req, ups_c, rsp, body_type)
                        .await?;
                    Ok(false)
                } else {
                    self.send_response_body_verbatim(clt_w, filters, req, ups_c, rsp, body_type)
                        .await?;
                    Ok(ups_reusable)
                }
            }
        }
    }

    async fn read_aggregated_body(
        &mut self,
        ups_c: &mut ServerConnection,
        body_type: HttpBodyType,
        limit: usize,
    ) -> ServerTaskResult<Vec<u8>> {
        use tokio::io::AsyncReadExt;

        let mut body_reader = HttpBodyDecodeReader::new(
            &mut ups_c.reader,
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
            .map_err(|_| ServerTaskError::UpstreamAppTimeout("idle while reading response body"))?
            .map_err(ServerTaskError::UpstreamReadFailed)?;
            if nr == 0 {
                return Ok(body);
            }
            if body.len() + nr > limit {
                return Err(ServerTaskError::InvalidUpstreamProtocol(
                    "response body exceeds the buffering limit",
                ));
            }
            body.extend_from_slice(&chunk[0..nr]);
        }
    }

    async fn send_close_delimited_response<CDW>(
        &mut self,
        clt_w: &mut CDW,
        filters: &mut dyn HttpFilters,
        req: &ClientRequest,
        ups_c: &mut ServerConnection,
        rsp: &mut RemoteResponse,
    ) -> ServerTaskResult<()>
    where
        CDW: AsyncWrite + Send + Unpin,
    {
        // converting to chunked (or staying close-delimited) always ends the
        // client connection after this response
        self.should_close = true;
        let chunked = req.version == Version::HTTP_11;
        if chunked {
            rsp.set_chunked_transfer();
        }
        rsp.set_no_keep_alive();
        filters.proxy_to_client_response(rsp);
        self.rsp_status = rsp.code;
        let head = rsp.serialize();
        self.send_error_response = false;
        clt_w
            .write_all(&head)
            .await
            .map_err(ServerTaskError::ClientTcpWriteFailed)?;

        if chunked {
            let mut transfer = StreamToChunkedTransfer::new(
                &mut ups_c.reader,
                clt_w,
                self.ctx.config.max_chunk_size,
            );
            let idle_duration = self.ctx.config.idle_connection_timeout;
            let mut idle_interval =
                tokio::time::interval_at(Instant::now() + idle_duration, idle_duration);
            loop {
                tokio::select! {
                    biased;

                    r = &mut transfer => {
                        return r.map_err(|e| match e {
                            LimitedCopyError::ReadFailed(e) => ServerTaskError::UpstreamReadFailed(e),
                            LimitedCopyError::WriteFailed(e) => ServerTaskError::ClientTcpWriteFailed(e),
                        });
                    }
                    _ = idle_interval.tick() => {
                        if transfer.is_idle() {
                            return if transfer.no_cached_data() {
                                Err(ServerTaskError::UpstreamAppTimeout("idle while reading response body"))
                            } else {
                                Err(ServerTaskError::ClientAppTimeout("idle while sending response body"))
                            };
                        }
                        transfer.reset_active();

                        if self.ctx.quit_policy.force_quit() {
                            return Err(ServerTaskError::CanceledAsServerQuit);
                        }
                    }
                }
            }
        } else {
            self.copy_response_stream(clt_w, ups_c, Vec::new()).await
        }
    }

    async fn send_response_body_verbatim<CDW>(
        &mut self,
        clt_w: &mut CDW,
        filters: &mut dyn HttpFilters,
        req: &ClientRequest,
        ups_c: &mut ServerConnection,
        rsp: &mut RemoteResponse,
        body_type: HttpBodyType,
    ) -> ServerTaskResult<()>
    where
        CDW: AsyncWrite + Send + Unpin,
    {
        let client_close = self.should_close || !req.keep_alive();
        rsp.set_keep_alive(!client_close);
        self.should_close = client_close;
        filters.proxy_to_client_response(rsp);
        self.rsp_status = rsp.code;
        let head = rsp.serialize();
        self.send_error_response = false;

        let copy_config = self.copy_config();
        let mut body_reader = HttpBodyReader::new(
            &mut ups_c.reader,
            body_type,
            self.ctx.config.max_chunk_size,
        );
        let mut ups_to_clt = LimitedCopy::with_data(&mut body_reader, clt_w, &copy_config, head);

        let idle_duration = self.ctx.config.idle_connection_timeout;
        let mut idle_interval =
            tokio::time::interval_at(Instant::now() + idle_duration, idle_duration);
        loop {
            tokio::select! {
                biased;

                r = &mut ups_to_clt => {
                    return r.map(|_| ()).map_err(|e| match e {
                        LimitedCopyError::ReadFailed(e) => ServerTaskError::UpstreamReadFailed(e),
                        LimitedCopyError::WriteFailed(e) => ServerTaskError::ClientTcpWriteFailed(e),
                    });
                }
                _ = idle_interval.tick() => {
                    if ups_to_clt.is_idle() {
                        return if ups_to_clt.no_cached_data() {
                            Err(ServerTaskError::UpstreamAppTimeout("idle while reading response body"))
                        } else {
                            Err(ServerTaskError::ClientAppTimeout("idle while sending response body"))
                        };
                    }
                    ups_to_clt.reset_active();

                    if self.ctx.quit_policy.force_quit() {
                        return Err(ServerTaskError::CanceledAsServerQuit);
                    }
                }
            }
        }
    }

    async fn send_response_body_filtered<CDW>(
        &mut self,
        clt_w: &mut CDW,
        filters: &mut dyn HttpFilters,
        req: &ClientRequest,
        ups_c: &mut ServerConnection,
        rsp: &mut RemoteResponse,
        body_type: HttpBodyType,
    ) -> ServerTaskResult<()>
    where
        CDW: AsyncWrite + Send + Unpin,
    {
        use tokio::io::AsyncReadExt;

        // content filters may change the length, re-frame as chunked for
        // HTTP/1.1 clients and close-delimit for HTTP/1.0 ones
        let chunked = req.version == Version::HTTP_11;
        if chunked {
            rsp.set_chunked_transfer();
            let client_close = self.should_close || !req.keep_alive();
            rsp.set_keep_alive(!client_close);
            self.should_close = client_close;
        } else {
            rsp.set_no_keep_alive();
            self.should_close = true;
        }
        filters.proxy_to_client_response(rsp);
        self.rsp_status = rsp.code;
        let head = rsp.serialize();
        self.send_error_response = false;
        clt_w
            .write_all(&head)
            .await
            .map_err(ServerTaskError::ClientTcpWriteFailed)?;

        let mut body_reader = HttpBodyDecodeReader::new(
            &mut ups_c.reader,
            body_type,
            self.ctx.config.max_chunk_size,
        );
        let mut chunk = vec![0u8; self.ctx.config.max_chunk_size];
        loop {
            let nr = tokio::time::timeout(
                self.ctx.config.idle_connection_timeout,
                body_reader.read(&mut chunk),
            )
            .await
            .map_err(|_| ServerTaskError::UpstreamAppTimeout("idle while reading response body"))?
            .map_err(ServerTaskError::UpstreamReadFailed)?;
            if nr == 0 {
                break;
            }
            let mut data = chunk[0..nr].to_vec();
            filters.server_to_proxy_response_chunk(&mut data);
            filters.proxy_to_client_response_chunk(&mut data);
            if data.is_empty() {
                continue;
            }
            if chunked {
                let framed = format!("{:x}\r\n", data.len());
                clt_w
                    .write_all(framed.as_bytes())
                    .await
                    .map_err(ServerTaskError::ClientTcpWriteFailed)?;
                clt_w
                    .write_all(&data)
                    .await
                    .map_err(ServerTaskError::ClientTcpWriteFailed)?;
                clt_w
                    .write_all(b"\r\n")
                    .await
                    .map_err(ServerTaskError::ClientTcpWriteFailed)?;
            } else {
                clt_w
                    .write_all(&data)
                    .await
                    .map_err(ServerTaskError::ClientTcpWriteFailed)?;
            }
        }
        if chunked {
            clt_w
                .write_all(b"0\r\n\r\n")
                .await
                .map_err(ServerTaskError::ClientTcpWriteFailed)?;
        }
        clt_w
            .flush()
            .await
            .map_err(ServerTaskError::ClientTcpWriteFailed)?;
        Ok(())
    }

    async fn copy_response_stream<CDW>(
        &mut self,
        clt_w: &mut CDW,
        ups_c: &mut ServerConnection,
        head: Vec<u8>,
    ) -> ServerTaskResult<()>
    where
        CDW: AsyncWrite + Send + Unpin,
    {
        let copy_config = self.copy_config();
        let mut ups_to_clt =
            LimitedCopy::with_data(&mut ups_c.reader, clt_w, &copy_config, head);
        let idle_duration = self.ctx.config.idle_connection_timeout;
        let mut idle_interval =
            tokio::time::interval_at(Instant::now() + idle_duration, idle_duration);
        loop {
            tokio::select! {
                biased;

                r = &mut ups_to_clt => {
                    return r.map(|_| ()).map_err(|e| match e {
                        LimitedCopyError::ReadFailed(e) => ServerTaskError::UpstreamReadFailed(e),
                        LimitedCopyError::WriteFailed(e) => ServerTaskError::ClientTcpWriteFailed(e),
                    });
                }
                _ = idle_interval.tick() => {
                    if ups_to_clt.is_idle() {
                        return Err(ServerTaskError::UpstreamAppTimeout("idle while relaying response"));
                    }
                    ups_to_clt.reset_active();

                    if self.ctx.quit_policy.force_quit() {
                        return Err(ServerTaskError::CanceledAsServerQuit);
                    }
                }
            }
        }
    }
}
