/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! Per-request filter chains.
//!
//! One [`HttpFilters`] instance is bound per original client request and
//! receives every lifecycle event for that request; the next request on the
//! same connection gets a fresh instance. All hooks run on the connection's
//! worker and must not block.

use std::io::Write;
use std::net::SocketAddr;

use bytes::BufMut;
use http::{HeaderMap, StatusCode, Version};

use crate::http::{ClientRequest, RemoteResponse};
use crate::serve::{FlowContext, FullFlowContext};
use crate::types::UpstreamAddr;

/// A response generated by a filter (or by the engine itself) instead of an
/// upstream exchange.
pub struct LocalResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub close_connection: bool,
}

impl LocalResponse {
    pub fn new(status: StatusCode) -> Self {
        LocalResponse {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
            close_connection: false,
        }
    }

    pub fn with_body(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        LocalResponse {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            close_connection: false,
        }
    }

    pub fn serialize(&self, version: Version) -> Vec<u8> {
        let mut buf = Vec::<u8>::with_capacity(256 + self.body.len());
        let reason = self.status.canonical_reason().unwrap_or("Unknown");
        let _ = write!(buf, "{:?} {} {}\r\n", version, self.status.as_u16(), reason);
        for (name, value) in self.headers.iter() {
            buf.put_slice(name.as_ref());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        let _ = write!(buf, "Content-Length: {}\r\n", self.body.len());
        if self.close_connection {
            buf.put_slice(b"Connection: Close\r\n");
        } else {
            buf.put_slice(b"Connection: Keep-Alive\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);
        buf
    }
}

/// The per-request filter contract.
///
/// Head hooks may mutate the passed head in place; returning a
/// [`LocalResponse`] from a request-side hook short-circuits the exchange.
/// Chunk hooks see decoded payload bytes and only fire for filters that
/// return `true` from [`HttpFilters::wants_content`], or in aggregated
/// (buffered) mode where the full body arrives on the head itself.
#[allow(unused_variables)]
pub trait HttpFilters: Send {
    fn client_to_proxy_request(&mut self, req: &mut ClientRequest) -> Option<LocalResponse> {
        None
    }

    fn client_to_proxy_request_chunk(&mut self, chunk: &mut Vec<u8>) -> Option<LocalResponse> {
        None
    }

    fn proxy_to_server_request(&mut self, req: &mut ClientRequest) -> Option<LocalResponse> {
        None
    }

    fn proxy_to_server_request_sending(&mut self) {}

    fn proxy_to_server_request_sent(&mut self) {}

    fn server_to_proxy_response(&mut self, rsp: &mut RemoteResponse) {}

    fn server_to_proxy_response_chunk(&mut self, chunk: &mut Vec<u8>) {}

    fn server_to_proxy_response_timed_out(&mut self) {}

    fn server_to_proxy_response_receiving(&mut self) {}

    fn server_to_proxy_response_received(&mut self) {}

    fn proxy_to_client_response(&mut self, rsp: &mut RemoteResponse) {}

    fn proxy_to_client_response_chunk(&mut self, chunk: &mut Vec<u8>) {}

    fn proxy_to_server_connection_queued(&mut self) {}

    /// May return an already-resolved address, skipping the resolver.
    fn proxy_to_server_resolution_started(
        &mut self,
        upstream: &UpstreamAddr,
    ) -> Option<SocketAddr> {
        None
    }

    fn proxy_to_server_resolution_succeeded(&mut self, upstream: &UpstreamAddr, addr: SocketAddr) {
    }

    fn proxy_to_server_resolution_failed(&mut self, upstream: &UpstreamAddr) {}

    fn proxy_to_server_connection_started(&mut self) {}

    fn proxy_to_server_connection_ssl_handshake_started(&mut self) {}

    fn proxy_to_server_connection_failed(&mut self) {}

    fn proxy_to_server_connection_succeeded(&mut self, ctx: &FullFlowContext) {}

    /// Returning false on a CONNECT forces an opaque tunnel even when a MITM
    /// manager is configured.
    fn proxy_to_server_allow_mitm(&self) -> bool {
        true
    }

    /// Opt in to decoded body chunks through the chunk hooks. Bodies of
    /// requests whose filter leaves this false relay with their original
    /// framing untouched.
    fn wants_content(&self) -> bool {
        false
    }
}

/// Binds one [`HttpFilters`] per original request.
pub trait HttpFiltersSource: Send + Sync {
    fn filter_request(&self, req: &ClientRequest, ctx: &FlowContext) -> Box<dyn HttpFilters>;

    /// When positive, request bodies up to this size are buffered and
    /// presented whole to the filter on the request head.
    fn max_request_buffer_size(&self) -> usize {
        0
    }

    /// When positive, response bodies up to this size are buffered and
    /// presented whole to the filter on the response head.
    fn max_response_buffer_size(&self) -> usize {
        0
    }
}

/// A stateless pass-through filter.
pub struct NoopFilters;

impl HttpFilters for NoopFilters {}

/// Source yielding [`NoopFilters`] for every request.
pub struct NoopFiltersSource;

impl HttpFiltersSource for NoopFiltersSource {
    fn filter_request(&self, _req: &ClientRequest, _ctx: &FlowContext) -> Box<dyn HttpFilters> {
        Box::new(NoopFilters)
    }
}
