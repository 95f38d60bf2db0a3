/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;

use crate::http::{ClientRequest, RemoteResponse};
use crate::serve::{FlowContext, FullFlowContext};

/// Observation hooks invoked synchronously on the connection's worker.
///
/// Hooks must not block. Teardown ordering is best effort: on abort,
/// `client_disconnected` may arrive before `response_sent_to_client`.
#[allow(unused_variables)]
pub trait ActivityTracker: Send + Sync {
    fn client_connected(&self, ctx: &FlowContext) {}
    fn client_ssl_handshake_succeeded(&self, ctx: &FlowContext) {}
    fn request_received_from_client(&self, ctx: &FlowContext, req: &ClientRequest) {}
    fn request_sent_to_server(&self, ctx: &FullFlowContext, req: &ClientRequest) {}
    fn response_received_from_server(&self, ctx: &FullFlowContext, rsp: &RemoteResponse) {}
    fn response_sent_to_client(&self, ctx: &FlowContext, rsp: &RemoteResponse) {}
    fn client_disconnected(&self, ctx: &FlowContext) {}
    fn bytes_received_from_client(&self, ctx: &FlowContext, size: u64) {}
    fn bytes_sent_to_server(&self, ctx: &FullFlowContext, size: u64) {}
    fn bytes_received_from_server(&self, ctx: &FullFlowContext, size: u64) {}
    fn bytes_sent_to_client(&self, ctx: &FlowContext, size: u64) {}
}

/// Fan-out wrapper over the proxy's tracker collection.
#[derive(Clone, Default)]
pub struct ActivityTrackers {
    inner: Arc<Vec<Arc<dyn ActivityTracker>>>,
}

impl ActivityTrackers {
    pub fn new(trackers: Vec<Arc<dyn ActivityTracker>>) -> Self {
        ActivityTrackers {
            inner: Arc::new(trackers),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn client_connected(&self, ctx: &FlowContext) {
        for t in self.inner.iter() {
            t.client_connected(ctx);
        }
    }

    pub fn client_ssl_handshake_succeeded(&self, ctx: &FlowContext) {
        for t in self.inner.iter() {
            t.client_ssl_handshake_succeeded(ctx);
        }
    }

    pub fn request_received_from_client(&self, ctx: &FlowContext, req: &ClientRequest) {
        for t in self.inner.iter() {
            t.request_received_from_client(ctx, req);
        }
    }

    pub fn request_sent_to_server(&self, ctx: &FullFlowContext, req: &ClientRequest) {
        for t in self.inner.iter() {
            t.request_sent_to_server(ctx, req);
        }
    }

    pub fn response_received_from_server(&self, ctx: &FullFlowContext, rsp: &RemoteResponse) {
        for t in self.inner.iter() {
            t.response_received_from_server(ctx, rsp);
        }
    }

    pub fn response_sent_to_client(&self, ctx: &FlowContext, rsp: &RemoteResponse) {
        for t in self.inner.iter() {
            t.response_sent_to_client(ctx, rsp);
        }
    }

    pub fn client_disconnected(&self, ctx: &FlowContext) {
        for t in self.inner.iter() {
            t.client_disconnected(ctx);
        }
    }

    pub fn bytes_received_from_client(&self, ctx: &FlowContext, size: u64) {
        for t in self.inner.iter() {
            t.bytes_received_from_client(ctx, size);
        }
    }

    pub fn bytes_sent_to_server(&self, ctx: &FullFlowContext, size: u64) {
        for t in self.inner.iter() {
            t.bytes_sent_to_server(ctx, size);
        }
    }

    pub fn bytes_received_from_server(&self, ctx: &FullFlowContext, size: u64) {
        for t in self.inner.iter() {
            t.bytes_received_from_server(ctx, size);
        }
    }

    pub fn bytes_sent_to_client(&self, ctx: &FlowContext, size: u64) {
        for t in self.inner.iter() {
            t.bytes_sent_to_client(ctx, size);
        }
    }
}
