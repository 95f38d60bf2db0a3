/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::io::{LimitedReaderStats, LimitedWriterStats};
use crate::tracker::ActivityTrackers;

use super::{FlowContext, FullFlowContext};

/// Per-proxy counters.
#[derive(Default)]
pub struct ServerStats {
    conn_total: AtomicU64,
    task_total: AtomicU64,
    alive_count: AtomicI32,
    reused_server_conn: AtomicU64,
    clt_read_bytes: AtomicU64,
    clt_write_bytes: AtomicU64,
    ups_read_bytes: AtomicU64,
    ups_write_bytes: AtomicU64,
}

impl ServerStats {
    pub fn add_conn(&self) {
        self.conn_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conn_total(&self) -> u64 {
        self.conn_total.load(Ordering::Relaxed)
    }

    pub fn add_task(&self) {
        self.task_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_total(&self) -> u64 {
        self.task_total.load(Ordering::Relaxed)
    }

    pub fn inc_alive_conn(&self) {
        self.alive_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_alive_conn(&self) {
        self.alive_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn alive_count(&self) -> i32 {
        self.alive_count.load(Ordering::Relaxed)
    }

    pub fn add_reused_server_conn(&self) {
        self.reused_server_conn.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reused_server_conn(&self) -> u64 {
        self.reused_server_conn.load(Ordering::Relaxed)
    }

    pub fn add_clt_read_bytes(&self, size: u64) {
        self.clt_read_bytes.fetch_add(size, Ordering::Relaxed);
    }

    pub fn add_clt_write_bytes(&self, size: u64) {
        self.clt_write_bytes.fetch_add(size, Ordering::Relaxed);
    }

    pub fn add_ups_read_bytes(&self, size: u64) {
        self.ups_read_bytes.fetch_add(size, Ordering::Relaxed);
    }

    pub fn add_ups_write_bytes(&self, size: u64) {
        self.ups_write_bytes.fetch_add(size, Ordering::Relaxed);
    }
}

/// Feeds client-side read bytes to both the proxy counters and the
/// tracker fan-out.
pub(crate) struct CltReadWrapperStats {
    server_stats: Arc<ServerStats>,
    trackers: ActivityTrackers,
    flow: FlowContext,
}

impl CltReadWrapperStats {
    pub(crate) fn new(
        server_stats: &Arc<ServerStats>,
        trackers: &ActivityTrackers,
        flow: &FlowContext,
    ) -> Arc<Self> {
        Arc::new(CltReadWrapperStats {
            server_stats: Arc::clone(server_stats),
            trackers: trackers.clone(),
            flow: flow.clone(),
        })
    }
}

impl LimitedReaderStats for CltReadWrapperStats {
    fn add_read_bytes(&self, size: usize) {
        if size == 0 {
            return;
        }
        self.server_stats.add_clt_read_bytes(size as u64);
        self.trackers
            .bytes_received_from_client(&self.flow, size as u64);
    }
}

pub(crate) struct CltWriteWrapperStats {
    server_stats: Arc<ServerStats>,
    trackers: ActivityTrackers,
    flow: FlowContext,
}

impl CltWriteWrapperStats {
    pub(crate) fn new(
        server_stats: &Arc<ServerStats>,
        trackers: &ActivityTrackers,
        flow: &FlowContext,
    ) -> Arc<Self> {
        Arc::new(CltWriteWrapperStats {
            server_stats: Arc::clone(server_stats),
            trackers: trackers.clone(),
            flow: flow.clone(),
        })
    }
}

impl LimitedWriterStats for CltWriteWrapperStats {
    fn add_write_bytes(&self, size: usize) {
        if size == 0 {
            return;
        }
        self.server_stats.add_clt_write_bytes(size as u64);
        self.trackers.bytes_sent_to_client(&self.flow, size as u64);
    }
}

pub(crate) struct UpsReadWrapperStats {
    server_stats: Arc<ServerStats>,
    trackers: ActivityTrackers,
    ctx: FullFlowContext,
}

impl UpsReadWrapperStats {
    pub(crate) fn new(
        server_stats: &Arc<ServerStats>,
        trackers: &ActivityTrackers,
        ctx: &FullFlowContext,
    ) -> Arc<Self> {
        Arc::new(UpsReadWrapperStats {
            server_stats: Arc::clone(server_stats),
            trackers: trackers.clone(),
            ctx: ctx.clone(),
        })
    }
}

impl LimitedReaderStats for UpsReadWrapperStats {
    fn add_read_bytes(&self, size: usize) {
        if size == 0 {
            return;
        }
        self.server_stats.add_ups_read_bytes(size as u64);
        self.trackers
            .bytes_received_from_server(&self.ctx, size as u64);
    }
}

pub(crate) struct UpsWriteWrapperStats {
    server_stats: Arc<ServerStats>,
    trackers: ActivityTrackers,
    ctx: FullFlowContext,
}

impl UpsWriteWrapperStats {
    pub(crate) fn new(
        server_stats: &Arc<ServerStats>,
        trackers: &ActivityTrackers,
        ctx: &FullFlowContext,
    ) -> Arc<Self> {
        Arc::new(UpsWriteWrapperStats {
            server_stats: Arc::clone(server_stats),
            trackers: trackers.clone(),
            ctx: ctx.clone(),
        })
    }
}

impl LimitedWriterStats for UpsWriteWrapperStats {
    fn add_write_bytes(&self, size: usize) {
        if size == 0 {
            return;
        }
        self.server_stats.add_ups_write_bytes(size as u64);
        self.trackers.bytes_sent_to_server(&self.ctx, size as u64);
    }
}
