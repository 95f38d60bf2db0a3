/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::net::SocketAddr;
use std::time::Duration;

use slog::{info, Logger};

use crate::serve::ServerTaskError;
use crate::types::UpstreamAddr;

const URI_LOG_MAX_CHARS: usize = 1024;

/// One structured line per forwarded request, written to the configured
/// task logger when the task ends.
pub(crate) struct TaskLogForHttpForward<'a> {
    pub(crate) connection_id: u64,
    pub(crate) client_addr: SocketAddr,
    pub(crate) upstream: &'a UpstreamAddr,
    pub(crate) method: &'a str,
    pub(crate) uri_len_capped: String,
    pub(crate) reused_connection: bool,
    pub(crate) origin_status: u16,
    pub(crate) rsp_status: u16,
    pub(crate) total_time: Duration,
}

impl TaskLogForHttpForward<'_> {
    pub(crate) fn log(&self, logger: &Logger, e: &ServerTaskError) {
        let mut uri = self.uri_len_capped.clone();
        if uri.len() > URI_LOG_MAX_CHARS {
            uri.truncate(URI_LOG_MAX_CHARS);
        }
        info!(logger, "{}", e.brief();
            "conn_id" => self.connection_id,
            "client" => %self.client_addr,
            "upstream" => %self.upstream,
            "method" => self.method,
            "uri" => uri,
            "reused_connection" => self.reused_connection,
            "origin_status" => self.origin_status,
            "rsp_status" => self.rsp_status,
            "total_time_ms" => self.total_time.as_millis() as u64,
        );
    }
}
