/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TcpConnectError {
    #[error("resolve failed: {0:?}")]
    ResolveFailed(io::Error),
    #[error("setup socket failed: {0:?}")]
    SetupSocketFailed(io::Error),
    #[error("connect failed: {0:?}")]
    ConnectFailed(io::Error),
    #[error("connect timed out")]
    TimeoutByRule,
    #[error("proxy protocol write failed: {0:?}")]
    ProxyProtocolWriteFailed(io::Error),
    #[error("chained proxy negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("chained proxy rejected with status {0}")]
    NegotiationRejected(u16),
    #[error("peer tls handshake timed out")]
    TlsHandshakeTimeout,
    #[error("peer tls handshake failed: {0:?}")]
    TlsHandshakeFailed(io::Error),
    #[error("no chain candidate usable")]
    NoCandidateUsable,
    #[error("internal server error: {0}")]
    InternalServerError(&'static str),
}

impl TcpConnectError {
    pub fn brief(&self) -> &'static str {
        match self {
            TcpConnectError::ResolveFailed(_) => "ResolveFailed",
            TcpConnectError::SetupSocketFailed(_) => "SetupSocketFailed",
            TcpConnectError::ConnectFailed(_) => "ConnectFailed",
            TcpConnectError::TimeoutByRule => "TimeoutByRule",
            TcpConnectError::ProxyProtocolWriteFailed(_) => "ProxyProtocolWriteFailed",
            TcpConnectError::NegotiationFailed(_) => "NegotiationFailed",
            TcpConnectError::NegotiationRejected(_) => "NegotiationRejected",
            TcpConnectError::TlsHandshakeTimeout => "TlsHandshakeTimeout",
            TcpConnectError::TlsHandshakeFailed(_) => "TlsHandshakeFailed",
            TcpConnectError::NoCandidateUsable => "NoCandidateUsable",
            TcpConnectError::InternalServerError(_) => "InternalServerError",
        }
    }
}
