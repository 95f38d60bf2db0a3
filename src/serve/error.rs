/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::connect::TcpConnectError;
use crate::http::{HttpRequestParseError, HttpResponseParseError};

#[derive(Error, Debug)]
pub enum ServerTaskError {
    #[error("internal server error: {0}")]
    InternalServerError(&'static str),
    #[error("client authentication required")]
    ClientAuthRequired,
    #[error("invalid client protocol: {0}")]
    InvalidClientProtocol(&'static str),
    #[error("unimplemented protocol")]
    UnimplementedProtocol,
    #[error("tcp read from client: {0:?}")]
    ClientTcpReadFailed(io::Error),
    #[error("tcp write to client: {0:?}")]
    ClientTcpWriteFailed(io::Error),
    #[error("client app timeout: {0}")]
    ClientAppTimeout(&'static str),
    #[error("client tls handshake failed: {0:?}")]
    ClientTlsHandshakeFailed(io::Error),
    #[error("upstream not connected: {0}")]
    UpstreamNotConnected(TcpConnectError),
    #[error("invalid upstream protocol: {0}")]
    InvalidUpstreamProtocol(&'static str),
    #[error("read from upstream: {0:?}")]
    UpstreamReadFailed(io::Error),
    #[error("write to upstream: {0:?}")]
    UpstreamWriteFailed(io::Error),
    #[error("upstream tls handshake failed: {0}")]
    UpstreamTlsHandshakeFailed(TcpConnectError),
    #[error("upstream app timeout: {0}")]
    UpstreamAppTimeout(&'static str),
    #[error("closed by upstream")]
    ClosedByUpstream,
    #[error("closed by client")]
    ClosedByClient,
    #[error("closed early by client")]
    ClosedEarlyByClient,
    #[error("canceled as server quit")]
    CanceledAsServerQuit,
    #[error("idle after {0:?} x {1}")]
    Idle(Duration, usize),
    #[error("finished")]
    Finished, // this isn't an error, for log only
    #[error("unclassified error: {0:?}")]
    UnclassifiedError(#[from] anyhow::Error),
}

impl ServerTaskError {
    pub fn brief(&self) -> &'static str {
        match self {
            ServerTaskError::InternalServerError(_) => "InternalServerError",
            ServerTaskError::ClientAuthRequired => "ClientAuthRequired",
            ServerTaskError::InvalidClientProtocol(_) => "InvalidClientProtocol",
            ServerTaskError::UnimplementedProtocol => "UnimplementedProtocol",
            ServerTaskError::ClientTcpReadFailed(_) => "ClientTcpReadFailed",
            ServerTaskError::ClientTcpWriteFailed(_) => "ClientTcpWriteFailed",
            ServerTaskError::ClientAppTimeout(_) => "ClientAppTimeout",
            ServerTaskError::ClientTlsHandshakeFailed(_) => "ClientTlsHandshakeFailed",
            ServerTaskError::UpstreamNotConnected(_) => "UpstreamNotConnected",
            ServerTaskError::InvalidUpstreamProtocol(_) => "InvalidUpstreamProtocol",
            ServerTaskError::UpstreamReadFailed(_) => "UpstreamReadFailed",
            ServerTaskError::UpstreamWriteFailed(_) => "UpstreamWriteFailed",
            ServerTaskError::UpstreamTlsHandshakeFailed(_) => "UpstreamTlsHandshakeFailed",
            ServerTaskError::UpstreamAppTimeout(_) => "UpstreamAppTimeout",
            ServerTaskError::ClosedByUpstream => "ClosedByUpstream",
            ServerTaskError::ClosedByClient => "ClosedByClient",
            ServerTaskError::ClosedEarlyByClient => "ClosedEarlyByClient",
            ServerTaskError::CanceledAsServerQuit => "CanceledAsServerQuit",
            ServerTaskError::Idle(_, _) => "Idle",
            ServerTaskError::Finished => "Finished",
            ServerTaskError::UnclassifiedError(_) => "UnclassifiedError",
        }
    }
}

pub type ServerTaskResult<T> = Result<T, ServerTaskError>;

impl From<HttpRequestParseError> for ServerTaskError {
    fn from(e: HttpRequestParseError) -> ServerTaskError {
        match e {
            HttpRequestParseError::ClientClosed => ServerTaskError::ClosedEarlyByClient,
            HttpRequestParseError::TooLargeHeader(_) => {
                ServerTaskError::InvalidClientProtocol("too large header in client request")
            }
            HttpRequestParseError::UnsupportedMethod(_)
            | HttpRequestParseError::UnsupportedScheme => ServerTaskError::UnimplementedProtocol,
            HttpRequestParseError::IoFailed(e) => ServerTaskError::ClientTcpReadFailed(e),
            HttpRequestParseError::UnmatchedHostAndAuthority => {
                ServerTaskError::InvalidClientProtocol("host header doesn't match host in uri")
            }
            _ => ServerTaskError::InvalidClientProtocol("invalid client request"),
        }
    }
}

impl From<HttpResponseParseError> for ServerTaskError {
    fn from(e: HttpResponseParseError) -> ServerTaskError {
        match e {
            HttpResponseParseError::RemoteClosed => ServerTaskError::ClosedByUpstream,
            HttpResponseParseError::TooLargeHeader(_) => {
                ServerTaskError::InvalidUpstreamProtocol("too large header in remote response")
            }
            HttpResponseParseError::IoFailed(e) => ServerTaskError::UpstreamReadFailed(e),
            _ => ServerTaskError::InvalidUpstreamProtocol("invalid remote response"),
        }
    }
}

impl From<TcpConnectError> for ServerTaskError {
    fn from(e: TcpConnectError) -> ServerTaskError {
        match e {
            TcpConnectError::TlsHandshakeTimeout | TcpConnectError::TlsHandshakeFailed(_) => {
                ServerTaskError::UpstreamTlsHandshakeFailed(e)
            }
            _ => ServerTaskError::UpstreamNotConnected(e),
        }
    }
}
