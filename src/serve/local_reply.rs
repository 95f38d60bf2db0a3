/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use http::{HeaderValue, StatusCode, Version};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::connect::TcpConnectError;
use crate::filter::LocalResponse;
use crate::http::HttpRequestParseError;

use super::ServerTaskError;

/// Locally generated replies for error paths and CONNECT acknowledgement.
///
/// Bodies are short plaintext; the status line carries the standard reason
/// phrase.
pub(crate) struct HttpLocalReply {
    response: LocalResponse,
}

impl HttpLocalReply {
    fn new(status: StatusCode, body: &str, close: bool) -> Self {
        let mut response = LocalResponse::with_body(status, body);
        response.close_connection = close;
        if !body.is_empty() {
            response.headers.insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain"),
            );
        }
        HttpLocalReply { response }
    }

    pub(crate) fn from_local_response(response: LocalResponse) -> Self {
        HttpLocalReply { response }
    }

    pub(crate) fn bad_request(close: bool) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad request\n", close)
    }

    pub(crate) fn payload_too_large() -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, "request body too large\n", true)
    }

    pub(crate) fn auth_required(realm: &str) -> Self {
        // the connection stays open for the client to retry with credentials
        let mut reply = Self::new(
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            "proxy authentication required\n",
            false,
        );
        if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{realm}\"")) {
            reply
                .response
                .headers
                .insert(http::header::PROXY_AUTHENTICATE, value);
        }
        reply
    }

    pub(crate) fn bad_gateway(reason: &str) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, reason, true)
    }

    pub(crate) fn gateway_timeout() -> Self {
        Self::new(
            StatusCode::GATEWAY_TIMEOUT,
            "timed out waiting for upstream\n",
            true,
        )
    }

    pub(crate) fn from_request_parse_error(e: &HttpRequestParseError) -> Option<Self> {
        e.status_code()
            .map(|status| Self::new(status, "invalid request\n", true))
    }

    pub(crate) fn from_connect_error(e: &TcpConnectError) -> Self {
        match e {
            TcpConnectError::TimeoutByRule => Self::gateway_timeout(),
            _ => Self::bad_gateway("failed to connect to upstream\n"),
        }
    }

    pub(crate) fn from_task_error(e: &ServerTaskError) -> Option<Self> {
        match e {
            ServerTaskError::UpstreamNotConnected(e) => Some(Self::from_connect_error(e)),
            ServerTaskError::UpstreamTlsHandshakeFailed(_) => {
                Some(Self::bad_gateway("upstream tls handshake failed\n"))
            }
            ServerTaskError::UpstreamAppTimeout(_) => Some(Self::gateway_timeout()),
            ServerTaskError::ClosedByUpstream
            | ServerTaskError::UpstreamReadFailed(_)
            | ServerTaskError::InvalidUpstreamProtocol(_) => {
                Some(Self::bad_gateway("invalid response from upstream\n"))
            }
            ServerTaskError::UpstreamWriteFailed(_) => {
                Some(Self::bad_gateway("failed to send request to upstream\n"))
            }
            ServerTaskError::InternalServerError(_) => Some(Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error\n",
                true,
            )),
            _ => None,
        }
    }

    pub(crate) fn should_close(&self) -> bool {
        self.response.close_connection
    }

    pub(crate) fn status(&self) -> u16 {
        self.response.status.as_u16()
    }

    pub(crate) async fn reply<W>(&self, version: Version, clt_w: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let buf = self.response.serialize(version);
        clt_w.write_all(&buf).await?;
        clt_w.flush().await
    }

    /// CONNECT acknowledgement; carries neither body nor framing headers.
    pub(crate) async fn reply_connect_ok<W>(
        version: Version,
        clt_w: &mut W,
    ) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let buf = format!("{version:?} 200 Connection established\r\n\r\n");
        clt_w.write_all(buf.as_bytes()).await?;
        clt_w.flush().await
    }
}
