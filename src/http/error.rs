/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::io;

use http::{StatusCode, Version};
use thiserror::Error;

use super::HttpLineParseError;

#[derive(Debug, Error)]
pub enum HttpRequestParseError {
    #[error("client closed")]
    ClientClosed,
    #[error("too large header, should be less than {0}")]
    TooLargeHeader(usize),
    #[error("invalid method line: {0}")]
    InvalidMethodLine(HttpLineParseError),
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),
    #[error("unsupported version: {0:?}")]
    UnsupportedVersion(Version),
    #[error("invalid request target")]
    InvalidRequestTarget,
    #[error("unsupported scheme")]
    UnsupportedScheme,
    #[error("invalid header line: {0}")]
    InvalidHeaderLine(HttpLineParseError),
    #[error("invalid host header")]
    InvalidHost,
    #[error("unsupported (proxy) authorization")]
    UnsupportedAuthorization,
    #[error("origin-form request target not allowed")]
    OriginFormNotAllowed,
    #[error("unmatched host and authority")]
    UnmatchedHostAndAuthority,
    #[error("invalid chunked transfer-encoding")]
    InvalidChunkedTransferEncoding,
    #[error("invalid content length")]
    InvalidContentLength,
    #[error("io failed: {0:?}")]
    IoFailed(#[from] io::Error),
}

impl HttpRequestParseError {
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            HttpRequestParseError::IoFailed(_) | HttpRequestParseError::ClientClosed => None,
            HttpRequestParseError::TooLargeHeader(_) => {
                Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
            }
            HttpRequestParseError::UnsupportedMethod(_)
            | HttpRequestParseError::UnsupportedScheme => Some(StatusCode::NOT_IMPLEMENTED),
            HttpRequestParseError::UnmatchedHostAndAuthority => Some(StatusCode::CONFLICT),
            _ => Some(StatusCode::BAD_REQUEST),
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpResponseParseError {
    #[error("remote closed")]
    RemoteClosed,
    #[error("too large header, should be less than {0}")]
    TooLargeHeader(usize),
    #[error("invalid status line: {0}")]
    InvalidStatusLine(HttpLineParseError),
    #[error("invalid version: {0:?}")]
    InvalidVersion(Version),
    #[error("invalid header line: {0}")]
    InvalidHeaderLine(HttpLineParseError),
    #[error("invalid chunked transfer-encoding")]
    InvalidChunkedTransferEncoding,
    #[error("invalid content length")]
    InvalidContentLength,
    #[error("io failed: {0:?}")]
    IoFailed(#[from] io::Error),
}
