/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! HTTP/1.x wire framing: heads, bodies and the header surgery a forwarding
//! proxy needs.

pub mod parse;
pub use parse::{
    HttpChunkedLine, HttpHeaderLine, HttpLineParseError, HttpMethodLine, HttpStatusLine,
};

mod error;
pub use error::{HttpRequestParseError, HttpResponseParseError};

pub mod header;
pub use header::HttpAuth;

mod request;
pub use request::ClientRequest;

mod response;
pub use response::RemoteResponse;

mod body;
pub use body::{HttpBodyDecodeReader, HttpBodyReader, StreamToChunkedTransfer};

/// How the message body of a parsed head is delimited on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpBodyType {
    ContentLength(u64),
    Chunked,
    ChunkedWithTrailer,
    ReadUntilEnd,
}
