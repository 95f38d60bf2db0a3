/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::io::Write;
use std::str::FromStr;

use bytes::BufMut;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Version};
use tokio::io::AsyncBufRead;

use crate::io::{LimitedBufReadExt, LineReadResult};

use super::header::write_connection_header;
use super::{HttpBodyType, HttpHeaderLine, HttpLineParseError, HttpStatusLine};
use super::HttpResponseParseError;

/// A parsed upstream response head.
pub struct RemoteResponse {
    pub version: Version,
    pub code: u16,
    pub reason: String,
    pub end_to_end_headers: HeaderMap,
    pub hop_by_hop_headers: HeaderMap,
    /// full decoded body, present only in aggregated (buffered) mode
    pub body: Option<Vec<u8>>,
    original_connection_name: Option<String>,
    extra_connection_headers: Vec<HeaderName>,
    origin_header_size: usize,
    keep_alive: bool,
    upgrade: bool,
    content_length: u64,
    chunked_transfer: bool,
    chunked_with_trailer: bool,
    has_transfer_encoding: bool,
    has_content_length: bool,
    has_trailer: bool,
    has_keep_alive: bool,
}

impl RemoteResponse {
    fn new(version: Version, code: u16, reason: String) -> Self {
        RemoteResponse {
            version,
            code,
            reason,
            end_to_end_headers: HeaderMap::new(),
            hop_by_hop_headers: HeaderMap::new(),
            body: None,
            original_connection_name: None,
            extra_connection_headers: Vec::new(),
            origin_header_size: 0,
            keep_alive: false,
            upgrade: false,
            content_length: 0,
            chunked_transfer: false,
            chunked_with_trailer: false,
            has_transfer_encoding: false,
            has_content_length: false,
            has_trailer: false,
            has_keep_alive: false,
        }
    }

    #[inline]
    pub fn origin_header_size(&self) -> usize {
        self.origin_header_size
    }

    #[inline]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline]
    pub fn is_upgrade(&self) -> bool {
        self.upgrade && self.code == 101
    }

    /// Force the connection signal written toward the client, independent
    /// of what the upstream answered.
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        if keep_alive {
            self.keep_alive = true;
        } else {
            self.set_no_keep_alive();
        }
    }

    pub fn set_no_keep_alive(&mut self) {
        if self.has_keep_alive {
            self.hop_by_hop_headers
                .remove(HeaderName::from_static("keep-alive"));
            self.has_keep_alive = false;
        }
        self.keep_alive = false;
    }

    fn expect_no_body(&self, method: &Method) -> bool {
        self.code < 200 || self.code == 204 || self.code == 304 || method.eq(&Method::HEAD)
    }

    /// see RFC 7230 §3.3.3 for message body length rules
    pub fn body_type(&self, method: &Method) -> Option<HttpBodyType> {
        if self.expect_no_body(method) {
            None
        } else if self.chunked_transfer {
            if self.chunked_with_trailer {
                Some(HttpBodyType::ChunkedWithTrailer)
            } else {
                Some(HttpBodyType::Chunked)
            }
        } else if self.has_content_length {
            if self.content_length > 0 {
                Some(HttpBodyType::ContentLength(self.content_length))
            } else {
                None
            }
        } else {
            Some(HttpBodyType::ReadUntilEnd)
        }
    }

    /// Re-frame a close-delimited body as chunked toward the client.
    pub fn set_chunked_transfer(&mut self) {
        if self.chunked_transfer {
            return;
        }
        self.chunked_transfer = true;
        self.chunked_with_trailer = false;
        self.end_to_end_headers.remove(header::CONTENT_LENGTH);
        self.has_content_length = false;
        self.hop_by_hop_headers.insert(
            header::TRANSFER_ENCODING,
            HeaderValue::from_static("chunked"),
        );
    }

    /// Replace the streamed body with a fully buffered one and fix framing
    /// headers so the client sees an exact `Content-Length`.
    pub fn set_aggregated_body(&mut self, body: Vec<u8>) {
        self.hop_by_hop_headers.remove(header::TRANSFER_ENCODING);
        self.hop_by_hop_headers.remove(header::TRAILER);
        self.chunked_transfer = false;
        self.chunked_with_trailer = false;
        self.has_trailer = false;
        self.content_length = body.len() as u64;
        self.has_content_length = true;
        let value = HeaderValue::from_str(&body.len().to_string()).unwrap();
        self.end_to_end_headers
            .insert(header::CONTENT_LENGTH, value);
        self.body = Some(body);
    }

    pub async fn parse<R>(
        reader: &mut R,
        method: &Method,
        keep_alive: bool,
        max_header_size: usize,
    ) -> Result<Self, HttpResponseParseError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line_buf = Vec::<u8>::with_capacity(1024);
        let mut header_size: usize = 0;

        match reader
            .limited_read_until(b'\n', max_header_size, &mut line_buf)
            .await?
        {
            LineReadResult::Line(nr) => header_size += nr,
            LineReadResult::EndOfStream(_) => {
                return Err(HttpResponseParseError::RemoteClosed);
            }
            LineReadResult::LimitReached(_) => {
                return Err(HttpResponseParseError::TooLargeHeader(max_header_size));
            }
        }

        let mut rsp = RemoteResponse::build_from_status_line(line_buf.as_ref())?;
        rsp.keep_alive = keep_alive;

        loop {
            if header_size >= max_header_size {
                return Err(HttpResponseParseError::TooLargeHeader(max_header_size));
            }
            line_buf.clear();
            let max_len = max_header_size - header_size;
            match reader
                .limited_read_until(b'\n', max_len, &mut line_buf)
                .await?
            {
                LineReadResult::Line(nr) => header_size += nr,
                LineReadResult::EndOfStream(_) => {
                    return Err(HttpResponseParseError::RemoteClosed);
                }
                LineReadResult::LimitReached(_) => {
                    return Err(HttpResponseParseError::TooLargeHeader(max_header_size));
                }
            }
            if (line_buf.len() == 1 && line_buf[0] == b'\n')
                || (line_buf.len() == 2 && line_buf[0] == b'\r' && line_buf[1] == b'\n')
            {
                // header end line
                break;
            }

            rsp.parse_header_line(line_buf.as_ref())?;
        }
        rsp.origin_header_size = header_size;

        rsp.post_check_and_fix(method);
        Ok(rsp)
    }

    /// do some necessary check and fix
    fn post_check_and_fix(&mut self, method: &Method) {
        if !self.chunked_transfer {
            if self.has_trailer {
                self.hop_by_hop_headers.remove(header::TRAILER);
            }

            if self.expect_no_body(method) {
                // no content-length check as no body is expected
            } else if !self.has_content_length {
                // read to end and close the connection
                self.keep_alive = false;
            }
        }

        // headers named in the Connection list are connection-scoped and die
        // at this hop, except the upgrade pair which is brokered through
        let mut retained = Vec::new();
        for name in self.extra_connection_headers.drain(..) {
            if name.as_str() == "upgrade" {
                retained.push(name);
                continue;
            }
            self.end_to_end_headers.remove(&name);
            self.hop_by_hop_headers.remove(&name);
        }
        self.extra_connection_headers = retained;
    }

    fn build_from_status_line(line_buf: &[u8]) -> Result<Self, HttpResponseParseError> {
        let rsp =
            HttpStatusLine::parse(line_buf).map_err(HttpResponseParseError::InvalidStatusLine)?;
        let version = match rsp.version {
            0 => Version::HTTP_10,
            1 => Version::HTTP_11,
            2 => return Err(HttpResponseParseError::InvalidVersion(Version::HTTP_2)),
            _ => unreachable!(),
        };

        Ok(RemoteResponse::new(
            version,
            rsp.code,
            rsp.reason.to_string(),
        ))
    }

    fn parse_header_line(&mut self, line_buf: &[u8]) -> Result<(), HttpResponseParseError> {
        let header =
            HttpHeaderLine::parse(line_buf).map_err(HttpResponseParseError::InvalidHeaderLine)?;
        self.handle_header(header)
    }

    fn insert_hop_by_hop_header(
        &mut self,
        name: HeaderName,
        value: &str,
    ) -> Result<(), HttpResponseParseError> {
        let value = HeaderValue::from_str(value).map_err(|_| {
            HttpResponseParseError::InvalidHeaderLine(HttpLineParseError::InvalidHeaderValue)
        })?;
        self.hop_by_hop_headers.append(name, value);
        Ok(())
    }

    fn handle_header(&mut self, header: HttpHeaderLine) -> Result<(), HttpResponseParseError> {
        let name = HeaderName::from_str(header.name).map_err(|_| {
            HttpResponseParseError::InvalidHeaderLine(HttpLineParseError::InvalidHeaderName)
        })?;

        match name.as_str() {
            "connection" | "proxy-connection" => {
                // proxy-connection is not standard, but at least curl use it
                let value = header.value.to_lowercase();

                for v in value.as_str().split(',') {
                    if v.is_empty() {
                        continue;
                    }

                    match v.trim() {
                        "keep-alive" => {
                            // keep the original value from the request
                        }
                        "close" => {
                            self.keep_alive = false;
                        }
                        "upgrade" => {
                            self.upgrade = true;
                            self.extra_connection_headers
                                .push(HeaderName::from_static("upgrade"));
                        }
                        s => {
                            if let Ok(h) = HeaderName::from_str(s) {
                                self.extra_connection_headers.push(h);
                            }
                        }
                    }
                }

                self.original_connection_name = Some(header.name.to_string());
                return Ok(());
            }
            "upgrade" => {
                return self.insert_hop_by_hop_header(name, header.value);
            }
            "keep-alive" => {
                // just pass
                self.has_keep_alive = true;
                return self.insert_hop_by_hop_header(name, header.value);
            }
            "proxy-authenticate" => {
                // hop-by-hop, never forwarded to the client
                return Ok(());
            }
            "trailer" => {
                self.has_trailer = true;
                if self.chunked_transfer {
                    self.chunked_with_trailer = true;
                }
                return self.insert_hop_by_hop_header(name, header.value);
            }
            "transfer-encoding" => {
                // it's a hop-by-hop option, but we just pass it
                self.has_transfer_encoding = true;
                if self.has_content_length {
                    // delete content-length
                    self.end_to_end_headers.remove(header::CONTENT_LENGTH);
                    self.content_length = 0;
                    self.keep_alive = false; // according to rfc9112 Section 6.1
                }

                let v = header.value.to_lowercase();
                if v.ends_with("chunked") {
                    self.chunked_transfer = true;
                    if self.has_trailer {
                        self.chunked_with_trailer = true;
                    }
                } else if v.contains("chunked") {
                    return Err(HttpResponseParseError::InvalidChunkedTransferEncoding);
                }

                return self.insert_hop_by_hop_header(name, header.value);
            }
            "content-length" => {
                if self.has_transfer_encoding {
                    // ignore content-length
                    self.keep_alive = false; // according to rfc9112 Section 6.1
                    return Ok(());
                }

                let content_length = u64::from_str(header.value)
                    .map_err(|_| HttpResponseParseError::InvalidContentLength)?;

                if self.has_content_length && self.content_length != content_length {
                    return Err(HttpResponseParseError::InvalidContentLength);
                }
                self.has_content_length = true;
                self.content_length = content_length;
            }
            _ => {}
        }

        let value = HeaderValue::from_str(header.value).map_err(|_| {
            HttpResponseParseError::InvalidHeaderLine(HttpLineParseError::InvalidHeaderValue)
        })?;
        self.end_to_end_headers.append(name, value);
        Ok(())
    }

    pub fn serialize(&self) -> Vec<u8> {
        const RESERVED_LEN_FOR_EXTRA_HEADERS: usize = 256;
        let mut buf =
            Vec::<u8>::with_capacity(self.origin_header_size + RESERVED_LEN_FOR_EXTRA_HEADERS);
        self.serialize_to(&mut buf);
        buf
    }

    pub fn serialize_to(&self, buf: &mut Vec<u8>) {
        let _ = write!(buf, "{:?} {} {}\r\n", self.version, self.code, self.reason);
        for (name, value) in self.end_to_end_headers.iter() {
            buf.put_slice(name.as_ref());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        for (name, value) in self.hop_by_hop_headers.iter() {
            buf.put_slice(name.as_ref());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }

        if self.is_upgrade() {
            buf.put_slice(b"Connection: Upgrade\r\n");
        } else {
            write_connection_header(
                self.original_connection_name.as_deref(),
                !self.keep_alive,
                &self.extra_connection_headers,
                buf,
            );
        }
        buf.put_slice(b"\r\n");
    }
}
