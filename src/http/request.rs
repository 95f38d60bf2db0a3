/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::io::Write;
use std::str::FromStr;

use bytes::BufMut;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};
use tokio::io::AsyncBufRead;

use crate::io::{LimitedBufReadExt, LineReadResult};
use crate::types::UpstreamAddr;

use super::header::{write_connection_header, HttpAuth};
use super::{HttpBodyType, HttpHeaderLine, HttpLineParseError, HttpMethodLine};
use super::HttpRequestParseError;

/// A parsed client request head.
///
/// End-to-end headers are kept apart from hop-by-hop ones so that serializing
/// for the next hop never leaks connection-scoped headers. Credentials from
/// `Proxy-Authorization` are consumed into `auth_info` and never forwarded.
pub struct ClientRequest {
    pub version: Version,
    pub method: Method,
    pub uri: Uri,
    pub end_to_end_headers: HeaderMap,
    pub hop_by_hop_headers: HeaderMap,
    pub auth_info: HttpAuth,
    /// the port may be 0
    pub host: Option<UpstreamAddr>,
    /// full decoded body, present only in aggregated (buffered) mode
    pub body: Option<Vec<u8>>,
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
}

impl ClientRequest {
    fn new(method: Method, uri: Uri, version: Version) -> Self {
        ClientRequest {
            version,
            method,
            uri,
            end_to_end_headers: HeaderMap::new(),
            hop_by_hop_headers: HeaderMap::new(),
            auth_info: HttpAuth::None,
            host: None,
            body: None,
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
        }
    }

    #[inline]
    pub fn origin_header_size(&self) -> usize {
        self.origin_header_size
    }

    #[inline]
    pub fn disable_keep_alive(&mut self) {
        self.keep_alive = false;
    }

    #[inline]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline]
    pub fn is_upgrade(&self) -> bool {
        self.upgrade
    }

    pub fn body_type(&self) -> Option<HttpBodyType> {
        if self.chunked_transfer {
            if self.chunked_with_trailer {
                Some(HttpBodyType::ChunkedWithTrailer)
            } else {
                Some(HttpBodyType::Chunked)
            }
        } else if self.content_length > 0 {
            Some(HttpBodyType::ContentLength(self.content_length))
        } else {
            None
        }
    }

    pub fn has_auth_info(&self) -> bool {
        !matches!(self.auth_info, HttpAuth::None)
    }

    /// Re-frame a streamed body as chunked toward the next hop, used when
    /// content filters may change the payload length.
    pub fn set_chunked_transfer(&mut self) {
        if self.chunked_transfer {
            return;
        }
        self.chunked_transfer = true;
        self.chunked_with_trailer = false;
        self.end_to_end_headers.remove(header::CONTENT_LENGTH);
        self.content_length = 0;
        self.has_content_length = false;
        self.hop_by_hop_headers.insert(
            header::TRANSFER_ENCODING,
            HeaderValue::from_static("chunked"),
        );
    }

    /// Replace the streamed body with a fully buffered one and fix framing
    /// headers so the next hop sees an exact `Content-Length`.
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
        max_initial_line_length: usize,
        max_header_size: usize,
        version: &mut Version,
    ) -> Result<Self, HttpRequestParseError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line_buf = Vec::<u8>::with_capacity(1024);
        let mut header_size: usize = 0;

        match reader
            .limited_read_until(b'\n', max_initial_line_length, &mut line_buf)
            .await?
        {
            LineReadResult::Line(nr) => header_size += nr,
            LineReadResult::EndOfStream(_) => {
                return Err(HttpRequestParseError::ClientClosed);
            }
            LineReadResult::LimitReached(_) => {
                return Err(HttpRequestParseError::TooLargeHeader(
                    max_initial_line_length,
                ));
            }
        }

        let mut req = ClientRequest::build_from_method_line(line_buf.as_ref())?;
        match req.version {
            Version::HTTP_10 => req.keep_alive = false,
            Version::HTTP_11 => req.keep_alive = true,
            _ => unreachable!(),
        }
        *version = req.version; // always set version in case of error

        loop {
            if header_size >= max_header_size {
                return Err(HttpRequestParseError::TooLargeHeader(max_header_size));
            }
            line_buf.clear();
            let max_len = max_header_size - header_size;
            match reader
                .limited_read_until(b'\n', max_len, &mut line_buf)
                .await?
            {
                LineReadResult::Line(nr) => header_size += nr,
                LineReadResult::EndOfStream(_) => {
                    return Err(HttpRequestParseError::ClientClosed);
                }
                LineReadResult::LimitReached(_) => {
                    return Err(HttpRequestParseError::TooLargeHeader(max_header_size));
                }
            }
            if (line_buf.len() == 1 && line_buf[0] == b'\n')
                || (line_buf.len() == 2 && line_buf[0] == b'\r' && line_buf[1] == b'\n')
            {
                // header end line
                break;
            }

            req.parse_header_line(line_buf.as_ref())?;
        }
        req.origin_header_size = header_size;

        req.post_check_and_fix();
        Ok(req)
    }

    /// do some necessary check and fix
    fn post_check_and_fix(&mut self) {
        if self.has_trailer && !self.chunked_transfer {
            self.hop_by_hop_headers.remove(header::TRAILER);
        }
        if self.upgrade && !self.hop_by_hop_headers.contains_key(header::UPGRADE) {
            self.upgrade = false;
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

    fn build_from_method_line(line_buf: &[u8]) -> Result<Self, HttpRequestParseError> {
        let req =
            HttpMethodLine::parse(line_buf).map_err(HttpRequestParseError::InvalidMethodLine)?;

        let version = match req.version {
            0 => Version::HTTP_10,
            1 => Version::HTTP_11,
            2 => return Err(HttpRequestParseError::UnsupportedVersion(Version::HTTP_2)),
            _ => unreachable!(),
        };

        let method = Method::from_str(req.method)
            .map_err(|_| HttpRequestParseError::UnsupportedMethod(req.method.to_string()))?;
        let uri =
            Uri::from_str(req.uri).map_err(|_| HttpRequestParseError::InvalidRequestTarget)?;
        Ok(ClientRequest::new(method, uri, version))
    }

    fn parse_header_line(&mut self, line_buf: &[u8]) -> Result<(), HttpRequestParseError> {
        let header =
            HttpHeaderLine::parse(line_buf).map_err(HttpRequestParseError::InvalidHeaderLine)?;
        self.handle_header(header)
    }

    pub fn parse_header_connection(&mut self, value: &str) -> Result<(), HttpRequestParseError> {
        let value = value.to_lowercase();

        for v in value.as_str().split(',') {
            if v.is_empty() {
                continue;
            }

            match v.trim() {
                "keep-alive" => {
                    self.keep_alive = true;
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

        Ok(())
    }

    fn append_header(
        &mut self,
        name: HeaderName,
        value: &str,
    ) -> Result<(), HttpRequestParseError> {
        let value = HeaderValue::from_str(value).map_err(|_| {
            HttpRequestParseError::InvalidHeaderLine(HttpLineParseError::InvalidHeaderValue)
        })?;
        self.end_to_end_headers.append(name, value);
        Ok(())
    }

    fn insert_hop_by_hop_header(
        &mut self,
        name: HeaderName,
        value: &str,
    ) -> Result<(), HttpRequestParseError> {
        let value = HeaderValue::from_str(value).map_err(|_| {
            HttpRequestParseError::InvalidHeaderLine(HttpLineParseError::InvalidHeaderValue)
        })?;
        self.hop_by_hop_headers.append(name, value);
        Ok(())
    }

    fn handle_header(&mut self, header: HttpHeaderLine) -> Result<(), HttpRequestParseError> {
        let name = HeaderName::from_str(header.name).map_err(|_| {
            HttpRequestParseError::InvalidHeaderLine(HttpLineParseError::InvalidHeaderName)
        })?;

        match name.as_str() {
            "host" => {
                if self.host.is_some() {
                    return Err(HttpRequestParseError::InvalidHost);
                }
                if !header.value.is_empty() {
                    let host = UpstreamAddr::from_str(header.value)
                        .map_err(|_| HttpRequestParseError::InvalidHost)?;
                    // the default port is set later, once the scheme is known
                    self.host = Some(host);
                }
            }
            "connection" | "proxy-connection" => {
                // proxy-connection is not standard, but at least curl use it
                return self.parse_header_connection(header.value);
            }
            "keep-alive" => {
                // the client should not send this, just ignore it
                return Ok(());
            }
            "proxy-authorization" => {
                self.auth_info = HttpAuth::from_authorization(header.value)
                    .map_err(|_| HttpRequestParseError::UnsupportedAuthorization)?;
                return Ok(());
            }
            "proxy-authenticate" => {
                // never crosses this hop in either direction
                return Ok(());
            }
            "te" => {
                // hop-by-hop option, but let's pass it
                return self.insert_hop_by_hop_header(name, header.value);
            }
            "upgrade" => {
                return self.insert_hop_by_hop_header(name, header.value);
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
                } else {
                    return Err(HttpRequestParseError::InvalidChunkedTransferEncoding);
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
                    .map_err(|_| HttpRequestParseError::InvalidContentLength)?;

                if self.has_content_length && self.content_length != content_length {
                    return Err(HttpRequestParseError::InvalidContentLength);
                }
                self.has_content_length = true;
                self.content_length = content_length;
            }
            _ => {}
        }

        self.append_header(name, header.value)
    }

    fn write_request_target(&self, buf: &mut Vec<u8>) {
        if let Some(pa) = self.uri.path_and_query() {
            if self.method.eq(&Method::OPTIONS) && pa.query().is_none() && pa.path().eq("/") {
                let _ = write!(buf, "OPTIONS * {:?}\r\n", self.version);
            } else {
                let _ = write!(buf, "{} {} {:?}\r\n", self.method, pa, self.version);
            }
        } else if self.method.eq(&Method::OPTIONS) {
            let _ = write!(buf, "OPTIONS * {:?}\r\n", self.version);
        } else {
            let _ = write!(buf, "{} / {:?}\r\n", self.method, self.version);
        }
    }

    fn write_headers(&self, buf: &mut Vec<u8>) {
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
    }

    /// Serialize with an origin-form request target, for a direct hop.
    pub fn serialize_for_origin(&self) -> Vec<u8> {
        const RESERVED_LEN_FOR_EXTRA_HEADERS: usize = 256;
        let mut buf =
            Vec::<u8>::with_capacity(self.origin_header_size + RESERVED_LEN_FOR_EXTRA_HEADERS);
        self.write_request_target(&mut buf);
        self.write_headers(&mut buf);
        write_connection_header(
            None,
            !self.keep_alive,
            &self.extra_connection_headers,
            &mut buf,
        );
        buf.put_slice(b"\r\n");
        buf
    }

    /// Serialize with an absolute-form request target, for a chained proxy hop.
    pub fn serialize_for_proxy(&self, upstream: &UpstreamAddr) -> Vec<u8> {
        const RESERVED_LEN_FOR_EXTRA_HEADERS: usize = 256;
        let mut buf =
            Vec::<u8>::with_capacity(self.origin_header_size + RESERVED_LEN_FOR_EXTRA_HEADERS);
        let scheme = self.uri.scheme_str().unwrap_or("http");
        if let Some(pa) = self.uri.path_and_query() {
            let _ = write!(
                buf,
                "{} {}://{}{} {:?}\r\n",
                self.method, scheme, upstream, pa, self.version
            );
        } else {
            let _ = write!(
                buf,
                "{} {}://{}/ {:?}\r\n",
                self.method, scheme, upstream, self.version
            );
        }
        self.write_headers(&mut buf);
        write_connection_header(
            None,
            !self.keep_alive,
            &self.extra_connection_headers,
            &mut buf,
        );
        buf.put_slice(b"\r\n");
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{BufReader, Result};
    use tokio_util::io::StreamReader;

    #[tokio::test]
    async fn read_get() {
        let content = b"GET http://example.com/v/a/x HTTP/1.1\r\n\
            Host: example.com\r\n\
            Connection: Keep-Alive\r\n\
            Accept: */*\r\n\r\n";
        let stream = tokio_stream::iter(vec![Result::Ok(Bytes::from_static(content))]);
        let stream = StreamReader::new(stream);
        let mut buf_stream = BufReader::new(stream);
        let mut version = Version::HTTP_11;
        let request = ClientRequest::parse(&mut buf_stream, 8192, 16384, &mut version)
            .await
            .unwrap();
        assert_eq!(request.method, Method::GET);
        assert!(request.keep_alive());
        assert!(request.body_type().is_none());
        assert_eq!(request.uri.authority().unwrap().host(), "example.com");

        let result = ClientRequest::parse(&mut buf_stream, 8192, 16384, &mut version).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn connection_close() {
        let content = b"GET http://api.example.com/v1/files HTTP/1.1\r\n\
            Accept: application/json\r\n\
            host: api.example.com\r\n\
            Connection: close\r\n\r\n";
        let stream = tokio_stream::iter(vec![Result::Ok(Bytes::from_static(content))]);
        let stream = StreamReader::new(stream);
        let mut buf_stream = BufReader::new(stream);
        let mut version = Version::HTTP_11;
        let request = ClientRequest::parse(&mut buf_stream, 8192, 16384, &mut version)
            .await
            .unwrap();
        assert!(!request.keep_alive());
    }

    #[tokio::test]
    async fn proxy_auth_consumed() {
        let content = b"GET http://example.com/ HTTP/1.1\r\n\
            Host: example.com\r\n\
            Proxy-Authorization: Basic dXNlcjpwYXNz\r\n\
            Proxy-Authenticate: Basic realm=ignored\r\n\r\n";
        let stream = tokio_stream::iter(vec![Result::Ok(Bytes::from_static(content))]);
        let stream = StreamReader::new(stream);
        let mut buf_stream = BufReader::new(stream);
        let mut version = Version::HTTP_11;
        let request = ClientRequest::parse(&mut buf_stream, 8192, 16384, &mut version)
            .await
            .unwrap();
        assert!(request.has_auth_info());

        let serialized = request.serialize_for_origin();
        let text = std::str::from_utf8(&serialized).unwrap().to_lowercase();
        assert!(!text.contains("proxy-authorization"));
        assert!(!text.contains("proxy-authenticate"));
    }

    #[tokio::test]
    async fn chunked_body() {
        let content = b"POST http://example.com/up HTTP/1.1\r\n\
            Host: example.com\r\n\
            Transfer-Encoding: chunked\r\n\r\n";
        let stream = tokio_stream::iter(vec![Result::Ok(Bytes::from_static(content))]);
        let stream = StreamReader::new(stream);
        let mut buf_stream = BufReader::new(stream);
        let mut version = Version::HTTP_11;
        let request = ClientRequest::parse(&mut buf_stream, 8192, 16384, &mut version)
            .await
            .unwrap();
        assert_eq!(request.body_type(), Some(HttpBodyType::Chunked));
    }

    #[tokio::test]
    async fn upgrade_request() {
        let content = b"GET http://example.com/chat HTTP/1.1\r\n\
            Host: example.com\r\n\
            Connection: Upgrade\r\n\
            Upgrade: websocket\r\n\r\n";
        let stream = tokio_stream::iter(vec![Result::Ok(Bytes::from_static(content))]);
        let stream = StreamReader::new(stream);
        let mut buf_stream = BufReader::new(stream);
        let mut version = Version::HTTP_11;
        let request = ClientRequest::parse(&mut buf_stream, 8192, 16384, &mut version)
            .await
            .unwrap();
        assert!(request.is_upgrade());

        let serialized = request.serialize_for_origin();
        let text = std::str::from_utf8(&serialized).unwrap();
        assert!(text.contains("Upgrade: websocket\r\n") || text.contains("upgrade: websocket\r\n"));
        assert!(text.to_lowercase().contains("connection: keep-alive, upgrade"));
    }

    #[tokio::test]
    async fn connection_named_headers_are_dropped() {
        let content = b"GET http://example.com/ HTTP/1.1\r\n\
            Host: example.com\r\n\
            Connection: keep-alive, x-request-token\r\n\
            X-Request-Token: abc\r\n\
            X-Other: kept\r\n\r\n";
        let stream = tokio_stream::iter(vec![Result::Ok(Bytes::from_static(content))]);
        let stream = StreamReader::new(stream);
        let mut buf_stream = BufReader::new(stream);
        let mut version = Version::HTTP_11;
        let request = ClientRequest::parse(&mut buf_stream, 8192, 16384, &mut version)
            .await
            .unwrap();

        let serialized = request.serialize_for_origin();
        let text = std::str::from_utf8(&serialized).unwrap().to_lowercase();
        assert!(!text.contains("x-request-token"));
        assert!(text.contains("x-other: kept\r\n"));
    }

    #[tokio::test]
    async fn too_large_header() {
        let mut content = b"GET http://example.com/ HTTP/1.1\r\n".to_vec();
        content.extend_from_slice(b"X-Filler: ");
        content.extend_from_slice(&vec![b'a'; 4096]);
        content.extend_from_slice(b"\r\n\r\n");
        let stream = tokio_stream::iter(vec![Result::Ok(Bytes::from(content))]);
        let stream = StreamReader::new(stream);
        let mut buf_stream = BufReader::new(stream);
        let mut version = Version::HTTP_11;
        let result = ClientRequest::parse(&mut buf_stream, 8192, 1024, &mut version).await;
        match result {
            Err(HttpRequestParseError::TooLargeHeader(_)) => {}
            _ => panic!("expected too large header error"),
        }
    }
}
