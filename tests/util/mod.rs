/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! In-process origin servers and a small blocking HTTP client, driving the
//! proxy over real sockets.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

pub const CLIENT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// What the scripted origin does with each request it reads.
#[derive(Clone, Copy)]
pub enum OriginMode {
    /// `200` with `Connection: close`, no `Content-Length`, body `Success!`
    CloseDelimited,
    /// `200` with `Content-Length: 8`, body `Success!`, keep-alive
    ContentLength,
    /// `200` with neither body nor framing headers
    EmptyOk,
    /// echo the received request head back as the response body
    EchoHead,
    /// read the request and never answer
    Hang,
}

/// Spawn a scripted origin on a loopback port. The listener thread serves
/// until the listener socket is dropped with the test.
pub fn spawn_origin(mode: OriginMode) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else {
                break;
            };
            std::thread::spawn(move || serve_origin_conn(stream, mode));
        }
    });
    addr
}

fn serve_origin_conn(stream: TcpStream, mode: OriginMode) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(30)));
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut stream = stream;
    loop {
        let Some(head) = read_head(&mut reader) else {
            return;
        };
        let body_len = content_length_of(&head);
        if body_len > 0 {
            let mut body = vec![0u8; body_len];
            if reader.read_exact(&mut body).is_err() {
                return;
            }
        }

        match mode {
            OriginMode::CloseDelimited => {
                let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nSuccess!");
                let _ = stream.flush();
                return;
            }
            OriginMode::ContentLength => {
                let _ = stream.write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\nConnection: keep-alive\r\n\r\nSuccess!",
                );
                let _ = stream.flush();
            }
            OriginMode::EmptyOk => {
                let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\n\r\n");
                let _ = stream.flush();
            }
            OriginMode::EchoHead => {
                let body = head.as_bytes();
                let rsp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(rsp.as_bytes());
                let _ = stream.write_all(body);
                let _ = stream.flush();
            }
            OriginMode::Hang => {
                std::thread::sleep(Duration::from_secs(30));
                return;
            }
        }
    }
}

fn read_head<R: BufRead>(reader: &mut R) -> Option<String> {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => return None,
            Ok(_) => {}
            Err(_) => return None,
        }
        if line == "\r\n" || line == "\n" {
            return Some(head);
        }
        head.push_str(&line);
    }
}

fn content_length_of(head: &str) -> usize {
    for line in head.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                return value.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

/// A parsed client-side view of one HTTP response.
pub struct TestResponse {
    pub status: u16,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.first())
            .map(|s| s.as_str())
    }

    pub fn header_count(&self, name: &str) -> usize {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}

/// A blocking test client holding one connection to the proxy.
pub struct TestClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TestClient {
    pub fn connect(proxy: SocketAddr) -> Self {
        let stream = TcpStream::connect(proxy).unwrap();
        stream.set_read_timeout(Some(CLIENT_IO_TIMEOUT)).unwrap();
        stream.set_nodelay(true).unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        TestClient { stream, reader }
    }

    pub fn send_raw(&mut self, data: &[u8]) {
        self.stream.write_all(data).unwrap();
        self.stream.flush().unwrap();
    }

    /// Absolute-form request through the proxy.
    pub fn request(
        &mut self,
        method: &str,
        origin: SocketAddr,
        path: &str,
        extra_headers: &[&str],
    ) {
        let mut req = format!(
            "{method} http://{origin}{path} HTTP/1.1\r\nHost: {origin}\r\n"
        );
        for h in extra_headers {
            req.push_str(h);
            req.push_str("\r\n");
        }
        req.push_str("\r\n");
        self.send_raw(req.as_bytes());
    }

    pub fn read_response(&mut self, method: &str) -> TestResponse {
        let mut status_line = String::new();
        self.reader.read_line(&mut status_line).unwrap();
        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| panic!("bad status line: {status_line:?}"));

        let mut headers: HashMap<String, Vec<String>> = HashMap::new();
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            if line == "\r\n" || line == "\n" {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers
                    .entry(name.trim().to_ascii_lowercase())
                    .or_default()
                    .push(value.trim().to_string());
            }
        }

        let connect_ok = method == "CONNECT" && (200..300).contains(&status);
        let body = if method == "HEAD" || connect_ok || status == 204 || status == 304 {
            Vec::new()
        } else if headers
            .get("transfer-encoding")
            .map(|v| v.iter().any(|t| t.contains("chunked")))
            .unwrap_or(false)
        {
            self.read_chunked_body()
        } else if let Some(len) = headers
            .get("content-length")
            .and_then(|v| v.first())
            .and_then(|s| s.parse::<usize>().ok())
        {
            let mut body = vec![0u8; len];
            self.reader.read_exact(&mut body).unwrap();
            body
        } else {
            // close-delimited
            let mut body = Vec::new();
            let _ = self.reader.read_to_end(&mut body);
            body
        };

        TestResponse {
            status,
            headers,
            body,
        }
    }

    fn read_chunked_body(&mut self) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            let mut size_line = String::new();
            self.reader.read_line(&mut size_line).unwrap();
            let size = usize::from_str_radix(size_line.trim(), 16).unwrap();
            if size == 0 {
                let mut end = String::new();
                self.reader.read_line(&mut end).unwrap();
                return body;
            }
            let mut chunk = vec![0u8; size + 2];
            self.reader.read_exact(&mut chunk).unwrap();
            chunk.truncate(size);
            body.extend_from_slice(&chunk);
        }
    }

    /// Whether the proxy closed this connection.
    pub fn at_eof(&mut self) -> bool {
        let mut buf = [0u8; 1];
        match self.reader.read(&mut buf) {
            Ok(0) => true,
            Ok(_) => false,
            Err(_) => false,
        }
    }
}
