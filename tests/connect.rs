/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! CONNECT tunnels, chained-proxy fallback and PROXY protocol handling.

mod util;

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use interpose::connect::{ChainCandidate, ChainedProxy, ChainedProxyManager, TcpConnectError};
use interpose::filter::{HttpFilters, HttpFiltersSource, NoopFilters};
use interpose::http::ClientRequest;
use interpose::serve::FlowContext;
use interpose::ProxyConfigBuilder;

use util::{spawn_origin, OriginMode, TestClient};

#[test]
fn connect_tunnel_relays_opaque_bytes() {
    let origin = spawn_origin(OriginMode::ContentLength);
    let proxy = ProxyConfigBuilder::new()
        .with_name("connect-tunnel")
        .with_port(0)
        .start()
        .unwrap();

    let mut client = TestClient::connect(proxy.bound_address());
    client.send_raw(format!("CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes());
    let rsp = client.read_response("CONNECT");
    assert_eq!(rsp.status, 200);

    // inside the tunnel nothing is interpreted, send a plain origin-form
    // request straight to the origin
    client.send_raw(format!("GET /tunneled HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes());
    let rsp = client.read_response("GET");
    assert_eq!(rsp.status, 200);
    assert_eq!(rsp.body_str(), "Success!");

    proxy.abort();
}

#[test]
fn connect_failure_answers_502_and_keeps_the_connection() {
    // a port nothing listens on
    let dead = TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let origin = spawn_origin(OriginMode::ContentLength);
    let proxy = ProxyConfigBuilder::new()
        .with_name("connect-fail")
        .with_port(0)
        .start()
        .unwrap();

    let mut client = TestClient::connect(proxy.bound_address());
    client.send_raw(format!("CONNECT {dead_addr} HTTP/1.1\r\nHost: {dead_addr}\r\n\r\n").as_bytes());
    let rsp = client.read_response("CONNECT");
    assert_eq!(rsp.status, 502);

    // the connection is back to reading request heads
    client.request("GET", origin, "/", &[]);
    let rsp = client.read_response("GET");
    assert_eq!(rsp.status, 200);

    proxy.abort();
}

struct CountingChainedProxy {
    addr: SocketAddr,
    encrypted: bool,
    failed: AtomicUsize,
    succeeded: AtomicUsize,
}

impl CountingChainedProxy {
    fn new(addr: SocketAddr, encrypted: bool) -> Arc<Self> {
        Arc::new(CountingChainedProxy {
            addr,
            encrypted,
            failed: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
        })
    }
}

impl ChainedProxy for CountingChainedProxy {
    fn address(&self) -> SocketAddr {
        self.addr
    }

    fn requires_encryption(&self) -> bool {
        self.encrypted
    }

    fn tls_client_config(&self) -> Option<Arc<rustls::ClientConfig>> {
        if !self.encrypted {
            return None;
        }
        let roots = rustls::RootCertStore::empty();
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Some(Arc::new(config))
    }

    fn connection_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_failed(&self, _error: &TcpConnectError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

struct StaticChainManager {
    candidates: Vec<ChainCandidate>,
}

impl ChainedProxyManager for StaticChainManager {
    fn lookup_chained_proxies(
        &self,
        _req: &ClientRequest,
        _ctx: &FlowContext,
    ) -> Vec<ChainCandidate> {
        self.candidates.clone()
    }
}

/// Accepts and immediately closes, so a TLS handshake can never complete.
fn spawn_tls_refuser() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            drop(stream);
        }
    });
    addr
}

#[test]
fn chain_falls_back_across_candidates() {
    let origin = spawn_origin(OriginMode::ContentLength);

    // the third candidate is a real upstream proxy instance
    let chain_proxy = ProxyConfigBuilder::new()
        .with_name("chain-upstream")
        .with_port(0)
        .start()
        .unwrap();

    let refused1 = CountingChainedProxy::new(spawn_tls_refuser(), true);
    let refused2 = CountingChainedProxy::new(spawn_tls_refuser(), true);
    let good = CountingChainedProxy::new(chain_proxy.bound_address(), false);

    let manager = StaticChainManager {
        candidates: vec![
            ChainCandidate::Proxy(refused1.clone()),
            ChainCandidate::Proxy(refused2.clone()),
            ChainCandidate::Proxy(good.clone()),
        ],
    };

    let proxy = ProxyConfigBuilder::new()
        .with_name("chain-front")
        .with_port(0)
        .with_chained_proxy_manager(Arc::new(manager))
        .start()
        .unwrap();

    let mut client = TestClient::connect(proxy.bound_address());
    client.request("GET", origin, "/", &[]);
    let rsp = client.read_response("GET");
    assert_eq!(rsp.status, 200);
    assert_eq!(rsp.body_str(), "Success!");

    assert_eq!(refused1.failed.load(Ordering::Relaxed), 1);
    assert_eq!(refused1.succeeded.load(Ordering::Relaxed), 0);
    assert_eq!(refused2.failed.load(Ordering::Relaxed), 1);
    assert_eq!(refused2.succeeded.load(Ordering::Relaxed), 0);
    assert_eq!(good.failed.load(Ordering::Relaxed), 0);
    assert_eq!(good.succeeded.load(Ordering::Relaxed), 1);

    proxy.abort();
    chain_proxy.abort();
}

#[test]
fn chain_exhaustion_answers_502() {
    let origin = spawn_origin(OriginMode::ContentLength);
    let refused = CountingChainedProxy::new(spawn_tls_refuser(), true);
    let manager = StaticChainManager {
        candidates: vec![ChainCandidate::Proxy(refused.clone())],
    };

    let proxy = ProxyConfigBuilder::new()
        .with_name("chain-dead")
        .with_port(0)
        .with_chained_proxy_manager(Arc::new(manager))
        .start()
        .unwrap();

    let mut client = TestClient::connect(proxy.bound_address());
    client.request("GET", origin, "/", &[]);
    let rsp = client.read_response("GET");
    assert_eq!(rsp.status, 502);
    assert_eq!(refused.failed.load(Ordering::Relaxed), 1);

    proxy.abort();
}

#[test]
fn direct_fallback_after_refused_candidates() {
    let origin = spawn_origin(OriginMode::ContentLength);
    let refused = CountingChainedProxy::new(spawn_tls_refuser(), true);
    let manager = StaticChainManager {
        candidates: vec![
            ChainCandidate::Proxy(refused.clone()),
            ChainCandidate::Direct,
        ],
    };

    let proxy = ProxyConfigBuilder::new()
        .with_name("chain-direct")
        .with_port(0)
        .with_chained_proxy_manager(Arc::new(manager))
        .start()
        .unwrap();

    let mut client = TestClient::connect(proxy.bound_address());
    client.request("GET", origin, "/", &[]);
    let rsp = client.read_response("GET");
    assert_eq!(rsp.status, 200);
    assert_eq!(refused.failed.load(Ordering::Relaxed), 1);

    proxy.abort();
}

struct AddrRecordingSource {
    seen: Arc<Mutex<Vec<SocketAddr>>>,
}

impl HttpFiltersSource for AddrRecordingSource {
    fn filter_request(&self, _req: &ClientRequest, ctx: &FlowContext) -> Box<dyn HttpFilters> {
        self.seen.lock().unwrap().push(ctx.client_addr);
        Box::new(NoopFilters)
    }
}

/// Origin that answers 101 and then echoes raw bytes.
fn spawn_upgrade_echo_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            std::thread::spawn(move || {
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                loop {
                    let mut line = String::new();
                    match reader.read_line(&mut line) {
                        Ok(0) | Err(_) => return,
                        Ok(_) if line == "\r\n" || line == "\n" => break,
                        Ok(_) => {}
                    }
                }
                let mut stream = stream;
                let _ = stream.write_all(
                    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\n",
                );
                let _ = stream.flush();
                // echo everything that follows, draining whatever the head
                // reader buffered first
                use std::io::Read;
                let mut buf = [0u8; 1024];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[0..n]).is_err() {
                                return;
                            }
                            let _ = stream.flush();
                        }
                    }
                }
            });
        }
    });
    addr
}

#[test]
fn upgrade_response_switches_to_a_byte_relay() {
    let origin = spawn_upgrade_echo_origin();
    let proxy = ProxyConfigBuilder::new()
        .with_name("upgrade-test")
        .with_port(0)
        .start()
        .unwrap();

    let mut stream = std::net::TcpStream::connect(proxy.bound_address()).unwrap();
    stream
        .set_read_timeout(Some(std::time::Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(
            format!(
                "GET http://{origin}/chat HTTP/1.1\r\nHost: {origin}\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n"
            )
            .as_bytes(),
        )
        .unwrap();

    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut status_line = String::new();
    reader.read_line(&mut status_line).unwrap();
    assert!(status_line.starts_with("HTTP/1.1 101"), "got {status_line:?}");
    let mut saw_upgrade = false;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        if line == "\r\n" || line == "\n" {
            break;
        }
        if line.to_ascii_lowercase().starts_with("upgrade:") {
            saw_upgrade = true;
        }
    }
    assert!(saw_upgrade);

    // from here the proxy is a byte pipe
    stream.write_all(b"ping over the upgraded stream").unwrap();
    stream.flush().unwrap();
    let mut echo = [0u8; 29];
    std::io::Read::read_exact(&mut reader, &mut echo).unwrap();
    assert_eq!(&echo, b"ping over the upgraded stream");

    proxy.abort();
}

#[test]
fn accepted_proxy_protocol_replaces_client_address() {
    let origin = spawn_origin(OriginMode::ContentLength);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let proxy = ProxyConfigBuilder::new()
        .with_name("pp-accept")
        .with_port(0)
        .with_accept_proxy_protocol(true)
        .with_filters_source(Arc::new(AddrRecordingSource { seen: seen.clone() }))
        .start()
        .unwrap();

    let mut client = TestClient::connect(proxy.bound_address());
    client.send_raw(b"PROXY TCP4 203.0.113.9 127.0.0.1 56324 8080\r\n");
    client.request("GET", origin, "/", &[]);
    let rsp = client.read_response("GET");
    assert_eq!(rsp.status, 200);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], "203.0.113.9:56324".parse().unwrap());

    proxy.abort();
}

#[test]
fn sent_proxy_protocol_reaches_the_upstream() {
    // raw origin that records the first line it receives
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let origin = listener.local_addr().unwrap();
    let first_line = Arc::new(Mutex::new(String::new()));
    let first_line_srv = first_line.clone();
    std::thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            let _ = reader.read_line(&mut line);
            *first_line_srv.lock().unwrap() = line;
            // consume the rest of the head then answer
            loop {
                let mut l = String::new();
                match reader.read_line(&mut l) {
                    Ok(0) => break,
                    Ok(_) if l == "\r\n" || l == "\n" => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            let mut stream = stream;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
        }
    });

    let proxy = ProxyConfigBuilder::new()
        .with_name("pp-send")
        .with_port(0)
        .with_send_proxy_protocol(interpose::proxy_proto::ProxyProtocolVersion::V1)
        .start()
        .unwrap();

    let mut client = TestClient::connect(proxy.bound_address());
    client.request("GET", origin, "/", &[]);
    let rsp = client.read_response("GET");
    assert_eq!(rsp.status, 200);

    let line = first_line.lock().unwrap();
    assert!(line.starts_with("PROXY TCP4 127.0.0.1 "), "got {line:?}");

    proxy.abort();
}
