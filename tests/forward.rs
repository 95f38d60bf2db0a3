/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! Round trips through a plain forward proxy against scripted origins.

mod util;

use std::sync::Arc;

use interpose::ProxyConfigBuilder;

use util::{spawn_origin, OriginMode, TestClient};

fn start_proxy(name: &str) -> interpose::Proxy {
    ProxyConfigBuilder::new()
        .with_name(name)
        .with_port(0)
        .with_proxy_alias("test-proxy")
        .start()
        .unwrap()
}

#[test]
fn close_delimited_becomes_chunked() {
    let origin = spawn_origin(OriginMode::CloseDelimited);
    let proxy = start_proxy("fwd-chunked");

    let mut client = TestClient::connect(proxy.bound_address());
    client.request("GET", origin, "/", &[]);
    let rsp = client.read_response("GET");

    assert_eq!(rsp.status, 200);
    assert_eq!(rsp.header("transfer-encoding"), Some("chunked"));
    assert!(rsp.header("content-length").is_none());
    assert_eq!(rsp.body_str(), "Success!");

    proxy.abort();
}

#[test]
fn content_length_passes_through() {
    let origin = spawn_origin(OriginMode::ContentLength);
    let proxy = start_proxy("fwd-cl");

    let mut client = TestClient::connect(proxy.bound_address());
    client.request("GET", origin, "/", &[]);
    let rsp = client.read_response("GET");

    assert_eq!(rsp.status, 200);
    assert_eq!(rsp.header("content-length"), Some("8"));
    assert!(rsp.header("transfer-encoding").is_none());
    assert_eq!(rsp.body_str(), "Success!");

    // the connection stays usable for a second request
    client.request("GET", origin, "/second", &[]);
    let rsp = client.read_response("GET");
    assert_eq!(rsp.status, 200);
    assert_eq!(rsp.body_str(), "Success!");

    proxy.abort();
}

#[test]
fn head_gets_no_entity() {
    let origin = spawn_origin(OriginMode::EmptyOk);
    let proxy = start_proxy("fwd-head");

    let mut client = TestClient::connect(proxy.bound_address());
    client.request("HEAD", origin, "/", &[]);
    let rsp = client.read_response("HEAD");

    assert_eq!(rsp.status, 200);
    assert!(rsp.header("transfer-encoding").is_none());
    assert!(rsp.header("content-length").is_none());
    assert!(rsp.body.is_empty());

    proxy.abort();
}

#[test]
fn origin_form_request_is_rejected() {
    let proxy = start_proxy("fwd-origin-form");

    let mut client = TestClient::connect(proxy.bound_address());
    client.send_raw(b"GET /some/path HTTP/1.1\r\nHost: example.com\r\n\r\n");
    let rsp = client.read_response("GET");

    assert_eq!(rsp.status, 400);

    proxy.abort();
}

#[test]
fn proxy_headers_are_stripped_and_via_added() {
    let origin = spawn_origin(OriginMode::EchoHead);
    let proxy = start_proxy("fwd-hop");

    let mut client = TestClient::connect(proxy.bound_address());
    client.request(
        "GET",
        origin,
        "/",
        &[
            "Proxy-Authorization: Basic dXNlcjpwYXNz",
            "Proxy-Authenticate: Basic realm=x",
        ],
    );
    let rsp = client.read_response("GET");
    assert_eq!(rsp.status, 200);

    let upstream_head = rsp.body_str().to_ascii_lowercase();
    assert!(!upstream_head.contains("proxy-authorization"));
    assert!(!upstream_head.contains("proxy-authenticate"));
    // the alias shows up exactly once on the forwarded request
    assert_eq!(upstream_head.matches("test-proxy").count(), 1);
    assert!(upstream_head.contains("via: 1.1 test-proxy"));

    // and once on the response
    assert_eq!(rsp.header_count("via"), 1);
    assert_eq!(rsp.header("via"), Some("1.1 test-proxy"));

    proxy.abort();
}

#[test]
fn auth_gate_answers_407_then_accepts() {
    let origin = spawn_origin(OriginMode::ContentLength);
    let mut authenticator = interpose::StaticUserAuthenticator::new("t-realm");
    authenticator.add_user("user", "pass");
    let proxy = ProxyConfigBuilder::new()
        .with_name("fwd-auth")
        .with_port(0)
        .with_proxy_authenticator(Arc::new(authenticator))
        .start()
        .unwrap();

    let mut client = TestClient::connect(proxy.bound_address());
    client.request("GET", origin, "/", &[]);
    let rsp = client.read_response("GET");
    assert_eq!(rsp.status, 407);
    assert_eq!(
        rsp.header("proxy-authenticate"),
        Some("Basic realm=\"t-realm\"")
    );

    // the connection stays open for the retry with credentials
    client.request(
        "GET",
        origin,
        "/",
        &["Proxy-Authorization: Basic dXNlcjpwYXNz"],
    );
    let rsp = client.read_response("GET");
    assert_eq!(rsp.status, 200);
    assert_eq!(rsp.body_str(), "Success!");

    proxy.abort();
}

#[test]
fn idle_upstream_answers_504() {
    let origin = spawn_origin(OriginMode::Hang);
    let proxy = ProxyConfigBuilder::new()
        .with_name("fwd-idle")
        .with_port(0)
        .with_idle_connection_timeout(std::time::Duration::from_secs(1))
        .start()
        .unwrap();

    let started = std::time::Instant::now();
    let mut client = TestClient::connect(proxy.bound_address());
    client.request("GET", origin, "/hang", &[]);
    let rsp = client.read_response("GET");

    assert_eq!(rsp.status, 504);
    assert!(started.elapsed() < std::time::Duration::from_secs(2));

    proxy.abort();
}

#[test]
fn http10_client_gets_close_delimited_body() {
    let origin = spawn_origin(OriginMode::CloseDelimited);
    let proxy = start_proxy("fwd-http10");

    let mut client = TestClient::connect(proxy.bound_address());
    client.send_raw(
        format!("GET http://{origin}/ HTTP/1.0\r\nHost: {origin}\r\n\r\n").as_bytes(),
    );
    let rsp = client.read_response("GET");

    assert_eq!(rsp.status, 200);
    assert!(rsp.header("transfer-encoding").is_none());
    assert_eq!(rsp.body_str(), "Success!");

    proxy.abort();
}
