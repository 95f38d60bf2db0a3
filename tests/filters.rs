/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! Filter dispatch: one instance per request, hook ordering, short
//! circuits, content mutation and aggregation.

mod util;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use http::StatusCode;

use interpose::filter::{HttpFilters, HttpFiltersSource, LocalResponse};
use interpose::http::{ClientRequest, RemoteResponse};
use interpose::serve::{FlowContext, FullFlowContext};
use interpose::ProxyConfigBuilder;

use util::{spawn_origin, OriginMode, TestClient};

type EventLog = Arc<Mutex<Vec<String>>>;

struct RecordingFilters {
    events: EventLog,
}

impl HttpFilters for RecordingFilters {
    fn client_to_proxy_request(&mut self, req: &mut ClientRequest) -> Option<LocalResponse> {
        self.events
            .lock()
            .unwrap()
            .push(format!("clientToProxyRequest {} {}", req.method, req.uri));
        None
    }

    fn proxy_to_server_request(&mut self, _req: &mut ClientRequest) -> Option<LocalResponse> {
        self.events
            .lock()
            .unwrap()
            .push("proxyToServerRequest".to_string());
        None
    }

    fn proxy_to_server_request_sending(&mut self) {
        self.events
            .lock()
            .unwrap()
            .push("proxyToServerRequestSending".to_string());
    }

    fn proxy_to_server_request_sent(&mut self) {
        self.events
            .lock()
            .unwrap()
            .push("proxyToServerRequestSent".to_string());
    }

    fn server_to_proxy_response(&mut self, rsp: &mut RemoteResponse) {
        self.events
            .lock()
            .unwrap()
            .push(format!("serverToProxyResponse {}", rsp.code));
    }

    fn proxy_to_client_response(&mut self, rsp: &mut RemoteResponse) {
        self.events
            .lock()
            .unwrap()
            .push(format!("proxyToClientResponse {}", rsp.code));
    }

    fn proxy_to_server_resolution_started(
        &mut self,
        upstream: &interpose::types::UpstreamAddr,
    ) -> Option<SocketAddr> {
        self.events
            .lock()
            .unwrap()
            .push(format!("resolutionStarted {upstream}"));
        None
    }

    fn proxy_to_server_resolution_succeeded(
        &mut self,
        _upstream: &interpose::types::UpstreamAddr,
        _addr: SocketAddr,
    ) {
        self.events
            .lock()
            .unwrap()
            .push("resolutionSucceeded".to_string());
    }

    fn proxy_to_server_connection_queued(&mut self) {
        self.events
            .lock()
            .unwrap()
            .push("connectionQueued".to_string());
    }

    fn proxy_to_server_connection_started(&mut self) {
        self.events
            .lock()
            .unwrap()
            .push("connectionStarted".to_string());
    }

    fn proxy_to_server_connection_succeeded(&mut self, _ctx: &FullFlowContext) {
        self.events
            .lock()
            .unwrap()
            .push("connectionSucceeded".to_string());
    }
}

struct RecordingSource {
    events: EventLog,
    bound: Arc<Mutex<usize>>,
}

impl HttpFiltersSource for RecordingSource {
    fn filter_request(&self, _req: &ClientRequest, _ctx: &FlowContext) -> Box<dyn HttpFilters> {
        *self.bound.lock().unwrap() += 1;
        Box::new(RecordingFilters {
            events: self.events.clone(),
        })
    }
}

#[test]
fn hooks_fire_in_request_order() {
    let origin = spawn_origin(OriginMode::ContentLength);
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let bound = Arc::new(Mutex::new(0));
    let proxy = ProxyConfigBuilder::new()
        .with_name("filters-order")
        .with_port(0)
        .with_filters_source(Arc::new(RecordingSource {
            events: events.clone(),
            bound: bound.clone(),
        }))
        .start()
        .unwrap();

    let mut client = TestClient::connect(proxy.bound_address());
    client.request("GET", origin, "/x", &[]);
    let rsp = client.read_response("GET");
    assert_eq!(rsp.status, 200);

    // a second request on the same connection binds a fresh instance
    client.request("GET", origin, "/y", &[]);
    let rsp = client.read_response("GET");
    assert_eq!(rsp.status, 200);

    assert_eq!(*bound.lock().unwrap(), 2);

    let events = events.lock().unwrap();
    let first_request: Vec<&str> = events
        .iter()
        .take_while(|e| !e.contains("/y"))
        .map(|s| s.as_str())
        .collect();
    // dial events only happen for the first request, the second reuses the
    // upstream connection
    assert!(first_request[0].starts_with("clientToProxyRequest GET"));
    assert!(first_request.contains(&"connectionQueued"));
    assert!(first_request
        .iter()
        .any(|e| e.starts_with("resolutionStarted")));
    assert!(first_request.contains(&"connectionStarted"));
    assert!(first_request.contains(&"connectionSucceeded"));
    let sending = first_request
        .iter()
        .position(|e| *e == "proxyToServerRequestSending")
        .unwrap();
    let sent = first_request
        .iter()
        .position(|e| *e == "proxyToServerRequestSent")
        .unwrap();
    let s2p = first_request
        .iter()
        .position(|e| e.starts_with("serverToProxyResponse"))
        .unwrap();
    let p2c = first_request
        .iter()
        .position(|e| e.starts_with("proxyToClientResponse"))
        .unwrap();
    assert!(sending < sent);
    assert!(sent < s2p);
    assert!(s2p < p2c);

    proxy.abort();
}

struct ShortCircuitFilters;

impl HttpFilters for ShortCircuitFilters {
    fn client_to_proxy_request(&mut self, _req: &mut ClientRequest) -> Option<LocalResponse> {
        Some(LocalResponse::with_body(
            StatusCode::FORBIDDEN,
            "blocked by filter",
        ))
    }
}

struct ShortCircuitSource;

impl HttpFiltersSource for ShortCircuitSource {
    fn filter_request(&self, _req: &ClientRequest, _ctx: &FlowContext) -> Box<dyn HttpFilters> {
        Box::new(ShortCircuitFilters)
    }
}

#[test]
fn request_short_circuit_never_reaches_the_origin() {
    let origin = spawn_origin(OriginMode::ContentLength);
    let proxy = ProxyConfigBuilder::new()
        .with_name("filters-short")
        .with_port(0)
        .with_filters_source(Arc::new(ShortCircuitSource))
        .start()
        .unwrap();

    let mut client = TestClient::connect(proxy.bound_address());
    client.request("GET", origin, "/", &[]);
    let rsp = client.read_response("GET");
    assert_eq!(rsp.status, 403);
    assert_eq!(rsp.body_str(), "blocked by filter");

    // the connection keeps serving
    client.request("GET", origin, "/", &[]);
    let rsp = client.read_response("GET");
    assert_eq!(rsp.status, 403);

    proxy.abort();
}

struct MutatingFilters;

impl HttpFilters for MutatingFilters {
    fn wants_content(&self) -> bool {
        true
    }

    fn server_to_proxy_response_chunk(&mut self, chunk: &mut Vec<u8>) {
        if let Ok(text) = std::str::from_utf8(chunk) {
            let replaced = text.replace("Success!", "Mutated!");
            *chunk = replaced.into_bytes();
        }
    }
}

struct MutatingSource;

impl HttpFiltersSource for MutatingSource {
    fn filter_request(&self, _req: &ClientRequest, _ctx: &FlowContext) -> Box<dyn HttpFilters> {
        Box::new(MutatingFilters)
    }
}

#[test]
fn content_filter_mutates_the_streamed_body() {
    let origin = spawn_origin(OriginMode::ContentLength);
    let proxy = ProxyConfigBuilder::new()
        .with_name("filters-mutate")
        .with_port(0)
        .with_filters_source(Arc::new(MutatingSource))
        .start()
        .unwrap();

    let mut client = TestClient::connect(proxy.bound_address());
    client.request("GET", origin, "/", &[]);
    let rsp = client.read_response("GET");
    assert_eq!(rsp.status, 200);
    // length may change, so the body was re-framed as chunked
    assert_eq!(rsp.header("transfer-encoding"), Some("chunked"));
    assert_eq!(rsp.body_str(), "Mutated!");

    proxy.abort();
}

struct AggregatingSource;

impl HttpFiltersSource for AggregatingSource {
    fn filter_request(&self, _req: &ClientRequest, _ctx: &FlowContext) -> Box<dyn HttpFilters> {
        Box::new(MutatingFilters)
    }

    fn max_response_buffer_size(&self) -> usize {
        1024 * 1024
    }
}

#[test]
fn aggregated_response_keeps_exact_content_length() {
    let origin = spawn_origin(OriginMode::ContentLength);
    let proxy = ProxyConfigBuilder::new()
        .with_name("filters-aggregate")
        .with_port(0)
        .with_filters_source(Arc::new(AggregatingSource))
        .start()
        .unwrap();

    let mut client = TestClient::connect(proxy.bound_address());
    client.request("GET", origin, "/", &[]);
    let rsp = client.read_response("GET");
    assert_eq!(rsp.status, 200);
    assert_eq!(rsp.header("content-length"), Some("8"));
    assert!(rsp.header("transfer-encoding").is_none());
    assert_eq!(rsp.body_str(), "Mutated!");

    proxy.abort();
}
