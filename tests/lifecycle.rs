/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! Instance lifecycle: clone-and-share-group, stop independence, worker
//! thread pinning, activity tracker delivery.

mod util;

use std::sync::{Arc, Mutex};

use interpose::config::ThreadPoolConfig;
use interpose::filter::{HttpFilters, HttpFiltersSource, LocalResponse};
use interpose::http::ClientRequest;
use interpose::serve::FlowContext;
use interpose::tracker::ActivityTracker;
use interpose::ProxyConfigBuilder;

use util::{spawn_origin, OriginMode, TestClient};

#[test]
fn cloned_proxy_survives_the_original() {
    let origin = spawn_origin(OriginMode::ContentLength);
    let proxy = ProxyConfigBuilder::new()
        .with_name("clone-test")
        .with_port(0)
        .start()
        .unwrap();
    let cloned = proxy.clone_at_next_port().unwrap();
    assert_ne!(proxy.bound_address(), cloned.bound_address());

    proxy.abort();

    // the clone keeps serving through the shared group
    let mut client = TestClient::connect(cloned.bound_address());
    client.request("GET", origin, "/", &[]);
    let rsp = client.read_response("GET");
    assert_eq!(rsp.status, 200);
    assert_eq!(rsp.body_str(), "Success!");

    cloned.abort();
}

struct ThreadNameFilters {
    names: Arc<Mutex<Vec<String>>>,
}

impl HttpFilters for ThreadNameFilters {
    fn client_to_proxy_request(&mut self, _req: &mut ClientRequest) -> Option<LocalResponse> {
        let name = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        self.names.lock().unwrap().push(name);
        None
    }
}

struct ThreadNameSource {
    names: Arc<Mutex<Vec<String>>>,
}

impl HttpFiltersSource for ThreadNameSource {
    fn filter_request(&self, _req: &ClientRequest, _ctx: &FlowContext) -> Box<dyn HttpFilters> {
        Box::new(ThreadNameFilters {
            names: self.names.clone(),
        })
    }
}

#[test]
fn single_threaded_pool_pins_filter_callbacks() {
    let origin = spawn_origin(OriginMode::ContentLength);
    let names = Arc::new(Mutex::new(Vec::new()));
    let proxy = ProxyConfigBuilder::new()
        .with_name("pin-test")
        .with_port(0)
        .with_thread_pool(ThreadPoolConfig::single_threaded())
        .with_filters_source(Arc::new(ThreadNameSource {
            names: names.clone(),
        }))
        .start()
        .unwrap();

    // two separate client connections
    for _ in 0..2 {
        let mut client = TestClient::connect(proxy.bound_address());
        client.request("GET", origin, "/", &[]);
        let rsp = client.read_response("GET");
        assert_eq!(rsp.status, 200);
    }

    let names = names.lock().unwrap();
    assert_eq!(names.len(), 2);
    assert_eq!(names[0], names[1]);
    assert!(names[0].starts_with("pin-test-client-worker-"));

    proxy.stop();
}

#[derive(Default)]
struct CountingTracker {
    connected: Mutex<u64>,
    disconnected: Mutex<u64>,
    requests: Mutex<u64>,
    clt_read_bytes: Mutex<u64>,
    ups_read_bytes: Mutex<u64>,
}

impl ActivityTracker for CountingTracker {
    fn client_connected(&self, _ctx: &FlowContext) {
        *self.connected.lock().unwrap() += 1;
    }

    fn client_disconnected(&self, _ctx: &FlowContext) {
        *self.disconnected.lock().unwrap() += 1;
    }

    fn request_received_from_client(&self, _ctx: &FlowContext, _req: &ClientRequest) {
        *self.requests.lock().unwrap() += 1;
    }

    fn bytes_received_from_client(&self, _ctx: &FlowContext, size: u64) {
        *self.clt_read_bytes.lock().unwrap() += size;
    }

    fn bytes_received_from_server(
        &self,
        _ctx: &interpose::serve::FullFlowContext,
        size: u64,
    ) {
        *self.ups_read_bytes.lock().unwrap() += size;
    }
}

#[test]
fn activity_tracker_observes_the_exchange() {
    let origin = spawn_origin(OriginMode::ContentLength);
    let tracker = Arc::new(CountingTracker::default());
    let proxy = ProxyConfigBuilder::new()
        .with_name("tracker-test")
        .with_port(0)
        .with_activity_tracker(tracker.clone())
        .start()
        .unwrap();

    {
        let mut client = TestClient::connect(proxy.bound_address());
        client.request("GET", origin, "/", &[]);
        let rsp = client.read_response("GET");
        assert_eq!(rsp.status, 200);
    }
    // the client socket just dropped; give the worker a moment to tear down
    std::thread::sleep(std::time::Duration::from_millis(300));

    assert_eq!(*tracker.connected.lock().unwrap(), 1);
    assert_eq!(*tracker.disconnected.lock().unwrap(), 1);
    assert_eq!(*tracker.requests.lock().unwrap(), 1);
    assert!(*tracker.clt_read_bytes.lock().unwrap() > 0);
    assert!(*tracker.ups_read_bytes.lock().unwrap() > 0);

    proxy.stop();
}

#[test]
fn stopped_group_rejects_new_proxies() {
    let group = interpose::ServerGroup::new_manual(
        "reject-test",
        ThreadPoolConfig::single_threaded(),
    )
    .unwrap();
    let proxy = ProxyConfigBuilder::new()
        .with_name("reject-test")
        .with_port(0)
        .with_server_group(group.clone())
        .start()
        .unwrap();
    proxy.stop();

    group.shutdown(true);
    let r = ProxyConfigBuilder::new()
        .with_name("reject-test-2")
        .with_port(0)
        .with_server_group(group)
        .start();
    assert!(r.is_err());
}

#[test]
fn server_stats_count_connections() {
    let origin = spawn_origin(OriginMode::ContentLength);
    let proxy = ProxyConfigBuilder::new()
        .with_name("stats-test")
        .with_port(0)
        .start()
        .unwrap();

    let stats = proxy.server_stats();
    {
        let mut client = TestClient::connect(proxy.bound_address());
        client.request("GET", origin, "/", &[]);
        let rsp = client.read_response("GET");
        assert_eq!(rsp.status, 200);

        client.request("GET", origin, "/again", &[]);
        let rsp = client.read_response("GET");
        assert_eq!(rsp.status, 200);
    }
    std::thread::sleep(std::time::Duration::from_millis(300));

    assert_eq!(stats.conn_total(), 1);
    assert_eq!(stats.task_total(), 2);
    assert_eq!(stats.reused_server_conn(), 1);
    assert_eq!(stats.alive_count(), 0);

    proxy.stop();
}
