/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! The proxy instance: listen socket, accept path, channel registry and
//! graceful shutdown, plus the per-connection task context.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context};
use log::debug;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::config::{ClientSideSecurity, ProxyConfig};
use crate::io::GlobalTrafficLimiter;
use crate::proxy_proto::{ProxyProtocolV1Reader, ProxyProtocolV2Reader};
use crate::runtime::ServerGroup;
use crate::tracker::ActivityTrackers;

mod error;
pub use error::{ServerTaskError, ServerTaskResult};

mod task;
pub use task::{ConnState, FlowContext, FullFlowContext};

mod stats;
pub use stats::ServerStats;

mod registry;
pub use registry::ServerQuitPolicy;
use registry::ChannelRegistry;

mod local_reply;

mod client;
use client::ClientConnection;

const GRACEFUL_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const PROXY_PROTOCOL_READ_TIMEOUT: Duration = Duration::from_secs(5);
const CLIENT_TLS_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a connection task needs, cloned per accepted connection.
pub(crate) struct CommonTaskContext {
    pub(crate) config: Arc<ProxyConfig>,
    pub(crate) stats: Arc<ServerStats>,
    pub(crate) quit_policy: Arc<ServerQuitPolicy>,
    pub(crate) limiter: Option<Arc<GlobalTrafficLimiter>>,
    pub(crate) server_handle: tokio::runtime::Handle,
    pub(crate) task_logger: Option<slog::Logger>,
    pub(crate) trackers: ActivityTrackers,
    pub(crate) flow: FlowContext,
}

struct ProxyShared {
    config: Arc<ProxyConfig>,
    group: ServerGroup,
    group_member_id: AtomicU64,
    bound_addr: SocketAddr,
    stats: Arc<ServerStats>,
    registry: Arc<ChannelRegistry>,
    quit_policy: Arc<ServerQuitPolicy>,
    limiter: Option<Arc<GlobalTrafficLimiter>>,
    trackers: ActivityTrackers,
    tls_acceptor: Option<TlsAcceptor>,
    next_connection_id: AtomicU64,
    accept_task: Mutex<Option<tokio::task::AbortHandle>>,
    stopped: AtomicBool,
}

/// A running proxy instance bound to its listen address.
///
/// Cloning via [`Proxy::clone_at_next_port`] yields an independent instance
/// sharing the same [`ServerGroup`]; stopping one does not stop the other.
pub struct Proxy {
    shared: Arc<ProxyShared>,
}

impl Proxy {
    pub fn start(config: Arc<ProxyConfig>, group: ServerGroup) -> anyhow::Result<Proxy> {
        if group.is_stopped() {
            return Err(anyhow!("the server group has already been stopped"));
        }

        let tls_acceptor = match &config.client_security {
            ClientSideSecurity::Tls(source) => {
                let tls_config = source
                    .server_config()
                    .context("failed to build client-facing tls config")?;
                Some(TlsAcceptor::from(tls_config))
            }
            _ => None,
        };

        let std_listener = std::net::TcpListener::bind(config.address)
            .context("failed to bind listen socket")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set listen socket non-blocking")?;
        let bound_addr = std_listener
            .local_addr()
            .context("failed to get bound address")?;

        let listener = {
            let _guard = group.acceptor_handle().enter();
            tokio::net::TcpListener::from_std(std_listener)
                .context("failed to register listen socket")?
        };

        let limiter = if config.throttle.is_set() {
            Some(GlobalTrafficLimiter::new(config.throttle))
        } else {
            None
        };

        let shared = Arc::new(ProxyShared {
            trackers: ActivityTrackers::new(config.trackers.clone()),
            config,
            group: group.clone(),
            group_member_id: AtomicU64::new(0),
            bound_addr,
            stats: Arc::new(ServerStats::default()),
            registry: Arc::new(ChannelRegistry::default()),
            quit_policy: Arc::new(ServerQuitPolicy::default()),
            limiter,
            tls_acceptor,
            next_connection_id: AtomicU64::new(1),
            accept_task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });

        // register for signal-driven abort before accepting anything
        let member_id = {
            let abort_shared = Arc::downgrade(&shared);
            group.register(Box::new(move || {
                if let Some(shared) = abort_shared.upgrade() {
                    shared.shutdown(false);
                }
            }))?
        };
        shared.group_member_id.store(member_id, Ordering::Release);

        let accept_shared = Arc::clone(&shared);
        let accept_task = group.acceptor_handle().spawn(async move {
            accept_loop(accept_shared, listener).await;
        });
        *shared.accept_task.lock().unwrap() = Some(accept_task.abort_handle());

        debug!(
            "proxy {} listening on {bound_addr}",
            shared.config.name
        );
        Ok(Proxy { shared })
    }

    pub fn bound_address(&self) -> SocketAddr {
        self.shared.bound_addr
    }

    pub fn server_stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.shared.stats)
    }

    pub fn server_group(&self) -> &ServerGroup {
        &self.shared.group
    }

    /// Update the traffic-shaping ceilings at runtime.
    pub fn update_throttle(&self, read_bytes_per_sec: u64, write_bytes_per_sec: u64) {
        if let Some(limiter) = &self.shared.limiter {
            limiter.update_rates(crate::io::ThrottleRates {
                read_bytes_per_sec,
                write_bytes_per_sec,
            });
        }
    }

    /// Stop accepting, wait up to 10s for open channels to drain, then
    /// close them and leave the group.
    pub fn stop(&self) {
        self.shared.shutdown(true);
    }

    /// Immediate stop: no draining, all channels closed right away.
    pub fn abort(&self) {
        self.shared.shutdown(false);
    }

    /// Start an independent instance on the next port, sharing the group.
    ///
    /// No port reservation happens; a concurrent clone racing for the same
    /// port surfaces as a bind error.
    pub fn clone_at_next_port(&self) -> anyhow::Result<Proxy> {
        let port = self.shared.bound_addr.port();
        let next_port = if port == 0 { 0 } else { port + 1 };
        let config = Arc::new(self.shared.config.with_port(next_port));
        Proxy::start(config, self.shared.group.clone())
    }
}

impl ProxyShared {
    fn shutdown(&self, graceful: bool) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.accept_task.lock().unwrap().take() {
            handle.abort();
        }
        if !graceful {
            self.quit_policy.set_force_quit();
        }
        self.registry.drain(graceful, GRACEFUL_DRAIN_TIMEOUT);
        self.group
            .unregister(self.group_member_id.load(Ordering::Acquire), graceful);
    }
}

fn ip_is_local(ip: IpAddr) -> bool {
    if ip.is_loopback() {
        return true;
    }
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

async fn accept_loop(shared: Arc<ProxyShared>, listener: tokio::net::TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                shared.stats.add_conn();
                if shared.config.allow_local_only && !ip_is_local(peer_addr.ip()) {
                    debug!(
                        "proxy {} dropped non-local client {peer_addr}",
                        shared.config.name
                    );
                    continue;
                }

                let connection_id = shared
                    .next_connection_id
                    .fetch_add(1, Ordering::Relaxed);
                let conn_shared = Arc::clone(&shared);
                // the task must not finish (and deregister) before it was
                // registered, or its entry would linger in the registry
                let (registered_tx, registered_rx) = tokio::sync::oneshot::channel::<()>();
                let task = shared.group.client_handle().spawn(async move {
                    let _ = registered_rx.await;
                    Box::pin(handle_connection(conn_shared, stream, peer_addr, connection_id)).await;
                });
                shared.registry.add(connection_id, task.abort_handle());
                let _ = registered_tx.send(());
            }
            Err(e) => {
                debug!("proxy {} accept failed: {e}", shared.config.name);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

struct ConnGuard {
    shared: Arc<ProxyShared>,
    flow: FlowContext,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.shared.registry.remove(self.flow.connection_id);
        self.shared.stats.dec_alive_conn();
        self.shared.trackers.client_disconnected(&self.flow);
    }
}

async fn handle_connection(
    shared: Arc<ProxyShared>,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    connection_id: u64,
) {
    shared.stats.inc_alive_conn();

    // the PROXY protocol header, when configured, precedes everything else
    let mut client_addr = peer_addr;
    if shared.config.accept_proxy_protocol {
        match read_proxy_protocol(&mut stream).await {
            Ok(Some(addr)) => client_addr = addr,
            Ok(None) => {}
            Err(()) => {
                shared.stats.dec_alive_conn();
                shared.registry.remove(connection_id);
                return;
            }
        }
    }

    let flow = FlowContext {
        client_addr,
        client_tls: shared.tls_acceptor.is_some(),
        connection_id,
    };
    let _guard = ConnGuard {
        shared: Arc::clone(&shared),
        flow: flow.clone(),
    };

    shared.trackers.client_connected(&flow);

    let ctx = Arc::new(CommonTaskContext {
        config: Arc::clone(&shared.config),
        stats: Arc::clone(&shared.stats),
        quit_policy: Arc::clone(&shared.quit_policy),
        limiter: shared.limiter.clone(),
        server_handle: shared.group.server_handle().clone(),
        task_logger: shared.config.task_logger.clone(),
        trackers: shared.trackers.clone(),
        flow: flow.clone(),
    });

    match &shared.tls_acceptor {
        Some(acceptor) => {
            let accepted =
                tokio::time::timeout(CLIENT_TLS_ACCEPT_TIMEOUT, acceptor.accept(stream)).await;
            match accepted {
                Ok(Ok(tls_stream)) => {
                    shared.trackers.client_ssl_handshake_succeeded(&flow);
                    let (clt_r, clt_w) = tokio::io::split(tls_stream);
                    ClientConnection::new(ctx, clt_r, clt_w).run().await;
                }
                Ok(Err(e)) => {
                    debug!(
                        "conn {connection_id} client tls handshake failed: {e}"
                    );
                }
                Err(_) => {
                    debug!("conn {connection_id} client tls handshake timed out");
                }
            }
        }
        None => {
            let (clt_r, clt_w) = stream.into_split();
            ClientConnection::new(ctx, clt_r, clt_w).run().await;
        }
    }
}

async fn read_proxy_protocol(stream: &mut TcpStream) -> Result<Option<SocketAddr>, ()> {
    let mut first = [0u8; 1];
    match stream.peek(&mut first).await {
        Ok(1) => {}
        _ => return Err(()),
    }
    let parsed = if first[0] == b'P' {
        let reader = ProxyProtocolV1Reader::new(PROXY_PROTOCOL_READ_TIMEOUT);
        reader.read_proxy_protocol_v1_for_tcp(stream).await
    } else {
        let mut reader = ProxyProtocolV2Reader::new(PROXY_PROTOCOL_READ_TIMEOUT);
        reader.read_proxy_protocol_v2_for_tcp(stream).await
    };
    match parsed {
        Ok(addr) => Ok(addr.map(|a| a.src_addr)),
        Err(e) => {
            debug!("invalid proxy protocol header: {e}");
            Err(())
        }
    }
}
