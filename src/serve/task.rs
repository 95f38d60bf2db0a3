/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use crate::types::UpstreamAddr;

/// Where a connection half currently is in its lifecycle.
///
/// The drivers move through these in a fixed order; a transition not listed
/// in the table below is a bug:
///
/// ```text
/// AwaitingInitial    -- request head     --> AwaitingChunk | NegotiatingConnect | Disconnected
/// AwaitingChunk      -- last chunk       --> AwaitingInitial
/// NegotiatingConnect -- CONNECT sent     --> AwaitingConnectOk
/// AwaitingConnectOk  -- 2xx, MITM        --> HandshakingTls
/// AwaitingConnectOk  -- 2xx, no MITM     --> Tunneling
/// AwaitingConnectOk  -- non-2xx          --> AwaitingInitial
/// HandshakingTls     -- handshake done   --> AwaitingInitial
/// Tunneling          -- peer EOF         --> Disconnected
/// any                -- error            --> DisconnectRequested -> Disconnected
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    AwaitingInitial,
    AwaitingChunk,
    AwaitingProxyChunk,
    Connecting,
    HandshakingTls,
    NegotiatingConnect,
    AwaitingConnectOk,
    Tunneling,
    Disconnected,
    DisconnectRequested,
}

impl ConnState {
    /// No HTTP frame may surface to filters in these states.
    pub fn frames_are_opaque(&self) -> bool {
        matches!(self, ConnState::HandshakingTls | ConnState::Tunneling)
    }
}

/// Identity of one accepted client connection, shared with filters and
/// activity trackers.
#[derive(Clone, Debug)]
pub struct FlowContext {
    pub client_addr: SocketAddr,
    pub client_tls: bool,
    pub connection_id: u64,
}

impl PartialEq for FlowContext {
    fn eq(&self, other: &Self) -> bool {
        self.connection_id == other.connection_id
    }
}

impl Eq for FlowContext {}

impl Hash for FlowContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.connection_id.hash(state);
    }
}

/// [`FlowContext`] plus the upstream half, available once a server
/// connection exists for the request.
#[derive(Clone, Debug)]
pub struct FullFlowContext {
    pub client_addr: SocketAddr,
    pub client_tls: bool,
    pub connection_id: u64,
    pub server_host_and_port: UpstreamAddr,
    pub chained_proxy_addr: Option<SocketAddr>,
}

impl FullFlowContext {
    pub fn new(ctx: &FlowContext, upstream: UpstreamAddr) -> Self {
        FullFlowContext {
            client_addr: ctx.client_addr,
            client_tls: ctx.client_tls,
            connection_id: ctx.connection_id,
            server_host_and_port: upstream,
            chained_proxy_addr: None,
        }
    }

    pub fn flow(&self) -> FlowContext {
        FlowContext {
            client_addr: self.client_addr,
            client_tls: self.client_tls,
            connection_id: self.connection_id,
        }
    }
}

impl PartialEq for FullFlowContext {
    fn eq(&self, other: &Self) -> bool {
        self.connection_id == other.connection_id
    }
}

impl Eq for FullFlowContext {}

impl Hash for FullFlowContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.connection_id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::str::FromStr;

    fn hash_of<T: Hash>(v: &T) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn flow_identity_is_connection_id() {
        let a = FlowContext {
            client_addr: SocketAddr::from_str("127.0.0.1:1111").unwrap(),
            client_tls: false,
            connection_id: 7,
        };
        let b = FlowContext {
            client_addr: SocketAddr::from_str("127.0.0.1:2222").unwrap(),
            client_tls: true,
            connection_id: 7,
        };
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn opaque_states() {
        assert!(ConnState::Tunneling.frames_are_opaque());
        assert!(ConnState::HandshakingTls.frames_are_opaque());
        assert!(!ConnState::AwaitingInitial.frames_are_opaque());
    }
}
