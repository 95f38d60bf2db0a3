/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! An intercepting HTTP/1.x forward proxy engine.
//!
//! The engine drives a pair of connection state machines per proxied request:
//! the client-to-proxy half (request parsing, authentication, CONNECT and MITM
//! negotiation, response delivery) and the proxy-to-server half (resolution,
//! chained-upstream fallback, request forwarding, response streaming).
//! User-supplied [`filter::HttpFilters`] chains may observe or mutate every
//! request and response, and [`tracker::ActivityTracker`]s observe connection
//! and byte-level events.
//!
//! Proxies are built from a [`config::ProxyConfigBuilder`] and share the
//! worker runtimes of a [`runtime::ServerGroup`].

pub mod config;
pub mod connect;
pub mod filter;
pub mod resolve;
pub mod runtime;
pub mod serve;
pub mod tracker;
pub mod types;

pub mod http;
pub mod io;
pub mod proxy_proto;

mod auth;
pub use auth::{ProxyAuthenticator, StaticUserAuthenticator};

mod log;

pub use config::{ClientSideSecurity, MitmManager, ProxyConfigBuilder, TlsEngineSource};
pub use serve::Proxy;
pub use runtime::ServerGroup;
