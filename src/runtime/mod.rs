/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! Process-wide resource group: the three worker runtimes shared by every
//! proxy instance registered to it, plus shutdown coordination and the
//! process signal listener.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context};
use log::debug;
use tokio::runtime::{Handle, Runtime};

use crate::config::ThreadPoolConfig;

const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

type AbortFn = Box<dyn Fn() + Send + Sync>;

struct RuntimeKeeper {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
}

impl RuntimeKeeper {
    fn new(group_name: &str, role: &str, threads: usize) -> anyhow::Result<Self> {
        let thread_name_prefix = format!("{group_name}-{role}");
        let thread_counter = AtomicUsize::new(0);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name_fn(move || {
                let id = thread_counter.fetch_add(1, Ordering::Relaxed);
                format!("{thread_name_prefix}-{id}")
            })
            .enable_all()
            .build()
            .context(format!("failed to build {role} runtime"))?;
        let handle = runtime.handle().clone();
        Ok(RuntimeKeeper {
            runtime: Mutex::new(Some(runtime)),
            handle,
        })
    }

    fn shutdown(&self, graceful: bool) {
        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            if graceful {
                runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
            } else {
                runtime.shutdown_background();
            }
        }
    }
}

struct GroupInner {
    name: String,
    auto_stop: bool,
    stopped: AtomicBool,
    acceptor: RuntimeKeeper,
    client_worker: RuntimeKeeper,
    server_worker: RuntimeKeeper,
    proxies: Mutex<HashMap<u64, AbortFn>>,
    next_member_id: AtomicU64,
    signal_task: Mutex<Option<tokio::task::AbortHandle>>,
}

/// Shared event-loop pools for one or more proxy instances.
///
/// The group owns three named runtimes: the acceptor pool, the
/// client-worker pool and the server-worker pool. By default it tears the
/// pools down once the last registered proxy unregisters; a group created
/// with [`ServerGroup::new_manual`] lives until an explicit
/// [`ServerGroup::shutdown`].
#[derive(Clone)]
pub struct ServerGroup {
    inner: Arc<GroupInner>,
}

impl ServerGroup {
    pub fn new(name: &str, thread_pool: ThreadPoolConfig) -> anyhow::Result<Self> {
        Self::build(name, thread_pool, true)
    }

    /// A group that survives its last proxy, for callers juggling several
    /// short-lived instances.
    pub fn new_manual(name: &str, thread_pool: ThreadPoolConfig) -> anyhow::Result<Self> {
        Self::build(name, thread_pool, false)
    }

    fn build(name: &str, thread_pool: ThreadPoolConfig, auto_stop: bool) -> anyhow::Result<Self> {
        let inner = GroupInner {
            name: name.to_string(),
            auto_stop,
            stopped: AtomicBool::new(false),
            acceptor: RuntimeKeeper::new(name, "acceptor", thread_pool.acceptor_threads)?,
            client_worker: RuntimeKeeper::new(
                name,
                "client-worker",
                thread_pool.client_worker_threads,
            )?,
            server_worker: RuntimeKeeper::new(
                name,
                "server-worker",
                thread_pool.server_worker_threads,
            )?,
            proxies: Mutex::new(HashMap::new()),
            next_member_id: AtomicU64::new(1),
            signal_task: Mutex::new(None),
        };
        Ok(ServerGroup {
            inner: Arc::new(inner),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn acceptor_handle(&self) -> &Handle {
        &self.inner.acceptor.handle
    }

    pub fn client_handle(&self) -> &Handle {
        &self.inner.client_worker.handle
    }

    pub fn server_handle(&self) -> &Handle {
        &self.inner.server_worker.handle
    }

    /// Register a proxy instance; the callback aborts it on a process
    /// signal.
    pub(crate) fn register(&self, abort: AbortFn) -> anyhow::Result<u64> {
        if self.is_stopped() {
            return Err(anyhow!("the server group has already been stopped"));
        }
        let id = self.inner.next_member_id.fetch_add(1, Ordering::Relaxed);
        let mut proxies = self.inner.proxies.lock().unwrap();
        let register_signal = proxies.is_empty();
        proxies.insert(id, abort);
        drop(proxies);

        if register_signal {
            self.register_signal_listener();
        }
        Ok(id)
    }

    /// Remove a proxy; the group tears its pools down when the last one
    /// leaves, unless configured for a manual lifetime.
    pub(crate) fn unregister(&self, id: u64, graceful: bool) {
        let emptied = {
            let mut proxies = self.inner.proxies.lock().unwrap();
            proxies.remove(&id);
            proxies.is_empty()
        };
        if emptied && self.inner.auto_stop {
            self.shutdown(graceful);
        }
    }

    /// Idempotent: the first call wins, later ones (including unregisters
    /// racing in after shutdown) are no-ops.
    pub fn shutdown(&self, graceful: bool) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("server group {} shutting down", self.inner.name);

        if let Some(handle) = self.inner.signal_task.lock().unwrap().take() {
            handle.abort();
        }

        // abort whatever proxies never unregistered themselves
        let aborts: Vec<AbortFn> = {
            let mut proxies = self.inner.proxies.lock().unwrap();
            proxies.drain().map(|(_, f)| f).collect()
        };
        for abort in &aborts {
            abort();
        }

        self.inner.acceptor.shutdown(graceful);
        self.inner.client_worker.shutdown(graceful);
        self.inner.server_worker.shutdown(graceful);
    }

    /// Abort every registered proxy on SIGINT. Registered when the first
    /// proxy joins, removed on shutdown.
    fn register_signal_listener(&self) {
        let inner = Arc::downgrade(&self.inner);
        let task = self.inner.acceptor.handle.spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if let Some(inner) = inner.upgrade() {
                debug!("server group {} caught interrupt", inner.name);
                let aborts: Vec<AbortFn> = {
                    let mut proxies = inner.proxies.lock().unwrap();
                    proxies.drain().map(|(_, f)| f).collect()
                };
                for abort in &aborts {
                    abort();
                }
            }
        });
        *self.inner.signal_task.lock().unwrap() = Some(task.abort_handle());
    }
}
