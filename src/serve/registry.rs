/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::task::AbortHandle;

/// Whether connection tasks should wind down, checked from their idle ticks.
#[derive(Default)]
pub struct ServerQuitPolicy {
    force_quit: AtomicBool,
}

impl ServerQuitPolicy {
    pub fn force_quit(&self) -> bool {
        self.force_quit.load(Ordering::Relaxed)
    }

    pub fn set_force_quit(&self) {
        self.force_quit.store(true, Ordering::Relaxed);
    }
}

/// Live connection tasks of one proxy instance.
///
/// Every accepted connection registers its task here and removes itself on
/// teardown, so an entry is either a live task or about to be removed by
/// its drop guard.
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    channels: Mutex<HashMap<u64, AbortHandle>>,
}

impl ChannelRegistry {
    pub(crate) fn add(&self, connection_id: u64, handle: AbortHandle) {
        let mut channels = self.channels.lock().unwrap();
        channels.insert(connection_id, handle);
    }

    pub(crate) fn remove(&self, connection_id: u64) {
        let mut channels = self.channels.lock().unwrap();
        channels.remove(&connection_id);
    }

    pub(crate) fn alive_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    /// Wait up to `timeout` for tasks to drain, then abort the rest.
    ///
    /// Called from the user thread driving `stop`; polling with a sleep is
    /// fine there.
    pub(crate) fn drain(&self, graceful: bool, timeout: Duration) {
        if graceful {
            let deadline = Instant::now() + timeout;
            while self.alive_count() > 0 && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(50));
            }
        }
        let mut channels = self.channels.lock().unwrap();
        for (_, handle) in channels.drain() {
            handle.abort();
        }
    }
}
