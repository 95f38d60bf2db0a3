/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;
use std::sync::Mutex;

use arc_swap::ArcSwap;
use tokio::time::Instant;

// the shaper hands out a fresh byte budget every 250ms
const REFILL_INTERVAL_MILLIS: u64 = 250;

/// Proxy-wide read/write ceilings in bytes per second. Zero disables the
/// corresponding direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThrottleRates {
    pub read_bytes_per_sec: u64,
    pub write_bytes_per_sec: u64,
}

impl ThrottleRates {
    pub fn is_set(&self) -> bool {
        self.read_bytes_per_sec > 0 || self.write_bytes_per_sec > 0
    }
}

/// Answer to a transfer asking for budget.
#[derive(Debug, PartialEq, Eq)]
pub enum BucketGrant {
    /// Go ahead with at most this many bytes.
    Granted(usize),
    /// Budget exhausted; sleep this many milliseconds until the refill.
    Wait(u64),
}

/// One direction of the shaper: a byte budget tied to the refill interval
/// it was handed out in.
struct DirectionBucket {
    /// bytes per refill interval; zero leaves the direction unlimited
    budget: u64,
    /// which interval `remaining` belongs to
    interval: u64,
    remaining: u64,
}

impl DirectionBucket {
    fn new(bytes_per_sec: u64) -> Self {
        let budget = bytes_per_sec * REFILL_INTERVAL_MILLIS / 1000;
        DirectionBucket {
            budget,
            interval: 0,
            remaining: budget,
        }
    }

    fn is_set(&self) -> bool {
        self.budget > 0
    }

    fn grant(&mut self, elapsed_millis: u64, wanted: usize) -> BucketGrant {
        if self.budget == 0 {
            // the direction went unlimited after this transfer wrapped it
            return BucketGrant::Granted(wanted);
        }
        let interval = elapsed_millis / REFILL_INTERVAL_MILLIS;
        if interval != self.interval {
            self.interval = interval;
            self.remaining = self.budget;
        }
        if self.remaining == 0 {
            BucketGrant::Wait(REFILL_INTERVAL_MILLIS - elapsed_millis % REFILL_INTERVAL_MILLIS)
        } else {
            BucketGrant::Granted(wanted.min(self.remaining.min(usize::MAX as u64) as usize))
        }
    }

    fn consume(&mut self, used: usize) {
        self.remaining = self.remaining.saturating_sub(used as u64);
    }
}

/// Token bucket shared by every connection of one proxy instance.
///
/// Each direction refills once per interval; readers and writers ask for a
/// grant on every poll, report what they actually moved, and sleep out the
/// rest of the interval once the budget is gone. Rates may be swapped at
/// runtime and are read atomically.
pub struct GlobalTrafficLimiter {
    started: Instant,
    rates: ArcSwap<ThrottleRates>,
    read: Mutex<DirectionBucket>,
    write: Mutex<DirectionBucket>,
}

impl GlobalTrafficLimiter {
    pub fn new(rates: ThrottleRates) -> Arc<Self> {
        Arc::new(GlobalTrafficLimiter {
            started: Instant::now(),
            rates: ArcSwap::from_pointee(rates),
            read: Mutex::new(DirectionBucket::new(rates.read_bytes_per_sec)),
            write: Mutex::new(DirectionBucket::new(rates.write_bytes_per_sec)),
        })
    }

    pub fn rates(&self) -> ThrottleRates {
        **self.rates.load()
    }

    pub fn update_rates(&self, rates: ThrottleRates) {
        self.rates.store(Arc::new(rates));
        *self.read.lock().unwrap() = DirectionBucket::new(rates.read_bytes_per_sec);
        *self.write.lock().unwrap() = DirectionBucket::new(rates.write_bytes_per_sec);
    }

    #[inline]
    pub fn elapsed_millis(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn read_is_set(&self) -> bool {
        self.read.lock().unwrap().is_set()
    }

    pub fn write_is_set(&self) -> bool {
        self.write.lock().unwrap().is_set()
    }

    pub fn grant_read(&self, elapsed_millis: u64, wanted: usize) -> BucketGrant {
        self.read.lock().unwrap().grant(elapsed_millis, wanted)
    }

    pub fn consume_read(&self, used: usize) {
        self.read.lock().unwrap().consume(used);
    }

    pub fn grant_write(&self, elapsed_millis: u64, wanted: usize) -> BucketGrant {
        self.write.lock().unwrap().grant(elapsed_millis, wanted)
    }

    pub fn consume_write(&self, used: usize) {
        self.write.lock().unwrap().consume(used);
    }
}
