/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use futures_util::FutureExt;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

use super::{BucketGrant, GlobalTrafficLimiter};

pub trait LimitedWriterStats {
    fn add_write_bytes(&self, size: usize);
}
pub type ArcLimitedWriterStats = Arc<dyn LimitedWriterStats + Send + Sync>;

#[derive(Default)]
pub struct NilLimitedWriterStats(());

impl LimitedWriterStats for NilLimitedWriterStats {
    fn add_write_bytes(&self, _size: usize) {}
}

struct LimitedWriterState {
    delay: Pin<Box<Sleep>>,
    limit: Option<Arc<GlobalTrafficLimiter>>,
    stats: ArcLimitedWriterStats,
}

impl LimitedWriterState {
    fn new(limit: Option<Arc<GlobalTrafficLimiter>>, stats: ArcLimitedWriterStats) -> Self {
        let limit = limit.filter(|l| l.write_is_set());
        LimitedWriterState {
            delay: Box::pin(tokio::time::sleep(Duration::from_millis(0))),
            limit,
            stats,
        }
    }

    fn poll_write<W>(
        &mut self,
        mut writer: Pin<&mut W>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>>
    where
        W: AsyncWrite,
    {
        if let Some(limiter) = &self.limit {
            loop {
                match limiter.grant_write(limiter.elapsed_millis(), buf.len()) {
                    BucketGrant::Granted(len) => {
                        let nw = ready!(writer.as_mut().poll_write(cx, &buf[0..len]))?;
                        limiter.consume_write(nw);
                        self.stats.add_write_bytes(nw);
                        return Poll::Ready(Ok(nw));
                    }
                    BucketGrant::Wait(ms) => {
                        self.delay
                            .as_mut()
                            .reset(tokio::time::Instant::now() + Duration::from_millis(ms));
                        ready!(self.delay.poll_unpin(cx));
                        // the interval rolled over while we were being polled
                    }
                }
            }
        } else {
            let nw = ready!(writer.poll_write(cx, buf))?;
            self.stats.add_write_bytes(nw);
            Poll::Ready(Ok(nw))
        }
    }
}

/// Byte-counting, optionally rate-limited writer wrapper.
#[pin_project]
pub struct LimitedWriter<W> {
    #[pin]
    inner: W,
    state: LimitedWriterState,
}

impl<W> LimitedWriter<W> {
    pub fn new(
        inner: W,
        limit: Option<Arc<GlobalTrafficLimiter>>,
        stats: ArcLimitedWriterStats,
    ) -> Self {
        LimitedWriter {
            inner,
            state: LimitedWriterState::new(limit, stats),
        }
    }

    pub fn new_unlimited(inner: W, stats: ArcLimitedWriterStats) -> Self {
        LimitedWriter {
            inner,
            state: LimitedWriterState::new(None, stats),
        }
    }

    #[inline]
    pub fn reset_stats(&mut self, stats: ArcLimitedWriterStats) {
        self.state.stats = stats;
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W> AsyncWrite for LimitedWriter<W>
where
    W: AsyncWrite,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        this.state.poll_write(this.inner, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

impl<W: AsyncRead + AsyncWrite> AsyncRead for LimitedWriter<W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}
