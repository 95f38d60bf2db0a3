/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::io;
use std::io::IoSlice;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use futures_util::FutureExt;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

use super::{BucketGrant, GlobalTrafficLimiter};

pub trait LimitedReaderStats {
    fn add_read_bytes(&self, size: usize);
}
pub type ArcLimitedReaderStats = Arc<dyn LimitedReaderStats + Send + Sync>;

#[derive(Default)]
pub struct NilLimitedReaderStats(());

impl LimitedReaderStats for NilLimitedReaderStats {
    fn add_read_bytes(&self, _size: usize) {}
}

struct LimitedReaderState {
    delay: Pin<Box<Sleep>>,
    limit: Option<Arc<GlobalTrafficLimiter>>,
    stats: ArcLimitedReaderStats,
}

impl LimitedReaderState {
    fn new(limit: Option<Arc<GlobalTrafficLimiter>>, stats: ArcLimitedReaderStats) -> Self {
        let limit = limit.filter(|l| l.read_is_set());
        LimitedReaderState {
            delay: Box::pin(tokio::time::sleep(Duration::from_millis(0))),
            limit,
            stats,
        }
    }

    fn poll_read<R>(
        &mut self,
        mut reader: Pin<&mut R>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead,
    {
        if let Some(limiter) = &self.limit {
            loop {
                match limiter.grant_read(limiter.elapsed_millis(), buf.remaining()) {
                    BucketGrant::Granted(len) => {
                        let mut limited_buf = ReadBuf::new(buf.initialize_unfilled_to(len));
                        ready!(reader.as_mut().poll_read(cx, &mut limited_buf))?;
                        let nr = limited_buf.filled().len();
                        limiter.consume_read(nr);
                        buf.advance(nr);
                        self.stats.add_read_bytes(nr);
                        return Poll::Ready(Ok(()));
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
            let old_filled_len = buf.filled().len();
            ready!(reader.poll_read(cx, buf))?;
            let nr = buf.filled().len() - old_filled_len;
            self.stats.add_read_bytes(nr);
            Poll::Ready(Ok(()))
        }
    }
}

/// Byte-counting, optionally rate-limited reader wrapper.
#[pin_project]
pub struct LimitedReader<R> {
    #[pin]
    inner: R,
    state: LimitedReaderState,
}

impl<R> LimitedReader<R> {
    pub fn new(
        inner: R,
        limit: Option<Arc<GlobalTrafficLimiter>>,
        stats: ArcLimitedReaderStats,
    ) -> Self {
        LimitedReader {
            inner,
            state: LimitedReaderState::new(limit, stats),
        }
    }

    pub fn new_unlimited(inner: R, stats: ArcLimitedReaderStats) -> Self {
        LimitedReader {
            inner,
            state: LimitedReaderState::new(None, stats),
        }
    }

    #[inline]
    pub fn reset_stats(&mut self, stats: ArcLimitedReaderStats) {
        self.state.stats = stats;
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R> AsyncRead for LimitedReader<R>
where
    R: AsyncRead,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        this.state.poll_read(this.inner, cx, buf)
    }
}

impl<R: AsyncRead + AsyncWrite> AsyncWrite for LimitedReader<R> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
