/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const DEFAULT_RELAY_BUFFER_SIZE: usize = 8 * 1024;
const MIN_RELAY_BUFFER_SIZE: usize = 2 * 1024;
const DEFAULT_YIELD_AFTER_BYTES: usize = 512 * 1024;
const MIN_YIELD_AFTER_BYTES: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LimitedCopyConfig {
    buffer_size: usize,
    yield_after: usize,
}

impl Default for LimitedCopyConfig {
    fn default() -> Self {
        LimitedCopyConfig {
            buffer_size: DEFAULT_RELAY_BUFFER_SIZE,
            yield_after: DEFAULT_YIELD_AFTER_BYTES,
        }
    }
}

impl LimitedCopyConfig {
    pub fn set_buffer_size(&mut self, buffer_size: usize) {
        self.buffer_size = buffer_size.max(MIN_RELAY_BUFFER_SIZE);
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn set_yield_after(&mut self, yield_after: usize) {
        self.yield_after = yield_after.max(MIN_YIELD_AFTER_BYTES);
    }
}

#[derive(Error, Debug)]
pub enum LimitedCopyError {
    #[error("relay read side failed: {0:?}")]
    ReadFailed(io::Error),
    #[error("relay write side failed: {0:?}")]
    WriteFailed(io::Error),
}

/// One-directional relay between two halves of a proxied exchange.
///
/// The engine alternates two phases on a single buffer: drain whatever is
/// pending to the writer, then refill from the reader. A poll that moves
/// `yield_after` bytes reschedules itself so one fast peer cannot starve
/// the other transfers on the worker. The idle flag feeds the caller's
/// idle-interval supervision.
pub struct LimitedCopy<'a, R: ?Sized, W: ?Sized> {
    reader: &'a mut R,
    writer: &'a mut W,
    buffer: Box<[u8]>,
    /// pending bytes not yet written, as a range into `buffer`
    pending: std::ops::Range<usize>,
    read_done: bool,
    copied: u64,
    yield_after: usize,
    need_flush: bool,
    active: bool,
}

impl<'a, R, W> LimitedCopy<'a, R, W>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    pub fn new(reader: &'a mut R, writer: &'a mut W, config: &LimitedCopyConfig) -> Self {
        LimitedCopy {
            reader,
            writer,
            buffer: vec![0u8; config.buffer_size].into_boxed_slice(),
            pending: 0..0,
            read_done: false,
            copied: 0,
            yield_after: config.yield_after,
            need_flush: false,
            active: false,
        }
    }

    /// Start with bytes that must go out before anything read from
    /// `reader`, typically a serialized response head ahead of its body.
    pub fn with_data(
        reader: &'a mut R,
        writer: &'a mut W,
        config: &LimitedCopyConfig,
        data: Vec<u8>,
    ) -> Self {
        let pending = 0..data.len();
        let mut data = data;
        if data.len() < config.buffer_size {
            data.resize(config.buffer_size, 0);
        }
        LimitedCopy {
            reader,
            writer,
            buffer: data.into_boxed_slice(),
            pending,
            read_done: false,
            copied: 0,
            yield_after: config.yield_after,
            need_flush: false,
            active: true, // there is data to move right away
        }
    }

    #[inline]
    pub fn no_cached_data(&self) -> bool {
        self.pending.is_empty()
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        !self.active
    }

    #[inline]
    pub fn reset_active(&mut self) {
        self.active = false;
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<Result<usize, LimitedCopyError>> {
        let mut drained = 0usize;
        while !self.pending.is_empty() {
            let data = &self.buffer[self.pending.clone()];
            match Pin::new(&mut *self.writer).poll_write(cx, data) {
                Poll::Pending => {
                    if drained == 0 {
                        return Poll::Pending;
                    }
                    break;
                }
                Poll::Ready(Err(e)) => {
                    return Poll::Ready(Err(LimitedCopyError::WriteFailed(e)));
                }
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(LimitedCopyError::WriteFailed(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "relay writer accepted no bytes",
                    ))));
                }
                Poll::Ready(Ok(nw)) => {
                    self.pending.start += nw;
                    self.copied += nw as u64;
                    self.need_flush = true;
                    self.active = true;
                    drained += nw;
                }
            }
        }
        Poll::Ready(Ok(drained))
    }

    fn poll_refill(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), LimitedCopyError>> {
        let mut buf = ReadBuf::new(&mut self.buffer);
        ready!(Pin::new(&mut *self.reader).poll_read(cx, &mut buf))
            .map_err(LimitedCopyError::ReadFailed)?;
        let nr = buf.filled().len();
        if nr == 0 {
            self.read_done = true;
        } else {
            self.pending = 0..nr;
            self.active = true;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_flush_if_needed(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), LimitedCopyError>> {
        if self.need_flush {
            ready!(Pin::new(&mut *self.writer).poll_flush(cx))
                .map_err(LimitedCopyError::WriteFailed)?;
            self.need_flush = false;
        }
        Poll::Ready(Ok(()))
    }
}

impl<R, W> Future for LimitedCopy<'_, R, W>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    type Output = Result<u64, LimitedCopyError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.get_mut();
        let mut moved_this_poll = 0usize;
        loop {
            // drain before touching the reader again
            match me.poll_drain(cx) {
                Poll::Pending => {
                    // writer blocked with data still pending; push out what
                    // already went through
                    ready!(me.poll_flush_if_needed(cx))?;
                    return Poll::Pending;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(drained)) => moved_this_poll += drained,
            }
            if !me.pending.is_empty() {
                // partial drain, the writer is backed up
                ready!(me.poll_flush_if_needed(cx))?;
                return Poll::Pending;
            }

            if me.read_done {
                ready!(me.poll_flush_if_needed(cx))?;
                return Poll::Ready(Ok(me.copied));
            }

            if moved_this_poll >= me.yield_after {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }

            match me.poll_refill(cx) {
                Poll::Pending => {
                    ready!(me.poll_flush_if_needed(cx))?;
                    return Poll::Pending;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::Result;
    use tokio_util::io::StreamReader;

    #[tokio::test]
    async fn relays_a_segmented_body() {
        let stream = tokio_stream::iter(vec![
            Result::Ok(Bytes::from_static(b"Suc")),
            Result::Ok(Bytes::from_static(b"cess!")),
        ]);
        let mut reader = StreamReader::new(stream);
        let mut out = Vec::new();

        let copy = LimitedCopy::new(&mut reader, &mut out, &LimitedCopyConfig::default());
        let n = copy.await.unwrap();
        assert_eq!(n, 8);
        assert_eq!(&out, b"Success!");
    }

    #[tokio::test]
    async fn response_head_goes_out_before_the_body() {
        let stream = tokio_stream::iter(vec![Result::Ok(Bytes::from_static(b"Success!"))]);
        let mut reader = StreamReader::new(stream);
        let mut out = Vec::new();

        let head = b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\n".to_vec();
        let copy = LimitedCopy::with_data(
            &mut reader,
            &mut out,
            &LimitedCopyConfig::default(),
            head,
        );
        let n = copy.await.unwrap();
        // the pre-seeded head counts toward the total
        assert_eq!(n as usize, out.len());
        assert_eq!(&out, b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nSuccess!");
    }

    #[tokio::test]
    async fn activity_flag_follows_progress() {
        let stream = tokio_stream::iter(vec![Result::Ok(Bytes::from_static(b"data"))]);
        let mut reader = StreamReader::new(stream);
        let mut out = Vec::new();

        let mut copy = LimitedCopy::new(&mut reader, &mut out, &LimitedCopyConfig::default());
        assert!(copy.is_idle());
        (&mut copy).await.unwrap();
        assert!(!copy.is_idle());
        copy.reset_active();
        assert!(copy.is_idle());
        assert!(copy.no_cached_data());
    }

    struct RefusingWriter;

    impl AsyncWrite for RefusingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(0))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn zero_length_write_is_an_error() {
        let stream = tokio_stream::iter(vec![Result::Ok(Bytes::from_static(b"data"))]);
        let mut reader = StreamReader::new(stream);
        let mut writer = RefusingWriter;

        let copy = LimitedCopy::new(&mut reader, &mut writer, &LimitedCopyConfig::default());
        match copy.await {
            Err(LimitedCopyError::WriteFailed(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::WriteZero);
            }
            r => panic!("unexpected result {r:?}"),
        }
    }
}
