/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::io;
use std::io::IoSlice;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A reader that hands back a chunk of already-buffered bytes before reading
/// from the wrapped stream. Used when a connection changes phase (CONNECT to
/// tunnel, plain to MITM TLS) and the old buffered reader may still hold
/// bytes that belong to the next phase.
#[pin_project]
pub struct OnceBufReader<R> {
    #[pin]
    inner: R,
    buf: Option<Bytes>,
}

impl<R> OnceBufReader<R> {
    pub fn new(inner: R, buf: Vec<u8>) -> Self {
        if buf.is_empty() {
            OnceBufReader { inner, buf: None }
        } else {
            OnceBufReader {
                inner,
                buf: Some(Bytes::from(buf)),
            }
        }
    }

    pub fn with_no_buf(inner: R) -> Self {
        OnceBufReader { inner, buf: None }
    }

    pub fn take_buf(&mut self) -> Option<Bytes> {
        self.buf.take()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead> AsyncRead for OnceBufReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();

        if let Some(mut cache) = this.buf.take() {
            let to_read = buf.remaining().min(cache.len());
            buf.put_slice(&cache.chunk()[0..to_read]);
            cache.advance(to_read);
            if !cache.is_empty() {
                *this.buf = Some(cache);
            }
            Poll::Ready(Ok(()))
        } else {
            this.inner.poll_read(cx, buf)
        }
    }
}

impl<R: AsyncRead + AsyncWrite> AsyncWrite for OnceBufReader<R> {
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
