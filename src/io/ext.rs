/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::AsyncBufRead;

/// How a bounded line read ended.
#[derive(Debug, PartialEq, Eq)]
pub enum LineReadResult {
    /// The delimiter was reached; total bytes appended, delimiter included.
    Line(usize),
    /// The stream ended before the delimiter.
    EndOfStream(usize),
    /// The byte budget ran out before the delimiter.
    LimitReached(usize),
}

/// Future returned by [`LimitedBufReadExt::limited_read_until`].
///
/// Appends to the caller's buffer up to and including the delimiter, but
/// never more than `max_len` bytes in total. Head parsers lean on the hard
/// budget: an attacker cannot make the proxy buffer an unbounded request
/// line or header line.
pub struct LimitedReadUntil<'a, R: ?Sized> {
    reader: &'a mut R,
    out: &'a mut Vec<u8>,
    delimiter: u8,
    max_len: usize,
    appended: usize,
}

impl<'a, R> Future for LimitedReadUntil<'a, R>
where
    R: AsyncBufRead + ?Sized + Unpin,
{
    type Output = io::Result<LineReadResult>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.get_mut();
        loop {
            let budget = me.max_len.saturating_sub(me.appended);
            if budget == 0 {
                return Poll::Ready(Ok(LineReadResult::LimitReached(me.appended)));
            }

            let mut reader = Pin::new(&mut *me.reader);
            let available = ready!(reader.as_mut().poll_fill_buf(cx))?;
            if available.is_empty() {
                return Poll::Ready(Ok(LineReadResult::EndOfStream(me.appended)));
            }

            let window = &available[..available.len().min(budget)];
            match window.iter().position(|&b| b == me.delimiter) {
                Some(at) => {
                    me.out.extend_from_slice(&window[..=at]);
                    me.appended += at + 1;
                    reader.consume(at + 1);
                    return Poll::Ready(Ok(LineReadResult::Line(me.appended)));
                }
                None => {
                    me.out.extend_from_slice(window);
                    me.appended += window.len();
                    let consumed = window.len();
                    reader.consume(consumed);
                }
            }
        }
    }
}

pub trait LimitedBufReadExt: AsyncBufRead {
    /// Read one delimited line into `out` with a hard byte budget.
    fn limited_read_until<'a>(
        &'a mut self,
        delimiter: u8,
        max_len: usize,
        out: &'a mut Vec<u8>,
    ) -> LimitedReadUntil<'a, Self>
    where
        Self: Unpin,
    {
        LimitedReadUntil {
            reader: self,
            out,
            delimiter,
            max_len,
            appended: 0,
        }
    }
}

impl<R: AsyncBufRead + ?Sized> LimitedBufReadExt for R {}
