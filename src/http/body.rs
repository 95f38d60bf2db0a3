/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, ReadBuf};

use crate::io::LimitedCopyError;

use super::{HttpBodyType, HttpChunkedLine};

enum NextReadType {
    UntilEnd,
    FixedData,
    ChunkSizeLine,
    ChunkDataEnd,
    TrailerLine,
    Finished,
}

/// Streams a message body off an `AsyncBufRead`, yielding the wire bytes
/// verbatim (chunk framing included) and stopping exactly at the body end.
///
/// Relaying through this reader preserves the original framing on the next
/// hop. EOF on the inner stream ends a `ReadUntilEnd` body and is an error
/// for length-delimited ones.
pub struct HttpBodyReader<'a, R> {
    stream: &'a mut R,
    next_read_type: NextReadType,
    body_line_max_len: usize,

    next_read_size: u64,
    line_cache: Vec<u8>,
    cur_line_len: usize,
    chunked: bool,

    finished: bool,
}

impl<'a, R> HttpBodyReader<'a, R>
where
    R: AsyncBufRead + Unpin,
{
    const DEFAULT_LINE_SIZE: usize = 64;

    pub fn new(stream: &'a mut R, body_type: HttpBodyType, body_line_max_len: usize) -> Self {
        let (next_read_type, next_read_size, chunked) = match body_type {
            HttpBodyType::ContentLength(size) => (NextReadType::FixedData, size, false),
            HttpBodyType::Chunked | HttpBodyType::ChunkedWithTrailer => {
                (NextReadType::ChunkSizeLine, 0, true)
            }
            HttpBodyType::ReadUntilEnd => (NextReadType::UntilEnd, 0, false),
        };
        HttpBodyReader {
            stream,
            next_read_type,
            body_line_max_len,
            next_read_size,
            line_cache: Vec::with_capacity(Self::DEFAULT_LINE_SIZE),
            cur_line_len: 0,
            chunked,
            finished: false,
        }
    }

    #[inline]
    pub fn finished(&self) -> bool {
        self.finished
    }

    fn poll_until_end(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let old_remaining = buf.remaining();
        ready!(Pin::new(&mut *self.stream).poll_read(cx, buf))?;
        if old_remaining == buf.remaining() {
            // io closed, which indicates the end of body
            self.finished = true;
            self.next_read_type = NextReadType::Finished;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_fixed(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
        is_chunk_data: bool,
    ) -> Poll<io::Result<usize>> {
        let buf_len = buf
            .remaining()
            .min(self.next_read_size.min(usize::MAX as u64) as usize);
        let mut limited_buf = ReadBuf::new(buf.initialize_unfilled_to(buf_len));
        ready!(Pin::new(&mut *self.stream).poll_read(cx, &mut limited_buf))?;
        let nr = limited_buf.filled().len();
        if nr == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "reader closed while reading fixed length body",
            )));
        }
        buf.advance(nr);
        self.next_read_size -= nr as u64;

        if self.next_read_size == 0 {
            if is_chunk_data {
                // the CRLF after the chunk data comes next
                self.next_read_type = NextReadType::ChunkDataEnd;
                self.cur_line_len = 0;
            } else {
                self.finished = true;
                self.next_read_type = NextReadType::Finished;
            }
        }

        Poll::Ready(Ok(nr))
    }

    /// Copy one (partial) line through to `buf`, returning the number of
    /// bytes written and whether the line terminator was reached.
    fn poll_passthrough_line(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
        cache_line: bool,
    ) -> Poll<io::Result<bool>> {
        let mut reader = Pin::new(&mut *self.stream);
        let cache = ready!(reader.as_mut().poll_fill_buf(cx))?;
        if cache.is_empty() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "reader closed while reading body framing line",
            )));
        }

        let max_len = buf.remaining().min(cache.len());
        let cache = &cache[0..max_len];
        let (nr, done) = match memchr::memchr(b'\n', cache) {
            Some(offset) => (offset + 1, true),
            None => (cache.len(), false),
        };

        if self.cur_line_len + nr > self.body_line_max_len {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "body framing line too long",
            )));
        }

        buf.put_slice(&cache[0..nr]);
        if cache_line {
            self.line_cache.extend_from_slice(&cache[0..nr]);
        }
        self.cur_line_len += nr;
        reader.as_mut().consume(nr);
        Poll::Ready(Ok(done))
    }

    fn handle_chunk_size_line_end(&mut self) -> io::Result<()> {
        let chunk_size = HttpChunkedLine::parse(self.line_cache.as_slice())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            .chunk_size;
        self.line_cache.clear();
        self.cur_line_len = 0;
        if chunk_size == 0 {
            // trailer section (possibly just the final blank line) follows
            self.next_read_type = NextReadType::TrailerLine;
        } else {
            self.next_read_type = NextReadType::FixedData;
            self.next_read_size = chunk_size;
        }
        Ok(())
    }

    fn poll_read_inner(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.next_read_type {
            NextReadType::Finished => Poll::Ready(Ok(())),
            NextReadType::UntilEnd => self.poll_until_end(cx, buf),
            NextReadType::FixedData => {
                let chunked = self.chunked;
                self.poll_fixed(cx, buf, chunked).map(|r| r.map(|_| ()))
            }
            NextReadType::ChunkSizeLine => {
                let done = ready!(self.poll_passthrough_line(cx, buf, true))?;
                if done {
                    self.handle_chunk_size_line_end()?;
                }
                Poll::Ready(Ok(()))
            }
            NextReadType::ChunkDataEnd => {
                let done = ready!(self.poll_passthrough_line(cx, buf, false))?;
                if done {
                    if self.cur_line_len > 2 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "invalid chunk data ending",
                        )));
                    }
                    self.cur_line_len = 0;
                    self.next_read_type = NextReadType::ChunkSizeLine;
                }
                Poll::Ready(Ok(()))
            }
            NextReadType::TrailerLine => {
                let done = ready!(self.poll_passthrough_line(cx, buf, false))?;
                if done {
                    if self.cur_line_len <= 2 {
                        // blank line, end of the trailer section
                        self.finished = true;
                        self.next_read_type = NextReadType::Finished;
                    }
                    self.cur_line_len = 0;
                }
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl<'a, R> AsyncRead for HttpBodyReader<'a, R>
where
    R: AsyncBufRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        me.poll_read_inner(cx, buf)
    }
}

/// Streams a message body off an `AsyncBufRead`, yielding decoded payload
/// bytes with all chunk framing and trailers stripped.
pub struct HttpBodyDecodeReader<'a, R> {
    stream: &'a mut R,
    next_read_type: NextReadType,
    body_line_max_len: usize,

    next_read_size: u64,
    line_cache: Vec<u8>,
    cur_line_len: usize,
    chunked: bool,

    finished: bool,
}

impl<'a, R> HttpBodyDecodeReader<'a, R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(stream: &'a mut R, body_type: HttpBodyType, body_line_max_len: usize) -> Self {
        let (next_read_type, next_read_size, chunked) = match body_type {
            HttpBodyType::ContentLength(size) => (NextReadType::FixedData, size, false),
            HttpBodyType::Chunked | HttpBodyType::ChunkedWithTrailer => {
                (NextReadType::ChunkSizeLine, 0, true)
            }
            HttpBodyType::ReadUntilEnd => (NextReadType::UntilEnd, 0, false),
        };
        HttpBodyDecodeReader {
            stream,
            next_read_type,
            body_line_max_len,
            next_read_size,
            line_cache: Vec::with_capacity(64),
            cur_line_len: 0,
            chunked,
            finished: false,
        }
    }

    #[inline]
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Consume one (partial) framing line without yielding it.
    fn poll_consume_line(
        &mut self,
        cx: &mut Context<'_>,
        cache_line: bool,
    ) -> Poll<io::Result<bool>> {
        let mut reader = Pin::new(&mut *self.stream);
        let cache = ready!(reader.as_mut().poll_fill_buf(cx))?;
        if cache.is_empty() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "reader closed while reading body framing line",
            )));
        }

        let (nr, done) = match memchr::memchr(b'\n', cache) {
            Some(offset) => (offset + 1, true),
            None => (cache.len(), false),
        };

        if self.cur_line_len + nr > self.body_line_max_len {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "body framing line too long",
            )));
        }

        if cache_line {
            self.line_cache.extend_from_slice(&cache[0..nr]);
        }
        self.cur_line_len += nr;
        reader.as_mut().consume(nr);
        Poll::Ready(Ok(done))
    }
}

impl<'a, R> AsyncRead for HttpBodyDecodeReader<'a, R>
where
    R: AsyncBufRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            match me.next_read_type {
                NextReadType::Finished => return Poll::Ready(Ok(())),
                NextReadType::UntilEnd => {
                    let old_remaining = buf.remaining();
                    ready!(Pin::new(&mut *me.stream).poll_read(cx, buf))?;
                    if old_remaining == buf.remaining() {
                        me.finished = true;
                        me.next_read_type = NextReadType::Finished;
                    }
                    return Poll::Ready(Ok(()));
                }
                NextReadType::FixedData => {
                    let buf_len = buf
                        .remaining()
                        .min(me.next_read_size.min(usize::MAX as u64) as usize);
                    let mut limited_buf = ReadBuf::new(buf.initialize_unfilled_to(buf_len));
                    ready!(Pin::new(&mut *me.stream).poll_read(cx, &mut limited_buf))?;
                    let nr = limited_buf.filled().len();
                    if nr == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "reader closed while reading fixed length body",
                        )));
                    }
                    buf.advance(nr);
                    me.next_read_size -= nr as u64;
                    if me.next_read_size == 0 {
                        if me.chunked {
                            me.next_read_type = NextReadType::ChunkDataEnd;
                            me.cur_line_len = 0;
                        } else {
                            me.finished = true;
                            me.next_read_type = NextReadType::Finished;
                        }
                    }
                    return Poll::Ready(Ok(()));
                }
                NextReadType::ChunkSizeLine => {
                    let done = ready!(me.poll_consume_line(cx, true))?;
                    if done {
                        let chunk_size = HttpChunkedLine::parse(me.line_cache.as_slice())
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
                            .chunk_size;
                        me.line_cache.clear();
                        me.cur_line_len = 0;
                        if chunk_size == 0 {
                            me.next_read_type = NextReadType::TrailerLine;
                        } else {
                            me.next_read_type = NextReadType::FixedData;
                            me.next_read_size = chunk_size;
                        }
                    }
                }
                NextReadType::ChunkDataEnd => {
                    let done = ready!(me.poll_consume_line(cx, false))?;
                    if done {
                        if me.cur_line_len > 2 {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "invalid chunk data ending",
                            )));
                        }
                        me.cur_line_len = 0;
                        me.next_read_type = NextReadType::ChunkSizeLine;
                    }
                }
                NextReadType::TrailerLine => {
                    let done = ready!(me.poll_consume_line(cx, false))?;
                    if done {
                        if me.cur_line_len <= 2 {
                            me.finished = true;
                            me.next_read_type = NextReadType::Finished;
                        }
                        me.cur_line_len = 0;
                    }
                }
            }
        }
    }
}

const CHUNKED_BODY_END: &[u8] = b"0\r\n\r\n";

enum ChunkedTransferState {
    Read,
    WriteHead,
    WriteData,
    WriteDataEnd,
    WriteEnd,
    Flush,
    Done,
}

/// Copies every byte of `reader` to `writer` re-framed as a chunked body,
/// finishing with the `0\r\n\r\n` terminator.
pub struct StreamToChunkedTransfer<'a, R, W> {
    reader: &'a mut R,
    writer: &'a mut W,
    state: ChunkedTransferState,
    buffer: Vec<u8>,
    data_len: usize,
    head: Vec<u8>,
    offset: usize,
    total_write: u64,
    active: bool,
}

impl<'a, R, W> StreamToChunkedTransfer<'a, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: &'a mut R, writer: &'a mut W, buffer_size: usize) -> Self {
        StreamToChunkedTransfer {
            reader,
            writer,
            state: ChunkedTransferState::Read,
            buffer: vec![0u8; buffer_size],
            data_len: 0,
            head: Vec::with_capacity(16),
            offset: 0,
            total_write: 0,
            active: false,
        }
    }

    #[inline]
    pub fn copied_size(&self) -> u64 {
        self.total_write
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        !self.active
    }

    #[inline]
    pub fn reset_active(&mut self) {
        self.active = false;
    }

    #[inline]
    pub fn finished(&self) -> bool {
        matches!(self.state, ChunkedTransferState::Done)
    }

    #[inline]
    pub fn no_cached_data(&self) -> bool {
        matches!(
            self.state,
            ChunkedTransferState::Read | ChunkedTransferState::Done
        )
    }
}

impl<'a, R, W> Future for StreamToChunkedTransfer<'a, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    type Output = Result<(), LimitedCopyError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.get_mut();
        loop {
            match me.state {
                ChunkedTransferState::Read => {
                    let mut buf = ReadBuf::new(&mut me.buffer);
                    ready!(Pin::new(&mut *me.reader).poll_read(cx, &mut buf))
                        .map_err(LimitedCopyError::ReadFailed)?;
                    let nr = buf.filled().len();
                    me.active = true;
                    if nr == 0 {
                        me.offset = 0;
                        me.state = ChunkedTransferState::WriteEnd;
                    } else {
                        me.data_len = nr;
                        me.head.clear();
                        me.head.extend_from_slice(format!("{nr:x}\r\n").as_bytes());
                        me.offset = 0;
                        me.state = ChunkedTransferState::WriteHead;
                    }
                }
                ChunkedTransferState::WriteHead => {
                    while me.offset < me.head.len() {
                        let nw = ready!(
                            Pin::new(&mut *me.writer).poll_write(cx, &me.head[me.offset..])
                        )
                        .map_err(LimitedCopyError::WriteFailed)?;
                        if nw == 0 {
                            return Poll::Ready(Err(LimitedCopyError::WriteFailed(
                                io::Error::new(io::ErrorKind::WriteZero, "write zero bytes"),
                            )));
                        }
                        me.offset += nw;
                        me.active = true;
                    }
                    me.offset = 0;
                    me.state = ChunkedTransferState::WriteData;
                }
                ChunkedTransferState::WriteData => {
                    while me.offset < me.data_len {
                        let nw = ready!(Pin::new(&mut *me.writer)
                            .poll_write(cx, &me.buffer[me.offset..me.data_len]))
                        .map_err(LimitedCopyError::WriteFailed)?;
                        if nw == 0 {
                            return Poll::Ready(Err(LimitedCopyError::WriteFailed(
                                io::Error::new(io::ErrorKind::WriteZero, "write zero bytes"),
                            )));
                        }
                        me.offset += nw;
                        me.total_write += nw as u64;
                        me.active = true;
                    }
                    me.offset = 0;
                    me.state = ChunkedTransferState::WriteDataEnd;
                }
                ChunkedTransferState::WriteDataEnd => {
                    while me.offset < 2 {
                        let nw = ready!(
                            Pin::new(&mut *me.writer).poll_write(cx, &b"\r\n"[me.offset..])
                        )
                        .map_err(LimitedCopyError::WriteFailed)?;
                        if nw == 0 {
                            return Poll::Ready(Err(LimitedCopyError::WriteFailed(
                                io::Error::new(io::ErrorKind::WriteZero, "write zero bytes"),
                            )));
                        }
                        me.offset += nw;
                        me.active = true;
                    }
                    me.offset = 0;
                    me.state = ChunkedTransferState::Read;
                }
                ChunkedTransferState::WriteEnd => {
                    while me.offset < CHUNKED_BODY_END.len() {
                        let nw = ready!(Pin::new(&mut *me.writer)
                            .poll_write(cx, &CHUNKED_BODY_END[me.offset..]))
                        .map_err(LimitedCopyError::WriteFailed)?;
                        if nw == 0 {
                            return Poll::Ready(Err(LimitedCopyError::WriteFailed(
                                io::Error::new(io::ErrorKind::WriteZero, "write zero bytes"),
                            )));
                        }
                        me.offset += nw;
                        me.active = true;
                    }
                    me.state = ChunkedTransferState::Flush;
                }
                ChunkedTransferState::Flush => {
                    ready!(Pin::new(&mut *me.writer).poll_flush(cx))
                        .map_err(LimitedCopyError::WriteFailed)?;
                    me.state = ChunkedTransferState::Done;
                }
                ChunkedTransferState::Done => return Poll::Ready(Ok(())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, BufReader, Result};
    use tokio_util::io::StreamReader;

    #[tokio::test]
    async fn read_single_content_length() {
        let content = b"test body";
        let stream = tokio_stream::iter(vec![Result::Ok(Bytes::from_static(content))]);
        let stream = StreamReader::new(stream);
        let mut buf_stream = BufReader::new(stream);
        let mut body_reader =
            HttpBodyReader::new(&mut buf_stream, HttpBodyType::ContentLength(9), 1024);

        let mut buf = Vec::new();
        let len = body_reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(len, 9);
        assert_eq!(&buf, content);
        assert!(body_reader.finished());
    }

    #[tokio::test]
    async fn read_single_chunked_passthrough() {
        let body_len: usize = 24;
        let content = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\nXXX";
        let stream = tokio_stream::iter(vec![Result::Ok(Bytes::from_static(content))]);
        let stream = StreamReader::new(stream);
        let mut buf_stream = BufReader::new(stream);
        let mut body_reader = HttpBodyReader::new(&mut buf_stream, HttpBodyType::Chunked, 1024);

        let mut buf = Vec::new();
        let len = body_reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(len, content.len() - 3);
        assert_eq!(&buf, &content[0..content.len() - 3]);
        assert!(body_reader.finished());
        let _ = body_len;
    }

    #[tokio::test]
    async fn read_single_chunked_with_trailer() {
        let content = b"5\r\nhello\r\n0\r\nX-Sum: abc\r\n\r\n";
        let stream = tokio_stream::iter(vec![Result::Ok(Bytes::from_static(content))]);
        let stream = StreamReader::new(stream);
        let mut buf_stream = BufReader::new(stream);
        let mut body_reader =
            HttpBodyReader::new(&mut buf_stream, HttpBodyType::ChunkedWithTrailer, 1024);

        let mut buf = Vec::new();
        body_reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(&buf, content);
        assert!(body_reader.finished());
    }

    #[tokio::test]
    async fn read_split_chunked_passthrough() {
        let content1 = b"5\r\nhe";
        let content2 = b"llo\r\n0\r\n\r\n";
        let stream = tokio_stream::iter(vec![
            Result::Ok(Bytes::from_static(content1)),
            Result::Ok(Bytes::from_static(content2)),
        ]);
        let stream = StreamReader::new(stream);
        let mut buf_stream = BufReader::new(stream);
        let mut body_reader = HttpBodyReader::new(&mut buf_stream, HttpBodyType::Chunked, 1024);

        let mut buf = Vec::new();
        body_reader.read_to_end(&mut buf).await.unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(content1);
        expected.extend_from_slice(content2);
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn decode_chunked() {
        let content = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let stream = tokio_stream::iter(vec![Result::Ok(Bytes::from_static(content))]);
        let stream = StreamReader::new(stream);
        let mut buf_stream = BufReader::new(stream);
        let mut body_reader =
            HttpBodyDecodeReader::new(&mut buf_stream, HttpBodyType::Chunked, 1024);

        let mut buf = Vec::new();
        body_reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
        assert!(body_reader.finished());
    }

    #[tokio::test]
    async fn decode_until_end() {
        let content = b"Success!";
        let stream = tokio_stream::iter(vec![Result::Ok(Bytes::from_static(content))]);
        let stream = StreamReader::new(stream);
        let mut buf_stream = BufReader::new(stream);
        let mut body_reader =
            HttpBodyDecodeReader::new(&mut buf_stream, HttpBodyType::ReadUntilEnd, 1024);

        let mut buf = Vec::new();
        body_reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(&buf, content);
        assert!(body_reader.finished());
    }

    #[tokio::test]
    async fn encode_chunked() {
        let content = b"Success!";
        let stream = tokio_stream::iter(vec![Result::Ok(Bytes::from_static(content))]);
        let mut reader = StreamReader::new(stream);
        let mut out = Vec::new();

        let transfer = StreamToChunkedTransfer::new(&mut reader, &mut out, 4096);
        transfer.await.unwrap();
        assert_eq!(&out, b"8\r\nSuccess!\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn encode_chunked_empty() {
        let stream = tokio_stream::iter(Vec::<Result<Bytes>>::new());
        let mut reader = StreamReader::new(stream);
        let mut out = Vec::new();

        let transfer = StreamToChunkedTransfer::new(&mut reader, &mut out, 4096);
        transfer.await.unwrap();
        assert_eq!(&out, b"0\r\n\r\n");
    }
}
