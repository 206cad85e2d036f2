//! Byte-window extraction over a forward-only chunk stream.
//!
//! The backend hands out an object as an ordered sequence of chunks that
//! cannot be addressed by offset.  [`ChunkSlicer`] walks that sequence once,
//! tracking the running offset, skips chunks that end before the window,
//! trims the first and last overlapping chunks, and stops pulling as soon as
//! the window has been emitted.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::range::ByteRange;

/// Stream adapter yielding only the bytes of `range` from `inner`.
///
/// Errors from the inner stream are forwarded once and end the stream.
/// If the inner stream ends before `range.end()`, the output simply ends
/// short; callers must not assume the full window was produced.
pub struct ChunkSlicer<S> {
    inner: S,
    range: ByteRange,
    /// Bytes consumed from the start of `inner`.
    cursor: u64,
    done: bool,
}

impl<S> ChunkSlicer<S> {
    pub fn new(inner: S, range: ByteRange) -> Self {
        Self {
            inner,
            range,
            cursor: 0,
            done: false,
        }
    }

    /// Offset of the next unread byte of the underlying stream.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}

/// Shorthand for [`ChunkSlicer::new`].
pub fn slice<S>(chunks: S, range: ByteRange) -> ChunkSlicer<S> {
    ChunkSlicer::new(chunks, range)
}

impl<S, E> Stream for ChunkSlicer<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            // Never pull a chunk that starts past the window.
            if this.done || this.cursor > this.range.end() {
                this.done = true;
                return Poll::Ready(None);
            }

            let chunk = match ready!(this.inner.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
                None => {
                    this.done = true;
                    return Poll::Ready(None);
                }
            };

            let len = chunk.len() as u64;
            let chunk_start = this.cursor;
            this.cursor += len;

            if len == 0 || chunk_start + len - 1 < this.range.start() {
                continue;
            }

            let from = this.range.start().saturating_sub(chunk_start) as usize;
            let to = len.min(this.range.end() - chunk_start + 1) as usize;
            return Poll::Ready(Some(Ok(chunk.slice(from..to))));
        }
    }
}
