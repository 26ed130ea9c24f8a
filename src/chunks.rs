use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};

/// Outbound data handoff between the producer (application calling `write`) and the
///  connection's scheduled write path.
///
/// Producer bytes accumulate in an active chunk of fixed size; full chunks queue up until
///  the writer drains them. The queue has its own lock so producers never contend with the
///  connection state lock.
pub struct ChunkQueue {
    chunk_size: usize,
    inner: Mutex<ChunkQueueInner>,
}

struct ChunkQueueInner {
    chunks: VecDeque<Bytes>,
    active: BytesMut,
}

impl ChunkQueue {
    pub fn new(chunk_size: usize) -> ChunkQueue {
        ChunkQueue {
            chunk_size,
            inner: Mutex::new(ChunkQueueInner {
                chunks: VecDeque::new(),
                active: BytesMut::with_capacity(chunk_size),
            }),
        }
    }

    /// Copies as much of `src` as fits, filling the active chunk and queueing completed
    ///  chunks until `chunk_limit` full chunks are pending. Returns the number of bytes
    ///  consumed, which is less than `src.len()` when the limit cut the write short.
    pub fn write(&self, src: &[u8], chunk_limit: usize) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut written = 0;

        while written < src.len() {
            let space = self.chunk_size - inner.active.len();
            if space == 0 {
                if inner.chunks.len() >= chunk_limit {
                    return written;
                }
                let full = std::mem::replace(&mut inner.active, BytesMut::with_capacity(self.chunk_size));
                inner.chunks.push_back(full.freeze());
                continue;
            }

            let n = space.min(src.len() - written);
            inner.active.extend_from_slice(&src[written..written + n]);
            written += n;
        }
        written
    }

    /// Takes the oldest chunk waiting to be sent, falling back to a partially filled
    ///  active chunk. `None` means there is nothing to send.
    pub fn next_chunk(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(chunk) = inner.chunks.pop_front() {
            return Some(chunk);
        }
        if !inner.active.is_empty() {
            let partial = std::mem::replace(&mut inner.active, BytesMut::with_capacity(self.chunk_size));
            return Some(partial.freeze());
        }
        None
    }

    /// Number of chunks waiting to be sent, counting a partially filled active chunk.
    pub fn pending_chunks(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        let mut count = inner.chunks.len();
        if !inner.active.is_empty() {
            count += 1;
        }
        count
    }
}
