//! Pooled, chainable byte buffers.
//!
//! A [`Chain`] is a FIFO of fixed-size [`Chunk`]s. All chunks but possibly the
//! last are either fully read from the tail or fully written to the head;
//! `split` cuts a chain at an arbitrary byte offset without copying payload,
//! which is how the parser hands the surplus bytes of a pipelined read back
//! to the connection as the start of the next message.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};

/// Default chunk size (`mbuf-size` in the runtime knobs), 16 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Tracks total bytes outstanding across every chunk drawn from the pool,
/// against a soft process-wide ceiling (`maxmemory`). Shared by `Arc` between
/// the pool and every chain that draws from it; only ever touched from the
/// event-loop thread, so a plain `AtomicUsize` (rather than a lock) is enough
/// headroom for the stats thread to read it concurrently.
#[derive(Debug)]
pub struct MemoryBudget {
    limit_bytes: usize,
    outstanding_bytes: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(limit_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            limit_bytes,
            outstanding_bytes: AtomicUsize::new(0),
        })
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding_bytes.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> usize {
        self.limit_bytes
    }

    /// True once outstanding bytes exceed the configured soft limit.
    pub fn over_limit(&self) -> bool {
        self.limit_bytes > 0 && self.outstanding() > self.limit_bytes
    }

    fn add(&self, n: usize) {
        self.outstanding_bytes.fetch_add(n, Ordering::Relaxed);
    }

    fn sub(&self, n: usize) {
        self.outstanding_bytes.fetch_sub(n, Ordering::Relaxed);
    }
}

/// A single fixed-capacity buffer with independent read/write cursors.
///
/// `BytesMut` already gives us the `start/read_pos/write_pos/end` cursor
/// arithmetic the spec describes (`advance`/`split_to`/`remaining_mut` are
/// O(1) reference-count operations, not copies), so `Chunk` is a thin wrapper
/// that also carries the chunk's accounted size back to the [`MemoryBudget`]
/// when dropped.
pub struct Chunk {
    buf: BytesMut,
    capacity: usize,
    budget: Arc<MemoryBudget>,
}

impl Chunk {
    fn new(capacity: usize, budget: Arc<MemoryBudget>) -> Self {
        budget.add(capacity);
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            budget,
        }
    }

    /// Writable span remaining in this chunk, at most `n` bytes.
    pub fn writable(&self, n: usize) -> usize {
        n.min(self.capacity - self.buf.len())
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.capacity
    }

    pub fn as_write_slice(&mut self, n: usize) -> &mut [u8] {
        let want = self.writable(n);
        let start = self.buf.len();
        self.buf.resize(start + want, 0);
        &mut self.buf[start..start + want]
    }

    /// Record that `n` bytes were actually written (e.g. by a `read()` into
    /// [`Chunk::as_write_slice`]), trimming any unused tail back off.
    pub fn commit_write(&mut self, start_len: usize, n: usize) {
        self.buf.truncate(start_len + n);
    }

    pub fn readable(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn advance(&mut self, n: usize) {
        self.buf.advance(n);
    }

    /// Split this chunk's buffer at `pos`, returning the suffix as a new
    /// chunk sharing the same underlying allocation (no copy).
    fn split_off(&mut self, pos: usize) -> Chunk {
        let suffix = self.buf.split_off(pos);
        Chunk {
            buf: suffix,
            capacity: self.capacity,
            budget: self.budget.clone(),
        }
    }

    pub fn put_slice(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        self.budget.sub(self.capacity);
    }
}

/// Draws [`Chunk`]s against a shared [`MemoryBudget`]. twemproxy-style free
/// lists reuse chunk allocations; we lean on the allocator instead (`BytesMut`
/// already pools via its own reclaimed capacity) and only keep the budget
/// accounting, which is the part the spec actually requires for backpressure.
#[derive(Clone)]
pub struct ChunkPool {
    chunk_size: usize,
    budget: Arc<MemoryBudget>,
}

impl ChunkPool {
    pub fn new(chunk_size: usize, limit_bytes: usize) -> Self {
        Self {
            chunk_size,
            budget: MemoryBudget::new(limit_bytes),
        }
    }

    pub fn budget(&self) -> Arc<MemoryBudget> {
        self.budget.clone()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn get(&self) -> Chunk {
        Chunk::new(self.chunk_size, self.budget.clone())
    }
}

/// FIFO of [`Chunk`]s backing one message's wire bytes.
pub struct Chain {
    pool: ChunkPool,
    chunks: VecDeque<Chunk>,
}

impl Chain {
    pub fn new(pool: ChunkPool) -> Self {
        Self {
            pool,
            chunks: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.is_empty())
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    /// Returns a writable slice of at most `n` bytes at the tail of the
    /// chain, growing the chain with a fresh chunk if the current tail is
    /// full or absent. Caller writes into the slice then calls
    /// [`Chain::commit_write`].
    pub fn push_write(&mut self, n: usize) -> (&mut [u8], usize) {
        if self.chunks.back().map(|c| c.is_full()).unwrap_or(true) {
            self.chunks.push_back(self.pool.get());
        }
        let tail = self.chunks.back_mut().expect("just pushed");
        let start_len = tail.len();
        let slice = tail.as_write_slice(n);
        (slice, start_len)
    }

    pub fn commit_write(&mut self, start_len: usize, n: usize) {
        if let Some(tail) = self.chunks.back_mut() {
            tail.commit_write(start_len, n);
        }
    }

    pub fn append_bytes(&mut self, data: &[u8]) {
        let mut offset = 0;
        while offset < data.len() {
            if self.chunks.back().map(|c| c.is_full()).unwrap_or(true) {
                self.chunks.push_back(self.pool.get());
            }
            let tail = self.chunks.back_mut().expect("just pushed");
            let room = tail.writable(data.len() - offset);
            let room = room.max(1).min(data.len() - offset);
            tail.put_slice(&data[offset..offset + room]);
            offset += room;
        }
    }

    /// Returns a contiguous readable span of up to `n` bytes from the head of
    /// the chain. Because chunks may not be physically contiguous this may
    /// return fewer bytes than `n` even when more are buffered; callers that
    /// need a longer run should drain repeatedly.
    pub fn pull_read(&self, n: usize) -> &[u8] {
        match self.chunks.front() {
            Some(head) => {
                let avail = head.readable().len();
                &head.readable()[..avail.min(n)]
            }
            None => &[],
        }
    }

    pub fn consume(&mut self, mut n: usize) {
        while n > 0 {
            let Some(head) = self.chunks.front_mut() else {
                break;
            };
            let avail = head.len();
            if n >= avail {
                n -= avail;
                self.chunks.pop_front();
            } else {
                head.advance(n);
                n = 0;
            }
        }
    }

    /// Splits the chain at absolute byte offset `pos`, returning a new chain
    /// holding everything from `pos` onward. The original chain retains only
    /// the bytes before `pos`. No payload bytes are copied.
    pub fn split(&mut self, pos: usize) -> Chain {
        let mut suffix = Chain::new(self.pool.clone());
        let mut remaining = pos;
        let mut keep = VecDeque::new();
        while let Some(mut chunk) = self.chunks.pop_front() {
            let len = chunk.len();
            if remaining >= len {
                remaining -= len;
                keep.push_back(chunk);
            } else {
                if remaining > 0 {
                    let tail = chunk.split_off(remaining);
                    keep.push_back(chunk);
                    suffix.chunks.push_back(tail);
                } else {
                    suffix.chunks.push_back(chunk);
                }
                // everything after this chunk also belongs to the suffix
                while let Some(rest) = self.chunks.pop_front() {
                    suffix.chunks.push_back(rest);
                }
                break;
            }
        }
        self.chunks = keep;
        suffix
    }

    /// Materializes the whole chain into one contiguous buffer. Used for the
    /// outgoing `writev` path and for tests; the hot path reads chunk-by-chunk
    /// instead to stay zero-copy.
    pub fn to_contiguous(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for chunk in &self.chunks {
            out.extend_from_slice(chunk.readable());
        }
        out
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ChunkPool {
        ChunkPool::new(8, 0)
    }

    #[test]
    fn append_and_read_round_trips() {
        let mut chain = Chain::new(pool());
        chain.append_bytes(b"hello world, this crosses chunks");
        assert_eq!(chain.to_contiguous(), b"hello world, this crosses chunks");
    }

    #[test]
    fn split_then_concat_yields_original() {
        let mut chain = Chain::new(pool());
        let payload = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n*1\r\n$4\r\nPING\r\n";
        chain.append_bytes(payload);
        let split_at = 20;
        let suffix = chain.split(split_at);
        let mut merged = chain.to_contiguous();
        merged.extend_from_slice(&suffix.to_contiguous());
        assert_eq!(merged, payload);
    }

    #[test]
    fn consume_drops_fully_read_chunks() {
        let mut chain = Chain::new(pool());
        chain.append_bytes(b"0123456789abcdef"); // exactly two 8-byte chunks
        chain.consume(8);
        assert_eq!(chain.to_contiguous(), b"89abcdef");
        assert_eq!(chain.len(), 8);
    }

    #[test]
    fn memory_budget_tracks_outstanding_bytes() {
        let pool = ChunkPool::new(8, 16);
        let budget = pool.budget();
        assert!(!budget.over_limit());
        let mut chain = Chain::new(pool);
        chain.append_bytes(b"0123456789abcdef0123"); // forces 3 chunks = 24 bytes
        assert!(budget.over_limit());
        drop(chain);
        assert_eq!(budget.outstanding(), 0);
    }
}
