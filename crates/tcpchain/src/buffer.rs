//! Pending-byte buffers and their compaction.
//!
//! A channel keeps its unconsumed bytes in an immutable [`Bytes`]. Handlers
//! consume by advancing that value; afterwards the remainder is copied into
//! a freshly allocated buffer so the old allocation can be released. Buffers
//! are never mutated in place once published to a channel.

use {
    bytes::{BufMut, Bytes, BytesMut},
    std::{fmt, sync::Arc},
};

/// Default upper bound of bytes a channel may hold between cycles.
pub const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 8192;

/// Allocates a writable buffer with at least the requested capacity.
#[derive(Clone)]
pub struct BufferAllocator(Arc<dyn Fn(usize) -> BytesMut + Send + Sync>);

impl BufferAllocator {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(usize) -> BytesMut + Send + Sync + 'static,
    {
        BufferAllocator(Arc::new(f))
    }

    pub fn allocate(&self, capacity: usize) -> BytesMut {
        (self.0)(capacity)
    }
}

impl Default for BufferAllocator {
    fn default() -> Self {
        BufferAllocator::new(BytesMut::with_capacity)
    }
}

impl fmt::Debug for BufferAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BufferAllocator")
    }
}

/// Compacts `buffer` after handlers ran over it.
///
/// `original_len` is the length before the handler chain started. If nothing
/// was consumed the buffer is returned as is; otherwise the remainder is
/// copied into a new buffer of exactly its length.
pub fn compact(buffer: Bytes, original_len: usize, allocator: &BufferAllocator) -> Bytes {
    if buffer.len() == original_len {
        return buffer;
    }
    if buffer.is_empty() {
        return Bytes::new();
    }
    let mut fresh = allocator.allocate(buffer.len());
    fresh.put_slice(&buffer);
    fresh.freeze()
}

/// Appends newly read bytes to the pending buffer.
pub fn compact_with(pending: &Bytes, new_bytes: Bytes, allocator: &BufferAllocator) -> Bytes {
    if pending.is_empty() {
        return new_bytes;
    }
    if new_bytes.is_empty() {
        return pending.clone();
    }
    let mut fresh = allocator.allocate(pending.len() + new_bytes.len());
    fresh.put_slice(pending);
    fresh.put_slice(&new_bytes);
    fresh.freeze()
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        bytes::Buf,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    #[test]
    fn untouched_buffer_is_kept() {
        let alloc = BufferAllocator::default();
        let buf = Bytes::from_static(b"abcdef");
        let out = compact(buf.clone(), 6, &alloc);
        assert_eq!(out.as_ptr(), buf.as_ptr());
    }

    #[test]
    fn remainder_moves_to_fresh_buffer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let alloc = BufferAllocator::new(move |cap| {
            counted.fetch_add(cap, Ordering::SeqCst);
            BytesMut::with_capacity(cap)
        });

        let mut buf = Bytes::from_static(b"abcdef");
        buf.advance(4);
        let out = compact(buf, 6, &alloc);
        assert_eq!(&out[..], b"ef");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let mut buf = Bytes::from_static(b"abc");
        buf.advance(3);
        assert!(compact(buf, 3, &alloc).is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn new_bytes_append_after_pending() {
        let alloc = BufferAllocator::default();
        let pending = Bytes::from_static(b"ab");
        let out = compact_with(&pending, Bytes::from_static(b"cd"), &alloc);
        assert_eq!(&out[..], b"abcd");

        let out = compact_with(&Bytes::new(), Bytes::from_static(b"xy"), &alloc);
        assert_eq!(&out[..], b"xy");

        let out = compact_with(&pending, Bytes::new(), &alloc);
        assert_eq!(&out[..], b"ab");
    }

    #[test]
    fn fragmented_cycles_never_lose_or_duplicate() {
        let alloc = BufferAllocator::default();
        let stream: Vec<u8> = (0..200u8).collect();
        let mut pending = Bytes::new();
        let mut seen = Vec::new();

        // Read 7 bytes per cycle, consume only whole 5-byte records.
        for chunk in stream.chunks(7) {
            let mut buf = compact_with(&pending, Bytes::copy_from_slice(chunk), &alloc);
            let before = buf.len();
            while buf.len() >= 5 {
                seen.extend_from_slice(&buf.split_to(5));
            }
            pending = compact(buf, before, &alloc);
        }
        seen.extend_from_slice(&pending);
        assert_eq!(seen, stream);
    }
}
