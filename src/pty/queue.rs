//! Bounded-by-convention byte buffer drained by the multiplexer.

/// Soft ceiling on queued bytes. Producers should check `has_room()`
/// before appending more, but `append` never rejects data: callers
/// depend on the non-blocking-append guarantee, so exceeding the
/// ceiling grows the buffer instead of failing. Intentional.
pub const WRITE_QUEUE_SOFT_LIMIT: usize = 10 * 1024;

/// FIFO byte queue between producer threads and the multiplexer.
///
/// Producers append whole chunks; the multiplexer drains from the front
/// in bounded slices, one slice per readiness iteration. The owning
/// task wraps this in its own `Mutex`.
#[derive(Debug, Default)]
pub struct WriteQueue {
    buf: Vec<u8>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append bytes unconditionally. Never blocks, never fails.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Soft backpressure signal: false once the buffered length has
    /// reached the ceiling. Advisory only.
    pub fn has_room(&self) -> bool {
        self.buf.len() < WRITE_QUEUE_SOFT_LIMIT
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The front slice, at most `limit` bytes, for the next write attempt.
    pub fn front(&self, limit: usize) -> &[u8] {
        let n = self.buf.len().min(limit);
        &self.buf[..n]
    }

    /// Compact the queue after `written` bytes made it to the descriptor.
    pub fn consume(&mut self, written: usize) {
        let n = written.min(self.buf.len());
        self.buf.drain(..n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_across_chunks() {
        let mut q = WriteQueue::new();
        q.append(b"hello ");
        q.append(b"world");

        let mut drained = Vec::new();
        while !q.is_empty() {
            let chunk = q.front(4).to_vec();
            drained.extend_from_slice(&chunk);
            q.consume(chunk.len());
        }
        assert_eq!(drained, b"hello world");
    }

    #[test]
    fn test_partial_consume_keeps_remainder() {
        let mut q = WriteQueue::new();
        q.append(b"abcdef");
        q.consume(2);
        assert_eq!(q.front(16), b"cdef");
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn test_soft_limit_is_advisory() {
        let mut q = WriteQueue::new();
        assert!(q.has_room());
        q.append(&vec![0u8; WRITE_QUEUE_SOFT_LIMIT]);
        assert!(!q.has_room());
        // Appending past the ceiling still succeeds.
        q.append(b"x");
        assert_eq!(q.len(), WRITE_QUEUE_SOFT_LIMIT + 1);
    }

    #[test]
    fn test_consume_more_than_available() {
        let mut q = WriteQueue::new();
        q.append(b"ab");
        q.consume(10);
        assert!(q.is_empty());
    }

    #[test]
    fn test_front_respects_limit() {
        let mut q = WriteQueue::new();
        q.append(b"abcdef");
        assert_eq!(q.front(3), b"abc");
    }
}
