/// Default number of output bytes retained per session.
pub const DEFAULT_TAIL_BYTES: usize = 4096;

/// Fixed-capacity ring buffer holding the most recent output of a session.
///
/// This is a preview cache, not scrollback: once full, every append
/// overwrites the oldest bytes in place. The backing storage is allocated
/// once at construction, so `append` never allocates.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    buf: Box<[u8]>,
    /// Index of the oldest byte.
    head: usize,
    len: usize,
}

impl Default for TailBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_BYTES)
    }
}

impl TailBuffer {
    /// Create an empty buffer retaining at most `capacity` bytes.
    ///
    /// A capacity of zero is bumped to one so the ring arithmetic stays valid.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Append `data`, discarding the oldest bytes once capacity is exceeded.
    pub fn append(&mut self, data: &[u8]) {
        let cap = self.buf.len();
        // Only the last `cap` bytes of the input can survive.
        let data = if data.len() > cap {
            &data[data.len() - cap..]
        } else {
            data
        };
        if data.is_empty() {
            return;
        }

        let tail = (self.head + self.len) % cap;
        let first = data.len().min(cap - tail);
        self.buf[tail..tail + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        if rest > 0 {
            self.buf[..rest].copy_from_slice(&data[first..]);
        }

        let total = self.len + data.len();
        if total > cap {
            let overflow = total - cap;
            self.head = (self.head + overflow) % cap;
            self.len = cap;
        } else {
            self.len = total;
        }
    }

    /// Copy out the retained bytes, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        let cap = self.buf.len();
        let mut out = Vec::with_capacity(self.len);
        let first = self.len.min(cap - self.head);
        out.extend_from_slice(&self.buf[self.head..self.head + first]);
        out.extend_from_slice(&self.buf[..self.len - first]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_buffer_is_empty() {
        let tail = TailBuffer::new(8);
        assert!(tail.is_empty());
        assert_eq!(tail.capacity(), 8);
        assert!(tail.snapshot().is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut tail = TailBuffer::new(0);
        tail.append(b"abc");
        assert_eq!(tail.snapshot(), b"c");
    }

    #[test]
    fn under_capacity_never_truncates() {
        let mut tail = TailBuffer::new(16);
        tail.append(b"hello ");
        tail.append(b"world");
        assert_eq!(tail.snapshot(), b"hello world");
        assert_eq!(tail.len(), 11);
    }

    #[test]
    fn exactly_capacity_keeps_everything() {
        let mut tail = TailBuffer::new(4);
        tail.append(b"ab");
        tail.append(b"cd");
        assert_eq!(tail.snapshot(), b"abcd");
    }

    #[test]
    fn overflow_keeps_last_bytes() {
        let mut tail = TailBuffer::new(4);
        tail.append(b"abc");
        tail.append(b"def");
        assert_eq!(tail.snapshot(), b"cdef");
        assert_eq!(tail.len(), 4);
    }

    #[test]
    fn oversized_append_keeps_its_suffix() {
        let mut tail = TailBuffer::new(4);
        tail.append(b"xy");
        tail.append(b"0123456789");
        assert_eq!(tail.snapshot(), b"6789");
    }

    #[test]
    fn wraps_repeatedly() {
        let mut tail = TailBuffer::new(5);
        let mut expected = Vec::new();
        for i in 0..100u8 {
            let chunk = [i, i.wrapping_add(1), i.wrapping_add(2)];
            tail.append(&chunk);
            expected.extend_from_slice(&chunk);
            assert!(tail.len() <= 5);
            let keep = expected.len().min(5);
            assert_eq!(tail.snapshot(), expected[expected.len() - keep..]);
        }
    }

    #[test]
    fn snapshot_does_not_mutate() {
        let mut tail = TailBuffer::new(4);
        tail.append(b"abcdef");
        let a = tail.snapshot();
        let b = tail.snapshot();
        assert_eq!(a, b);
        assert_eq!(tail.len(), 4);
    }

    #[test]
    fn clear_resets() {
        let mut tail = TailBuffer::new(4);
        tail.append(b"abcdef");
        tail.clear();
        assert!(tail.is_empty());
        tail.append(b"z");
        assert_eq!(tail.snapshot(), b"z");
    }

    #[test]
    fn empty_append_is_noop() {
        let mut tail = TailBuffer::new(4);
        tail.append(b"ab");
        tail.append(b"");
        assert_eq!(tail.snapshot(), b"ab");
    }

    #[test]
    fn default_capacity() {
        assert_eq!(TailBuffer::default().capacity(), DEFAULT_TAIL_BYTES);
    }
}
