/// A bounded byte region with a monotonically advancing `used` marker. The
/// readable region is `[0, used)` and the writable tail is `[used, size)`.
/// Buffers flow down a filter chain by borrowed reference for the duration
/// of one process call; a buffer handed to a producer is expected cleared.
pub struct Buffer {
    data: Vec<u8>,
    used: usize,
}

impl Buffer {
    /// Allocates a buffer with a fixed capacity.
    #[inline]
    pub fn allocate(size: usize) -> Buffer {
        Buffer {
            data: vec![0; size],
            used: 0,
        }
    }

    /// Total capacity of the buffer.
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Number of readable bytes.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Remaining free capacity in the writable tail.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.used
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.used == self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Slice containing the readable region.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Slice containing the writable tail. Writers fill a prefix of this
    /// slice and then advance the used marker.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.used..]
    }

    /// Advance the used marker over `count` bytes just written to the tail.
    #[inline]
    pub fn advance(&mut self, count: usize) {
        if count > self.remaining() {
            panic!(
                "Buffer advance of {} exceeds remaining capacity {}",
                count,
                self.remaining()
            );
        }

        self.used += count;
    }

    /// Copy `src` into the writable tail. The source must fit.
    #[inline]
    pub fn append(&mut self, src: &[u8]) {
        if src.len() > self.remaining() {
            panic!(
                "Buffer append of {} exceeds remaining capacity {}",
                src.len(),
                self.remaining()
            );
        }

        let used = self.used;
        self.data[used..used + src.len()].copy_from_slice(src);
        self.used += src.len();
    }

    #[inline]
    pub fn clear(&mut self) {
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_clear() {
        let mut buffer = Buffer::allocate(8);

        assert_eq!(buffer.size(), 8);
        assert_eq!(buffer.remaining(), 8);
        assert!(buffer.is_empty());

        buffer.append(&[1, 2, 3]);

        assert_eq!(buffer.used(), 3);
        assert_eq!(buffer.remaining(), 5);
        assert_eq!(buffer.bytes(), &[1, 2, 3]);
        assert!(!buffer.is_full());

        buffer.append(&[4, 5, 6, 7, 8]);

        assert!(buffer.is_full());
        assert_eq!(buffer.remaining(), 0);

        buffer.clear();

        assert!(buffer.is_empty());
        assert_eq!(buffer.remaining(), 8);
    }

    #[test]
    fn test_write_slice_advance() {
        let mut buffer = Buffer::allocate(4);

        buffer.write_slice()[..2].copy_from_slice(&[9, 9]);
        buffer.advance(2);

        assert_eq!(buffer.bytes(), &[9, 9]);
        assert_eq!(buffer.write_slice().len(), 2);
    }

    #[test]
    #[should_panic(expected = "Buffer append of 3 exceeds remaining capacity 2")]
    fn test_append_overflow() {
        let mut buffer = Buffer::allocate(2);
        buffer.append(&[1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "Buffer advance of 5 exceeds remaining capacity 4")]
    fn test_advance_overflow() {
        let mut buffer = Buffer::allocate(4);
        buffer.advance(5);
    }
}
