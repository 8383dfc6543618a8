//! Byte buffers used by the stream engines.
//!
//! A [`Buffer`] is a fixed window over pooled storage with two phases:
//!
//! ```text
//!   fill:   [ consumed ........ | spare ............ ]
//!           0                  pos                 limit
//!
//!   drain:  [ done ...... | chunk ........ ]
//!           0            pos             limit
//! ```
//!
//! `pos <= limit <= window <= storage` holds at all times; the fields are
//! private so only the methods below can move the cursors.

pub mod pool;

pub use pool::BufferPool;

use bytes::BytesMut;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Fill,
    Drain,
}

/// Fixed-capacity byte region owned by exactly one engine at a time.
#[derive(Debug)]
pub struct Buffer {
    data: BytesMut,
    window: usize,
    pos: usize,
    limit: usize,
    phase: Phase,
    pooled: bool,
}

impl Buffer {
    pub(crate) fn new(data: BytesMut, window: usize) -> Self {
        debug_assert!(window <= data.len());
        Self {
            data,
            window,
            pos: 0,
            limit: window,
            phase: Phase::Fill,
            pooled: true,
        }
    }

    /// Zero-sized stand-in for a buffer a transport could not hand back.
    pub(crate) fn detached() -> Self {
        Self {
            data: BytesMut::new(),
            window: 0,
            pos: 0,
            limit: 0,
            phase: Phase::Fill,
            pooled: false,
        }
    }

    pub(crate) fn is_pooled(&self) -> bool {
        self.pooled
    }

    pub(crate) fn into_storage(self) -> BytesMut {
        self.data
    }

    /// Usable size of this buffer.
    pub fn capacity(&self) -> usize {
        self.window
    }

    /// Bytes between the cursor and the limit.
    ///
    /// Spare room while filling, unread bytes while draining.
    pub fn remaining(&self) -> usize {
        self.limit - self.pos
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.limit
    }

    /// Number of bytes written so far (fill phase) or the readable total
    /// (drain phase).
    pub fn filled(&self) -> usize {
        match self.phase {
            Phase::Fill => self.pos,
            Phase::Drain => self.limit,
        }
    }

    /// Write-only view of the unfilled region.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        debug_assert_eq!(self.phase, Phase::Fill);
        &mut self.data[self.pos..self.limit]
    }

    /// Marks `n` bytes of the spare region as written.
    pub fn commit(&mut self, n: usize) {
        debug_assert_eq!(self.phase, Phase::Fill);
        assert!(n <= self.remaining(), "commit past buffer limit");
        self.pos += n;
    }

    /// Copies as much of `src` as fits; returns the number of bytes taken.
    pub fn put(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.spare_mut()[..n].copy_from_slice(&src[..n]);
        self.pos += n;
        n
    }

    /// Switches from filling to draining over the bytes written so far.
    pub fn flip(&mut self) {
        debug_assert_eq!(self.phase, Phase::Fill);
        self.limit = self.pos;
        self.pos = 0;
        self.phase = Phase::Drain;
    }

    /// Read-only view of the unread bytes.
    pub fn chunk(&self) -> &[u8] {
        debug_assert_eq!(self.phase, Phase::Drain);
        &self.data[self.pos..self.limit]
    }

    /// Marks `n` unread bytes as consumed.
    pub fn advance(&mut self, n: usize) {
        debug_assert_eq!(self.phase, Phase::Drain);
        assert!(n <= self.remaining(), "advance past buffer limit");
        self.pos += n;
    }

    /// Copies unread bytes into `dst`, consuming them.
    pub fn take_into(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.remaining());
        dst[..n].copy_from_slice(&self.chunk()[..n]);
        self.pos += n;
        n
    }

    /// Resets to an empty fill-phase buffer over the whole window.
    pub fn clear(&mut self) {
        self.pos = 0;
        self.limit = self.window;
        self.phase = Phase::Fill;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(window: usize) -> Buffer {
        Buffer::new(BytesMut::zeroed(window), window)
    }

    #[test]
    fn fill_flip_drain() {
        let mut buf = buffer(8);
        assert_eq!(buf.put(b"hello world"), 8);
        assert_eq!(buf.remaining(), 0);
        buf.flip();
        assert_eq!(buf.chunk(), b"hello wo");

        let mut out = [0u8; 5];
        assert_eq!(buf.take_into(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert_eq!(buf.chunk(), b" wo");
    }

    #[test]
    fn clear_reopens_whole_window() {
        let mut buf = buffer(64);
        buf.put(b"abc");
        buf.flip();
        buf.clear();
        assert_eq!(buf.spare_mut().len(), 64);
    }

    #[test]
    #[should_panic(expected = "commit past buffer limit")]
    fn commit_beyond_limit_panics() {
        let mut buf = buffer(4);
        buf.commit(5);
    }
}
