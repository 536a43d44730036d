use std::cmp;
use std::io::{self, Read};

use zeroize::Zeroize;

use crate::error::Error;

/// Buffers start at 4 KiB and double until the requested extra fits.
const INITIAL_CAPACITY: usize = 4096;

/// A growable byte region with a consume cursor.
///
/// The live payload is `[start, len)`: `push` appends at the end, `shift`
/// advances `start`. One buffer serves a whole request/response cycle: the
/// daemon shifts the request atoms out and pushes the response atoms into
/// the same buffer.
///
/// Buffers transiently hold private-key material and signatures, so every
/// byte that was ever live is zeroed on `dispose` and on drop.
pub struct ExpandingBuffer {
    /// `[0, start)` has been consumed, `[start, data.len())` is live.
    data: Vec<u8>,
    start: usize,
}

impl ExpandingBuffer {
    pub fn new() -> ExpandingBuffer {
        ExpandingBuffer {
            data: Vec::new(),
            start: 0,
        }
    }

    /// Number of live bytes.
    pub fn size(&self) -> usize {
        self.data.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// The live region.
    pub fn live(&self) -> &[u8] {
        &self.data[self.start..]
    }

    /// Ensure capacity for `extra` more bytes, doubling from 4 KiB.
    /// Allocation failure aborts the process.
    pub fn reserve(&mut self, extra: usize) {
        let needed = self.data.len() + extra;
        if needed <= self.data.capacity() {
            return;
        }
        let mut cap = cmp::max(self.data.capacity(), INITIAL_CAPACITY);
        while cap < needed {
            cap *= 2;
        }
        self.data.reserve_exact(cap - self.data.len());
    }

    pub fn push_slice(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.data.extend_from_slice(bytes);
    }

    /// Consume exactly `n` bytes from the front of the live region.
    pub fn shift_slice(&mut self, n: usize) -> Result<&[u8], Error> {
        if self.size() < n {
            return Err(Error::Protocol("message shorter than expected"));
        }
        let begin = self.start;
        self.start += n;
        Ok(&self.data[begin..begin + n])
    }

    /// Append exactly `n` bytes read from `r` to the live region.
    ///
    /// On a short read nothing is appended and whatever arrived is scrubbed.
    pub fn fill_from<R: Read>(&mut self, r: &mut R, n: usize) -> io::Result<()> {
        self.reserve(n);
        let old = self.data.len();
        self.data.resize(old + n, 0);
        if let Err(e) = r.read_exact(&mut self.data[old..]) {
            self.data[old..].zeroize();
            self.data.truncate(old);
            return Err(e);
        }
        Ok(())
    }

    /// Scrub every initialized byte and reset to empty. The allocation is
    /// kept so a worker can reuse the buffer for the next frame.
    pub fn dispose(&mut self) {
        self.data.zeroize();
        self.start = 0;
    }

    #[cfg(test)]
    pub(crate) fn backing_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}

impl Default for ExpandingBuffer {
    fn default() -> ExpandingBuffer {
        ExpandingBuffer::new()
    }
}

impl Drop for ExpandingBuffer {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_shift_in_order() {
        let mut buf = ExpandingBuffer::new();
        buf.push_slice(b"abc");
        buf.push_slice(b"defg");
        assert_eq!(buf.size(), 7);
        assert_eq!(buf.shift_slice(3).unwrap(), b"abc");
        assert_eq!(buf.shift_slice(4).unwrap(), b"defg");
        assert!(buf.is_empty());
    }

    #[test]
    fn shift_past_end_fails_and_consumes_nothing() {
        let mut buf = ExpandingBuffer::new();
        buf.push_slice(b"xy");
        assert!(buf.shift_slice(3).is_err());
        assert_eq!(buf.size(), 2);
        assert_eq!(buf.shift_slice(2).unwrap(), b"xy");
    }

    #[test]
    fn reserve_doubles_from_initial() {
        let mut buf = ExpandingBuffer::new();
        buf.push_slice(&[0u8; 1]);
        buf.reserve(INITIAL_CAPACITY);
        // 1 + 4096 does not fit in 4096, so capacity doubled once.
        buf.push_slice(&vec![7u8; INITIAL_CAPACITY]);
        assert_eq!(buf.size(), INITIAL_CAPACITY + 1);
    }

    #[test]
    fn fill_from_appends_exactly_n() {
        let mut buf = ExpandingBuffer::new();
        let mut src = io::Cursor::new(vec![9u8; 10]);
        buf.fill_from(&mut src, 6).unwrap();
        assert_eq!(buf.live(), &[9u8; 6][..]);
    }

    #[test]
    fn fill_from_short_read_leaves_buffer_unchanged() {
        let mut buf = ExpandingBuffer::new();
        buf.push_slice(b"head");
        let mut src = io::Cursor::new(vec![1u8; 3]);
        let err = buf.fill_from(&mut src, 8).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(buf.live(), b"head");
    }

    #[test]
    fn dispose_scrubs_backing_memory() {
        let mut buf = ExpandingBuffer::new();
        let secret = b"not for the parent address space";
        buf.push_slice(secret);
        let ptr = buf.backing_ptr();
        buf.dispose();
        assert!(buf.is_empty());
        // The allocation is still owned by the buffer; the payload must be
        // gone from it.
        let scrubbed = unsafe { std::slice::from_raw_parts(ptr, secret.len()) };
        assert!(scrubbed.iter().all(|&b| b == 0));
    }

    #[test]
    fn shift_after_partial_consume_sees_remaining_live_region() {
        let mut buf = ExpandingBuffer::new();
        buf.push_slice(b"0123456789");
        buf.shift_slice(4).unwrap();
        assert_eq!(buf.live(), b"456789");
        buf.push_slice(b"ab");
        assert_eq!(buf.live(), b"456789ab");
    }
}
