//! Wire atoms and framing.
//!
//! Every message is `len:number || payload`, where a *number* is a
//! little-endian unsigned 64-bit word. The payload is a concatenation of
//! atoms: numbers, NUL-terminated strings, and length-prefixed byte blobs.
//! The width is fixed (rather than the platform word) so a frame means the
//! same thing to any build of the two processes.

use std::io::{self, IoSlice, Read, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use memchr::memchr;
use static_assertions::const_assert_eq;

use crate::buffer::ExpandingBuffer;
use crate::error::Error;

/// Width of a wire number in bytes.
pub const WORD: usize = 8;
const_assert_eq!(WORD, std::mem::size_of::<u64>());

/// Upper bound on a single frame's payload. Key paths, ciphertexts and
/// signatures are all well under this; anything larger is a corrupt or
/// hostile peer and is treated as a parse failure.
pub const MAX_FRAME_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Opaque index of a key inside the daemon's registry.
pub type KeyHandle = u64;

/// `load_key` reports this handle when it fails.
pub const INVALID_HANDLE: KeyHandle = u64::MAX;

pub const CMD_LOAD_KEY: &str = "load_key";
pub const CMD_PRIV_ENC: &str = "priv_enc";
pub const CMD_PRIV_DEC: &str = "priv_dec";
pub const CMD_SIGN: &str = "sign";
pub const CMD_SETUIDGID: &str = "setuidgid";

/// Typed atom accessors. Pushes append to the live region; shifts consume
/// from its front and fail without consuming anything if the region is too
/// short (or, for strings, unterminated).
impl ExpandingBuffer {
    pub fn push_num(&mut self, v: u64) {
        let mut word = [0u8; WORD];
        LittleEndian::write_u64(&mut word, v);
        self.push_slice(&word);
    }

    /// Append `s` plus its terminating NUL. `s` must not contain NUL.
    pub fn push_str(&mut self, s: &str) {
        debug_assert!(memchr(0, s.as_bytes()).is_none());
        self.push_slice(s.as_bytes());
        self.push_slice(&[0u8]);
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.push_num(bytes.len() as u64);
        self.push_slice(bytes);
    }

    pub fn shift_num(&mut self) -> Result<u64, Error> {
        let word = self
            .shift_slice(WORD)
            .map_err(|_| Error::Protocol("truncated number"))?;
        Ok(LittleEndian::read_u64(word))
    }

    pub fn shift_str(&mut self) -> Result<String, Error> {
        let nul = match memchr(0, self.live()) {
            Some(pos) => pos,
            None => return Err(Error::Protocol("string missing NUL terminator")),
        };
        let raw = self.shift_slice(nul + 1)?;
        let s = std::str::from_utf8(&raw[..nul])
            .map_err(|_| Error::Protocol("string is not utf-8"))?;
        Ok(s.to_owned())
    }

    pub fn shift_bytes(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.shift_num()? as usize;
        if len > self.size() {
            return Err(Error::Protocol("byte blob longer than message"));
        }
        Ok(self.shift_slice(len)?.to_vec())
    }
}

/// Emit the buffer's live region as one frame.
///
/// Length word and payload go out as a single vectored write, resumed at the
/// remaining offset after partial writes. `EINTR` is retried; a zero-byte
/// write means the peer is gone.
pub fn write_frame<W: Write>(w: &mut W, buf: &ExpandingBuffer) -> Result<(), Error> {
    let mut word = [0u8; WORD];
    LittleEndian::write_u64(&mut word, buf.size() as u64);
    let payload = buf.live();
    let total = WORD + payload.len();

    let mut written = 0usize;
    while written < total {
        let result = if written < WORD {
            let iov = [IoSlice::new(&word[written..]), IoSlice::new(payload)];
            w.write_vectored(&iov)
        } else {
            w.write(&payload[written - WORD..])
        };
        match result {
            Ok(0) => return Err(Error::Closed),
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}

/// Read one frame, appending its payload to `buf`'s live region.
///
/// EOF before a complete frame is a `Closed` error: the peer hung up.
pub fn read_frame<R: Read>(r: &mut R, buf: &mut ExpandingBuffer) -> Result<(), Error> {
    let len = match r.read_u64::<LittleEndian>() {
        Ok(v) => v,
        Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(Error::Closed),
        Err(e) => return Err(Error::Io(e)),
    };
    if len > MAX_FRAME_PAYLOAD {
        return Err(Error::Protocol("frame exceeds maximum size"));
    }
    match buf.fill_from(r, len as usize) {
        Ok(()) => Ok(()),
        Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(Error::Closed),
        Err(e) => Err(Error::Io(e)),
    }
}
