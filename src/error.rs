use std::io;

use thiserror::Error;

/// Everything that can go wrong between the parent, the wire and the daemon.
///
/// Only `KeyLoad`, `Privilege` and `Primitive` are recoverable from the
/// caller's point of view; transport-level failures (`Io`, `Closed`,
/// `Protocol` on a response) never reach callers of the proxy operations
/// because the parent treats a silent daemon as unrecoverable and aborts.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the stream in the middle of a frame, or refused a
    /// write outright.
    #[error("connection closed by peer")]
    Closed,

    /// A frame or atom did not parse. On the daemon this drops the offending
    /// connection; on the parent it is treated like any transport failure.
    #[error("malformed message: {0}")]
    Protocol(&'static str),

    #[error("{0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    /// In-band `load_key` failure reported by the daemon.
    #[error("failed to load key: {0}")]
    KeyLoad(String),

    /// In-band `setuidgid` failure reported by the daemon.
    #[error("failed to drop privileges: {0}")]
    Privilege(String),

    /// The daemon ran the RSA primitive and it failed. The key and the
    /// transport are fine; the inputs (padding, buffer sizes, digest type)
    /// are not.
    #[error("rsa {op} failed in the key daemon")]
    Primitive { op: &'static str },

    /// Caller-supplied output buffer shorter than the primitive's result.
    #[error("output buffer too small for {op} result")]
    ShortBuffer { op: &'static str },
}

impl Error {
    pub(crate) fn from_nix(err: nix::Error) -> Error {
        Error::Io(io::Error::from_raw_os_error(err as i32))
    }
}

/// Abort the parent after a transport failure. There is no reconnect path:
/// a fresh connection would reach a daemon without this parent's key table,
/// or no daemon at all.
pub(crate) fn fatal_transport(op: &str, err: &Error) -> ! {
    log::error!("keyshed: fatal transport failure during {}: {}", op, err);
    eprintln!("keyshed: fatal transport failure during {}: {}", op, err);
    std::process::abort();
}
