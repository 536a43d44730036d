//! Privilege separation for RSA private-key operations.
//!
//! A TLS-terminating process should never hold raw private keys in the
//! address space that parses untrusted network bytes. This crate forks a
//! *key daemon* once at startup; the daemon loads keys from disk and
//! performs every private-key primitive on the parent's behalf over an
//! `AF_UNIX` socket in a private tempdir. The parent keeps only handles and
//! public components, wrapped in a [`ProxyKey`] that slots in wherever the
//! TLS stack expects an RSA key.
//!
//! ```no_run
//! use keyshed::{Instance, RsaMethod};
//! use openssl::nid::Nid;
//!
//! # fn main() -> Result<(), keyshed::Error> {
//! let privsep = Instance::init()?;
//! let key = privsep.load_key("/etc/tls/server.pem".as_ref())?;
//!
//! // digest comes from the handshake transcript
//! let digest = [0u8; 32];
//! let mut sig = vec![0u8; key.size()];
//! let n = key.sign(Nid::SHA256, &digest, &mut sig)?;
//! sig.truncate(n);
//! # Ok(())
//! # }
//! ```
//!
//! The daemon dies with the parent (a liveness pipe, no shutdown RPC), and
//! any transport failure between the two aborts the parent: a TLS server
//! that silently lost its signing oracle is worse than a dead one.

pub mod buffer;
mod conn;
mod daemon;
pub mod error;
pub mod instance;
pub mod method;
pub mod proxy;
mod registry;
mod scoped_fd;
pub mod wire;

pub use crate::error::Error;
pub use crate::instance::{Instance, PrivateKeySink};
pub use crate::method::{LocalKey, RsaMethod};
pub use crate::proxy::ProxyKey;
pub use crate::wire::KeyHandle;
