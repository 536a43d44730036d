//! Bootstrap: fork the daemon, wire up the socket and the liveness pipe,
//! and expose the parent-facing API.
//!
//! Order matters here. The tempdir, socket and listening descriptor are
//! created before `fork` so both processes share them; the liveness pipe's
//! write end carries `FD_CLOEXEC` so an `exec` in the parent cannot keep a
//! stale daemon alive. The child never returns from [`Instance::init`].

use std::env;
use std::os::unix::io::IntoRawFd;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::{fork, pipe, ForkResult};

use crate::buffer::ExpandingBuffer;
use crate::conn;
use crate::daemon;
use crate::error::{fatal_transport, Error};
use crate::proxy::ProxyKey;
use crate::scoped_fd::ScopedFd;
use crate::wire::{self, KeyHandle};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(0);

/// Where a freshly loaded proxy key gets installed, typically an adapter
/// around a TLS context. The sink reports rejection as a message, which the
/// caller sees as a recoverable load failure.
pub trait PrivateKeySink {
    fn install(&mut self, key: ProxyKey) -> Result<(), String>;
}

/// One privilege-separation instance: a forked key daemon plus everything
/// the parent needs to reach it. Lives for the process lifetime; dropping
/// the last reference closes the liveness pipe, which the daemon takes as
/// its signal to clean up the tempdir and exit.
pub struct Instance {
    id: u64,
    tempdir: PathBuf,
    sock_path: PathBuf,
    #[allow(dead_code)] // held for its drop: closing it is the daemon's exit signal
    lifeline: ScopedFd,
    /// Back-reference so proxy keys can hold the instance alive.
    weak_self: std::sync::Weak<Instance>,
}

impl Instance {
    /// Create the tempdir and socket, fork the daemon, and hand the parent
    /// its instance. Any failure unwinds fully: descriptors close via RAII
    /// and the tempdir is removed.
    pub fn init() -> Result<Arc<Instance>, Error> {
        let template = env::temp_dir().join("keyshed.XXXXXX");
        let tempdir = nix::unistd::mkdtemp(&template).map_err(Error::from_nix)?;
        match Instance::bootstrap(&tempdir) {
            Ok(instance) => Ok(instance),
            Err(e) => {
                let _ = std::fs::remove_dir_all(&tempdir);
                Err(e)
            }
        }
    }

    fn bootstrap(tempdir: &Path) -> Result<Arc<Instance>, Error> {
        let sock_path = tempdir.join("_");
        let listener = UnixListener::bind(&sock_path)?;

        let (read_end, write_end) = pipe().map_err(Error::from_nix)?;
        let mut read_end = ScopedFd::from_raw(read_end.into_raw_fd());
        let mut write_end = ScopedFd::from_raw(write_end.into_raw_fd());
        fcntl(write_end.as_raw(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(Error::from_nix)?;

        match unsafe { fork() }.map_err(Error::from_nix)? {
            ForkResult::Child => {
                write_end.close();
                daemon::daemon_main(
                    listener,
                    read_end,
                    tempdir.to_path_buf(),
                    sock_path,
                )
            }
            ForkResult::Parent { .. } => {
                read_end.close();
                drop(listener);
                Ok(Arc::new_cyclic(|weak| Instance {
                    id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
                    tempdir: tempdir.to_path_buf(),
                    sock_path,
                    lifeline: write_end,
                    weak_self: weak.clone(),
                }))
            }
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn shared(&self) -> Arc<Instance> {
        // Callable only through the Arc this instance lives in, so the
        // upgrade cannot fail.
        self.weak_self.upgrade().unwrap()
    }

    pub fn socket_path(&self) -> &Path {
        &self.sock_path
    }

    pub fn tempdir(&self) -> &Path {
        &self.tempdir
    }

    /// Ask the daemon to load the PEM private key at `path` and install the
    /// resulting proxy key into `sink`.
    pub fn load_private_key_file(
        &self,
        path: &Path,
        sink: &mut dyn PrivateKeySink,
    ) -> Result<(), Error> {
        let key = self.load_key(path)?;
        sink.install(key).map_err(Error::KeyLoad)
    }

    /// `load_key` round trip. Failures the daemon reports in-band (missing
    /// file, bad PEM) come back as [`Error::KeyLoad`] and leave the
    /// instance fully usable.
    pub fn load_key(&self, path: &Path) -> Result<ProxyKey, Error> {
        let path_str = match path.to_str() {
            Some(s) => s,
            None => {
                return Err(Error::KeyLoad(format!(
                    "{}: path is not valid utf-8",
                    path.display()
                )))
            }
        };

        let mut buf = ExpandingBuffer::new();
        buf.push_str(wire::CMD_LOAD_KEY);
        buf.push_str(path_str);
        conn::round_trip(self, &mut buf);

        let (ok, handle, e_hex, n_hex, err) = match parse_load_response(&mut buf) {
            Ok(parsed) => parsed,
            Err(e) => fatal_transport("load_key", &e),
        };
        if ok == 0 {
            return Err(Error::KeyLoad(err));
        }

        match ProxyKey::from_daemon_parts(self.shared(), handle, &e_hex, &n_hex) {
            Ok(key) => Ok(key),
            Err(e) => fatal_transport("load_key", &e),
        }
    }

    /// Tell the daemon to drop privileges to `user`. With
    /// `change_socket_ownership` the socket directory is chowned first so
    /// new parent threads can still connect after the parent drops
    /// privileges itself.
    pub fn setuidgid(&self, user: &str, change_socket_ownership: bool) -> Result<(), Error> {
        let mut buf = ExpandingBuffer::new();
        buf.push_str(wire::CMD_SETUIDGID);
        buf.push_str(user);
        buf.push_num(change_socket_ownership as u64);
        conn::round_trip(self, &mut buf);

        let ret = match buf.shift_num() {
            Ok(v) => v as i64,
            Err(e) => fatal_transport("setuidgid", &e),
        };
        if ret != 0 {
            return Err(Error::Privilege(format!(
                "daemon could not switch to user {:?}",
                user
            )));
        }
        Ok(())
    }
}

fn parse_load_response(
    buf: &mut ExpandingBuffer,
) -> Result<(u64, KeyHandle, String, String, String), Error> {
    let ok = buf.shift_num()?;
    let handle = buf.shift_num()?;
    let e_hex = buf.shift_str()?;
    let n_hex = buf.shift_str()?;
    let err = buf.shift_str()?;
    if !buf.is_empty() {
        return Err(Error::Protocol("trailing bytes in response"));
    }
    Ok((ok, handle, e_hex, n_hex, err))
}
