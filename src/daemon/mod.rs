//! The key daemon: the forked child that owns every private key.
//!
//! Two long-lived flows. A liveness watcher blocks on the pipe inherited
//! from the parent and takes the whole process down (cleaning up the socket
//! directory) the moment the parent is gone. An acceptor turns each client
//! connection into a detached worker thread running the
//! `read_frame → dispatch → write_frame` loop. Workers share nothing but the
//! key registry; a fault on one connection never touches the others.

mod handlers;

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use nix::errno::Errno;

use crate::buffer::ExpandingBuffer;
use crate::error::Error;
use crate::registry::KeyRegistry;
use crate::scoped_fd::ScopedFd;
use crate::wire::{read_frame, write_frame};

use self::handlers::HandlerCtx;

/// Entered in the forked child; never returns.
pub(crate) fn daemon_main(
    listener: UnixListener,
    lifeline: ScopedFd,
    tempdir: PathBuf,
    sock_path: PathBuf,
) -> ! {
    let registry = Arc::new(KeyRegistry::new());

    let watch_dir = tempdir.clone();
    thread::spawn(move || watch_parent(lifeline, watch_dir));

    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                let registry = Arc::clone(&registry);
                let tempdir = tempdir.clone();
                let sock_path = sock_path.clone();
                thread::spawn(move || serve(stream, &registry, tempdir, sock_path));
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::error!("keyshed daemon: accept: {}", e);
            }
        }
    }
}

/// Block on the pipe whose write end the parent holds. The parent never
/// writes; the only way out is the read failing, which means the parent is
/// gone. Keys and connections are reclaimed by process exit; there is no
/// orderly shutdown path.
fn watch_parent(lifeline: ScopedFd, tempdir: PathBuf) -> ! {
    let mut byte = [0u8; 1];
    loop {
        match nix::unistd::read(lifeline.as_raw(), &mut byte) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
    let _ = std::fs::remove_dir_all(&tempdir);
    // _exit: atexit handlers and stdio buffers belong to the parent's image.
    unsafe { libc::_exit(0) }
}

/// One worker per connection. Any transport or parse fault ends this
/// connection only; the buffer is scrubbed on the way out either way.
fn serve(mut stream: UnixStream, registry: &KeyRegistry, tempdir: PathBuf, sock_path: PathBuf) {
    let ctx = HandlerCtx {
        registry,
        tempdir: &tempdir,
        sock_path: &sock_path,
    };
    let mut buf = ExpandingBuffer::new();

    loop {
        match read_frame(&mut stream, &mut buf) {
            Ok(()) => {}
            Err(Error::Closed) => {
                log::debug!("keyshed daemon: client disconnected");
                return;
            }
            Err(e) => {
                log::warn!("keyshed daemon: dropping connection: {}", e);
                return;
            }
        }

        let cmd = match buf.shift_str() {
            Ok(cmd) => cmd,
            Err(e) => {
                log::warn!("keyshed daemon: dropping connection: {}", e);
                return;
            }
        };

        if let Err(e) = handlers::dispatch(&cmd, &mut buf, &ctx) {
            log::warn!(
                "keyshed daemon: {:?} failed, dropping connection: {}",
                cmd,
                e
            );
            return;
        }

        if let Err(e) = write_frame(&mut stream, &buf) {
            log::warn!("keyshed daemon: send failed, dropping connection: {}", e);
            return;
        }
        buf.dispose();
    }
}
