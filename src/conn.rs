//! Per-thread daemon connections.
//!
//! The wire is strict request-response with no multiplexing, so connections
//! are never shared: each parent thread lazily opens its own socket per
//! privsep instance and keeps it in thread-local storage. The slot's drop at
//! thread exit closes the socket, which ends the matching daemon worker.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::buffer::ExpandingBuffer;
use crate::error::{fatal_transport, Error};
use crate::instance::Instance;
use crate::wire::{read_frame, write_frame};

thread_local! {
    static CONNECTIONS: RefCell<HashMap<u64, UnixStream>> = RefCell::new(HashMap::new());
}

fn connect_retrying(path: &Path) -> io::Result<UnixStream> {
    loop {
        match UnixStream::connect(path) {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Send the buffer as one frame and replace its contents with the response
/// payload.
///
/// Every failure in here (connect, send, receive) means the daemon is gone
/// or corrupt, and the parent must not limp on without it: this aborts the
/// process rather than returning an error.
pub(crate) fn round_trip(instance: &Instance, buf: &mut ExpandingBuffer) {
    let result = CONNECTIONS.with(|conns| {
        let mut conns = conns.borrow_mut();
        let stream = match conns.entry(instance.id()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => {
                let stream = connect_retrying(instance.socket_path()).map_err(Error::Io)?;
                slot.insert(stream)
            }
        };
        write_frame(stream, buf)?;
        buf.dispose();
        read_frame(stream, buf)
    });
    if let Err(e) = result {
        fatal_transport("key daemon exchange", &e);
    }
}
