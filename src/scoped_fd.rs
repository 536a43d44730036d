use std::os::unix::io::RawFd;

/// An owned file descriptor closed on drop.
///
/// `UnixListener`/`UnixStream` own their descriptors already; this covers the
/// raw ones that predate or outlive a std wrapper, i.e. the liveness pipe
/// ends handed across `fork`.
#[derive(Debug)]
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn from_raw(fd: RawFd) -> ScopedFd {
        debug_assert!(fd >= 0);
        ScopedFd { fd }
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    /// Close eagerly. Idempotent; drop does the same.
    pub fn close(&mut self) {
        if self.fd >= 0 {
            // EBADF/EINTR on close are not actionable here.
            let _ = nix::unistd::close(self.fd);
            self.fd = -1;
        }
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close();
    }
}
