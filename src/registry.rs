use std::sync::Mutex;

use openssl::pkey::Private;
use openssl::rsa::Rsa;

use crate::wire::KeyHandle;

/// Process-wide table of the daemon's loaded keys.
///
/// Append-only: a handle is the zero-based insertion index and stays valid
/// for the daemon's lifetime. One mutex over the backing vector guards both
/// the relocation on growth and the slot contents.
pub struct KeyRegistry {
    keys: Mutex<Vec<Rsa<Private>>>,
}

impl KeyRegistry {
    pub fn new() -> KeyRegistry {
        KeyRegistry {
            keys: Mutex::new(Vec::new()),
        }
    }

    /// Store a key and return its handle. `Rsa` is reference-counted
    /// internally, so the registry's copy keeps the key alive however the
    /// caller disposes of its own reference.
    pub fn register(&self, key: Rsa<Private>) -> KeyHandle {
        let mut keys = self.lock();
        keys.push(key);
        (keys.len() - 1) as KeyHandle
    }

    /// Look up a key by handle; the returned clone is a reference bump.
    pub fn lookup(&self, handle: KeyHandle) -> Option<Rsa<Private>> {
        let keys = self.lock();
        keys.get(handle as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Rsa<Private>>> {
        // A worker that panicked mid-push never leaves the vector in a
        // half-written state (push is the last thing register does), so a
        // poisoned lock is still safe to use.
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for KeyRegistry {
    fn default() -> KeyRegistry {
        KeyRegistry::new()
    }
}
