//! Registry of threads parked by a throttle, so they can be woken early.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::primitives::concurrency::CancellationToken;

/// Live set of parked threads, each represented by a cancellation handle.
///
/// A handle is registered before the wait starts and removed when it ends,
/// however it ends. Waking is advisory: a woken thread just returns early.
#[derive(Default)]
pub struct ParkedThreads {
    next_id: AtomicU64,
    parked: Mutex<HashMap<u64, CancellationToken>>,
}

struct Registration<'a> {
    registry: &'a ParkedThreads,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.parked.lock().remove(&self.id);
    }
}

impl ParkedThreads {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks the calling thread for up to `nanos`. Returns true if it was woken early.
    pub fn park(&self, nanos: u64) -> bool {
        let token = CancellationToken::new();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.parked.lock().insert(id, token.clone());
        let _registration = Registration { registry: self, id };
        token.wait_timeout(Duration::from_nanos(nanos))
    }

    /// Wakes every currently parked thread. Returns how many were signalled.
    pub fn unpark_all(&self) -> usize {
        let tokens: Vec<CancellationToken> = self.parked.lock().values().cloned().collect();
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    /// Number of threads currently parked.
    pub fn len(&self) -> usize {
        self.parked.lock().len()
    }

    /// True if no thread is parked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ParkedThreads {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParkedThreads")
            .field("parked", &self.len())
            .finish()
    }
}
