use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide connection identifier. Monotonically increasing, never reused.
pub type ConnectionId = u64;

/// Allocates connection identifiers with an atomic counter.
///
/// Injected into the accept loop rather than kept as a global so tests can
/// run isolated allocators.
#[derive(Debug, Default)]
pub struct ConnectionIdAllocator {
    next: AtomicU64,
}

impl ConnectionIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self) -> ConnectionId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
