//! Nonce generation for authenticated requests.
//!
//! Several signing patterns embed a strictly increasing nonce so the exchange
//! can reject replays.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::clock::{Clock, SystemClock};

/// Trait for providing nonces for authenticated requests.
///
/// The nonce must be strictly increasing for each request.
pub trait NonceProvider: Send + Sync {
    /// Generate the next nonce value.
    ///
    /// This value must be greater than any previously returned value.
    fn next_nonce(&self) -> u64;
}

/// Microsecond-timestamp nonces that never repeat.
///
/// Falls back to `last + 1` when two requests land in the same microsecond
/// or the clock steps backwards.
pub struct IncreasingNonce {
    last_nonce: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl IncreasingNonce {
    /// Create a provider backed by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a provider backed by a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            last_nonce: AtomicU64::new(0),
            clock,
        }
    }
}

impl Default for IncreasingNonce {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IncreasingNonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncreasingNonce")
            .field("last_nonce", &self.last_nonce.load(Ordering::Relaxed))
            .finish()
    }
}

impl NonceProvider for IncreasingNonce {
    fn next_nonce(&self) -> u64 {
        let time_nonce = self.clock.now_micros();
        let mut last = self.last_nonce.load(Ordering::SeqCst);
        loop {
            let next = time_nonce.max(last + 1);
            match self
                .last_nonce
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}

/// Always returns the same nonce. Only useful for reproducible signatures.
#[derive(Debug, Clone, Copy)]
pub struct FixedNonce(pub u64);

impl NonceProvider for FixedNonce {
    fn next_nonce(&self) -> u64 {
        self.0
    }
}
