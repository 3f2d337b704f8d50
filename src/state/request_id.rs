use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

// Odd stride keeps the counter full-period over u64.
const COUNTER_STRIDE: u64 = 0x9e37_79b9_7f4a_7c15;

/// Allocates request ids on the request path without a syscall or lock.
///
/// A per-process random seed is mixed with a strided counter and stamped
/// with the v4 version bits. Ids never repeat within a process and do not
/// leak the request count.
pub(crate) struct RequestIdGenerator {
    seed: u128,
    counter: AtomicU64,
}

impl RequestIdGenerator {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            seed: fastrand::u128(..),
            counter: AtomicU64::new(fastrand::u64(..)),
        }
    }

    #[must_use]
    pub(crate) fn next(&self) -> Uuid {
        let step = self.counter.fetch_add(COUNTER_STRIDE, Ordering::Relaxed);
        let mixed = self.seed ^ (u128::from(step) << 32);
        uuid::Builder::from_random_bytes(mixed.to_be_bytes()).into_uuid()
    }
}
