use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Instant;

/// Monotonic millisecond source for request timestamps and stall tracking.
///
/// Production downloads anchor on [`Instant`]; tests drive a manual clock
/// forward with [`Clock::advance`] to hit timeout paths deterministically.
#[derive(Debug, Clone)]
pub struct Clock(Arc<Inner>);

#[derive(Debug)]
enum Inner {
    Monotonic { origin: Instant },
    Manual { now_ms: AtomicU64 },
}

impl Clock {
    pub fn monotonic() -> Self {
        Self(Arc::new(Inner::Monotonic {
            origin: Instant::now(),
        }))
    }

    pub fn manual(start_ms: u64) -> Self {
        Self(Arc::new(Inner::Manual {
            now_ms: AtomicU64::new(start_ms),
        }))
    }

    pub fn now_ms(&self) -> u64 {
        match &*self.0 {
            Inner::Monotonic { origin } => origin.elapsed().as_millis() as u64,
            Inner::Manual { now_ms } => now_ms.load(Ordering::Acquire),
        }
    }

    /// Moves a manual clock forward. No effect on a monotonic clock.
    pub fn advance(&self, ms: u64) {
        match &*self.0 {
            Inner::Monotonic { .. } => {
                debug_assert!(false, "advancing a monotonic clock");
            }
            Inner::Manual { now_ms } => {
                now_ms.fetch_add(ms, Ordering::AcqRel);
            }
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::monotonic()
    }
}
