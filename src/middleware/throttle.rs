//! Rate limiting for repeated warnings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Kinds of warnings throttled independently of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarnClass {
    /// The daemon could not be asked for admission
    Admit,
    /// A completion report was not delivered
    Complete,
    /// The request could not be classified
    Classify,
    /// The downstream handler panicked
    Handler,
}

impl WarnClass {
    const COUNT: usize = 4;

    fn index(self) -> usize {
        match self {
            WarnClass::Admit => 0,
            WarnClass::Complete => 1,
            WarnClass::Classify => 2,
            WarnClass::Handler => 3,
        }
    }
}

/// Lets at most one warning per class through per interval.
///
/// Each class keeps the monotonic time of its last emitted warning in an
/// atomic slot. Slots hold nanoseconds since `origin` plus one, so zero means
/// "never emitted".
#[derive(Debug)]
pub struct WarnThrottle {
    interval: Duration,
    origin: Instant,
    last: [AtomicU64; WarnClass::COUNT],
}

impl WarnThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            origin: Instant::now(),
            last: Default::default(),
        }
    }

    /// Returns true if a warning of `class` may be emitted now, and records
    /// the emission.
    pub fn should_emit(&self, class: WarnClass) -> bool {
        let now = self.ticks();
        let interval = u64::try_from(self.interval.as_nanos()).unwrap_or(u64::MAX);
        let slot = &self.last[class.index()];

        let mut last = slot.load(Ordering::Acquire);
        loop {
            if last != 0 && now.saturating_sub(last) < interval {
                return false;
            }
            match slot.compare_exchange_weak(last, now, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => last = actual,
            }
        }
    }

    fn ticks(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos())
            .unwrap_or(u64::MAX - 1)
            .saturating_add(1)
    }
}
