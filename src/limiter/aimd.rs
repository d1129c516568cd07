//! AIMD concurrency limiter.
//!
//! The limit drops multiplicatively when a completion is slower than the
//! latency target and grows additively when a healthy completion arrives while
//! the system is near its ceiling.

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::LimiterConfig;

/// Default amount added to the limit on a healthy, saturated sample.
pub const ADDITIVE_STEP: u32 = 1;
/// Default factor applied to the limit on a slow sample.
pub const MULTIPLICATIVE_DECREASE: f64 = 0.9;

/// Snapshot of the limiter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterStats {
    pub limit: u32,
    pub inflight: u32,
    pub degraded: bool,
}

/// Outcome of a single admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub admitted: bool,
    pub limit: u32,
    pub inflight: u32,
    pub degraded: bool,
}

#[derive(Debug)]
struct LimiterState {
    limit: u32,
    inflight: u32,
    degraded: bool,
}

/// Adaptive concurrency limiter.
///
/// This struct is thread-safe and can be shared across tasks behind an `Arc`.
/// Every operation takes the same lock, so `limit`, `inflight` and `degraded`
/// are always observed together.
#[derive(Debug)]
pub struct AimdLimiter {
    state: Mutex<LimiterState>,
    initial_limit: u32,
    target_p95_ms: f64,
    additive_step: u32,
    multiplicative_decrease: f64,
}

impl AimdLimiter {
    /// Create a limiter with the default AIMD parameters.
    pub fn new(initial_limit: u32, target_p95_ms: u64) -> Self {
        Self::with_config(initial_limit, target_p95_ms, &LimiterConfig::default())
    }

    /// Create a limiter with explicit AIMD parameters.
    pub fn with_config(initial_limit: u32, target_p95_ms: u64, config: &LimiterConfig) -> Self {
        let initial_limit = initial_limit.max(1);
        debug!(
            initial_limit,
            target_p95_ms,
            additive_step = config.additive_step,
            multiplicative_decrease = config.multiplicative_decrease,
            "Creating AIMD limiter"
        );

        Self {
            state: Mutex::new(LimiterState {
                limit: initial_limit,
                inflight: 0,
                degraded: false,
            }),
            initial_limit,
            target_p95_ms: target_p95_ms as f64,
            additive_step: config.additive_step,
            multiplicative_decrease: config.multiplicative_decrease,
        }
    }

    /// Try to take an admission slot.
    pub fn admit(&self) -> Decision {
        let mut state = self.state.lock();
        let admitted = state.inflight < state.limit;
        if admitted {
            state.inflight += 1;
        }

        trace!(
            admitted,
            limit = state.limit,
            inflight = state.inflight,
            "Admission decision"
        );

        Decision {
            admitted,
            limit: state.limit,
            inflight: state.inflight,
            degraded: state.degraded,
        }
    }

    /// Release a slot and, if `sample` is set, retune the limit from `rtt_ms`.
    ///
    /// A completion without a matching admission never drives `inflight`
    /// below zero.
    pub fn complete(&self, rtt_ms: f64, sample: bool) {
        let mut state = self.state.lock();
        state.inflight = state.inflight.saturating_sub(1);
        if !sample {
            return;
        }

        let previous = state.limit;
        if rtt_ms > self.target_p95_ms {
            let decreased = (f64::from(state.limit) * self.multiplicative_decrease).floor() as u32;
            state.limit = decreased.max(self.lmin());
            state.degraded = true;
        } else if state.inflight * 2 >= state.limit {
            state.limit = state
                .limit
                .saturating_add(self.additive_step)
                .min(self.lmax());
            state.degraded = false;
        } else {
            state.degraded = false;
        }

        if state.limit != previous {
            debug!(
                rtt_ms,
                from = previous,
                to = state.limit,
                inflight = state.inflight,
                "Limit adjusted"
            );
        }
    }

    /// Read the current state without changing it.
    pub fn stats(&self) -> LimiterStats {
        let state = self.state.lock();
        LimiterStats {
            limit: state.limit,
            inflight: state.inflight,
            degraded: state.degraded,
        }
    }

    /// Lowest value the limit can be cut to.
    pub fn lmin(&self) -> u32 {
        (self.initial_limit / 2).max(1)
    }

    /// Highest value the limit can grow to.
    pub fn lmax(&self) -> u32 {
        self.initial_limit
    }

    #[cfg(test)]
    fn set_state(&self, limit: u32, degraded: bool) {
        let mut state = self.state.lock();
        state.limit = limit;
        state.degraded = degraded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn limiter() -> AimdLimiter {
        AimdLimiter::new(4, 300)
    }

    #[test]
    fn test_new_limiter_starts_at_initial_limit() {
        let limiter = limiter();
        let stats = limiter.stats();
        assert_eq!(stats.limit, 4);
        assert_eq!(stats.inflight, 0);
        assert!(!stats.degraded);
        assert_eq!(limiter.lmin(), 2);
        assert_eq!(limiter.lmax(), 4);
    }

    #[test]
    fn test_initial_limit_clamped_to_one() {
        let limiter = AimdLimiter::new(0, 300);
        assert_eq!(limiter.stats().limit, 1);
        assert_eq!(limiter.lmin(), 1);
    }

    #[test]
    fn test_admit_rejects_when_over_limit() {
        let limiter = limiter();
        limiter.set_state(1, false);

        let results: Vec<bool> = (0..3).map(|_| limiter.admit().admitted).collect();

        assert_eq!(results, vec![true, false, false]);
        assert_eq!(limiter.stats().inflight, 1);
    }

    #[test]
    fn test_admit_reports_state() {
        let limiter = limiter();
        let decision = limiter.admit();
        assert_eq!(
            decision,
            Decision {
                admitted: true,
                limit: 4,
                inflight: 1,
                degraded: false,
            }
        );
    }

    #[test]
    fn test_slow_sample_backs_off() {
        let limiter = limiter();
        limiter.complete(1_000.0, true);

        let stats = limiter.stats();
        assert_eq!(stats.limit, 3);
        assert!(stats.degraded);
    }

    #[test]
    fn test_healthy_saturated_sample_increases() {
        let limiter = limiter();
        limiter.set_state(3, true);

        for _ in 0..3 {
            limiter.admit();
        }
        limiter.complete(50.0, true);

        let stats = limiter.stats();
        assert_eq!(stats.limit, 4);
        assert!(!stats.degraded);
        assert_eq!(stats.inflight, 2);
    }

    #[test]
    fn test_healthy_idle_sample_keeps_limit() {
        let limiter = limiter();
        limiter.admit();
        limiter.complete(50.0, true);

        let stats = limiter.stats();
        assert_eq!(stats.limit, 4);
        assert!(!stats.degraded);
    }

    #[test]
    fn test_healthy_sample_clears_degraded_without_growth() {
        let limiter = limiter();
        limiter.set_state(4, true);
        limiter.complete(10.0, true);

        let stats = limiter.stats();
        assert_eq!(stats.limit, 4);
        assert!(!stats.degraded);
    }

    #[test]
    fn test_backoff_respects_minimum() {
        let limiter = limiter();
        limiter.set_state(2, false);
        limiter.complete(10_000.0, true);

        assert_eq!(limiter.stats().limit, 2);
    }

    #[test]
    fn test_growth_respects_maximum() {
        let limiter = limiter();
        for _ in 0..4 {
            limiter.admit();
        }
        limiter.complete(10.0, true);

        assert_eq!(limiter.stats().limit, 4);
    }

    #[test]
    fn test_rtt_equal_to_target_is_healthy() {
        let limiter = limiter();
        limiter.complete(300.0, true);
        assert!(!limiter.stats().degraded);
    }

    #[test]
    fn test_unsampled_completion_only_releases_slot() {
        let limiter = limiter();
        limiter.set_state(3, true);
        limiter.admit();
        limiter.complete(10_000.0, false);

        let stats = limiter.stats();
        assert_eq!(stats.limit, 3);
        assert_eq!(stats.inflight, 0);
        assert!(stats.degraded);
    }

    #[test]
    fn test_complete_without_admit_clamps_inflight() {
        let limiter = limiter();
        limiter.complete(10.0, true);
        limiter.complete(10.0, false);
        assert_eq!(limiter.stats().inflight, 0);
    }

    #[test]
    fn test_custom_parameters() {
        let config = LimiterConfig {
            additive_step: 3,
            multiplicative_decrease: 0.5,
        };
        let limiter = AimdLimiter::with_config(20, 100, &config);

        limiter.complete(500.0, true);
        assert_eq!(limiter.stats().limit, 10);

        for _ in 0..10 {
            limiter.admit();
        }
        limiter.complete(5.0, true);
        assert_eq!(limiter.stats().limit, 13);
    }

    #[test]
    fn test_concurrent_admits_never_exceed_limit() {
        let limiter = Arc::new(AimdLimiter::new(8, 300));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..10).filter(|_| limiter.admit().admitted).count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 8);
        assert_eq!(limiter.stats().inflight, 8);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Admit,
        Complete { rtt_ms: f64, sample: bool },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Admit),
            (0.0f64..2_000.0, any::<bool>())
                .prop_map(|(rtt_ms, sample)| Op::Complete { rtt_ms, sample }),
        ]
    }

    proptest! {
        #[test]
        fn prop_limit_stays_within_bounds(
            initial in 1u32..64,
            ops in proptest::collection::vec(op_strategy(), 0..200),
        ) {
            let limiter = AimdLimiter::new(initial, 300);
            for op in ops {
                match op {
                    Op::Admit => { limiter.admit(); }
                    Op::Complete { rtt_ms, sample } => limiter.complete(rtt_ms, sample),
                }
                let stats = limiter.stats();
                prop_assert!(stats.limit >= limiter.lmin());
                prop_assert!(stats.limit <= limiter.lmax());
            }
        }

        #[test]
        fn prop_inflight_counts_outstanding_admits(initial in 1u32..64, attempts in 0usize..128) {
            let limiter = AimdLimiter::new(initial, 300);
            let mut admitted = 0u32;
            for _ in 0..attempts {
                let decision = limiter.admit();
                prop_assert!(!decision.admitted || decision.inflight <= decision.limit);
                if decision.admitted {
                    admitted += 1;
                }
            }
            prop_assert!(admitted <= initial);
            prop_assert_eq!(limiter.stats().inflight, admitted);
        }
    }
}
