//! Admission state and the AIMD tuning law.

mod aimd;

pub use aimd::{AimdLimiter, Decision, LimiterStats, ADDITIVE_STEP, MULTIPLICATIVE_DECREASE};
