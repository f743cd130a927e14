//! Small shared helpers.

use crate::config::{BackoffStrategy, RetryPolicy};
use std::time::{SystemTime, UNIX_EPOCH};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a. Stable across processes and platforms.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Backoff in milliseconds after `attempt_count` attempts, capped at the
/// policy maximum.
pub fn calculate_backoff(policy: &RetryPolicy, attempt_count: u32) -> u64 {
    let base = policy.base_delay_ms as f64;
    let delay = match &policy.backoff_strategy {
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Linear { increment_ms } => {
            base + (*increment_ms as f64) * f64::from(attempt_count)
        }
        BackoffStrategy::Exponential { multiplier } => {
            base * multiplier.powi(attempt_count.min(63) as i32)
        }
    };

    if !delay.is_finite() || delay >= policy.max_delay_ms as f64 {
        policy.max_delay_ms
    } else {
        delay as u64
    }
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
