//! Retry policy for `stream_failed{wire_kind}` errors.
//!
//! The contract names only `baseDelayMs` and `maxRetries`; the exact jitter
//! strategy is left to the implementer. This uses full jitter with base
//! doubling, the recommended choice the contract calls out, rather than
//! plain exponential backoff — it spreads retries from many concurrent
//! sessions instead of having them all wake up in lockstep.

use turnloop_core::RetrySettings;

use crate::error::WireErrorKind;

pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            enabled: settings.enabled(),
            max_retries: settings.max_retries(),
            base_delay_ms: settings.base_delay_ms(),
        }
    }

    pub fn should_retry(&self, attempt: u32, kind: WireErrorKind) -> bool {
        self.enabled && kind.is_retryable() && attempt < self.max_retries
    }

    /// Full-jitter exponential backoff: a uniformly random delay in
    /// `[0, base_delay_ms * 2^attempt]`, capped to avoid overflow on a
    /// pathologically large `attempt`.
    pub fn backoff_delay_ms(&self, attempt: u32, random_unit: f64) -> u64 {
        let exponent = attempt.min(20);
        let ceiling = self.base_delay_ms.saturating_mul(1u64 << exponent);
        (ceiling as f64 * random_unit.clamp(0.0, 1.0)) as u64
    }
}
