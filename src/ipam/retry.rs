use std::thread;

use tracing::{debug, warn};

use crate::error::{IpamError, Result};
use crate::ipam::config::RetryConfig;
use crate::ipam::context::OpContext;

/// Runs `op` until its version-checked write lands.
///
/// `op` reads fresh state, computes a candidate, and attempts the persist;
/// only `VersionConflict` triggers another round, because a conflict means a
/// concurrent actor advanced the same record and the candidate must be
/// recomputed against the winner's state. Everything else — success,
/// `NoCapacity`, `NotFound`, validation errors — is final and returned as-is.
///
/// Under bounded contention the loop converges: each conflict means some
/// other actor made forward progress. The retry cap turns pathological
/// contention into `Exhausted`, and the caller's context is consulted before
/// every attempt and every sleep so cancellation and deadlines cut the loop
/// without a partial write.
pub(crate) fn retry_on_version_conflict<T, F>(
    ctx: &OpContext,
    config: &RetryConfig,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt: u32 = 0;
    loop {
        ctx.check()?;
        match op() {
            Err(IpamError::VersionConflict(key)) => {
                if attempt >= config.max_retries {
                    warn!(key = %key, attempts = attempt, "optimistic lock retries exhausted");
                    return Err(IpamError::Exhausted(attempt));
                }
                let mut delay = config.backoff(attempt);
                if let Some(remaining) = ctx.remaining() {
                    delay = delay.min(remaining);
                }
                debug!(
                    key = %key,
                    attempt,
                    delay_us = delay.as_micros() as u64,
                    "version conflict, recomputing against fresh state"
                );
                thread::sleep(delay);
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick() -> RetryConfig {
        RetryConfig {
            max_retries: 5,
            backoff_base: Duration::from_micros(10),
            backoff_cap: Duration::from_micros(100),
            jitter: false,
        }
    }

    #[test]
    fn conflicts_are_absorbed_until_success() {
        let mut left = 3;
        let result = retry_on_version_conflict(&OpContext::background(), &quick(), || {
            if left > 0 {
                left -= 1;
                Err(IpamError::VersionConflict("10.0.0.0/16".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.expect("converges"), 42);
    }

    #[test]
    fn budget_exhaustion_surfaces() {
        let mut calls = 0;
        let result: Result<()> = retry_on_version_conflict(&OpContext::background(), &quick(), || {
            calls += 1;
            Err(IpamError::VersionConflict("10.0.0.0/16".into()))
        });
        assert!(matches!(result, Err(IpamError::Exhausted(5))));
        assert_eq!(calls, 6);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<()> = retry_on_version_conflict(&OpContext::background(), &quick(), || {
            calls += 1;
            Err(IpamError::NoCapacity("10.0.0.0/16".into()))
        });
        assert!(matches!(result, Err(IpamError::NoCapacity(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn expired_deadline_cuts_the_loop() {
        let ctx = OpContext::timeout(Duration::ZERO);
        let mut calls = 0;
        let result: Result<()> = retry_on_version_conflict(&ctx, &quick(), || {
            calls += 1;
            Err(IpamError::VersionConflict("10.0.0.0/16".into()))
        });
        assert!(matches!(result, Err(IpamError::Timeout)));
        assert_eq!(calls, 0);
    }
}
