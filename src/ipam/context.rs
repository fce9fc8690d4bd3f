use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{IpamError, Result};

/// Cooperative cancellation flag, cloneable across threads.
///
/// Cancelling never interrupts an in-flight persist attempt; the retry loop
/// observes the flag between attempts, so a cancelled operation performs no
/// further writes and never leaves a partial one.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates an unfired token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the token; every operation holding a clone fails with
    /// `Cancelled` at its next check.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Returns `true` once [`CancelToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Per-operation deadline and cancellation signal.
///
/// Every engine operation takes one; `background()` is the no-limit default.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use cidralloc::OpContext;
///
/// let ctx = OpContext::timeout(Duration::from_secs(2));
/// # let _ = ctx;
/// ```
#[derive(Clone, Debug, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: Option<CancelToken>,
}

impl OpContext {
    /// A context with no deadline and no cancellation.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context expiring `timeout` from now.
    pub fn timeout(timeout: Duration) -> Self {
        Self::background().with_deadline(Instant::now() + timeout)
    }

    /// Sets an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attaches a cancellation token.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Fails with `Cancelled` or `Timeout` once the signal has fired.
    pub(crate) fn check(&self) -> Result<()> {
        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                return Err(IpamError::Cancelled);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(IpamError::Timeout);
            }
        }
        Ok(())
    }

    /// Time left until the deadline, if one is set.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_never_expires() {
        assert!(OpContext::background().check().is_ok());
    }

    #[test]
    fn elapsed_deadline_times_out() {
        let ctx = OpContext::timeout(Duration::ZERO);
        assert!(matches!(ctx.check(), Err(IpamError::Timeout)));
    }

    #[test]
    fn cancel_token_fires_across_clones() {
        let token = CancelToken::new();
        let ctx = OpContext::background().with_cancel(token.clone());
        assert!(ctx.check().is_ok());
        token.cancel();
        assert!(matches!(ctx.check(), Err(IpamError::Cancelled)));
    }
}
