//! Cancellation context threaded through blocking engine calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vellum_error::{Result, VellumError};

/// Per-call execution context: an optional deadline and a cooperative
/// cancellation flag.
///
/// Every public blocking operation checks [`VxContext::check`] before
/// taking a namespace lock and at iteration checkpoints, except while a
/// transaction is being applied (transaction steps are all-or-nothing).
#[derive(Debug, Clone, Default)]
pub struct VxContext {
    deadline: Option<Instant>,
    cancel: Option<Arc<AtomicBool>>,
    /// Suppresses cancellation checks while replaying transaction steps.
    in_transaction: bool,
}

impl VxContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// A copy of this context with cancellation checks suppressed, used
    /// while applying buffered transaction steps.
    #[must_use]
    pub fn for_transaction(&self) -> Self {
        let mut cx = self.clone();
        cx.in_transaction = true;
        cx
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        if self.in_transaction {
            return false;
        }
        if let Some(flag) = &self.cancel {
            if flag.load(Ordering::Relaxed) {
                return true;
            }
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// Error out if the caller cancelled or the deadline passed.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(VellumError::query_exec("context was cancelled or timed out"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_context_never_cancels() {
        let cx = VxContext::new();
        assert!(cx.check().is_ok());
    }

    #[test]
    fn cancel_flag_trips_check() {
        let flag = Arc::new(AtomicBool::new(false));
        let cx = VxContext::new().with_cancel(flag.clone());
        assert!(cx.check().is_ok());
        flag.store(true, Ordering::Relaxed);
        assert!(cx.check().is_err());
    }

    #[test]
    fn expired_deadline_trips_check() {
        let cx = VxContext::new().with_timeout(Duration::from_secs(0));
        assert!(cx.check().is_err());
    }

    #[test]
    fn transaction_context_suppresses_cancellation() {
        let flag = Arc::new(AtomicBool::new(true));
        let cx = VxContext::new().with_cancel(flag);
        assert!(cx.check().is_err());
        assert!(cx.for_transaction().check().is_ok());
    }
}
