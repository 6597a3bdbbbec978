//! Shared test doubles.
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use futures::future::BoxFuture;

use crate::limiter::{LimitError, Limiter};

/// Records every charge and can be told to fail one of them.
pub(crate) struct RecordingLimiter {
    pub(crate) limit: AtomicUsize,
    charges: Mutex<Vec<usize>>,
    // 1-based index of the charge that fails.
    fail_on: Option<usize>,
    calls: AtomicUsize,
}

impl RecordingLimiter {
    pub(crate) fn new(limit: usize) -> Arc<Self> {
        Self::failing_on(limit, None)
    }

    pub(crate) fn failing_on(limit: usize, fail_on: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            limit: AtomicUsize::new(limit),
            charges: Mutex::new(Vec::new()),
            fail_on,
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn charges(&self) -> Vec<usize> {
        self.charges.lock().unwrap().clone()
    }
}

impl Limiter for RecordingLimiter {
    fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    fn wait_n(&self, n: usize) -> BoxFuture<'_, Result<(), LimitError>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on == Some(call) {
                return Err(LimitError::Rejected("limit exceed token".into()));
            }
            self.charges.lock().unwrap().push(n);
            Ok(())
        })
    }
}
