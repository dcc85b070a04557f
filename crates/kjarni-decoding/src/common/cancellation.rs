//! Step-boundary stop signals: cooperative cancellation and the `max_time`
//! budget.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Checked by the decoding loop between steps, never inside a compute call.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token together with the handle that trips it.
    ///
    /// ```ignore
    /// let (token, handle) = CancellationToken::new();
    /// let pending = generator.generate_cancellable(&input_ids, options, token);
    /// // from another task
    /// handle.cancel();
    /// ```
    pub fn new() -> (Self, CancellationHandle) {
        let cancelled = Arc::new(AtomicBool::new(false));
        (
            CancellationToken {
                cancelled: cancelled.clone(),
            },
            CancellationHandle { cancelled },
        )
    }

    /// A token nobody can cancel.
    pub fn never() -> Self {
        CancellationToken {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::never()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Trips every token created alongside it.
#[derive(Clone, Debug)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Why the decoding loop stopped at a step boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Caller cancelled. The call is abandoned.
    Cancelled,
    /// `max_time` elapsed. Treated like reaching the length cap.
    TimeBudget,
}

/// Combines the cancellation token with the wall-clock budget.
#[derive(Debug, Clone)]
pub struct StepBudget {
    token: CancellationToken,
    started: Instant,
    max_time: Option<Duration>,
}

impl StepBudget {
    /// `max_time` in seconds. Non-finite or negative values disable the
    /// budget.
    pub fn new(token: CancellationToken, max_time: Option<f64>) -> Self {
        let max_time = max_time
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64);
        Self {
            token,
            started: Instant::now(),
            max_time,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Cancellation takes precedence over the time budget.
    pub fn check(&self) -> Option<StopReason> {
        if self.token.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        match self.max_time {
            Some(limit) if self.started.elapsed() > limit => Some(StopReason::TimeBudget),
            _ => None,
        }
    }
}
