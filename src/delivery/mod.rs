pub mod influx;

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::config::{BackoffKind, DeliveryConfig};

pub use influx::InfluxWriter;

/// Why a write attempt (or a whole delivery) failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("write timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("delivery cancelled")]
    Cancelled,

    #[error("delivery deadline exceeded")]
    DeadlineExceeded,
}

impl DeliveryError {
    /// Short label for metrics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Connect(_) => "connect",
            Self::Status { .. } => "status",
            Self::Request(_) => "request",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline",
        }
    }
}

/// Database write collaborator. One call writes one batch as one point.
pub trait PointWriter: Send + Sync {
    fn write(&self, batch: &Batch) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

/// Delay shape between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Constant,
    /// Doubles after every failure, capped at `max`.
    Exponential { max: Duration },
}

/// Bounded retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn from_config(cfg: &DeliveryConfig) -> Self {
        let backoff = match cfg.backoff {
            BackoffKind::Constant => Backoff::Constant,
            BackoffKind::Exponential => Backoff::Exponential {
                max: cfg.max_retry_delay,
            },
        };

        Self {
            max_attempts: cfg.max_retries.max(1),
            delay: cfg.retry_delay,
            backoff,
        }
    }

    /// Delay to wait after the `failures`-th consecutive failure (1-based).
    pub fn delay_after(&self, failures: u32) -> Duration {
        match self.backoff {
            Backoff::Constant => self.delay,
            Backoff::Exponential { max } => {
                let shift = failures.saturating_sub(1).min(16);
                self.delay.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Retry(Duration),
    GiveUp,
}

/// Retry bookkeeping for one delivery.
#[derive(Debug, Default)]
pub struct RetryState {
    attempts: u32,
    last_error: Option<DeliveryError>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&DeliveryError> {
        self.last_error.as_ref()
    }

    /// Record a failed attempt and decide whether another is allowed.
    pub fn record_failure(&mut self, policy: &RetryPolicy, error: DeliveryError) -> NextStep {
        self.attempts += 1;
        self.last_error = Some(error);

        if self.attempts >= policy.max_attempts {
            NextStep::GiveUp
        } else {
            NextStep::Retry(policy.delay_after(self.attempts))
        }
    }

    /// Final failure. `cause` is reported when no attempt has failed yet.
    fn into_failure(self, cause: DeliveryError) -> Delivery {
        Delivery::Failed {
            attempts: self.attempts,
            error: self.last_error.unwrap_or(cause),
        }
    }
}

/// Final outcome of [`Deliverer::deliver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered { attempts: u32 },
    Failed { attempts: u32, error: DeliveryError },
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Writes batches with a per-attempt timeout and bounded retries.
pub struct Deliverer<W> {
    writer: W,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl<W: PointWriter> Deliverer<W> {
    pub fn new(writer: W, policy: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            writer,
            policy,
            attempt_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// One write bounded by the attempt timeout (or less, if `deadline`
    /// is closer). A timeout counts as a failed attempt.
    pub async fn attempt_once(
        &self,
        batch: &Batch,
        deadline: Option<Instant>,
    ) -> Result<(), DeliveryError> {
        let mut limit = self.attempt_timeout;
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DeliveryError::DeadlineExceeded);
            }
            limit = limit.min(remaining);
        }

        match tokio::time::timeout(limit, self.writer.write(batch)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(limit)),
        }
    }

    /// Deliver `batch`, retrying per policy.
    ///
    /// No attempt or backoff sleep starts past `deadline`. Cancellation is
    /// honored between attempts; the caller keeps ownership of the batch
    /// and must spool it on any failure.
    pub async fn deliver(
        &self,
        batch: &Batch,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Delivery {
        let mut state = RetryState::new();

        loop {
            if cancel.is_cancelled() {
                return state.into_failure(DeliveryError::Cancelled);
            }

            let err = match self.attempt_once(batch, deadline).await {
                Ok(()) => {
                    let attempts = state.attempts() + 1;
                    debug!(attempts, fields = batch.len(), "batch delivered");
                    return Delivery::Delivered { attempts };
                }
                Err(DeliveryError::DeadlineExceeded) => {
                    return state.into_failure(DeliveryError::DeadlineExceeded);
                }
                Err(e) => e,
            };

            debug!(
                attempt = state.attempts() + 1,
                max_attempts = self.policy.max_attempts,
                error = %err,
                "write attempt failed",
            );

            let delay = match state.record_failure(&self.policy, err.clone()) {
                NextStep::Retry(delay) => delay,
                NextStep::GiveUp => {
                    warn!(
                        attempts = state.attempts(),
                        error = %err,
                        "giving up on batch after retries",
                    );
                    return state.into_failure(err);
                }
            };

            if let Some(deadline) = deadline {
                if Instant::now() + delay >= deadline {
                    debug!("no time left for another attempt this cycle");
                    return state.into_failure(DeliveryError::DeadlineExceeded);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return state.into_failure(DeliveryError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// Writer that replays a script of results and records what it saw.
    #[derive(Clone, Default)]
    pub struct ScriptedWriter {
        pub script: Arc<Mutex<VecDeque<Result<(), DeliveryError>>>>,
        pub written: Arc<Mutex<Vec<Batch>>>,
        pub calls: Arc<Mutex<u32>>,
        /// When each write started.
        pub started: Arc<Mutex<Vec<Instant>>>,
        pub stall: Option<Duration>,
        /// Panic inside the first write.
        pub panic_first: bool,
    }

    impl ScriptedWriter {
        pub fn new(script: Vec<Result<(), DeliveryError>>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.into())),
                ..Default::default()
            }
        }

        pub fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    impl PointWriter for ScriptedWriter {
        async fn write(&self, batch: &Batch) -> Result<(), DeliveryError> {
            let call = {
                let mut calls = self.calls.lock();
                *calls += 1;
                *calls
            };
            self.started.lock().push(Instant::now());
            if self.panic_first && call == 1 {
                panic!("writer exploded");
            }
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            let next = self.script.lock().pop_front().unwrap_or(Ok(()));
            if next.is_ok() {
                self.written.lock().push(batch.clone());
            }
            next
        }
    }
}
