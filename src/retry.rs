//! Retry/backoff executor for transient upstream failures.
//!
//! Failures are classified against a fixed set of transient signatures
//! (overload, rate limit, timeout). Transient failures restart the operation
//! from the beginning after a clamped delay taken from the schedule; anything
//! else is returned to the caller immediately.
//!
//! Long waits are slept in bounded chunks so that heartbeat and progress
//! reporting keep flowing through the wait hook. Chunking is not a
//! cancellation point.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use tracing::{debug, warn};

use crate::error::{PipelineError, SessionError};

/// Default per-chunk sleep while backing off.
pub const DEFAULT_SLEEP_CHUNK: Duration = Duration::from_secs(10);

/// Transient failure families worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientKind {
    Overloaded,
    RateLimited,
    Timeout,
}

impl TransientKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransientKind::Overloaded => "overloaded",
            TransientKind::RateLimited => "rate_limited",
            TransientKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const OVERLOAD_SIGNATURES: &[&str] = &["overloaded", "overload", "service unavailable"];
const OVERLOAD_CODES: &[&str] = &["503", "529"];
const RATE_LIMIT_SIGNATURES: &[&str] = &["rate limit", "rate_limit", "ratelimit", "too many requests"];
const RATE_LIMIT_CODES: &[&str] = &["429"];
const TIMEOUT_SIGNATURES: &[&str] = &["timeout", "timed out", "deadline exceeded"];
const TIMEOUT_CODES: &[&str] = &["408", "504"];

/// Match an error message against the transient signatures.
///
/// Phrases match anywhere; status codes only as standalone tokens, so
/// "line 1503" is not an overload.
pub fn classify(message: &str) -> Option<TransientKind> {
    let lower = message.to_ascii_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    let matches = |phrases: &[&str], codes: &[&str]| {
        phrases.iter().any(|p| lower.contains(p)) || tokens.iter().any(|t| codes.contains(t))
    };
    if matches(OVERLOAD_SIGNATURES, OVERLOAD_CODES) {
        Some(TransientKind::Overloaded)
    } else if matches(RATE_LIMIT_SIGNATURES, RATE_LIMIT_CODES) {
        Some(TransientKind::RateLimited)
    } else if matches(TIMEOUT_SIGNATURES, TIMEOUT_CODES) {
        Some(TransientKind::Timeout)
    } else {
        None
    }
}

/// Errors the executor knows how to classify.
pub trait Classify {
    /// `None` means fatal: the executor re-raises without retrying.
    fn transient_kind(&self) -> Option<TransientKind>;
}

impl Classify for PipelineError {
    fn transient_kind(&self) -> Option<TransientKind> {
        match self {
            PipelineError::Overloaded(_) => Some(TransientKind::Overloaded),
            PipelineError::RateLimited(_) => Some(TransientKind::RateLimited),
            PipelineError::Timeout(_) => Some(TransientKind::Timeout),
            PipelineError::Generator(message) => classify(message),
            PipelineError::StageFailed { message, .. } => classify(message),
            PipelineError::InvalidInput(_)
            | PipelineError::AuthFailed(_)
            | PipelineError::Cancelled(_)
            | PipelineError::UnknownStage { .. }
            | PipelineError::Storage(_) => None,
        }
    }
}

impl Classify for SessionError {
    fn transient_kind(&self) -> Option<TransientKind> {
        match self {
            SessionError::ConnectTimeout(_) => Some(TransientKind::Timeout),
            SessionError::Transport(message) => classify(message),
            _ => None,
        }
    }
}

/// Retry budget and delay schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay_schedule: Vec<Duration>,
    pub sleep_chunk: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay_schedule: [60, 120, 240, 480, 960]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
            sleep_chunk: DEFAULT_SLEEP_CHUNK,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay_schedule: Vec<Duration>) -> Self {
        Self {
            max_retries,
            delay_schedule,
            sleep_chunk: DEFAULT_SLEEP_CHUNK,
        }
    }

    pub fn with_sleep_chunk(mut self, chunk: Duration) -> Self {
        self.sleep_chunk = chunk;
        self
    }

    /// Delay before retry number `attempt` (0-based); clamps to the last entry.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let Some(last) = self.delay_schedule.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        self.delay_schedule[(attempt as usize).min(last)]
    }

    /// Upper bound on total backoff: `max_retries * last(delay_schedule)`.
    pub fn worst_case_wait(&self) -> Duration {
        let last = self.delay_schedule.last().copied().unwrap_or(Duration::ZERO);
        last * self.max_retries
    }

    pub fn context(&self) -> RetryContext {
        RetryContext::new(self)
    }
}

/// Attempt counter for one operation (or one connection).
#[derive(Debug, Clone)]
pub struct RetryContext {
    attempt: u32,
    max_retries: u32,
    delay_schedule: Vec<Duration>,
}

impl RetryContext {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            max_retries: policy.max_retries,
            delay_schedule: policy.delay_schedule.clone(),
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_retries
    }

    /// Delay for the current attempt, then advance. `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        let delay = match self.delay_schedule.len().checked_sub(1) {
            Some(last) => self.delay_schedule[(self.attempt as usize).min(last)],
            None => Duration::ZERO,
        };
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Reported after every sleep chunk while backing off.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitTick {
    /// Retry number being waited for (1-based).
    pub attempt: u32,
    pub kind: TransientKind,
    pub total: Duration,
    pub remaining: Duration,
}

pub type WaitHook = Arc<dyn Fn(&WaitTick) + Send + Sync>;

/// Item of a retried stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem<T> {
    Item(T),
    /// The source stream failed transiently and was restarted from scratch.
    /// Items yielded before this marker will be produced again.
    Restarted { attempt: u32 },
}

#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    on_wait: Option<WaitHook>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            on_wait: None,
        }
    }

    pub fn with_wait_hook(mut self, hook: WaitHook) -> Self {
        self.on_wait = Some(hook);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation`, restarting it from the beginning on transient failures.
    ///
    /// The operation must be safe to repeat. Fatal errors and the last
    /// transient error after the budget is spent are returned unchanged.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let mut ctx = self.policy.context();
        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let Some(kind) = err.transient_kind() else {
                debug!(error = %err, "Non-transient failure, not retrying");
                return Err(err);
            };
            let Some(delay) = ctx.next_delay() else {
                warn!(
                    kind = %kind,
                    attempts = ctx.attempt(),
                    error = %err,
                    "Retry budget exhausted"
                );
                return Err(err);
            };
            warn!(
                kind = %kind,
                attempt = ctx.attempt(),
                max_retries = ctx.max_retries(),
                delay_secs = delay.as_secs(),
                error = %err,
                "Transient failure, backing off"
            );
            self.wait(delay, kind, ctx.attempt()).await;
        }
    }

    /// Retry a streaming operation.
    ///
    /// On a transient mid-stream failure the source is dropped and `factory`
    /// is invoked again; a [`StreamItem::Restarted`] marker precedes the
    /// replacement items. Items already yielded are not retracted, so a
    /// consumer that cannot tolerate duplicates must discard what it received
    /// before the marker.
    pub fn execute_stream<T, E, F>(&self, factory: F) -> BoxStream<'static, Result<StreamItem<T>, E>>
    where
        T: Send + 'static,
        E: Classify + fmt::Display + Send + 'static,
        F: FnMut() -> BoxStream<'static, Result<T, E>> + Send + 'static,
    {
        let state = StreamState {
            executor: self.clone(),
            factory,
            current: None,
            ctx: self.policy.context(),
            restarted: None,
            done: false,
        };

        futures::stream::unfold(state, |mut st| async move {
            loop {
                if st.done {
                    return None;
                }
                if let Some(attempt) = st.restarted.take() {
                    return Some((Ok(StreamItem::Restarted { attempt }), st));
                }
                let factory = &mut st.factory;
                let source = st.current.get_or_insert_with(|| factory());
                match source.next().await {
                    Some(Ok(item)) => return Some((Ok(StreamItem::Item(item)), st)),
                    None => return None,
                    Some(Err(err)) => {
                        st.current = None;
                        let retry = err
                            .transient_kind()
                            .and_then(|kind| st.ctx.next_delay().map(|delay| (kind, delay)));
                        let Some((kind, delay)) = retry else {
                            warn!(error = %err, "Stream failed without retry");
                            st.done = true;
                            return Some((Err(err), st));
                        };
                        warn!(
                            kind = %kind,
                            attempt = st.ctx.attempt(),
                            delay_secs = delay.as_secs(),
                            error = %err,
                            "Transient stream failure, restarting from scratch"
                        );
                        st.executor.wait(delay, kind, st.ctx.attempt()).await;
                        st.restarted = Some(st.ctx.attempt());
                    }
                }
            }
        })
        .boxed()
    }

    async fn wait(&self, delay: Duration, kind: TransientKind, attempt: u32) {
        let chunk = if self.policy.sleep_chunk.is_zero() {
            delay
        } else {
            self.policy.sleep_chunk
        };
        let mut remaining = delay;
        while !remaining.is_zero() {
            let step = remaining.min(chunk);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
            if let Some(hook) = &self.on_wait {
                hook(&WaitTick {
                    attempt,
                    kind,
                    total: delay,
                    remaining,
                });
            }
        }
    }
}

struct StreamState<T, E, F> {
    executor: RetryExecutor,
    factory: F,
    current: Option<BoxStream<'static, Result<T, E>>>,
    ctx: RetryContext,
    restarted: Option<u32>,
    done: bool,
}
