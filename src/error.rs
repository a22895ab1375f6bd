use std::borrow::Cow;
use std::sync::Arc;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared failure cause. One cause can terminate every duplicate of a stream and the caller.
pub type Cause = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    CallAborted,
    AttemptTimedOut,
    DeadlineExceeded,
    Transport,
    RuleEvaluation,
    MalformedRetryAfter,
    StreamAborted,
    DuplicatorClosed,
    ContentTooLarge,
    InvalidConfig,
    RuntimeUnavailable,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CallAborted => "call_aborted",
            Self::AttemptTimedOut => "attempt_timed_out",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Transport => "transport",
            Self::RuleEvaluation => "rule_evaluation",
            Self::MalformedRetryAfter => "malformed_retry_after",
            Self::StreamAborted => "stream_aborted",
            Self::DuplicatorClosed => "duplicator_closed",
            Self::ContentTooLarge => "content_too_large",
            Self::InvalidConfig => "invalid_config",
            Self::RuntimeUnavailable => "runtime_unavailable",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("call aborted: {reason}")]
    CallAborted { reason: Cow<'static, str> },
    #[error("attempt {attempt} timed out after {timeout_ms}ms")]
    AttemptTimedOut { attempt: u32, timeout_ms: u128 },
    #[error("call deadline exceeded after {timeout_ms}ms")]
    DeadlineExceeded { timeout_ms: u128 },
    #[error("transport failure: {source}")]
    Transport {
        #[source]
        source: Cause,
    },
    #[error("retry rule evaluation failed: {message}")]
    RuleEvaluation { message: String },
    #[error("malformed retry-after value: {value}")]
    MalformedRetryAfter { value: String },
    #[error("stream aborted")]
    StreamAborted,
    #[error("stream duplicator is closed")]
    DuplicatorClosed,
    #[error("content exceeds {limit_bytes} bytes")]
    ContentTooLarge { limit_bytes: usize },
    #[error("invalid retry configuration: {message}")]
    InvalidConfig { message: String },
    #[error("no tokio runtime available to drive the call")]
    RuntimeUnavailable,
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::CallAborted { .. } => ErrorCode::CallAborted,
            Self::AttemptTimedOut { .. } => ErrorCode::AttemptTimedOut,
            Self::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::RuleEvaluation { .. } => ErrorCode::RuleEvaluation,
            Self::MalformedRetryAfter { .. } => ErrorCode::MalformedRetryAfter,
            Self::StreamAborted => ErrorCode::StreamAborted,
            Self::DuplicatorClosed => ErrorCode::DuplicatorClosed,
            Self::ContentTooLarge { .. } => ErrorCode::ContentTooLarge,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            Self::RuntimeUnavailable => ErrorCode::RuntimeUnavailable,
        }
    }

    pub fn aborted(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::CallAborted {
            reason: reason.into(),
        }
    }

    pub fn transport(source: impl Into<BoxError>) -> Self {
        Self::Transport {
            source: Arc::from(source.into()),
        }
    }

    pub fn into_cause(self) -> Cause {
        Arc::new(self)
    }

    /// Recovers a crate error from a shared cause; foreign causes become `Transport`.
    pub fn from_cause(cause: &Cause) -> Self {
        match cause.downcast_ref::<Error>() {
            Some(error) => error.clone(),
            None => Self::Transport {
                source: Arc::clone(cause),
            },
        }
    }

    /// True when the failure should short-circuit the retry loop instead of feeding the rule.
    pub fn is_call_abort(&self) -> bool {
        matches!(self, Self::CallAborted { .. })
    }
}

impl From<BoxError> for Error {
    fn from(source: BoxError) -> Self {
        match source.downcast::<Error>() {
            Ok(error) => *error,
            Err(source) => Self::Transport {
                source: Arc::from(source),
            },
        }
    }
}
