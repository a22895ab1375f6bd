//! `rebound` is a retrying decorator for streaming HTTP clients.
//!
//! A [`RetryingClient`] wraps any [`Transport`] and re-sends a request until a
//! [`RetryRule`] stops asking for retries, the attempt budget runs out, or the call
//! deadline passes. Request bodies are streamed once and replayed to every attempt;
//! content-aware rules read a capped copy of the response while the caller still
//! receives the full body.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use rebound::prelude::{Body, ExponentialBackoff, HyperTransport, RetryingClient, StatusRetryRule};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = RetryingClient::builder(
//!         StatusRetryRule::standard().backoff(
//!             ExponentialBackoff::standard()
//!                 .base_backoff(Duration::from_millis(100))
//!                 .max_backoff(Duration::from_millis(800)),
//!         ),
//!     )
//!     .max_total_attempts(3)
//!     .response_timeout_for_each_attempt(Duration::from_secs(2))
//!     .total_timeout(Duration::from_secs(8))
//!     .try_build(HyperTransport::http())?;
//!
//!     let request = http::Request::post("http://127.0.0.1:8080/v1/items")
//!         .body(Body::from("{\"name\":\"demo\"}"))?;
//!     let response = client.execute(request).await?;
//!     let content = response.into_body().collect().await?.to_bytes();
//!
//!     println!("body={content:?}");
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - Use `StatusRetryRule::standard()` unless the service signals failures in content.
//! - Set both a per-attempt timeout and a total timeout.
//! - Keep `use_retry_after` enabled so server hints stretch the backoff.

/// Header carrying the number of prior attempts on every retried request.
pub const RETRY_COUNT_HEADER: &str = "rebound-retry-count";

mod backoff;
mod body;
mod client;
mod config;
mod context;
mod duplicator;
mod error;
mod log;
mod metrics;
mod retry;
mod timeout;
mod transport;
mod util;

pub use crate::backoff::{Backoff, ExponentialBackoff, FixedBackoff};
pub use crate::body::{Body, Collected, Frame};
pub use crate::client::{
    AbortHandle, ResponseFuture, RetryingClient, RetryingClientBuilder, RetryingLayer,
};
pub use crate::config::RetryConfig;
pub use crate::context::AttemptContext;
pub use crate::duplicator::{
    ContentLength, DuplicateHandle, StreamDuplicator, Termination, TruncatingHandle,
};
pub use crate::error::{BoxError, Cause, Error, ErrorCode};
pub use crate::log::{LogProperty, RequestLog};
pub use crate::metrics::RetryMetricsSnapshot;
pub use crate::retry::{
    ContentRuleFn, RetryDecision, RetryRule, RetryRuleWithContent, RuleFn, RuleFuture,
    StatusRetryRule, TruncatedResponse, content_rule_fn, rule_fn,
};
pub use crate::timeout::{DeadlineController, TimeoutState, TimeoutTask};
#[cfg(feature = "hyper-transport")]
pub use crate::transport::HyperTransport;
pub use crate::transport::{Transport, TransportFn, TransportFuture, transport_fn};

pub type ReboundResult<T> = std::result::Result<T, Error>;

pub mod prelude {
    #[cfg(feature = "hyper-transport")]
    pub use crate::HyperTransport;
    pub use crate::{
        AttemptContext, Backoff, Body, Error, ErrorCode, ExponentialBackoff, FixedBackoff,
        ReboundResult, RequestLog, RetryConfig, RetryDecision, RetryRule, RetryRuleWithContent,
        RetryingClient, RetryingLayer, StatusRetryRule, Transport, TruncatedResponse,
        content_rule_fn, rule_fn, transport_fn,
    };
}
