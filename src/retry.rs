use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use http::{HeaderMap, StatusCode};

use crate::backoff::{Backoff, ExponentialBackoff};
use crate::body::Frame;
use crate::context::AttemptContext;
use crate::duplicator::{Termination, TruncatingHandle};
use crate::error::{BoxError, Cause, Error, ErrorCode};
use crate::log::RequestLog;

/// Outcome of a retry rule.
#[derive(Clone)]
pub enum RetryDecision {
    NoRetry,
    Retry(Arc<dyn Backoff>),
}

impl RetryDecision {
    pub fn retry(backoff: impl Backoff + 'static) -> Self {
        Self::Retry(Arc::new(backoff))
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }
}

impl std::fmt::Debug for RetryDecision {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoRetry => formatter.write_str("NoRetry"),
            Self::Retry(_) => formatter.write_str("Retry"),
        }
    }
}

pub type RuleFuture<'a> = BoxFuture<'a, Result<RetryDecision, BoxError>>;

/// Decides from headers, trailers and failure cause whether an attempt is retried.
///
/// Status and headers are read from `ctx.log()`, which holds a consistent snapshot of the
/// attempt by the time the rule runs.
pub trait RetryRule: Send + Sync + 'static {
    fn should_retry<'a>(&'a self, ctx: &'a AttemptContext, cause: Option<&'a Cause>)
    -> RuleFuture<'a>;

    /// Whether the whole response, trailers included, must arrive before evaluation.
    fn requires_response_trailers(&self) -> bool {
        false
    }
}

/// Like [`RetryRule`], but also sees a length-capped copy of the response content.
///
/// `response` is `None` when the attempt failed before a response arrived.
pub trait RetryRuleWithContent: Send + Sync + 'static {
    fn should_retry<'a>(
        &'a self,
        ctx: &'a AttemptContext,
        response: Option<TruncatedResponse>,
        cause: Option<&'a Cause>,
    ) -> RuleFuture<'a>;

    fn requires_response_trailers(&self) -> bool {
        false
    }
}

impl<R: RetryRule + ?Sized> RetryRule for Arc<R> {
    fn should_retry<'a>(
        &'a self,
        ctx: &'a AttemptContext,
        cause: Option<&'a Cause>,
    ) -> RuleFuture<'a> {
        (**self).should_retry(ctx, cause)
    }

    fn requires_response_trailers(&self) -> bool {
        (**self).requires_response_trailers()
    }
}

impl<R: RetryRuleWithContent + ?Sized> RetryRuleWithContent for Arc<R> {
    fn should_retry<'a>(
        &'a self,
        ctx: &'a AttemptContext,
        response: Option<TruncatedResponse>,
        cause: Option<&'a Cause>,
    ) -> RuleFuture<'a> {
        (**self).should_retry(ctx, response, cause)
    }

    fn requires_response_trailers(&self) -> bool {
        (**self).requires_response_trailers()
    }
}

pub struct RuleFn<F> {
    decide: F,
    requires_trailers: bool,
}

/// Builds a [`RetryRule`] from a synchronous closure.
pub fn rule_fn<F>(decide: F) -> RuleFn<F>
where
    F: Fn(&AttemptContext, Option<&Cause>) -> RetryDecision + Send + Sync + 'static,
{
    RuleFn {
        decide,
        requires_trailers: false,
    }
}

impl<F> RuleFn<F> {
    pub fn requiring_trailers(mut self) -> Self {
        self.requires_trailers = true;
        self
    }
}

impl<F> RetryRule for RuleFn<F>
where
    F: Fn(&AttemptContext, Option<&Cause>) -> RetryDecision + Send + Sync + 'static,
{
    fn should_retry<'a>(
        &'a self,
        ctx: &'a AttemptContext,
        cause: Option<&'a Cause>,
    ) -> RuleFuture<'a> {
        let decision = (self.decide)(ctx, cause);
        Box::pin(std::future::ready(Ok(decision)))
    }

    fn requires_response_trailers(&self) -> bool {
        self.requires_trailers
    }
}

pub struct ContentRuleFn<F> {
    decide: F,
    requires_trailers: bool,
}

/// Builds a [`RetryRuleWithContent`] from an async closure over owned arguments.
pub fn content_rule_fn<F, Fut>(decide: F) -> ContentRuleFn<F>
where
    F: Fn(AttemptContext, Option<TruncatedResponse>, Option<Cause>) -> Fut
        + Send
        + Sync
        + 'static,
    Fut: Future<Output = RetryDecision> + Send + 'static,
{
    ContentRuleFn {
        decide,
        requires_trailers: false,
    }
}

impl<F> ContentRuleFn<F> {
    pub fn requiring_trailers(mut self) -> Self {
        self.requires_trailers = true;
        self
    }
}

impl<F, Fut> RetryRuleWithContent for ContentRuleFn<F>
where
    F: Fn(AttemptContext, Option<TruncatedResponse>, Option<Cause>) -> Fut
        + Send
        + Sync
        + 'static,
    Fut: Future<Output = RetryDecision> + Send + 'static,
{
    fn should_retry<'a>(
        &'a self,
        ctx: &'a AttemptContext,
        response: Option<TruncatedResponse>,
        cause: Option<&'a Cause>,
    ) -> RuleFuture<'a> {
        let decision = (self.decide)(ctx.clone(), response, cause.cloned());
        Box::pin(async move { Ok(decision.await) })
    }

    fn requires_response_trailers(&self) -> bool {
        self.requires_trailers
    }
}

type TrailerPredicate = Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>;

/// Retries on selected status codes, attempt timeouts and transport failures.
#[derive(Clone)]
pub struct StatusRetryRule {
    retryable_status_codes: BTreeSet<u16>,
    retry_on_timeout: bool,
    retry_on_transport_error: bool,
    backoff: Arc<dyn Backoff>,
    trailer_predicate: Option<TrailerPredicate>,
}

impl std::fmt::Debug for StatusRetryRule {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("StatusRetryRule")
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field("retry_on_timeout", &self.retry_on_timeout)
            .field("retry_on_transport_error", &self.retry_on_transport_error)
            .field("on_trailer", &self.trailer_predicate.is_some())
            .finish()
    }
}

impl StatusRetryRule {
    pub fn standard() -> Self {
        Self {
            retryable_status_codes: default_retryable_status_codes(),
            retry_on_timeout: true,
            retry_on_transport_error: true,
            backoff: Arc::new(ExponentialBackoff::standard()),
            trailer_predicate: None,
        }
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    pub fn retry_on_transport_error(mut self, retry: bool) -> Self {
        self.retry_on_transport_error = retry;
        self
    }

    pub fn backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Also retries when `predicate` matches the response trailers. Makes the rule wait for them.
    pub fn on_trailer(
        mut self,
        predicate: impl Fn(&HeaderMap) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.trailer_predicate = Some(Arc::new(predicate));
        self
    }

    pub fn decide(&self, ctx: &AttemptContext, cause: Option<&Cause>) -> RetryDecision {
        let retry = match cause {
            Some(cause) => match Error::from_cause(cause).code() {
                ErrorCode::AttemptTimedOut => self.retry_on_timeout,
                ErrorCode::Transport => self.retry_on_transport_error,
                _ => false,
            },
            None => {
                let log = ctx.log();
                let status_matches = log
                    .status()
                    .is_some_and(|status| self.retryable_status_codes.contains(&status.as_u16()));
                status_matches
                    || self
                        .trailer_predicate
                        .as_ref()
                        .is_some_and(|predicate| predicate(&log.response_trailers()))
            }
        };

        if retry {
            RetryDecision::Retry(Arc::clone(&self.backoff))
        } else {
            RetryDecision::NoRetry
        }
    }
}

impl Default for StatusRetryRule {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryRule for StatusRetryRule {
    fn should_retry<'a>(
        &'a self,
        ctx: &'a AttemptContext,
        cause: Option<&'a Cause>,
    ) -> RuleFuture<'a> {
        Box::pin(std::future::ready(Ok(self.decide(ctx, cause))))
    }

    fn requires_response_trailers(&self) -> bool {
        self.trailer_predicate.is_some()
    }
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [429_u16, 500, 502, 503, 504].into_iter().collect()
}

/// Response handed to content-aware rules. Its body stops at the configured length.
pub struct TruncatedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: TruncatingHandle<Frame>,
    log: RequestLog,
}

impl TruncatedResponse {
    pub(crate) fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: TruncatingHandle<Frame>,
        log: RequestLog,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            log,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Reads the rest of the capped content. The result is also recorded in the attempt log.
    pub async fn content(&mut self) -> Result<Bytes, Cause> {
        let mut content = BytesMut::new();
        while let Some(frame) = self.body.next().await {
            if let Frame::Data(chunk) = frame? {
                content.extend_from_slice(&chunk);
            }
        }
        let content = content.freeze();
        self.log.record_response_content(content.clone());
        Ok(content)
    }

    pub fn is_truncated(&self) -> bool {
        self.body.is_truncated()
    }

    pub fn termination(&self) -> Option<&Termination> {
        self.body.termination()
    }

    pub fn into_body(self) -> TruncatingHandle<Frame> {
        self.body
    }
}

impl std::fmt::Debug for TruncatedResponse {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TruncatedResponse")
            .field("status", &self.status)
            .field("body", &self.body)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::stream;
    use http::{HeaderValue, Method, Uri};
    use tokio::time::Instant;

    use super::*;
    use crate::backoff::FixedBackoff;
    use crate::duplicator::StreamDuplicator;

    fn context(log: RequestLog) -> AttemptContext {
        AttemptContext::new(
            Method::GET,
            Uri::from_static("http://service.test/items"),
            HeaderMap::new(),
            1,
            3,
            None,
            Instant::now(),
            log,
        )
    }

    fn context_with_status(status: StatusCode) -> AttemptContext {
        let log = RequestLog::attempt(1);
        log.record_response_headers(status, &HeaderMap::new());
        context(log)
    }

    #[test]
    fn status_rule_retries_configured_codes_only() {
        let rule = StatusRetryRule::standard().backoff(FixedBackoff::no_delay());
        assert!(
            rule.decide(&context_with_status(StatusCode::SERVICE_UNAVAILABLE), None)
                .is_retry()
        );
        assert!(
            !rule
                .decide(&context_with_status(StatusCode::OK), None)
                .is_retry()
        );
        assert!(
            !rule
                .decide(&context_with_status(StatusCode::NOT_FOUND), None)
                .is_retry()
        );
    }

    #[test]
    fn status_rule_classifies_causes() {
        let rule = StatusRetryRule::standard().retry_on_transport_error(false);
        let ctx = context(RequestLog::attempt(1));

        let timeout = Error::AttemptTimedOut {
            attempt: 1,
            timeout_ms: 100,
        }
        .into_cause();
        assert!(rule.decide(&ctx, Some(&timeout)).is_retry());

        let transport = Error::transport(std::io::Error::other("refused")).into_cause();
        assert!(!rule.decide(&ctx, Some(&transport)).is_retry());

        let aborted = Error::aborted("caller left").into_cause();
        assert!(!rule.decide(&ctx, Some(&aborted)).is_retry());
    }

    #[test]
    fn trailer_predicate_requires_trailers() {
        let rule = StatusRetryRule::standard().on_trailer(|trailers| {
            trailers
                .get("grpc-status")
                .is_some_and(|status| status != "0")
        });
        assert!(rule.requires_response_trailers());

        let log = RequestLog::attempt(1);
        log.record_response_headers(StatusCode::OK, &HeaderMap::new());
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("14"));
        log.record_response_trailers(trailers);
        assert!(rule.decide(&context(log), None).is_retry());

        let log = RequestLog::attempt(1);
        log.record_response_headers(StatusCode::OK, &HeaderMap::new());
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        log.record_response_trailers(trailers);
        assert!(!rule.decide(&context(log), None).is_retry());
    }

    #[tokio::test]
    async fn closure_rules_see_the_context() {
        let rule = rule_fn(|ctx, _cause| {
            if ctx.attempt() < 2 {
                RetryDecision::retry(FixedBackoff::new(Duration::from_millis(10)))
            } else {
                RetryDecision::NoRetry
            }
        });
        let ctx = context(RequestLog::attempt(1));
        let decision = rule.should_retry(&ctx, None).await.expect("decision");
        assert!(decision.is_retry());
        assert!(!rule.requires_response_trailers());
    }

    #[tokio::test]
    async fn truncated_response_reads_capped_content() {
        let upstream = stream::iter(vec![
            Ok(Frame::Data(Bytes::from_static(b"{\"error\":"))),
            Ok(Frame::Data(Bytes::from_static(b"\"overloaded\"}"))),
        ]);
        let duplicator = StreamDuplicator::new(upstream);
        let log = RequestLog::attempt(1);
        let mut response = TruncatedResponse::new(
            StatusCode::SERVICE_UNAVAILABLE,
            HeaderMap::new(),
            TruncatingHandle::by_length(duplicator.duplicate(), 12),
            log.clone(),
        );

        let content = response.content().await.expect("content");
        assert_eq!(content, Bytes::from_static(b"{\"error\":\"ov"));
        assert!(response.is_truncated());
        assert_eq!(log.response_content(), Some(content));
    }
}
