use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::{HeaderMap, Method, Request, Response, Uri, Version};
use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tower_layer::Layer;
use tower_service::Service;
use tracing::{Instrument, debug, info_span, warn};

use crate::RETRY_COUNT_HEADER;
use crate::backoff::Backoff;
use crate::body::{Body, Frame};
use crate::config::RetryConfig;
use crate::context::AttemptContext;
use crate::duplicator::{StreamDuplicator, TruncatingHandle};
use crate::error::{BoxError, Cause, Error};
use crate::log::RequestLog;
use crate::metrics::{RetryMetrics, RetryMetricsSnapshot};
use crate::retry::{RetryDecision, RetryRule, RetryRuleWithContent, TruncatedResponse};
use crate::timeout::{DeadlineController, TimeoutTask};
use crate::transport::{Transport, TransportFuture};
use crate::util::{
    bounded_retry_delay, duration_nanos, lock_unpoisoned, parse_retry_after, phase_timeout,
    set_retry_count,
};

#[derive(Clone)]
enum RuleKind {
    Headers(Arc<dyn RetryRule>),
    Content {
        rule: Arc<dyn RetryRuleWithContent>,
        max_content_length: usize,
    },
}

impl RuleKind {
    fn requires_response_trailers(&self) -> bool {
        match self {
            Self::Headers(rule) => rule.requires_response_trailers(),
            Self::Content { rule, .. } => rule.requires_response_trailers(),
        }
    }
}

#[derive(Clone)]
pub struct RetryingClientBuilder {
    rule: RuleKind,
    config: RetryConfig,
    runtime: Option<Handle>,
}

impl RetryingClientBuilder {
    fn new(rule: RuleKind) -> Self {
        Self {
            rule,
            config: RetryConfig::standard(),
            runtime: None,
        }
    }

    pub fn config(mut self, config: RetryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_total_attempts(mut self, max_total_attempts: u32) -> Self {
        self.config = self.config.max_total_attempts(max_total_attempts);
        self
    }

    /// Bounds each attempt up to the retry decision. The resolved response body is not
    /// covered; use [`total_timeout`](Self::total_timeout) to cap it.
    pub fn response_timeout_for_each_attempt(mut self, timeout: Duration) -> Self {
        self.config = self.config.response_timeout_for_each_attempt(timeout);
        self
    }

    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.total_timeout(timeout);
        self
    }

    pub fn use_retry_after(mut self, use_retry_after: bool) -> Self {
        self.config = self.config.use_retry_after(use_retry_after);
        self
    }

    /// Runtime that drives calls and timers. Defaults to the runtime current at `execute`.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if let RuleKind::Content {
            max_content_length: 0,
            ..
        } = self.rule
        {
            return Err(Error::InvalidConfig {
                message: "max_content_length must be positive".to_owned(),
            });
        }
        Ok(())
    }

    pub fn try_build<T: Transport>(self, transport: T) -> Result<RetryingClient<T>, Error> {
        self.validate()?;
        Ok(RetryingClient::from_parts(
            transport,
            self.rule,
            self.config,
            self.runtime,
        ))
    }

    #[track_caller]
    pub fn build<T: Transport>(self, transport: T) -> RetryingClient<T> {
        self.try_build(transport).unwrap_or_else(|error| {
            panic!("failed to build retrying client: {error}; use try_build() to handle configuration errors")
        })
    }

    /// Produces a layer that wraps any transport with this configuration.
    pub fn try_layer(self) -> Result<RetryingLayer, Error> {
        self.validate()?;
        Ok(RetryingLayer {
            rule: self.rule,
            config: self.config,
            runtime: self.runtime,
        })
    }
}

impl std::fmt::Debug for RetryingClientBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryingClientBuilder")
            .field("config", &self.config)
            .finish()
    }
}

/// Decorates a transport with retries, request replay and response inspection.
pub struct RetryingClient<T> {
    inner: Arc<ClientInner<T>>,
}

struct ClientInner<T> {
    transport: T,
    rule: RuleKind,
    config: RetryConfig,
    runtime: Option<Handle>,
    metrics: RetryMetrics,
}

impl<T> Clone for RetryingClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl RetryingClient<()> {
    /// Client whose rule sees headers, trailers and the failure cause.
    pub fn builder(rule: impl RetryRule) -> RetryingClientBuilder {
        RetryingClientBuilder::new(RuleKind::Headers(Arc::new(rule)))
    }

    /// Client whose rule also sees up to `max_content_length` bytes of the response body.
    pub fn builder_with_content(
        rule: impl RetryRuleWithContent,
        max_content_length: usize,
    ) -> RetryingClientBuilder {
        RetryingClientBuilder::new(RuleKind::Content {
            rule: Arc::new(rule),
            max_content_length,
        })
    }
}

impl<T: Transport> RetryingClient<T> {
    fn from_parts(
        transport: T,
        rule: RuleKind,
        config: RetryConfig,
        runtime: Option<Handle>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                rule,
                config,
                runtime,
                metrics: RetryMetrics::default(),
            }),
        }
    }

    /// Starts a call. The call runs on its own task whether or not the future is polled.
    pub fn execute(&self, request: Request<Body>) -> ResponseFuture {
        let (result_tx, result_rx) = oneshot::channel();
        let signal = Arc::new(CallSignal::new());
        let root_log = RequestLog::root();
        let future = ResponseFuture {
            result: result_rx,
            signal: Arc::clone(&signal),
            log: root_log.clone(),
            done: false,
        };

        let runtime = match &self.inner.runtime {
            Some(runtime) => runtime.clone(),
            None => match Handle::try_current() {
                Ok(runtime) => runtime,
                Err(_) => {
                    root_log.end_response(Some(Error::RuntimeUnavailable.into_cause()));
                    if result_tx.send(Err(Error::RuntimeUnavailable)).is_err() {
                        debug!("response future dropped before resolution");
                    }
                    return future;
                }
            },
        };

        let (parts, body) = request.into_parts();
        root_log.record_request_headers(&parts.headers);
        let span = info_span!(
            "rebound.call",
            method = %parts.method,
            uri = %parts.uri
        );
        let driver = CallDriver {
            client: Arc::clone(&self.inner),
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            root: StreamDuplicator::new(body),
            root_log,
            signal,
            result_tx: Some(result_tx),
            runtime: runtime.clone(),
            started_at: Instant::now(),
        };
        runtime.spawn(driver.run().instrument(span));
        future
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn config(&self) -> &RetryConfig {
        &self.inner.config
    }

    pub fn metrics_snapshot(&self) -> RetryMetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

impl<T> std::fmt::Debug for RetryingClient<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryingClient")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl<T: Transport> Service<Request<Body>> for RetryingClient<T> {
    type Response = Response<Body>;
    type Error = Error;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        self.execute(request)
    }
}

// Lets retrying clients be stacked, for example per-endpoint retries under a global one.
impl<T: Transport> Transport for RetryingClient<T> {
    fn send(&self, _ctx: AttemptContext, request: Request<Body>) -> TransportFuture {
        let response = self.execute(request);
        Box::pin(async move { response.await.map_err(|error| Box::new(error) as BoxError) })
    }
}

#[derive(Clone)]
pub struct RetryingLayer {
    rule: RuleKind,
    config: RetryConfig,
    runtime: Option<Handle>,
}

impl<T: Transport> Layer<T> for RetryingLayer {
    type Service = RetryingClient<T>;

    fn layer(&self, transport: T) -> Self::Service {
        RetryingClient::from_parts(
            transport,
            self.rule.clone(),
            self.config.clone(),
            self.runtime.clone(),
        )
    }
}

impl std::fmt::Debug for RetryingLayer {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryingLayer")
            .field("config", &self.config)
            .finish()
    }
}

enum SignalState {
    Pending,
    Aborted(Error),
    Settled,
}

/// Caller-side abort flag shared by the response future and the call driver.
struct CallSignal {
    state: Mutex<SignalState>,
    notify: Notify,
}

impl CallSignal {
    fn new() -> Self {
        Self {
            state: Mutex::new(SignalState::Pending),
            notify: Notify::new(),
        }
    }

    fn abort(&self, error: Error) -> bool {
        {
            let mut state = lock_unpoisoned(&self.state);
            if !matches!(*state, SignalState::Pending) {
                return false;
            }
            *state = SignalState::Aborted(error);
        }
        self.notify.notify_one();
        true
    }

    fn aborted(&self) -> Option<Error> {
        match &*lock_unpoisoned(&self.state) {
            SignalState::Aborted(error) => Some(error.clone()),
            SignalState::Pending | SignalState::Settled => None,
        }
    }

    fn is_pending(&self) -> bool {
        matches!(*lock_unpoisoned(&self.state), SignalState::Pending)
    }

    fn settle(&self) {
        let mut state = lock_unpoisoned(&self.state);
        if matches!(*state, SignalState::Pending) {
            *state = SignalState::Settled;
        }
    }

    async fn wait(&self) -> Error {
        loop {
            if let Some(error) = self.aborted() {
                return error;
            }
            self.notify.notified().await;
        }
    }
}

/// Aborts a call from anywhere.
#[derive(Clone)]
pub struct AbortHandle {
    signal: Arc<CallSignal>,
}

impl AbortHandle {
    /// Returns `false` if the call already resolved or was already aborted.
    pub fn abort(&self, error: Error) -> bool {
        self.signal.abort(error)
    }
}

impl std::fmt::Debug for AbortHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AbortHandle")
            .field("pending", &self.signal.is_pending())
            .finish()
    }
}

/// The caller-visible result of a call. Dropping it before completion aborts the call.
pub struct ResponseFuture {
    result: oneshot::Receiver<Result<Response<Body>, Error>>,
    signal: Arc<CallSignal>,
    log: RequestLog,
    done: bool,
}

impl ResponseFuture {
    pub fn abort(&self, error: Error) -> bool {
        self.signal.abort(error)
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            signal: Arc::clone(&self.signal),
        }
    }

    /// Root log entry of the call, with one child per attempt.
    pub fn log(&self) -> &RequestLog {
        &self.log
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response<Body>, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.result).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => {
                this.done = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                this.done = true;
                Poll::Ready(Err(Error::aborted("call stopped before resolving")))
            }
        }
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        if !self.done {
            self.signal.abort(Error::aborted("response future dropped"));
        }
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ResponseFuture")
            .field("done", &self.done)
            .finish()
    }
}

struct NotifyOnTimeout {
    fired: Arc<Notify>,
    signal: Arc<CallSignal>,
}

impl TimeoutTask for NotifyOnTimeout {
    fn can_schedule(&self) -> bool {
        self.signal.is_pending()
    }

    fn run(&self) {
        self.fired.notify_one();
    }
}

struct AttemptScope {
    number: u32,
    ctx: AttemptContext,
    log: RequestLog,
    fired: Arc<Notify>,
    deadline: DeadlineController,
    timeout: Option<Duration>,
}

impl AttemptScope {
    fn timed_out(&self) -> Cause {
        Error::AttemptTimedOut {
            attempt: self.number,
            timeout_ms: self.timeout.map_or(0, |timeout| timeout.as_millis()),
        }
        .into_cause()
    }

    fn settle(&self, cause: Option<Cause>) {
        self.deadline.cancel_timeout();
        self.log.end_response(cause);
    }
}

enum Step {
    Retry(Duration),
    Finished,
}

type AttemptResult = Result<Response<Body>, Cause>;

struct CallDriver<T> {
    client: Arc<ClientInner<T>>,
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    root: StreamDuplicator<Frame>,
    root_log: RequestLog,
    signal: Arc<CallSignal>,
    result_tx: Option<oneshot::Sender<Result<Response<Body>, Error>>>,
    runtime: Handle,
    started_at: Instant,
}

impl<T: Transport> CallDriver<T> {
    async fn run(mut self) {
        let _in_flight = self.client.metrics.record_call_started();
        let max_attempts = self.client.config.configured_max_total_attempts();
        let mut attempt = 1_u32;

        loop {
            if let Some(error) = self.precondition_failure() {
                self.abort(error);
                return;
            }

            let config = &self.client.config;
            let Some(timeout) = phase_timeout(
                config.configured_response_timeout(),
                config.configured_total_timeout(),
                self.started_at,
            ) else {
                let timeout_ms = config
                    .configured_total_timeout()
                    .map_or(0, |timeout| timeout.as_millis());
                debug!(attempt, timeout_ms, "call deadline passed before dispatch");
                self.resolve(Err(Error::DeadlineExceeded { timeout_ms }));
                return;
            };

            match self.run_attempt(attempt, max_attempts, timeout).await {
                Step::Finished => return,
                Step::Retry(delay) => {
                    if !self.wait_for_retry(delay).await {
                        return;
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn precondition_failure(&self) -> Option<Error> {
        if let Some(error) = self.signal.aborted() {
            return Some(error);
        }
        self.root
            .failure()
            .map(|cause| Error::from_cause(&cause))
    }

    fn attempt_request(&self, headers: HeaderMap) -> Request<Body> {
        let mut request = Request::new(Body::from_duplicate(self.root.duplicate()));
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.version_mut() = self.version;
        *request.headers_mut() = headers;
        request
    }

    fn open_attempt(
        &self,
        attempt: u32,
        max_attempts: u32,
        timeout: Option<Duration>,
    ) -> (AttemptScope, Request<Body>) {
        let log = RequestLog::attempt(attempt);
        self.root_log.add_child(log.clone());

        let mut headers = self.headers.clone();
        if attempt > 1 {
            set_retry_count(&mut headers, RETRY_COUNT_HEADER, attempt - 1);
        }
        log.record_request_headers(&headers);
        let ctx = AttemptContext::new(
            self.method.clone(),
            self.uri.clone(),
            headers.clone(),
            attempt,
            max_attempts,
            timeout,
            self.started_at,
            log.clone(),
        );

        let fired = Arc::new(Notify::new());
        let deadline = DeadlineController::new(
            NotifyOnTimeout {
                fired: Arc::clone(&fired),
                signal: Arc::clone(&self.signal),
            },
            self.runtime.clone(),
        );
        if let Some(timeout) = timeout {
            deadline.schedule_timeout_nanos(duration_nanos(timeout));
        }

        let scope = AttemptScope {
            number: attempt,
            ctx,
            log,
            fired,
            deadline,
            timeout,
        };
        (scope, self.attempt_request(headers))
    }

    async fn run_attempt(
        &mut self,
        attempt: u32,
        max_attempts: u32,
        timeout: Option<Duration>,
    ) -> Step {
        let client = Arc::clone(&self.client);
        let signal = Arc::clone(&self.signal);
        let (scope, request) = self.open_attempt(attempt, max_attempts, timeout);

        client.metrics.record_attempt();
        debug!(attempt, max_attempts, "dispatching attempt");
        let send = dispatch(&client.transport, scope.ctx.clone(), request);
        let mut result: AttemptResult = tokio::select! {
            biased;
            error = signal.wait() => {
                scope.settle(Some(error.clone().into_cause()));
                self.abort(error);
                return Step::Finished;
            }
            _ = scope.fired.notified() => {
                client.metrics.record_attempt_timeout();
                debug!(attempt, "attempt timed out before a response arrived");
                Err(scope.timed_out())
            }
            result = send => result,
        };

        if let Ok(response) = &result {
            scope
                .log
                .record_response_headers(response.status(), response.headers());
        }

        let requires_trailers = client.rule.requires_response_trailers();
        if requires_trailers {
            result = match result {
                Ok(response) => {
                    let (parts, body) = response.into_parts();
                    let collected = tokio::select! {
                        biased;
                        error = signal.wait() => {
                            scope.settle(Some(error.clone().into_cause()));
                            self.abort(error);
                            return Step::Finished;
                        }
                        _ = scope.fired.notified() => {
                            client.metrics.record_attempt_timeout();
                            debug!(attempt, "attempt timed out while reading trailers");
                            Err(scope.timed_out())
                        }
                        collected = body.collect() => collected,
                    };
                    collected.map(|collected| {
                        scope
                            .log
                            .record_response_trailers(collected.trailers().cloned().unwrap_or_default());
                        Response::from_parts(parts, collected.into_body())
                    })
                }
                failed => failed,
            };
        }

        if let Err(cause) = &result {
            scope.log.end_response(Some(Arc::clone(cause)));
        }

        let mut truncated = None;
        let mut response_duplicator = None;
        if let RuleKind::Content {
            max_content_length, ..
        } = &client.rule
        {
            result = match result {
                Ok(response) => {
                    let (parts, body) = response.into_parts();
                    let duplicator = StreamDuplicator::new(body);
                    let capped =
                        TruncatingHandle::by_length(duplicator.duplicate(), *max_content_length);
                    let full = duplicator.duplicate();
                    duplicator.close();
                    truncated = Some(TruncatedResponse::new(
                        parts.status,
                        parts.headers.clone(),
                        capped,
                        scope.log.clone(),
                    ));
                    response_duplicator = Some(duplicator);
                    Ok(Response::from_parts(parts, Body::from_duplicate(full)))
                }
                failed => failed,
            };
        }

        let mut cause = result.as_ref().err().cloned();
        let mut evaluation =
            evaluate_rule(&client.rule, &signal, &scope, truncated, cause.as_ref(), true).await;
        if matches!(evaluation, Evaluation::TimedOut) {
            // The response is abandoned; the rule decides on the timeout alone.
            client.metrics.record_attempt_timeout();
            debug!(attempt, "attempt timed out while the retry rule was running");
            let timed_out = scope.timed_out();
            discard(&mut result, response_duplicator.as_ref(), &timed_out);
            result = Err(Arc::clone(&timed_out));
            scope.log.clear_response_content();
            evaluation =
                evaluate_rule(&client.rule, &signal, &scope, None, Some(&timed_out), false).await;
            cause = Some(timed_out);
        }
        scope.deadline.cancel_timeout();

        let evaluated = match evaluation {
            Evaluation::Decided(evaluated) => evaluated,
            Evaluation::TimedOut => {
                Err("retry rule did not finish before the attempt timed out".to_owned())
            }
            Evaluation::Aborted(error) => {
                let aborted = error.clone().into_cause();
                discard(&mut result, response_duplicator.as_ref(), &aborted);
                scope.settle(Some(aborted));
                self.abort(error);
                return Step::Finished;
            }
        };

        let decision = evaluated.unwrap_or_else(|message| {
            let error = Error::RuleEvaluation { message };
            warn!(attempt, error = %error, "retry rule failed, not retrying");
            client.metrics.record_rule_failure();
            RetryDecision::NoRetry
        });

        let delay = match &decision {
            RetryDecision::Retry(backoff) if attempt < max_attempts => {
                self.next_delay(backoff.as_ref(), attempt, result.as_ref().ok())
            }
            RetryDecision::Retry(_) => {
                debug!(attempt, max_attempts, "retry requested but no attempts left");
                None
            }
            RetryDecision::NoRetry => None,
        };

        match delay {
            None => {
                scope.log.end_response(cause);
                self.resolve(result.map_err(|cause| Error::from_cause(&cause)));
                Step::Finished
            }
            Some(delay) => {
                scope.log.clear_response_content();
                discard(
                    &mut result,
                    response_duplicator.as_ref(),
                    &Error::StreamAborted.into_cause(),
                );
                scope.log.end_response(cause);
                client.metrics.record_retry();
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling retry"
                );
                Step::Retry(delay)
            }
        }
    }

    fn next_delay(
        &self,
        backoff: &dyn Backoff,
        attempt: u32,
        response: Option<&Response<Body>>,
    ) -> Option<Duration> {
        let config = &self.client.config;
        let Some(backoff_delay) = backoff.next_delay(attempt) else {
            debug!(attempt, "backoff declined another attempt");
            return None;
        };

        let retry_after = if config.uses_retry_after() {
            response.and_then(
                |response| match parse_retry_after(response.headers(), SystemTime::now()) {
                    Ok(retry_after) => retry_after,
                    Err(error) => {
                        debug!(error = %error, "ignoring retry-after header");
                        None
                    }
                },
            )
        } else {
            None
        };
        let delay = retry_after.map_or(backoff_delay, |retry_after| retry_after.max(backoff_delay));

        let bounded = bounded_retry_delay(delay, config.configured_total_timeout(), self.started_at);
        if bounded.is_none() {
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retry delay passes the call deadline, not retrying"
            );
        }
        bounded
    }

    /// Waits out a retry delay. Returns `false` if the call was aborted meanwhile.
    async fn wait_for_retry(&mut self, delay: Duration) -> bool {
        if delay.is_zero() {
            return true;
        }
        let elapsed = Arc::new(Notify::new());
        let timer = DeadlineController::new(
            NotifyOnTimeout {
                fired: Arc::clone(&elapsed),
                signal: Arc::clone(&self.signal),
            },
            self.runtime.clone(),
        );
        timer.schedule_timeout_nanos(duration_nanos(delay));

        let signal = Arc::clone(&self.signal);
        tokio::select! {
            biased;
            error = signal.wait() => {
                timer.cancel_timeout();
                self.abort(error);
                false
            }
            _ = elapsed.notified() => true,
        }
    }

    fn abort(&mut self, error: Error) {
        debug!(error = %error, "call aborted");
        let cause = error.clone().into_cause();
        self.root.abort(Arc::clone(&cause));
        self.root_log.end_response(Some(cause));
        self.finish(Err(error));
    }

    fn resolve(&mut self, result: Result<Response<Body>, Error>) {
        self.root.close();
        match &result {
            Ok(response) => {
                self.root_log
                    .record_response_headers(response.status(), response.headers());
                self.root_log.end_response(None);
            }
            Err(error) => self.root_log.end_response(Some(error.clone().into_cause())),
        }
        self.finish(result);
    }

    fn finish(&mut self, result: Result<Response<Body>, Error>) {
        let Some(result_tx) = self.result_tx.take() else {
            return;
        };
        self.signal.settle();
        self.client
            .metrics
            .record_call_completed(&result, self.started_at.elapsed());
        if result_tx.send(result).is_err() {
            debug!("response future dropped before resolution");
        }
    }
}

fn dispatch<T: Transport>(
    transport: &T,
    ctx: AttemptContext,
    request: Request<Body>,
) -> BoxFuture<'static, AttemptResult> {
    let send = std::panic::catch_unwind(AssertUnwindSafe(|| transport.send(ctx, request)));
    Box::pin(async move {
        let send = match send {
            Ok(send) => send,
            Err(_) => return Err(Error::transport("transport panicked while dispatching").into_cause()),
        };
        match AssertUnwindSafe(send).catch_unwind().await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(Error::from(error).into_cause()),
            Err(_) => Err(Error::transport("transport panicked while sending").into_cause()),
        }
    })
}

enum Evaluation {
    Decided(Result<RetryDecision, String>),
    TimedOut,
    Aborted(Error),
}

/// Runs the rule to a decision. With `bounded`, the attempt deadline cuts it short.
async fn evaluate_rule(
    rule: &RuleKind,
    signal: &CallSignal,
    scope: &AttemptScope,
    truncated: Option<TruncatedResponse>,
    cause: Option<&Cause>,
    bounded: bool,
) -> Evaluation {
    let started = match rule {
        RuleKind::Headers(rule) => {
            std::panic::catch_unwind(AssertUnwindSafe(|| rule.should_retry(&scope.ctx, cause)))
        }
        RuleKind::Content { rule, .. } => std::panic::catch_unwind(AssertUnwindSafe(|| {
            rule.should_retry(&scope.ctx, truncated, cause)
        })),
    };
    let Ok(evaluation) = started else {
        return Evaluation::Decided(Err("retry rule panicked".to_owned()));
    };
    let deadline = async {
        if bounded {
            scope.fired.notified().await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        biased;
        error = signal.wait() => Evaluation::Aborted(error),
        _ = deadline => Evaluation::TimedOut,
        outcome = AssertUnwindSafe(evaluation).catch_unwind() => Evaluation::Decided(match outcome {
            Ok(Ok(decision)) => Ok(decision),
            Ok(Err(error)) => Err(error.to_string()),
            Err(_) => Err("retry rule panicked".to_owned()),
        }),
    }
}

fn discard(
    result: &mut AttemptResult,
    duplicator: Option<&StreamDuplicator<Frame>>,
    cause: &Cause,
) {
    if let Some(duplicator) = duplicator {
        duplicator.abort(Arc::clone(cause));
    }
    if let Ok(response) = result {
        response.body_mut().abort(Arc::clone(cause));
    }
}
