use std::time::Duration;

use http::{HeaderMap, Method, Uri};
use tokio::time::Instant;

use crate::log::RequestLog;

/// What the transport and the retry rule know about one attempt.
#[derive(Clone, Debug)]
pub struct AttemptContext {
    method: Method,
    uri: Uri,
    request_headers: HeaderMap,
    attempt: u32,
    max_attempts: u32,
    response_timeout: Option<Duration>,
    call_started_at: Instant,
    log: RequestLog,
}

impl AttemptContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        method: Method,
        uri: Uri,
        request_headers: HeaderMap,
        attempt: u32,
        max_attempts: u32,
        response_timeout: Option<Duration>,
        call_started_at: Instant,
        log: RequestLog,
    ) -> Self {
        Self {
            method,
            uri,
            request_headers,
            attempt,
            max_attempts,
            response_timeout,
            call_started_at,
            log,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Headers sent with this attempt, including the retry count.
    pub fn request_headers(&self) -> &HeaderMap {
        &self.request_headers
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Time budget of this attempt, if any.
    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout
    }

    pub fn call_elapsed(&self) -> Duration {
        self.call_started_at.elapsed()
    }

    /// This attempt's log entry.
    pub fn log(&self) -> &RequestLog {
        &self.log
    }
}
