//! Structured per-request log.
//!
//! A call gets one root entry and one child entry per attempt. Properties become available in
//! stages, and rules or observers can wait for a stage instead of polling.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::Cause;
use crate::util::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogProperty {
    RequestHeaders,
    ResponseHeaders,
    ResponseTrailers,
    ResponseContent,
    ResponseEnd,
}

impl LogProperty {
    const fn bit(self) -> u8 {
        match self {
            Self::RequestHeaders => 1,
            Self::ResponseHeaders => 1 << 1,
            Self::ResponseTrailers => 1 << 2,
            Self::ResponseContent => 1 << 3,
            Self::ResponseEnd => 1 << 4,
        }
    }
}

const ALL_PROPERTIES: u8 = (1 << 5) - 1;

#[derive(Clone)]
pub struct RequestLog {
    inner: Arc<LogInner>,
}

struct LogInner {
    entry: Mutex<LogEntry>,
    available: watch::Sender<u8>,
}

struct LogEntry {
    attempt: Option<u32>,
    started_at: Instant,
    ended_at: Option<Instant>,
    request_headers: HeaderMap,
    status: Option<StatusCode>,
    response_headers: HeaderMap,
    response_trailers: HeaderMap,
    response_content: Option<Bytes>,
    cause: Option<Cause>,
    children: Vec<RequestLog>,
}

impl RequestLog {
    /// Creates the root entry of a call.
    pub fn root() -> Self {
        Self::new(None)
    }

    pub(crate) fn attempt(attempt: u32) -> Self {
        Self::new(Some(attempt))
    }

    fn new(attempt: Option<u32>) -> Self {
        let (available, _) = watch::channel(0);
        Self {
            inner: Arc::new(LogInner {
                entry: Mutex::new(LogEntry {
                    attempt,
                    started_at: Instant::now(),
                    ended_at: None,
                    request_headers: HeaderMap::new(),
                    status: None,
                    response_headers: HeaderMap::new(),
                    response_trailers: HeaderMap::new(),
                    response_content: None,
                    cause: None,
                    children: Vec::new(),
                }),
                available,
            }),
        }
    }

    fn mark(&self, property: LogProperty) {
        self.inner
            .available
            .send_modify(|bits| *bits |= property.bit());
    }

    pub fn is_available(&self, property: LogProperty) -> bool {
        *self.inner.available.borrow() & property.bit() != 0
    }

    /// Waits until `property` has been recorded or the entry has ended.
    pub async fn when_available(&self, property: LogProperty) {
        let mut receiver = self.inner.available.subscribe();
        // The sender lives as long as `self`, so the wait can only end by the predicate.
        let _ = receiver
            .wait_for(|bits| bits & property.bit() != 0)
            .await;
    }

    pub fn add_child(&self, child: RequestLog) {
        lock_unpoisoned(&self.inner.entry).children.push(child);
    }

    pub fn children(&self) -> Vec<RequestLog> {
        lock_unpoisoned(&self.inner.entry).children.clone()
    }

    pub fn record_request_headers(&self, headers: &HeaderMap) {
        lock_unpoisoned(&self.inner.entry).request_headers = headers.clone();
        self.mark(LogProperty::RequestHeaders);
    }

    pub fn record_response_headers(&self, status: StatusCode, headers: &HeaderMap) {
        {
            let mut entry = lock_unpoisoned(&self.inner.entry);
            entry.status = Some(status);
            entry.response_headers = headers.clone();
        }
        self.mark(LogProperty::ResponseHeaders);
    }

    /// Records trailers. An empty map marks that the response had none.
    pub fn record_response_trailers(&self, trailers: HeaderMap) {
        lock_unpoisoned(&self.inner.entry).response_trailers = trailers;
        self.mark(LogProperty::ResponseTrailers);
    }

    pub fn record_response_content(&self, content: Bytes) {
        lock_unpoisoned(&self.inner.entry).response_content = Some(content);
        self.mark(LogProperty::ResponseContent);
    }

    /// Drops recorded content from a response that is being discarded.
    pub fn clear_response_content(&self) {
        lock_unpoisoned(&self.inner.entry).response_content = None;
    }

    /// Ends the entry. Every property becomes available, recorded or not.
    pub fn end_response(&self, cause: Option<Cause>) {
        {
            let mut entry = lock_unpoisoned(&self.inner.entry);
            if entry.ended_at.is_some() {
                return;
            }
            entry.ended_at = Some(Instant::now());
            entry.cause = cause;
        }
        self.inner.available.send_replace(ALL_PROPERTIES);
    }

    /// The 1-based attempt number, or `None` for the root entry.
    pub fn attempt_number(&self) -> Option<u32> {
        lock_unpoisoned(&self.inner.entry).attempt
    }

    pub fn status(&self) -> Option<StatusCode> {
        lock_unpoisoned(&self.inner.entry).status
    }

    pub fn request_headers(&self) -> HeaderMap {
        lock_unpoisoned(&self.inner.entry).request_headers.clone()
    }

    pub fn response_headers(&self) -> HeaderMap {
        lock_unpoisoned(&self.inner.entry).response_headers.clone()
    }

    pub fn response_trailers(&self) -> HeaderMap {
        lock_unpoisoned(&self.inner.entry).response_trailers.clone()
    }

    pub fn response_content(&self) -> Option<Bytes> {
        lock_unpoisoned(&self.inner.entry).response_content.clone()
    }

    pub fn cause(&self) -> Option<Cause> {
        lock_unpoisoned(&self.inner.entry).cause.clone()
    }

    pub fn started_at(&self) -> Instant {
        lock_unpoisoned(&self.inner.entry).started_at
    }

    pub fn ended_at(&self) -> Option<Instant> {
        lock_unpoisoned(&self.inner.entry).ended_at
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at().is_some()
    }
}

impl std::fmt::Debug for RequestLog {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entry = lock_unpoisoned(&self.inner.entry);
        formatter
            .debug_struct("RequestLog")
            .field("attempt", &entry.attempt)
            .field("status", &entry.status)
            .field("children", &entry.children.len())
            .field("ended", &entry.ended_at.is_some())
            .finish()
    }
}
