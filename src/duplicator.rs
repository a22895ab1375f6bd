//! Fan-out of one upstream stream to any number of independently paced readers.
//!
//! Elements live in an index-addressed buffer. Each handle owns only an integer cursor into it,
//! so trimming is "drop everything below the smallest live cursor". The buffer keeps the full
//! history until the duplicator is closed, because until then a new handle may still ask for a
//! replay from the first element.

use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tracing::debug;

use crate::error::{Cause, Error};
use crate::util::lock_unpoisoned;

/// How a handle's element sequence ended.
#[derive(Clone, Debug)]
pub enum Termination {
    Completed,
    /// The reader's budget ran out before the upstream ended. Not a failure.
    Truncated,
    Failed(Cause),
}

impl Termination {
    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::Truncated)
    }
}

/// Payloads that can be measured and cut for length-bounded reads.
pub trait ContentLength: Sized {
    fn content_length(&self) -> usize;

    /// Keeps only the first `len` units.
    fn truncate(self, len: usize) -> Self;
}

impl ContentLength for Bytes {
    fn content_length(&self) -> usize {
        self.len()
    }

    fn truncate(self, len: usize) -> Self {
        self.slice(..len.min(self.len()))
    }
}

#[derive(Clone)]
enum Element<T> {
    Data(T),
    Complete,
    Error(Cause),
}

struct Slot {
    cursor: u64,
    failed: Option<Cause>,
}

struct Limit<T> {
    max_length: usize,
    measure: fn(&T) -> usize,
    seen: usize,
}

struct State<T> {
    upstream: Option<BoxStream<'static, Result<T, Cause>>>,
    elements: VecDeque<Element<T>>,
    base: u64,
    handles: BTreeMap<u64, Slot>,
    next_id: u64,
    sealed: bool,
    terminated: bool,
    failure: Option<Cause>,
    limit: Option<Limit<T>>,
}

type Released<T> = Option<BoxStream<'static, Result<T, Cause>>>;

impl<T: Clone> State<T> {
    fn element_at(&self, cursor: u64) -> Option<Element<T>> {
        let index = usize::try_from(cursor.checked_sub(self.base)?).ok()?;
        self.elements.get(index).cloned()
    }

    fn push_upstream(&mut self, item: Option<Result<T, Cause>>) -> Released<T> {
        match item {
            Some(Ok(data)) => {
                if let Some(limit) = self.limit.as_mut() {
                    limit.seen = limit.seen.saturating_add((limit.measure)(&data));
                    if limit.seen > limit.max_length {
                        let limit_bytes = limit.max_length;
                        debug!(limit_bytes, "duplicated stream exceeded its maximum length");
                        return self.fail_all(Error::ContentTooLarge { limit_bytes }.into_cause());
                    }
                }
                self.elements.push_back(Element::Data(data));
                None
            }
            Some(Err(cause)) => {
                self.failure = Some(Arc::clone(&cause));
                self.terminated = true;
                self.elements.push_back(Element::Error(cause));
                self.upstream.take()
            }
            None => {
                self.terminated = true;
                self.elements.push_back(Element::Complete);
                self.upstream.take()
            }
        }
    }

    fn fail_all(&mut self, cause: Cause) -> Released<T> {
        for slot in self.handles.values_mut() {
            slot.failed.get_or_insert_with(|| Arc::clone(&cause));
        }
        if !self.terminated {
            self.terminated = true;
            self.failure = Some(Arc::clone(&cause));
            self.elements.push_back(Element::Error(cause));
        }
        self.upstream.take()
    }
}

impl<T> State<T> {
    fn trim(&mut self) {
        if !self.sealed {
            return;
        }
        let end = self.base + self.elements.len() as u64;
        let floor = self
            .handles
            .values()
            .map(|slot| slot.cursor)
            .min()
            .unwrap_or(end);
        while self.base < floor && self.elements.pop_front().is_some() {
            self.base += 1;
        }
    }
}

#[derive(Default)]
struct Parked {
    wakers: Mutex<BTreeMap<u64, Waker>>,
}

impl Parked {
    fn park(&self, id: u64, waker: &Waker) {
        let mut wakers = lock_unpoisoned(&self.wakers);
        match wakers.get(&id) {
            Some(existing) if existing.will_wake(waker) => {}
            _ => {
                wakers.insert(id, waker.clone());
            }
        }
    }

    fn unpark(&self, id: u64) {
        lock_unpoisoned(&self.wakers).remove(&id);
    }

    fn wake_all(&self) {
        let wakers = std::mem::take(&mut *lock_unpoisoned(&self.wakers));
        for waker in wakers.into_values() {
            waker.wake();
        }
    }
}

// The upstream is polled with this waker so that readiness reaches every parked reader, not
// just whichever reader happened to poll last.
impl Wake for Parked {
    fn wake(self: Arc<Self>) {
        self.wake_all();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_all();
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    parked: Arc<Parked>,
}

impl<T: Clone> Shared<T> {
    fn poll_element(&self, id: u64, cx: &mut Context<'_>) -> Poll<Element<T>> {
        let mut released: Released<T> = None;
        let mut appended = false;
        let mut state = lock_unpoisoned(&self.state);

        let outcome = loop {
            let Some(slot) = state.handles.get_mut(&id) else {
                break Poll::Ready(Element::Error(Error::StreamAborted.into_cause()));
            };
            if let Some(cause) = slot.failed.take() {
                break Poll::Ready(Element::Error(cause));
            }
            let cursor = slot.cursor;
            if let Some(element) = state.element_at(cursor) {
                if let Some(slot) = state.handles.get_mut(&id) {
                    slot.cursor = cursor + 1;
                }
                break Poll::Ready(element);
            }

            let Some(upstream) = state.upstream.as_mut() else {
                let cause = state
                    .failure
                    .clone()
                    .unwrap_or_else(|| Error::StreamAborted.into_cause());
                break Poll::Ready(Element::Error(cause));
            };
            self.parked.park(id, cx.waker());
            let waker = Waker::from(Arc::clone(&self.parked));
            let mut upstream_cx = Context::from_waker(&waker);
            let polled = upstream.as_mut().poll_next(&mut upstream_cx);
            match polled {
                Poll::Pending => break Poll::Pending,
                Poll::Ready(item) => {
                    self.parked.unpark(id);
                    appended = true;
                    if let Some(upstream) = state.push_upstream(item) {
                        released = Some(upstream);
                    }
                }
            }
        };

        if let Poll::Ready(Element::Complete | Element::Error(_)) = &outcome {
            state.handles.remove(&id);
            self.parked.unpark(id);
            if state.sealed && state.handles.is_empty() {
                released = released.or_else(|| state.upstream.take());
            }
        }
        state.trim();
        drop(state);
        drop(released);

        if appended {
            self.parked.wake_all();
        }
        outcome
    }
}

impl<T> Shared<T> {
    fn detach(&self, id: u64, abort: Option<Cause>) {
        let mut released: Released<T> = None;
        let mut state = lock_unpoisoned(&self.state);
        if state.handles.remove(&id).is_none() {
            return;
        }
        self.parked.unpark(id);

        if state.handles.is_empty() {
            if let Some(cause) = abort {
                if let Some(upstream) = state.upstream.take() {
                    debug!("last live handle aborted, cancelling upstream");
                    released = Some(upstream);
                    if !state.terminated {
                        state.terminated = true;
                        state.failure = Some(Arc::clone(&cause));
                        state.elements.push_back(Element::Error(cause));
                    }
                }
            }
            if state.sealed {
                released = released.or_else(|| state.upstream.take());
            }
        }
        state.trim();
        drop(state);
        drop(released);
    }
}

/// Produces independent readers over one upstream stream.
///
/// Dropping the duplicator closes it.
pub struct StreamDuplicator<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> StreamDuplicator<T> {
    pub fn new<S>(upstream: S) -> Self
    where
        S: Stream<Item = Result<T, Cause>> + Send + 'static,
    {
        Self::with_limit(upstream.boxed(), None)
    }

    /// Like [`new`](Self::new), but fails the upstream and every reader with
    /// [`Error::ContentTooLarge`] once more than `max_length` units have arrived.
    pub fn with_max_length<S>(upstream: S, max_length: usize) -> Self
    where
        S: Stream<Item = Result<T, Cause>> + Send + 'static,
        T: ContentLength,
    {
        Self::with_limit(
            upstream.boxed(),
            Some(Limit {
                max_length,
                measure: <T as ContentLength>::content_length,
                seen: 0,
            }),
        )
    }

    fn with_limit(upstream: BoxStream<'static, Result<T, Cause>>, limit: Option<Limit<T>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    upstream: Some(upstream),
                    elements: VecDeque::new(),
                    base: 0,
                    handles: BTreeMap::new(),
                    next_id: 0,
                    sealed: false,
                    terminated: false,
                    failure: None,
                    limit,
                }),
                parked: Arc::new(Parked::default()),
            }),
        }
    }

    /// Returns a reader that replays the stream from its first element.
    ///
    /// After [`close`](Self::close) the returned handle fails with [`Error::DuplicatorClosed`].
    pub fn duplicate(&self) -> DuplicateHandle<T> {
        let mut state = lock_unpoisoned(&self.shared.state);
        if state.sealed {
            return DuplicateHandle {
                shared: Arc::clone(&self.shared),
                id: u64::MAX,
                rejected: Some(Error::DuplicatorClosed.into_cause()),
                termination: None,
            };
        }
        let id = state.next_id;
        state.next_id += 1;
        let cursor = state.base;
        state.handles.insert(
            id,
            Slot {
                cursor,
                failed: None,
            },
        );
        DuplicateHandle {
            shared: Arc::clone(&self.shared),
            id,
            rejected: None,
            termination: None,
        }
    }

    /// Fails every live reader with `cause` and cancels the upstream.
    pub fn abort(&self, cause: Cause) {
        let mut state = lock_unpoisoned(&self.shared.state);
        let released = state.fail_all(cause);
        state.trim();
        drop(state);
        drop(released);
        self.shared.parked.wake_all();
    }

    /// The upstream failure or abort cause, if any.
    pub fn failure(&self) -> Option<Cause> {
        lock_unpoisoned(&self.shared.state).failure.clone()
    }

    /// Number of elements currently retained for readers.
    pub fn buffered(&self) -> usize {
        lock_unpoisoned(&self.shared.state).elements.len()
    }

    pub fn live_handles(&self) -> usize {
        lock_unpoisoned(&self.shared.state).handles.len()
    }

    pub fn is_closed(&self) -> bool {
        lock_unpoisoned(&self.shared.state).sealed
    }
}

impl<T> StreamDuplicator<T> {
    /// Stops handing out new readers.
    ///
    /// Live readers keep streaming. The upstream is released once the last of them detaches.
    pub fn close(&self) {
        let mut released: Released<T> = None;
        let mut state = lock_unpoisoned(&self.shared.state);
        if state.sealed {
            return;
        }
        state.sealed = true;
        if state.handles.is_empty() {
            released = state.upstream.take();
        }
        state.trim();
        drop(state);
        drop(released);
    }
}

impl<T> Drop for StreamDuplicator<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> std::fmt::Debug for StreamDuplicator<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_unpoisoned(&self.shared.state);
        formatter
            .debug_struct("StreamDuplicator")
            .field("buffered", &state.elements.len())
            .field("live_handles", &state.handles.len())
            .field("sealed", &state.sealed)
            .field("terminated", &state.terminated)
            .finish()
    }
}

/// One reader of a [`StreamDuplicator`].
pub struct DuplicateHandle<T> {
    shared: Arc<Shared<T>>,
    id: u64,
    rejected: Option<Cause>,
    termination: Option<Termination>,
}

impl<T> DuplicateHandle<T> {
    /// Detaches this reader. Cancels the upstream only if no other reader is live.
    pub fn abort(&mut self, cause: Cause) {
        if self.termination.is_some() {
            return;
        }
        self.rejected = None;
        self.shared.detach(self.id, Some(Arc::clone(&cause)));
        self.termination = Some(Termination::Failed(cause));
    }

    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    /// Position of the next element this reader will see.
    pub fn position(&self) -> Option<u64> {
        lock_unpoisoned(&self.shared.state)
            .handles
            .get(&self.id)
            .map(|slot| slot.cursor)
    }
}

impl<T: Clone + Send + 'static> Stream for DuplicateHandle<T> {
    type Item = Result<T, Cause>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.termination.is_some() {
            return Poll::Ready(None);
        }
        if let Some(cause) = this.rejected.take() {
            this.termination = Some(Termination::Failed(Arc::clone(&cause)));
            return Poll::Ready(Some(Err(cause)));
        }

        match this.shared.poll_element(this.id, cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Element::Data(data)) => Poll::Ready(Some(Ok(data))),
            Poll::Ready(Element::Complete) => {
                this.termination = Some(Termination::Completed);
                Poll::Ready(None)
            }
            Poll::Ready(Element::Error(cause)) => {
                this.termination = Some(Termination::Failed(Arc::clone(&cause)));
                Poll::Ready(Some(Err(cause)))
            }
        }
    }
}

impl<T> Drop for DuplicateHandle<T> {
    fn drop(&mut self) {
        if self.termination.is_none() && self.rejected.is_none() {
            self.shared.detach(self.id, None);
        }
    }
}

impl<T> std::fmt::Debug for DuplicateHandle<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("DuplicateHandle")
            .field("id", &self.id)
            .field("termination", &self.termination)
            .finish()
    }
}

/// A reader capped at a fixed budget.
///
/// Once the budget is spent the consumer sees [`Termination::Truncated`] and end of stream, while
/// the wrapped reader keeps draining on the current runtime so it never pins the shared buffer.
pub struct TruncatingHandle<T: Clone + Send + 'static> {
    inner: Option<DuplicateHandle<T>>,
    budget: usize,
    delivered: usize,
    measure: fn(&T) -> usize,
    split: fn(T, usize) -> T,
    termination: Option<Termination>,
}

impl<T: Clone + Send + 'static> TruncatingHandle<T> {
    /// Delivers at most `max_elements` elements.
    pub fn by_elements(handle: DuplicateHandle<T>, max_elements: usize) -> Self {
        Self {
            inner: Some(handle),
            budget: max_elements,
            delivered: 0,
            measure: |_| 1,
            split: |data, _| data,
            termination: None,
        }
    }

    /// Delivers at most `max_length` units, slicing the element that crosses the limit.
    pub fn by_length(handle: DuplicateHandle<T>, max_length: usize) -> Self
    where
        T: ContentLength,
    {
        Self {
            inner: Some(handle),
            budget: max_length,
            delivered: 0,
            measure: <T as ContentLength>::content_length,
            split: <T as ContentLength>::truncate,
            termination: None,
        }
    }

    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    pub fn is_truncated(&self) -> bool {
        self.termination
            .as_ref()
            .is_some_and(Termination::is_truncated)
    }

    pub fn abort(&mut self, cause: Cause) {
        if let Some(mut inner) = self.inner.take() {
            inner.abort(Arc::clone(&cause));
        }
        self.termination
            .get_or_insert(Termination::Failed(cause));
    }

    fn truncate(&mut self) {
        self.termination = Some(Termination::Truncated);
        let Some(inner) = self.inner.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let mut inner = inner;
                    while inner.next().await.is_some() {}
                });
            }
            Err(_) => drop(inner),
        }
    }
}

impl<T: Clone + Send + 'static> Stream for TruncatingHandle<T> {
    type Item = Result<T, Cause>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.termination.is_some() {
            return Poll::Ready(None);
        }
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(data))) => {
                let size = (this.measure)(&data);
                let remaining = this.budget - this.delivered;
                if size <= remaining {
                    this.delivered += size;
                    return Poll::Ready(Some(Ok(data)));
                }
                this.truncate();
                if remaining == 0 {
                    return Poll::Ready(None);
                }
                this.delivered = this.budget;
                Poll::Ready(Some(Ok((this.split)(data, remaining))))
            }
            Poll::Ready(Some(Err(cause))) => {
                this.termination = Some(Termination::Failed(Arc::clone(&cause)));
                this.inner = None;
                Poll::Ready(Some(Err(cause)))
            }
            Poll::Ready(None) => {
                this.termination = Some(
                    inner
                        .termination()
                        .cloned()
                        .unwrap_or(Termination::Completed),
                );
                this.inner = None;
                Poll::Ready(None)
            }
        }
    }
}

impl<T: Clone + Send + 'static> std::fmt::Debug for TruncatingHandle<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TruncatingHandle")
            .field("budget", &self.budget)
            .field("delivered", &self.delivered)
            .field("termination", &self.termination)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;
    use tokio::sync::mpsc;

    use super::*;

    fn numbers(count: u32) -> impl Stream<Item = Result<u32, Cause>> + Send + 'static {
        stream::iter((0..count).map(Ok))
    }

    async fn drain<S>(mut handle: S) -> (Vec<u32>, Option<Cause>)
    where
        S: Stream<Item = Result<u32, Cause>> + Unpin,
    {
        let mut items = Vec::new();
        let mut failure = None;
        while let Some(item) = handle.next().await {
            match item {
                Ok(item) => items.push(item),
                Err(cause) => failure = Some(cause),
            }
        }
        (items, failure)
    }

    fn channel_upstream() -> (
        mpsc::UnboundedSender<Result<Bytes, Cause>>,
        impl Stream<Item = Result<Bytes, Cause>> + Send + 'static,
    ) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let upstream = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        (sender, upstream)
    }

    #[tokio::test]
    async fn early_and_late_handles_observe_the_same_sequence() {
        let duplicator = StreamDuplicator::new(numbers(5));
        let early: Vec<_> = (0..3).map(|_| duplicator.duplicate()).collect();

        let mut sequences = Vec::new();
        for handle in early {
            let (items, failure) = drain(handle).await;
            assert!(failure.is_none());
            sequences.push(items);
        }
        for _ in 0..2 {
            let late = duplicator.duplicate();
            let (items, failure) = drain(late).await;
            assert!(failure.is_none());
            sequences.push(items);
        }

        for sequence in &sequences {
            assert_eq!(sequence, &vec![0, 1, 2, 3, 4]);
        }
    }

    #[tokio::test]
    async fn handles_report_completion() {
        let duplicator = StreamDuplicator::new(numbers(2));
        let mut handle = duplicator.duplicate();
        while handle.next().await.is_some() {}
        assert!(matches!(handle.termination(), Some(Termination::Completed)));
    }

    #[tokio::test]
    async fn upstream_error_is_replayed_to_every_handle() {
        let upstream = stream::iter(vec![
            Ok(1_u32),
            Err(Error::transport(std::io::Error::other("reset")).into_cause()),
        ]);
        let duplicator = StreamDuplicator::new(upstream);
        let first = duplicator.duplicate();
        let (items, failure) = drain(first).await;
        assert_eq!(items, vec![1]);
        assert!(failure.is_some());

        let late = duplicator.duplicate();
        let (items, failure) = drain(late).await;
        assert_eq!(items, vec![1]);
        let failure = failure.expect("late handle sees the upstream error");
        assert!(failure.to_string().contains("reset"));
        assert!(duplicator.failure().is_some());
    }

    #[tokio::test]
    async fn truncating_handle_caps_elements() {
        let duplicator = StreamDuplicator::new(numbers(100));
        let mut truncated = TruncatingHandle::by_elements(duplicator.duplicate(), 3);
        let mut seen = Vec::new();
        while let Some(item) = truncated.next().await {
            seen.push(item.expect("no upstream error"));
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(truncated.is_truncated());

        let (items, _) = drain(duplicator.duplicate()).await;
        assert_eq!(items.len(), 100);
    }

    #[tokio::test]
    async fn truncating_handle_completes_when_stream_fits() {
        let duplicator = StreamDuplicator::new(numbers(2));
        let truncated = TruncatingHandle::by_elements(duplicator.duplicate(), 3);
        let (items, failure) = drain(truncated).await;
        assert_eq!(items, vec![0, 1]);
        assert!(failure.is_none());
    }

    #[tokio::test]
    async fn truncating_by_length_slices_the_crossing_chunk() {
        let upstream = stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
            Ok(Bytes::from_static(b"!!!")),
        ]);
        let duplicator = StreamDuplicator::new(upstream);
        let mut truncated = TruncatingHandle::by_length(duplicator.duplicate(), 8);
        let mut collected = Vec::new();
        while let Some(chunk) = truncated.next().await {
            collected.extend_from_slice(&chunk.expect("chunk"));
        }
        assert_eq!(collected, b"hello wo");
        assert!(matches!(truncated.termination(), Some(Termination::Truncated)));
    }

    #[tokio::test]
    async fn close_rejects_new_handles_but_keeps_live_ones() {
        let duplicator = StreamDuplicator::new(numbers(3));
        let live = duplicator.duplicate();
        duplicator.close();

        let mut late = duplicator.duplicate();
        let error = late
            .next()
            .await
            .expect("terminal item")
            .expect_err("closed duplicator rejects");
        assert_eq!(Error::from_cause(&error).code().as_str(), "duplicator_closed");

        let (items, failure) = drain(live).await;
        assert_eq!(items, vec![0, 1, 2]);
        assert!(failure.is_none());
    }

    #[tokio::test]
    async fn abort_fails_live_handles_before_buffered_data() {
        let duplicator = StreamDuplicator::new(numbers(3));
        let mut fast = duplicator.duplicate();
        let slow = duplicator.duplicate();
        while fast.next().await.is_some() {}

        duplicator.abort(Error::aborted("caller gave up").into_cause());
        let (items, failure) = drain(slow).await;
        assert!(items.is_empty());
        let failure = failure.expect("aborted");
        assert!(Error::from_cause(&failure).is_call_abort());
    }

    #[tokio::test]
    async fn handle_abort_does_not_disturb_others() {
        let (sender, upstream) = channel_upstream();
        let duplicator = StreamDuplicator::new(upstream);
        let mut quitter = duplicator.duplicate();
        let mut reader = duplicator.duplicate();

        sender.send(Ok(Bytes::from_static(b"a"))).expect("send");
        assert_eq!(
            quitter.next().await.expect("item").expect("data"),
            Bytes::from_static(b"a")
        );
        quitter.abort(Error::aborted("not interested").into_cause());
        assert!(quitter.termination().is_some());

        sender.send(Ok(Bytes::from_static(b"b"))).expect("send");
        drop(sender);
        let mut collected = Vec::new();
        while let Some(chunk) = reader.next().await {
            collected.push(chunk.expect("chunk"));
        }
        assert_eq!(collected, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert!(duplicator.failure().is_none());
    }

    #[tokio::test]
    async fn last_handle_abort_cancels_upstream() {
        let (sender, upstream) = channel_upstream();
        let duplicator = StreamDuplicator::new(upstream);
        let mut only = duplicator.duplicate();
        only.abort(Error::aborted("done").into_cause());

        assert!(duplicator.failure().is_some());
        assert!(sender.send(Ok(Bytes::new())).is_err());
    }

    #[tokio::test]
    async fn sealed_buffer_trims_below_the_slowest_reader() {
        let duplicator = StreamDuplicator::new(numbers(10));
        let mut fast = duplicator.duplicate();
        let mut slow = duplicator.duplicate();
        duplicator.close();

        for _ in 0..6 {
            fast.next().await;
        }
        assert_eq!(duplicator.buffered(), 6);
        for _ in 0..4 {
            slow.next().await;
        }
        assert_eq!(duplicator.buffered(), 2);
        drop(slow);
        assert_eq!(duplicator.buffered(), 0);
    }

    #[tokio::test]
    async fn max_length_fails_every_reader() {
        let upstream = stream::iter(vec![
            Ok(Bytes::from_static(b"1234")),
            Ok(Bytes::from_static(b"5678")),
        ]);
        let duplicator = StreamDuplicator::with_max_length(upstream, 6);
        let mut handle = duplicator.duplicate();
        assert!(handle.next().await.expect("first").is_ok());
        let error = handle.next().await.expect("second").expect_err("too large");
        assert_eq!(Error::from_cause(&error).code().as_str(), "content_too_large");
    }

    #[tokio::test]
    async fn parked_readers_wake_when_another_reader_pulls_data() {
        let (sender, upstream) = channel_upstream();
        let duplicator = StreamDuplicator::new(upstream);
        let first = duplicator.duplicate();
        let second = duplicator.duplicate();

        let first_task = tokio::spawn(async move { first.count().await });
        let second_task = tokio::spawn(async move { second.count().await });
        tokio::task::yield_now().await;

        for chunk in [&b"x"[..], b"y", b"z"] {
            sender.send(Ok(Bytes::copy_from_slice(chunk))).expect("send");
            tokio::task::yield_now().await;
        }
        drop(sender);

        assert_eq!(first_task.await.expect("join"), 3);
        assert_eq!(second_task.await.expect("join"), 3);
    }
}
