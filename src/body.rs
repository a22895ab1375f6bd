use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use futures_util::future;
use futures_util::stream::BoxStream;
use http::HeaderMap;
use http_body_util::BodyStream;

use crate::duplicator::{ContentLength, DuplicateHandle};
use crate::error::{BoxError, Cause};

/// One unit of a streamed HTTP message.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Data(Bytes),
    Trailers(HeaderMap),
}

impl Frame {
    pub fn data_ref(&self) -> Option<&Bytes> {
        match self {
            Self::Data(data) => Some(data),
            Self::Trailers(_) => None,
        }
    }

    pub fn trailers_ref(&self) -> Option<&HeaderMap> {
        match self {
            Self::Data(_) => None,
            Self::Trailers(trailers) => Some(trailers),
        }
    }

    fn from_http(frame: http_body::Frame<Bytes>) -> Option<Self> {
        match frame.into_data() {
            Ok(data) => Some(Self::Data(data)),
            Err(frame) => frame.into_trailers().ok().map(Self::Trailers),
        }
    }

    fn into_http(self) -> http_body::Frame<Bytes> {
        match self {
            Self::Data(data) => http_body::Frame::data(data),
            Self::Trailers(trailers) => http_body::Frame::trailers(trailers),
        }
    }
}

// Trailers carry no content, so a length budget never cuts them.
impl ContentLength for Frame {
    fn content_length(&self) -> usize {
        match self {
            Self::Data(data) => data.len(),
            Self::Trailers(_) => 0,
        }
    }

    fn truncate(self, len: usize) -> Self {
        match self {
            Self::Data(data) => Self::Data(ContentLength::truncate(data, len)),
            trailers => trailers,
        }
    }
}

/// Request or response body flowing through the retrying client.
pub struct Body {
    kind: Kind,
}

enum Kind {
    Empty,
    Full(Option<Bytes>),
    Frames(VecDeque<Frame>),
    Stream(BoxStream<'static, Result<Frame, Cause>>),
    Duplicate(DuplicateHandle<Frame>),
}

impl Body {
    pub fn empty() -> Self {
        Self { kind: Kind::Empty }
    }

    pub fn from_frames(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            kind: Kind::Frames(frames.into_iter().collect()),
        }
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Frame, Cause>> + Send + 'static,
    {
        Self {
            kind: Kind::Stream(stream.boxed()),
        }
    }

    pub fn from_byte_stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self::from_stream(stream.map(|item| {
            item.map(Frame::Data)
                .map_err(|error| Cause::from(error.into()))
        }))
    }

    /// Adapts any `http_body::Body`, such as a hyper `Incoming`.
    pub fn from_http_body<B>(body: B) -> Self
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let frames = BodyStream::new(body).filter_map(|frame| {
            future::ready(match frame {
                Ok(frame) => Frame::from_http(frame).map(Ok),
                Err(error) => Some(Err(Cause::from(error.into()))),
            })
        });
        Self::from_stream(frames)
    }

    pub(crate) fn from_duplicate(handle: DuplicateHandle<Frame>) -> Self {
        Self {
            kind: Kind::Duplicate(handle),
        }
    }

    /// Aborts a duplicated body. Other kinds are simply ended.
    pub(crate) fn abort(&mut self, cause: Cause) {
        if let Kind::Duplicate(handle) = &mut self.kind {
            handle.abort(cause);
        } else {
            self.kind = Kind::Empty;
        }
    }

    /// Reads the remaining frames into memory.
    pub async fn collect(mut self) -> Result<Collected, Cause> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next().await {
            frames.push(frame?);
        }
        Ok(Collected { frames })
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Self {
        Self {
            kind: Kind::Full(Some(data)),
        }
    }
}

impl From<&'static str> for Body {
    fn from(data: &'static str) -> Self {
        Self::from(Bytes::from_static(data.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(data: String) -> Self {
        Self::from(Bytes::from(data))
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        Self::from(Bytes::from(data))
    }
}

impl Stream for Body {
    type Item = Result<Frame, Cause>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.kind {
            Kind::Empty => Poll::Ready(None),
            Kind::Full(data) => Poll::Ready(data.take().map(|data| Ok(Frame::Data(data)))),
            Kind::Frames(frames) => Poll::Ready(frames.pop_front().map(Ok)),
            Kind::Stream(stream) => stream.poll_next_unpin(cx),
            Kind::Duplicate(handle) => handle.poll_next_unpin(cx),
        }
    }
}

impl http_body::Body for Body {
    type Data = Bytes;
    type Error = Cause;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        self.poll_next(cx)
            .map(|frame| frame.map(|frame| frame.map(Frame::into_http)))
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            Kind::Empty => true,
            Kind::Full(data) => data.is_none(),
            Kind::Frames(frames) => frames.is_empty(),
            Kind::Stream(_) | Kind::Duplicate(_) => false,
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match &self.kind {
            Kind::Empty => http_body::SizeHint::with_exact(0),
            Kind::Full(data) => {
                http_body::SizeHint::with_exact(data.as_ref().map_or(0, |data| data.len() as u64))
            }
            _ => http_body::SizeHint::default(),
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            Kind::Empty => "empty",
            Kind::Full(_) => "full",
            Kind::Frames(_) => "frames",
            Kind::Stream(_) => "stream",
            Kind::Duplicate(_) => "duplicate",
        };
        formatter.debug_struct("Body").field("kind", &kind).finish()
    }
}

/// A fully buffered body.
#[derive(Clone, Debug, Default)]
pub struct Collected {
    frames: Vec<Frame>,
}

impl Collected {
    pub fn to_bytes(&self) -> Bytes {
        let mut data = BytesMut::new();
        for frame in &self.frames {
            if let Some(chunk) = frame.data_ref() {
                data.extend_from_slice(chunk);
            }
        }
        data.freeze()
    }

    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.frames.iter().rev().find_map(Frame::trailers_ref)
    }

    /// Rebuilds a body that replays the same frames.
    pub fn into_body(self) -> Body {
        Body::from_frames(self.frames)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;
    use http::HeaderValue;

    use super::*;

    #[tokio::test]
    async fn collect_keeps_data_and_trailers() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        let body = Body::from_frames([
            Frame::Data(Bytes::from_static(b"ab")),
            Frame::Data(Bytes::from_static(b"cd")),
            Frame::Trailers(trailers.clone()),
        ]);

        let collected = body.collect().await.expect("collect");
        assert_eq!(collected.to_bytes(), Bytes::from_static(b"abcd"));
        assert_eq!(collected.trailers(), Some(&trailers));

        let replayed = collected.into_body().collect().await.expect("collect again");
        assert_eq!(replayed.to_bytes(), Bytes::from_static(b"abcd"));
    }

    #[tokio::test]
    async fn byte_stream_errors_surface_as_causes() {
        let body = Body::from_byte_stream(stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("connection reset")),
        ]));
        let error = body.collect().await.expect_err("stream error");
        assert!(error.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn http_body_adapter_preserves_frames() {
        let source = Body::from_frames([Frame::Data(Bytes::from_static(b"hello"))]);
        let adapted = Body::from_http_body(source);
        let collected = adapted.collect().await.expect("collect");
        assert_eq!(collected.to_bytes(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn frame_truncation_leaves_trailers_intact() {
        let data = Frame::Data(Bytes::from_static(b"abcdef"));
        assert_eq!(data.truncate(2), Frame::Data(Bytes::from_static(b"ab")));

        let trailers = Frame::Trailers(HeaderMap::new());
        assert_eq!(trailers.content_length(), 0);
    }

    #[test]
    fn full_body_reports_exact_size() {
        let body = Body::from("four");
        assert_eq!(http_body::Body::size_hint(&body).exact(), Some(4));
        assert!(!http_body::Body::is_end_stream(&body));
        assert!(http_body::Body::is_end_stream(&Body::empty()));
    }
}
