use crate::codec::Decoder;
use crate::error::RewriteError;
use crate::transform::Transform;
use bytes::{Buf, Bytes, BytesMut};
use http::HeaderMap;
use http_body::{Body, Frame};
use pin_project_lite::pin_project;
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::BoxError;

pin_project! {
    /// A response body that may be rewritten.
    ///
    /// This type either runs the inner body through the rewrite chain
    /// (decoder, transform) or passes it through unchanged.
    #[project = RewriteBodyProj]
    #[allow(missing_docs)]
    pub enum RewriteBody<B> {
        /// Body flowing through the rewrite chain.
        Rewritten {
            chain: RewriteChain<B>,
        },
        /// Passthrough body without rewriting.
        Passthrough {
            #[pin]
            inner: B,
        },
    }
}

impl<B> RewriteBody<B> {
    pub(crate) fn rewritten(chain: RewriteChain<B>) -> Self {
        Self::Rewritten { chain }
    }

    /// Creates a passthrough body.
    pub fn passthrough(inner: B) -> Self {
        Self::Passthrough { inner }
    }
}

impl<B> fmt::Debug for RewriteBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewriteBody::Rewritten { chain } => f.debug_tuple("Rewritten").field(chain).finish(),
            RewriteBody::Passthrough { .. } => f.write_str("Passthrough"),
        }
    }
}

/// State of an engaged chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChainState {
    /// Pulling chunks from the inner body.
    Streaming,
    /// Inner body is done; decoder and transform must be finished.
    Finishing,
    /// Everything has been handed to the sink.
    Done,
    /// A stage failed; the chain was torn down.
    Aborted,
}

/// Terminal stage of the chain: frames ready for the transport.
///
/// The chain pulls from the inner body only while the sink is ready, i.e.
/// when the transport has taken every frame produced so far. The
/// transport's next `poll_frame` is the readiness signal, so the chain
/// never runs ahead of the connection.
#[derive(Debug, Default)]
pub(crate) struct UpstreamSink {
    ready: VecDeque<Frame<Bytes>>,
    trailers: Option<HeaderMap>,
}

impl UpstreamSink {
    fn is_ready(&self) -> bool {
        self.ready.is_empty()
    }

    fn accept(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.ready.push_back(Frame::data(data));
        }
    }

    fn hold_trailers(&mut self, trailers: HeaderMap) {
        self.trailers = Some(trailers);
    }

    /// Releases held trailers behind the final data.
    fn close(&mut self) {
        if let Some(trailers) = self.trailers.take() {
            self.ready.push_back(Frame::trailers(trailers));
        }
    }

    /// Puts a frame the transport has not taken yet back in front.
    fn requeue(&mut self, frame: Frame<Bytes>) {
        self.ready.push_front(frame);
    }

    fn next_frame(&mut self) -> Option<Frame<Bytes>> {
        self.ready.pop_front()
    }

    /// Drops everything queued without delivering it.
    fn discard(&mut self) {
        self.ready.clear();
        self.trailers = None;
    }
}

/// Engaged rewrite chain: inner body → decoder → transform → sink.
pub struct RewriteChain<B> {
    inner: Pin<Box<B>>,
    decoder: Option<Decoder>,
    transform: Option<Box<dyn Transform>>,
    sink: UpstreamSink,
    state: ChainState,
}

impl<B> RewriteChain<B> {
    /// Assembles the chain. Either middle stage may be absent.
    pub(crate) fn new(
        inner: B,
        decoder: Option<Decoder>,
        transform: Option<Box<dyn Transform>>,
    ) -> Self {
        Self {
            inner: Box::pin(inner),
            decoder,
            transform,
            sink: UpstreamSink::default(),
            state: ChainState::Streaming,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ChainState {
        self.state
    }

    /// Hands back a frame that was polled before the response head was
    /// released, so it is delivered first.
    pub(crate) fn requeue(&mut self, frame: Frame<Bytes>) {
        self.sink.requeue(frame);
    }

    /// Pushes one raw chunk through the decoder and transform.
    fn feed(&mut self, chunk: Bytes) -> Result<(), RewriteError> {
        let decoded = match &mut self.decoder {
            Some(decoder) => {
                let mut out = BytesMut::new();
                decoder.decode(&chunk, &mut out)?;
                out.freeze()
            }
            None => chunk,
        };
        if decoded.is_empty() {
            return Ok(());
        }

        match &mut self.transform {
            Some(transform) => {
                let mut out = BytesMut::new();
                transform
                    .write(&decoded, &mut out)
                    .map_err(RewriteError::Transform)?;
                self.sink.accept(out.freeze());
            }
            None => self.sink.accept(decoded),
        }
        Ok(())
    }

    /// Ends every stage in order, then releases held trailers.
    fn finish(&mut self) -> Result<(), RewriteError> {
        if let Some(decoder) = &mut self.decoder {
            decoder.finish()?;
        }
        if let Some(transform) = &mut self.transform {
            let mut out = BytesMut::new();
            transform.end(&mut out).map_err(RewriteError::Transform)?;
            self.sink.accept(out.freeze());
        }
        self.sink.close();
        Ok(())
    }

    /// Tears the chain down without flushing and surfaces the error once.
    fn abort(&mut self, err: RewriteError) -> Poll<Option<Result<Frame<Bytes>, RewriteError>>> {
        tracing::debug!(
            error = %err,
            codec = ?self.decoder.as_ref().map(Decoder::codec),
            "aborting html rewrite chain"
        );
        self.decoder = None;
        self.transform = None;
        self.sink.discard();
        self.state = ChainState::Aborted;
        Poll::Ready(Some(Err(err)))
    }

    /// Polls the next frame the transport should receive.
    pub(crate) fn poll_chain(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, RewriteError>>>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        loop {
            if let Some(frame) = self.sink.next_frame() {
                return Poll::Ready(Some(Ok(frame)));
            }

            match self.state {
                ChainState::Done | ChainState::Aborted => return Poll::Ready(None),

                ChainState::Finishing => {
                    if let Err(e) = self.finish() {
                        return self.abort(e);
                    }
                    self.state = ChainState::Done;
                }

                ChainState::Streaming => match self.inner.as_mut().poll_frame(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(None) => self.state = ChainState::Finishing,
                    Poll::Ready(Some(Err(e))) => {
                        return self.abort(RewriteError::Body(e.into()));
                    }
                    Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                        Ok(mut data) => {
                            let chunk = data.copy_to_bytes(data.remaining());
                            if let Err(e) = self.feed(chunk) {
                                return self.abort(e);
                            }
                        }
                        Err(frame) => {
                            if let Ok(trailers) = frame.into_trailers() {
                                // Trailers go out after the transformed data
                                self.sink.hold_trailers(trailers);
                                self.state = ChainState::Finishing;
                            }
                        }
                    },
                },
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match self.state {
            ChainState::Aborted => true,
            ChainState::Done => self.sink.is_ready(),
            _ => false,
        }
    }
}

impl<B> fmt::Debug for RewriteChain<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RewriteChain")
            .field("codec", &self.decoder.as_ref().map(Decoder::codec))
            .field("transform", &self.transform.is_some())
            .field("sink", &self.sink)
            .field("state", &self.state)
            .finish()
    }
}

impl<B> Body for RewriteBody<B>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = RewriteError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            RewriteBodyProj::Passthrough { inner } => match inner.poll_frame(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Ready(Some(Ok(frame))) => {
                    let frame = frame.map_data(|mut data| data.copy_to_bytes(data.remaining()));
                    Poll::Ready(Some(Ok(frame)))
                }
                Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(RewriteError::Body(e.into())))),
            },
            RewriteBodyProj::Rewritten { chain } => chain.poll_chain(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            RewriteBody::Passthrough { inner } => inner.is_end_stream(),
            RewriteBody::Rewritten { chain } => chain.is_end_stream(),
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match self {
            RewriteBody::Passthrough { inner } => inner.size_hint(),
            // Rewritten size is unknown
            RewriteBody::Rewritten { .. } => http_body::SizeHint::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{Replace, from_fn};
    use std::collections::VecDeque;

    /// A test body that yields predefined frames.
    struct TestBody {
        frames: VecDeque<Result<Frame<Bytes>, BoxError>>,
        polls: usize,
    }

    impl TestBody {
        fn new(frames: Vec<Frame<Bytes>>) -> Self {
            Self {
                frames: frames.into_iter().map(Ok).collect(),
                polls: 0,
            }
        }

        fn with_error_after(frames: Vec<Frame<Bytes>>, message: &'static str) -> Self {
            let mut body = Self::new(frames);
            body.frames.push_back(Err(message.into()));
            body
        }
    }

    impl Body for TestBody {
        type Data = Bytes;
        type Error = BoxError;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            self.polls += 1;
            Poll::Ready(self.frames.pop_front())
        }
    }

    fn poll_body<B: Body + Unpin>(body: &mut B) -> Option<Result<Frame<B::Data>, B::Error>> {
        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        match Pin::new(body).poll_frame(&mut cx) {
            Poll::Ready(result) => result,
            Poll::Pending => None,
        }
    }

    fn data(s: &'static str) -> Frame<Bytes> {
        Frame::data(Bytes::from(s))
    }

    #[test]
    fn test_passthrough_data() {
        let inner = TestBody::new(vec![data("hello world")]);
        let mut body = RewriteBody::passthrough(inner);

        let frame = poll_body(&mut body).unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from("hello world"));

        assert!(poll_body(&mut body).is_none());
    }

    #[test]
    fn test_passthrough_error_is_body_error() {
        let inner = TestBody::with_error_after(vec![], "socket closed");
        let mut body = RewriteBody::passthrough(inner);

        let err = poll_body(&mut body).unwrap().unwrap_err();
        assert!(matches!(err, RewriteError::Body(_)));
    }

    #[test]
    fn test_debug_does_not_need_inner_debug() {
        let body = RewriteBody::rewritten(RewriteChain::new(TestBody::new(vec![]), None, None));
        let text = format!("{body:?}");
        assert!(text.starts_with("Rewritten(RewriteChain"));
        assert!(text.contains("Streaming"));

        let body = RewriteBody::passthrough(TestBody::new(vec![]));
        assert_eq!(format!("{body:?}"), "Passthrough");
    }

    #[test]
    fn test_chain_without_stages_preserves_order() {
        let inner = TestBody::new(vec![data("<html>"), data("<body>"), data("</html>")]);
        let mut body = RewriteBody::rewritten(RewriteChain::new(inner, None, None));

        let mut chunks = Vec::new();
        while let Some(frame) = poll_body(&mut body) {
            chunks.push(frame.unwrap().into_data().unwrap());
        }
        assert_eq!(chunks, vec!["<html>", "<body>", "</html>"]);
        assert!(body.is_end_stream());
    }

    #[test]
    fn test_chain_transforms_and_keeps_trailers_last() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "abc123".parse().unwrap());

        let inner = TestBody::new(vec![
            data("<p>Orig"),
            data("inal</p>"),
            Frame::trailers(trailers),
        ]);
        let transform: Box<dyn Transform> = Box::new(Replace::new("Original", "Replaced"));
        let mut body = RewriteBody::rewritten(RewriteChain::new(inner, None, Some(transform)));

        let mut text = Vec::new();
        let mut saw_trailers = false;
        while let Some(frame) = poll_body(&mut body) {
            let frame = frame.unwrap();
            if frame.is_trailers() {
                saw_trailers = true;
                let trailers = frame.into_trailers().unwrap();
                assert_eq!(trailers.get("x-checksum").unwrap(), "abc123");
            } else {
                assert!(!saw_trailers, "data after trailers");
                text.extend_from_slice(&frame.into_data().unwrap());
            }
        }
        assert!(saw_trailers);
        assert_eq!(text, b"<p>Replaced</p>");
    }

    #[test]
    fn test_sink_drains_before_pulling_more_input() {
        let inner = TestBody::new(vec![data("a"), data("b")]);
        let mut chain = RewriteChain::new(inner, None, None);
        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);

        let first = match chain.poll_chain(&mut cx) {
            Poll::Ready(Some(Ok(frame))) => frame,
            _ => panic!("Expected a data frame"),
        };
        chain.requeue(first);

        // The requeued frame is delivered without touching the inner body.
        let polls_before = chain.inner.polls;
        match chain.poll_chain(&mut cx) {
            Poll::Ready(Some(Ok(frame))) => assert_eq!(frame.into_data().unwrap(), "a"),
            _ => panic!("Expected the requeued frame"),
        }
        assert_eq!(chain.inner.polls, polls_before);
    }

    #[test]
    fn test_transform_error_aborts_without_flushing() {
        let inner = TestBody::new(vec![data("first"), data("boom"), data("never")]);
        let transform: Box<dyn Transform> = Box::new(from_fn(|chunk: &[u8], out: &mut BytesMut| {
            if chunk == b"boom" {
                out.extend_from_slice(b"partial");
                return Err("transform blew up".into());
            }
            out.extend_from_slice(chunk);
            Ok(())
        }));
        let mut body = RewriteBody::rewritten(RewriteChain::new(inner, None, Some(transform)));

        let frame = poll_body(&mut body).unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), "first");

        let err = poll_body(&mut body).unwrap().unwrap_err();
        assert!(matches!(err, RewriteError::Transform(_)));

        // Nothing more, not even the partial output.
        assert!(poll_body(&mut body).is_none());
        assert!(body.is_end_stream());
        match &body {
            RewriteBody::Rewritten { chain } => {
                assert_eq!(chain.state(), ChainState::Aborted);
                assert_eq!(chain.inner.polls, 2);
            }
            _ => panic!("Expected rewritten body"),
        }
    }

    #[test]
    fn test_inner_error_aborts_chain() {
        let inner = TestBody::with_error_after(vec![data("<html>")], "upstream reset");
        let transform: Box<dyn Transform> = Box::new(Replace::new("<html>", "<HTML>"));
        let mut body = RewriteBody::rewritten(RewriteChain::new(inner, None, Some(transform)));

        let mut delivered = Vec::new();
        let err = loop {
            match poll_body(&mut body) {
                Some(Ok(frame)) => delivered.extend_from_slice(&frame.into_data().unwrap()),
                Some(Err(e)) => break e,
                None => panic!("Expected an error"),
            }
        };
        assert!(matches!(err, RewriteError::Body(_)));
        assert_eq!(delivered, b"<HTML>");
        assert!(poll_body(&mut body).is_none());
    }

    #[test]
    fn test_end_without_data_still_ends_transform() {
        let inner = TestBody::new(vec![]);
        let transform: Box<dyn Transform> = Box::new(crate::transform::buffered(|_body| {
            Ok(Bytes::from_static(b"<p>generated</p>"))
        }));
        let mut body = RewriteBody::rewritten(RewriteChain::new(inner, None, Some(transform)));

        let frame = poll_body(&mut body).unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), "<p>generated</p>");
        assert!(poll_body(&mut body).is_none());
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_chain_decodes_before_transform() {
        use crate::codec::{Codec, DecoderRegistry};
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(b"<html><body>Original!</body></html>")
            .unwrap();
        let compressed = Bytes::from(encoder.finish().unwrap());
        let (head, tail) = compressed.split_at(7);

        let inner = TestBody::new(vec![
            Frame::data(Bytes::copy_from_slice(head)),
            Frame::data(Bytes::copy_from_slice(tail)),
        ]);
        let decoder = DecoderRegistry::global().decoder(Codec::Gzip);
        let transform: Box<dyn Transform> = Box::new(Replace::new("Original", "Replaced"));
        let mut body = RewriteBody::rewritten(RewriteChain::new(inner, decoder, Some(transform)));

        let mut text = Vec::new();
        while let Some(frame) = poll_body(&mut body) {
            text.extend_from_slice(&frame.unwrap().into_data().unwrap());
        }
        assert_eq!(text, b"<html><body>Replaced!</body></html>");
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_garbage_input_is_decode_error() {
        use crate::codec::{Codec, DecoderRegistry};

        let inner = TestBody::new(vec![data("uiweykwegkdsfhjksdjhfkj")]);
        let decoder = DecoderRegistry::global().decoder(Codec::Gzip);
        let mut body = RewriteBody::rewritten(RewriteChain::new(inner, decoder, None));

        let err = poll_body(&mut body).unwrap().unwrap_err();
        assert!(err.is_decode());
        assert!(poll_body(&mut body).is_none());
    }
}
