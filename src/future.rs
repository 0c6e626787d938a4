use crate::body::{RewriteBody, RewriteChain};
use crate::codec::{Decoder, DecoderRegistry};
use crate::transform::MakeTransform;
use http::response::Parts;
use http::{HeaderMap, Response, header};
use http_body::Body;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::BoxError;

pin_project! {
    /// Future for rewrite service responses.
    ///
    /// When the response is rewritten, the future resolves only once the
    /// chain has its first frame ready (or has ended), so the response head
    /// is released after header negotiation and right before the first
    /// byte of rewritten output.
    pub struct ResponseFuture<F, B> {
        #[pin]
        inner: F,
        make_transform: Option<Arc<dyn MakeTransform>>,
        commit: Commit<B>,
    }
}

/// Progress of the response head.
enum Commit<B> {
    /// The inner service has not produced a response yet.
    Waiting,
    /// Headers are negotiated; held until the chain yields its first frame.
    Pending {
        parts: Parts,
        chain: RewriteChain<B>,
    },
    /// The response was handed on.
    Committed,
}

impl<F, B> ResponseFuture<F, B> {
    pub(crate) fn new(inner: F, make_transform: Option<Arc<dyn MakeTransform>>) -> Self {
        Self {
            inner,
            make_transform,
            commit: Commit::Waiting,
        }
    }
}

impl<F, B, E> Future for ResponseFuture<F, B>
where
    F: Future<Output = Result<Response<B>, E>>,
    E: Into<BoxError>,
    B: Body,
    B::Error: Into<BoxError>,
{
    type Output = Result<Response<RewriteBody<B>>, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        loop {
            match std::mem::replace(this.commit, Commit::Committed) {
                Commit::Waiting => {
                    let response = match this.inner.as_mut().poll(cx) {
                        Poll::Pending => {
                            *this.commit = Commit::Waiting;
                            return Poll::Pending;
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into())),
                        Poll::Ready(Ok(response)) => response,
                    };

                    let Some(make_transform) = this.make_transform.as_deref() else {
                        return Poll::Ready(Ok(response.map(RewriteBody::passthrough)));
                    };

                    match intercept(response, make_transform, DecoderRegistry::global()) {
                        Intercepted::Passthrough(response) => return Poll::Ready(Ok(response)),
                        Intercepted::Engaged { parts, chain } => {
                            *this.commit = Commit::Pending { parts, chain };
                        }
                    }
                }

                Commit::Pending { parts, mut chain } => match chain.poll_chain(cx) {
                    Poll::Pending => {
                        *this.commit = Commit::Pending { parts, chain };
                        return Poll::Pending;
                    }
                    // Nothing was sent yet; the caller may still answer with an error status.
                    Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e.into())),
                    Poll::Ready(first) => {
                        if let Some(Ok(frame)) = first {
                            chain.requeue(frame);
                        }
                        let response = Response::from_parts(parts, RewriteBody::rewritten(chain));
                        return Poll::Ready(Ok(response));
                    }
                },

                Commit::Committed => panic!("ResponseFuture polled after completion"),
            }
        }
    }
}

/// Outcome of intercepting the inner response.
enum Intercepted<B> {
    Passthrough(Response<RewriteBody<B>>),
    Engaged {
        parts: Parts,
        chain: RewriteChain<B>,
    },
}

/// Negotiates the response head and, when engaged, builds the chain.
fn intercept<B>(
    response: Response<B>,
    make_transform: &dyn MakeTransform,
    registry: &DecoderRegistry,
) -> Intercepted<B> {
    let (mut parts, body) = response.into_parts();

    match negotiate(&mut parts.headers, registry) {
        Negotiation::Decline => {
            Intercepted::Passthrough(Response::from_parts(parts, RewriteBody::passthrough(body)))
        }
        Negotiation::Engage { decoder } => {
            let transform = make_transform.make_transform();
            if transform.is_none() {
                tracing::debug!("transform factory returned nothing; body is only decoded");
            }
            let chain = RewriteChain::new(body, decoder, transform);
            Intercepted::Engaged { parts, chain }
        }
    }
}

/// Decision taken once per response.
enum Negotiation {
    Decline,
    Engage { decoder: Option<Decoder> },
}

/// Decides whether to rewrite and adjusts the headers to match.
///
/// Headers are only touched when the rewrite engages.
fn negotiate(headers: &mut HeaderMap, registry: &DecoderRegistry) -> Negotiation {
    if !is_html(headers) {
        tracing::debug!("not rewriting: content type is not text/html");
        return Negotiation::Decline;
    }

    // An empty Content-Encoding names no coding
    let decoder = match headers
        .get(header::CONTENT_ENCODING)
        .filter(|value| !value.as_bytes().trim_ascii().is_empty())
    {
        None => None,
        Some(value) => {
            let decoder = value
                .to_str()
                .ok()
                .and_then(|token| registry.lookup(token))
                .and_then(|codec| registry.decoder(codec));
            match decoder {
                Some(decoder) => Some(decoder),
                None => {
                    tracing::debug!(content_encoding = ?value, "not rewriting: unsupported content encoding");
                    return Negotiation::Decline;
                }
            }
        }
    };

    // The rewritten length is unknown
    headers.remove(header::CONTENT_LENGTH);
    if decoder.is_some() {
        headers.remove(header::CONTENT_ENCODING);
    }

    tracing::debug!(
        codec = ?decoder.as_ref().map(Decoder::codec),
        "rewriting html response"
    );
    Negotiation::Engage { decoder }
}

/// Checks if Content-Type is `text/html`, parameters allowed.
fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| {
            ct.get(..9)
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case("text/html"))
        })
}
