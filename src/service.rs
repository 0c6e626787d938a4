use crate::body::RewriteBody;
use crate::future::ResponseFuture;
use crate::transform::MakeTransform;
use http::{Request, Response};
use http_body::Body;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{BoxError, Service};

/// A Tower service that rewrites HTML response bodies.
#[derive(Clone)]
pub struct HtmlRewriteService<S> {
    inner: S,
    make_transform: Option<Arc<dyn MakeTransform>>,
}

impl<S> HtmlRewriteService<S> {
    pub(crate) fn new(inner: S, make_transform: Option<Arc<dyn MakeTransform>>) -> Self {
        Self {
            inner,
            make_transform,
        }
    }

    /// Returns a reference to the inner service.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns a mutable reference to the inner service.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consumes this service, returning the inner service.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: fmt::Debug> fmt::Debug for HtmlRewriteService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HtmlRewriteService")
            .field("inner", &self.inner)
            .field("transform", &self.make_transform.is_some())
            .finish()
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for HtmlRewriteService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Error: Into<BoxError>,
    ResBody: Body,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<RewriteBody<ResBody>>;
    type Error = BoxError;
    type Future = ResponseFuture<S::Future, ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // The inner service always handles the request; only its response is rewritten.
        let inner = self.inner.call(req);

        ResponseFuture::new(inner, self.make_transform.clone())
    }
}
