use crate::service::HtmlRewriteService;
use crate::transform::MakeTransform;
use std::fmt;
use std::sync::Arc;
use tower::Layer;

/// A Tower layer that rewrites HTML response bodies.
///
/// Without a transform factory the layer is a no-op: responses are passed
/// through and their headers are never inspected.
#[derive(Clone, Default)]
pub struct HtmlRewriteLayer {
    make_transform: Option<Arc<dyn MakeTransform>>,
}

impl HtmlRewriteLayer {
    /// Creates a layer with no transform configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the factory that builds a transform for each HTML response.
    ///
    /// The factory runs only for responses that will be rewritten. When it
    /// returns `None` the body is still decoded, just not transformed.
    ///
    /// ```ignore
    /// let layer = HtmlRewriteLayer::new().transform(|| Some(Replace::new("foo", "bar")));
    /// ```
    pub fn transform<M: MakeTransform>(mut self, make_transform: M) -> Self {
        self.make_transform = Some(Arc::new(make_transform));
        self
    }
}

impl fmt::Debug for HtmlRewriteLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HtmlRewriteLayer")
            .field("transform", &self.make_transform.is_some())
            .finish()
    }
}

impl<S> Layer<S> for HtmlRewriteLayer {
    type Service = HtmlRewriteService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HtmlRewriteService::new(inner, self.make_transform.clone())
    }
}
