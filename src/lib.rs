//! HTML response rewriting middleware for Tower.
//!
//! This crate provides a Tower layer that routes HTML response bodies through
//! a caller-supplied [`Transform`], decoding them first when the inner service
//! produced a compressed body.
//!
//! # Example
//!
//! ```ignore
//! use html_response_rewrite::{HtmlRewriteLayer, transform::Replace};
//! use tower::ServiceBuilder;
//!
//! let service = ServiceBuilder::new()
//!     .layer(HtmlRewriteLayer::new().transform(|| Some(Replace::new("Original", "Replaced"))))
//!     .service(my_service);
//! ```
//!
//! # Rewrite Rules
//!
//! A response is rewritten only when:
//! - A transform factory is configured
//! - `Content-Type` starts with `text/html`
//! - `Content-Encoding` is absent, or is one of `gzip`, `deflate` or `br`
//!   and the matching cargo feature is enabled
//!
//! Anything else, including an unknown `Content-Encoding`, is passed through
//! byte for byte.
//!
//! # Response Modifications
//!
//! When a response is rewritten:
//! - `Content-Length` header is removed (rewritten size is unknown)
//! - `Content-Encoding` header is removed if the body was decoded
//! - The response head is released only when the first rewritten frame is
//!   ready, or the body ended without one
//!
//! # Errors
//!
//! A failure in the decoder, the transform or the inner body before the
//! response head is released resolves the service future with a
//! [`RewriteError`] (boxed), so an outer error handler can still answer with
//! an error status. Later failures end the body with the error; nothing the
//! chain buffered is flushed.

#![deny(missing_docs)]

mod body;
mod codec;
mod error;
mod future;
mod layer;
mod service;
pub mod transform;

pub use body::{RewriteBody, RewriteChain};
pub use codec::{Codec, DecoderRegistry};
pub use error::RewriteError;
pub use future::ResponseFuture;
pub use layer::HtmlRewriteLayer;
pub use service::HtmlRewriteService;
pub use transform::{MakeTransform, Transform};
