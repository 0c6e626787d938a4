use crate::codec::Codec;
use std::io;
use tower::BoxError;

/// Failure of an engaged rewrite chain.
///
/// Raised before the response head is handed on, the error resolves the
/// service future and the surrounding stack decides what to answer. Raised
/// later, it ends the response body early and nothing buffered in the chain
/// is flushed.
#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    /// The compressed body could not be decoded.
    #[error("failed to decode `{codec}` response body")]
    Decode {
        /// Codec named by the response's Content-Encoding.
        codec: Codec,
        /// Error reported by the codec.
        #[source]
        source: io::Error,
    },
    /// The configured transform rejected the body.
    #[error("response transform failed")]
    Transform(#[source] BoxError),
    /// The wrapped response body produced an error.
    #[error("response body stream failed")]
    Body(#[source] BoxError),
}

impl RewriteError {
    /// Returns `true` if the error came from decoding a compressed body.
    pub fn is_decode(&self) -> bool {
        matches!(self, RewriteError::Decode { .. })
    }
}
