//! Caller-supplied rewrite stages.
//!
//! A [`Transform`] sees the decoded HTML body chunk by chunk and writes
//! whatever it wants to emit into an output buffer. A [`MakeTransform`]
//! builds a fresh transform for every response that gets rewritten.

use bytes::{Bytes, BytesMut};
use tower::BoxError;

/// A streaming rewrite of a response body.
pub trait Transform: Send {
    /// Consumes one chunk of the body, appending any output to `out`.
    fn write(&mut self, chunk: &[u8], out: &mut BytesMut) -> Result<(), BoxError>;

    /// Called once after the last chunk; flushes anything held back.
    fn end(&mut self, out: &mut BytesMut) -> Result<(), BoxError> {
        let _ = out;
        Ok(())
    }
}

impl<T: Transform + ?Sized> Transform for Box<T> {
    fn write(&mut self, chunk: &[u8], out: &mut BytesMut) -> Result<(), BoxError> {
        (**self).write(chunk, out)
    }

    fn end(&mut self, out: &mut BytesMut) -> Result<(), BoxError> {
        (**self).end(out)
    }
}

/// Factory producing one [`Transform`] per rewritten response.
///
/// Returning `None` skips the transform stage; the body is still decoded
/// and its headers adjusted.
pub trait MakeTransform: Send + Sync + 'static {
    /// Builds the transform for the next response.
    fn make_transform(&self) -> Option<Box<dyn Transform>>;
}

impl<F, T> MakeTransform for F
where
    F: Fn() -> Option<T> + Send + Sync + 'static,
    T: Transform + 'static,
{
    fn make_transform(&self) -> Option<Box<dyn Transform>> {
        self().map(|transform| Box::new(transform) as Box<dyn Transform>)
    }
}

/// Replaces every occurrence of a byte pattern, streaming.
///
/// Only the tail of a chunk that could start a match is held back between
/// writes, so output keeps flowing for large documents.
#[derive(Debug, Clone)]
pub struct Replace {
    pattern: Vec<u8>,
    replacement: Bytes,
    carry: Vec<u8>,
}

impl Replace {
    /// Creates a transform replacing `pattern` with `replacement`.
    ///
    /// An empty pattern matches nothing.
    pub fn new(pattern: impl AsRef<[u8]>, replacement: impl AsRef<[u8]>) -> Self {
        Self {
            pattern: pattern.as_ref().to_vec(),
            replacement: Bytes::copy_from_slice(replacement.as_ref()),
            carry: Vec::new(),
        }
    }
}

impl Transform for Replace {
    fn write(&mut self, chunk: &[u8], out: &mut BytesMut) -> Result<(), BoxError> {
        if self.pattern.is_empty() {
            out.extend_from_slice(chunk);
            return Ok(());
        }

        self.carry.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(pos) = find(&self.carry[start..], &self.pattern) {
            out.extend_from_slice(&self.carry[start..start + pos]);
            out.extend_from_slice(&self.replacement);
            start += pos + self.pattern.len();
        }

        // keep a possible partial match for the next chunk
        let keep = (self.pattern.len() - 1).min(self.carry.len() - start);
        let emit_to = self.carry.len() - keep;
        out.extend_from_slice(&self.carry[start..emit_to]);
        self.carry.drain(..emit_to);

        Ok(())
    }

    fn end(&mut self, out: &mut BytesMut) -> Result<(), BoxError> {
        out.extend_from_slice(&self.carry);
        self.carry.clear();
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Collects the whole body, then rewrites it in one call at the end.
pub struct Buffered<F> {
    f: F,
    body: BytesMut,
}

/// Creates a [`Buffered`] transform from a whole-document rewrite.
pub fn buffered<F>(f: F) -> Buffered<F>
where
    F: FnMut(Bytes) -> Result<Bytes, BoxError> + Send,
{
    Buffered {
        f,
        body: BytesMut::new(),
    }
}

impl<F> Transform for Buffered<F>
where
    F: FnMut(Bytes) -> Result<Bytes, BoxError> + Send,
{
    fn write(&mut self, chunk: &[u8], _out: &mut BytesMut) -> Result<(), BoxError> {
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    fn end(&mut self, out: &mut BytesMut) -> Result<(), BoxError> {
        let body = std::mem::take(&mut self.body).freeze();
        out.extend_from_slice(&(self.f)(body)?);
        Ok(())
    }
}

/// A per-chunk transform built from a closure.
pub struct FromFn<F> {
    f: F,
}

/// Creates a [`FromFn`] transform. The closure sees every chunk.
pub fn from_fn<F>(f: F) -> FromFn<F>
where
    F: FnMut(&[u8], &mut BytesMut) -> Result<(), BoxError> + Send,
{
    FromFn { f }
}

impl<F> Transform for FromFn<F>
where
    F: FnMut(&[u8], &mut BytesMut) -> Result<(), BoxError> + Send,
{
    fn write(&mut self, chunk: &[u8], out: &mut BytesMut) -> Result<(), BoxError> {
        (self.f)(chunk, out)
    }
}
