use crate::error::RewriteError;
use bytes::BytesMut;
use compression_codecs::DecodeV2;
use compression_core::util::{PartialBuffer, WriteBuffer};
use std::fmt;
use std::io;
use std::sync::OnceLock;

const OUTPUT_BUFFER_SIZE: usize = 8 * 1024; // 8KB output buffer

/// Content codings the middleware knows how to undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Gzip compression.
    Gzip,
    /// Deflate compression (zlib-wrapped, as used by HTTP).
    Deflate,
    /// Brotli compression.
    Brotli,
}

impl Codec {
    /// Every codec in lookup order.
    pub const ALL: [Codec; 3] = [Codec::Gzip, Codec::Deflate, Codec::Brotli];

    /// Returns the Content-Encoding header value for this codec.
    pub fn content_encoding(&self) -> &'static str {
        match self {
            Codec::Gzip => "gzip",
            Codec::Deflate => "deflate",
            Codec::Brotli => "br",
        }
    }

    /// Parses a single Content-Encoding token.
    ///
    /// Returns `None` for unknown tokens and for lists of codings such as
    /// `"gzip, br"`, which are not undone.
    pub fn from_content_encoding(token: &str) -> Option<Codec> {
        let token = token.trim();
        if token.eq_ignore_ascii_case("gzip") || token.eq_ignore_ascii_case("x-gzip") {
            Some(Codec::Gzip)
        } else if token.eq_ignore_ascii_case("deflate") {
            Some(Codec::Deflate)
        } else if token.eq_ignore_ascii_case("br") {
            Some(Codec::Brotli)
        } else {
            None
        }
    }

    /// Creates a new decoder for this codec, if support was compiled in.
    fn raw_decoder(&self) -> Option<Box<dyn DecodeV2 + Send>> {
        match self {
            #[cfg(feature = "gzip")]
            Codec::Gzip => Some(Box::new(compression_codecs::gzip::GzipDecoder::new())),
            #[cfg(feature = "deflate")]
            Codec::Deflate => Some(Box::new(compression_codecs::zlib::ZlibDecoder::new())),
            #[cfg(feature = "brotli")]
            Codec::Brotli => Some(Box::new(compression_codecs::brotli::BrotliDecoder::new())),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.content_encoding())
    }
}

/// The fixed set of codecs this process can decode.
///
/// The set is probed once, the first time [`DecoderRegistry::global`] is
/// called, and never changes afterwards.
#[derive(Debug, Clone)]
pub struct DecoderRegistry {
    available: Vec<Codec>,
}

impl DecoderRegistry {
    /// Returns the process-wide registry.
    pub fn global() -> &'static DecoderRegistry {
        static REGISTRY: OnceLock<DecoderRegistry> = OnceLock::new();
        REGISTRY.get_or_init(DecoderRegistry::probe)
    }

    fn probe() -> Self {
        let available: Vec<Codec> = Codec::ALL
            .into_iter()
            .filter(|codec| codec.raw_decoder().is_some())
            .collect();
        tracing::debug!(?available, "probed response decoders");
        Self { available }
    }

    /// Resolves a Content-Encoding value to a decodable codec.
    ///
    /// A miss means "unsupported"; the caller leaves the body alone.
    pub fn lookup(&self, content_encoding: &str) -> Option<Codec> {
        Codec::from_content_encoding(content_encoding).filter(|codec| self.supports(*codec))
    }

    /// Returns whether a decoder exists for `codec`.
    pub fn supports(&self, codec: Codec) -> bool {
        self.available.contains(&codec)
    }

    /// Builds a decoder stage for a codec this registry supports.
    pub(crate) fn decoder(&self, codec: Codec) -> Option<Decoder> {
        if !self.supports(codec) {
            return None;
        }
        codec.raw_decoder().map(|inner| Decoder::new(codec, inner))
    }
}

/// Magic bytes opening every gzip member.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decoding stage of the rewrite chain.
pub(crate) struct Decoder {
    codec: Codec,
    inner: Box<dyn DecodeV2 + Send>,
    output_buffer: Vec<u8>,
    seen_input: bool,
    done: bool,
    /// Bytes seen after a finished gzip member, up to the magic length.
    member_header: Vec<u8>,
    /// Bytes after the stream did not start a new member; drop the rest.
    trailing: bool,
}

impl Decoder {
    fn new(codec: Codec, inner: Box<dyn DecodeV2 + Send>) -> Self {
        Self {
            codec,
            inner,
            output_buffer: vec![0u8; OUTPUT_BUFFER_SIZE],
            seen_input: false,
            done: false,
            member_header: Vec::new(),
            trailing: false,
        }
    }

    pub(crate) fn codec(&self) -> Codec {
        self.codec
    }

    /// Decodes `input`, appending everything the codec can produce to `out`.
    ///
    /// Gzip bodies may hold several members back to back; each one is
    /// decoded in turn. Anything else after the end of the stream is ignored.
    pub(crate) fn decode(&mut self, mut input: &[u8], out: &mut BytesMut) -> Result<(), RewriteError> {
        while !input.is_empty() {
            if self.done {
                match self.start_next_member(input, out)? {
                    Some(rest) => input = rest,
                    None => return Ok(()),
                }
                continue;
            }

            let consumed = self.decode_member(input, out)?;
            if !self.done && consumed < input.len() {
                // codec made no progress
                break;
            }
            input = &input[consumed..];
        }
        Ok(())
    }

    /// Feeds the current member, returning how much input it took.
    fn decode_member(&mut self, input: &[u8], out: &mut BytesMut) -> Result<usize, RewriteError> {
        self.seen_input = true;

        let codec = self.codec;
        let mut input_buf = PartialBuffer::new(input);

        loop {
            let consumed_before = input_buf.written_len();
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());

            let done = self
                .inner
                .decode(&mut input_buf, &mut output)
                .map_err(|source| RewriteError::Decode { codec, source })?;

            let written = output.written_len();
            if written > 0 {
                out.extend_from_slice(&self.output_buffer[..written]);
            }

            if done {
                self.done = true;
                break;
            }

            // A full output buffer may mean the codec still holds output.
            let all_consumed = input_buf.written_len() >= input.len();
            if all_consumed && written < self.output_buffer.len() {
                break;
            }

            // Safety check to prevent infinite loop
            if written == 0 && input_buf.written_len() == consumed_before {
                break;
            }
        }

        Ok(input_buf.written_len())
    }

    /// Handles input arriving after the current stream ended.
    ///
    /// Returns the input left to decode when a new gzip member starts, or
    /// `None` when the bytes were held back or ignored.
    fn start_next_member<'a>(
        &mut self,
        input: &'a [u8],
        out: &mut BytesMut,
    ) -> Result<Option<&'a [u8]>, RewriteError> {
        if self.codec != Codec::Gzip || self.trailing {
            self.ignore_trailing(input.len());
            return Ok(None);
        }

        let take = (GZIP_MAGIC.len() - self.member_header.len()).min(input.len());
        self.member_header.extend_from_slice(&input[..take]);
        let rest = &input[take..];

        if self.member_header.len() < GZIP_MAGIC.len() {
            return Ok(None);
        }
        if self.member_header != GZIP_MAGIC {
            self.trailing = true;
            self.ignore_trailing(self.member_header.len() + rest.len());
            self.member_header.clear();
            return Ok(None);
        }

        self.inner = self.codec.raw_decoder().ok_or_else(|| RewriteError::Decode {
            codec: self.codec,
            source: io::Error::other("decoder no longer available"),
        })?;
        self.done = false;
        tracing::debug!(codec = %self.codec, "decoding next gzip member");

        let header = std::mem::take(&mut self.member_header);
        self.decode_member(&header, out)?;
        Ok(Some(rest))
    }

    fn ignore_trailing(&self, len: usize) {
        tracing::debug!(
            codec = %self.codec,
            len,
            "ignoring bytes after end of compressed stream"
        );
    }

    /// Signals end of input. A stream that started but never reached its
    /// final block is reported as a decode failure.
    pub(crate) fn finish(&mut self) -> Result<(), RewriteError> {
        if !self.member_header.is_empty() {
            self.ignore_trailing(self.member_header.len());
            self.member_header.clear();
        }
        if self.seen_input && !self.done {
            return Err(RewriteError::Decode {
                codec: self.codec,
                source: io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "compressed stream ended before its final block",
                ),
            });
        }
        Ok(())
    }
}
