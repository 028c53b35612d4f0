//! Decoder for the body that follows a response head.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::body::chunked_decoder::ChunkedDecoder;
use crate::protocol::{ParseError, PayloadItem, PayloadSize, ResponseHead};

/// Yields the decoded payload of one message as [`PayloadItem`]s, ending with
/// [`PayloadItem::Eof`].
///
/// For bodies delimited by connection close, the end is only known once the
/// caller sees EOF on the transport and calls [`Decoder::decode_eof`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyDecoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Length(u64),
    Chunked(ChunkedDecoder),
    UntilClose,
    Empty,
}

impl BodyDecoder {
    pub fn new(size: PayloadSize) -> Self {
        let kind = match size {
            PayloadSize::Length(length) => Kind::Length(length),
            PayloadSize::Chunked => Kind::Chunked(ChunkedDecoder::new()),
            PayloadSize::UntilClose => Kind::UntilClose,
            PayloadSize::Empty => Kind::Empty,
        };
        Self { kind }
    }

    /// Builds the decoder matching the framing headers of `head`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidContentLength`] for a malformed `Content-Length`.
    pub fn for_response(head: &ResponseHead) -> Result<Self, ParseError> {
        head.payload_size().map(Self::new)
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.kind, Kind::Chunked(_))
    }
}

impl Decoder for BodyDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            Kind::Empty | Kind::Length(0) => Ok(Some(PayloadItem::Eof)),
            Kind::Length(remaining) => {
                if src.is_empty() {
                    return Ok(None);
                }
                let len = usize::try_from(*remaining).unwrap_or(usize::MAX).min(src.len());
                *remaining -= len as u64;
                Ok(Some(PayloadItem::Chunk(src.split_to(len).freeze())))
            }
            Kind::Chunked(chunked) => chunked.decode(src),
            Kind::UntilClose => {
                if src.is_empty() {
                    return Ok(None);
                }
                Ok(Some(PayloadItem::Chunk(src.split().freeze())))
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        match self.kind {
            Kind::UntilClose => {
                self.kind = Kind::Empty;
                Ok(Some(PayloadItem::Eof))
            }
            _ => Err(ParseError::invalid_body("connection closed before the body was complete")),
        }
    }
}
