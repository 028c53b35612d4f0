//! Decoder for `Transfer-Encoding: chunked` bodies.
//!
//! refer: <https://www.rfc-editor.org/rfc/rfc9112#section-7.1>
//!
//! The decoder yields the de-chunked payload as it arrives: a chunk that is
//! only partially buffered is returned in pieces rather than waiting for all of
//! it. Chunk extensions and trailer fields are read and dropped.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::protocol::{ParseError, PayloadItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// hex digits of the chunk size
    Size,
    /// whitespace between size and `;` or CR
    SizeLws,
    /// `;name=value` after the size, ignored
    Extension,
    SizeLf,
    /// `remaining` bytes of chunk data
    Data,
    DataCr,
    DataLf,
    /// first byte after the last-chunk line: CR or a trailer field
    TrailerStart,
    Trailer,
    TrailerLf,
    EndLf,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: State,
    remaining: u64,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: State::Size, remaining: 0 }
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Done
    }

    /// Consumes framing bytes until chunk data is available, the body ends or `src` runs dry.
    fn skip_framing(&mut self, src: &mut BytesMut) -> Result<(), ParseError> {
        while self.state != State::Data && self.state != State::Done && src.has_remaining() {
            let byte = src.get_u8();
            self.state = match (self.state, byte) {
                (State::Size, b) if b.is_ascii_hexdigit() => {
                    // is_ascii_hexdigit guarantees to_digit succeeds
                    let digit = u64::from(char::from(b).to_digit(16).unwrap_or_default());
                    self.remaining = self
                        .remaining
                        .checked_mul(16)
                        .and_then(|size| size.checked_add(digit))
                        .ok_or_else(|| ParseError::invalid_body("chunk size overflow"))?;
                    State::Size
                }
                (State::Size | State::SizeLws, b'\t' | b' ') => State::SizeLws,
                (State::Size | State::SizeLws, b';') => State::Extension,
                (State::Size | State::SizeLws | State::Extension, b'\r') => State::SizeLf,
                (State::Extension, b'\n') => return Err(ParseError::invalid_body("bare LF in chunk extension")),
                (State::Extension, _) => State::Extension,
                (State::SizeLf, b'\n') if self.remaining == 0 => State::TrailerStart,
                (State::SizeLf, b'\n') => State::Data,
                (State::DataCr, b'\r') => State::DataLf,
                (State::DataLf, b'\n') => State::Size,
                (State::TrailerStart, b'\r') => State::EndLf,
                (State::TrailerStart | State::Trailer, b'\r') => State::TrailerLf,
                (State::TrailerStart | State::Trailer, _) => State::Trailer,
                (State::TrailerLf, b'\n') => State::TrailerStart,
                (State::EndLf, b'\n') => State::Done,
                (state, b) => {
                    return Err(ParseError::invalid_body(format!("unexpected byte 0x{b:02x} in chunked body at {state:?}")));
                }
            };
        }
        Ok(())
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.skip_framing(src)?;

        match self.state {
            State::Done => {
                trace!("finished reading chunked body");
                Ok(Some(PayloadItem::Eof))
            }
            State::Data if src.has_remaining() => {
                let len = usize::try_from(self.remaining).unwrap_or(usize::MAX).min(src.len());
                self.remaining -= len as u64;
                if self.remaining == 0 {
                    self.state = State::DataCr;
                }
                trace!(len, "read chunk data");
                Ok(Some(PayloadItem::Chunk(src.split_to(len).freeze())))
            }
            _ => Ok(None),
        }
    }
}
