//! Incremental decoder for HTTP/1.x request and response heads.
//!
//! [`HeadDecoder`] wraps `httparse` in a [`Decoder`]: callers keep appending
//! received bytes to one `BytesMut` and call `decode` until a head comes out.
//! On success the head bytes (up to and including the blank line) are split off
//! the front of the buffer; whatever followed stays in the buffer untouched, so
//! body bytes that arrived in the same read are never parsed twice.
//!
//! Header names and values are not copied: the decoder records their byte
//! ranges while `httparse` still borrows the buffer, then slices the frozen head
//! bytes once the borrow is released.

use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode, Uri, Version};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{HeaderField, HeaderFields, ParseError, RequestHead, ResponseHead};

/// Maximum number of header fields allowed in a head
const MAX_HEADER_NUM: usize = 64;

/// Maximum size in bytes allowed for the entire head
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// A message head that [`HeadDecoder`] knows how to parse.
pub trait MessageHead: Sized {
    /// Tries to parse one head from the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched when more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] when the bytes can not be the start of a valid head
    /// or when the head exceeds the size limits.
    fn parse_from(src: &mut BytesMut) -> Result<Option<Self>, ParseError>;
}

/// Decoder for [`RequestHead`] or [`ResponseHead`].
#[derive(Debug)]
pub struct HeadDecoder<T> {
    _head: PhantomData<fn() -> T>,
}

impl<T> HeadDecoder<T> {
    pub fn new() -> Self {
        Self { _head: PhantomData }
    }
}

impl<T> Default for HeadDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: MessageHead> Decoder for HeadDecoder<T> {
    type Item = T;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        T::parse_from(src)
    }
}

impl MessageHead for RequestHead {
    fn parse_from(src: &mut BytesMut) -> Result<Option<Self>, ParseError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut req = httparse::Request::new(&mut headers);

        let head_len = match req.parse(src).map_err(map_parse_error)? {
            Status::Complete(head_len) => head_len,
            Status::Partial => return partial(src),
        };
        ensure!(head_len <= MAX_HEADER_BYTES, ParseError::too_large_header(head_len, MAX_HEADER_BYTES));
        trace!(head_len, "parsed request head");

        let version = to_version(req.version)?;
        let method = Method::from_bytes(req.method.ok_or(ParseError::InvalidMethod)?.as_bytes()).map_err(|_| ParseError::InvalidMethod)?;
        let uri = req.path.ok_or(ParseError::InvalidUri)?.parse::<Uri>().map_err(|_| ParseError::InvalidUri)?;
        let index = FieldIndex::record(src, req.headers);

        let head_bytes = src.split_to(head_len).freeze();
        Ok(Some(RequestHead::new(method, uri, version, FieldIndex::to_fields(&head_bytes, &index))))
    }
}

impl MessageHead for ResponseHead {
    fn parse_from(src: &mut BytesMut) -> Result<Option<Self>, ParseError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut res = httparse::Response::new(&mut headers);

        let head_len = match res.parse(src).map_err(map_parse_error)? {
            Status::Complete(head_len) => head_len,
            Status::Partial => return partial(src),
        };
        ensure!(head_len <= MAX_HEADER_BYTES, ParseError::too_large_header(head_len, MAX_HEADER_BYTES));
        trace!(head_len, "parsed response head");

        let version = to_version(res.version)?;
        let code = res.code.ok_or(ParseError::InvalidStatus(None))?;
        let status = StatusCode::from_u16(code).map_err(|_| ParseError::InvalidStatus(Some(code)))?;
        let reason = res.reason.unwrap_or_default().to_owned();
        let index = FieldIndex::record(src, res.headers);

        let head_bytes = src.split_to(head_len).freeze();
        Ok(Some(ResponseHead::new(version, status, reason, FieldIndex::to_fields(&head_bytes, &index))))
    }
}

/// An incomplete head is fine as long as it still fits in the limit.
fn partial<T>(src: &BytesMut) -> Result<Option<T>, ParseError> {
    ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));
    Ok(None)
}

fn map_parse_error(e: Error) -> ParseError {
    match e {
        Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
        e => ParseError::invalid_header(e),
    }
}

fn to_version(version: Option<u8>) -> Result<Version, ParseError> {
    match version {
        Some(0) => Ok(Version::HTTP_10),
        Some(1) => Ok(Version::HTTP_11),
        v => Err(ParseError::InvalidVersion(v)),
    }
}

/// Byte ranges of a header field's name and value within the head buffer.
#[derive(Clone, Copy)]
struct FieldIndex {
    name: (usize, usize),
    value: (usize, usize),
}

impl FieldIndex {
    fn record(bytes: &[u8], headers: &[httparse::Header<'_>]) -> Vec<FieldIndex> {
        let bytes_ptr = bytes.as_ptr() as usize;
        headers
            .iter()
            .map(|header| {
                let name_start = header.name.as_ptr() as usize - bytes_ptr;
                let value_start = header.value.as_ptr() as usize - bytes_ptr;
                FieldIndex {
                    name: (name_start, name_start + header.name.len()),
                    value: (value_start, value_start + header.value.len()),
                }
            })
            .collect()
    }

    fn to_fields(head_bytes: &Bytes, index: &[FieldIndex]) -> HeaderFields {
        index
            .iter()
            .map(|i| HeaderField::new(head_bytes.slice(i.name.0..i.name.1), head_bytes.slice(i.value.0..i.value.1)))
            .collect()
    }
}
