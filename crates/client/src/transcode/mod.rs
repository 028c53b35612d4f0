//! On-the-fly compression of responses relayed through a tunnel.
//!
//! A tunnel carries raw HTTP/1.x between the relay and a local web server. Local
//! dev servers rarely compress, while the relay sits behind a real network, so
//! the tunnel compresses eligible responses itself:
//!
//! - [`RequestInspector`] watches bytes going to the destination. It parses the
//!   first request head and records which encoding the client accepts. It never
//!   changes or holds back a byte.
//! - [`ResponseTranscoder`] watches bytes coming back. If an encoding was recorded
//!   and the response is compressible text, the head is rewritten to
//!   `Transfer-Encoding: chunked` plus `Content-Encoding`, and the body is
//!   decoded, compressed and re-framed as it streams. Everything else passes
//!   through untouched.
//!
//! Anything the parsers do not understand is relayed verbatim.

mod encoder;

pub use encoder::ContentEncoding;

use std::io;
use std::sync::{Arc, OnceLock};

use bytes::{Bytes, BytesMut};
use http::Method;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use rv_http::codec::{BodyDecoder, ChunkedEncoder, HeadDecoder, HeadEncoder};
use rv_http::protocol::{HeaderField, PayloadItem, RequestHead, ResponseHead};
use tokio_util::codec::{Decoder, Encoder as _};
use tracing::{debug, trace};

use encoder::Encoder;

/// Content types worth compressing, compared against the mime essence.
const COMPRESSIBLE_TYPES: [&str; 8] = [
    "text/plain",
    "text/css",
    "text/html",
    "text/javascript",
    "application/x-javascript",
    "application/javascript",
    "application/xml",
    "text/xml",
];

/// The encoding decided by the inspector: unset until the first request head is
/// parsed, then `Some(encoding)` or `None` for good.
type Decision = Arc<OnceLock<Option<ContentEncoding>>>;

/// Both halves of one tunnel's transcoding state.
#[derive(Debug, Default)]
pub struct TranscodingDuplex {
    decision: Decision,
}

impl TranscodingDuplex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits into the request side and the response side, which may be driven
    /// concurrently.
    pub fn split(self) -> (RequestInspector, ResponseTranscoder) {
        let inspector = RequestInspector { decision: Arc::clone(&self.decision), buf: Some(BytesMut::new()) };
        let transcoder = ResponseTranscoder { decision: self.decision, state: State::Inspect { buf: BytesMut::new() } };
        (inspector, transcoder)
    }
}

/// Request side: learns the accepted encoding from the first request head.
#[derive(Debug)]
pub struct RequestInspector {
    decision: Decision,
    /// Copy of request bytes until the head is complete; `None` once decided
    buf: Option<BytesMut>,
}

impl RequestInspector {
    /// Observes bytes on their way to the destination.
    pub fn inspect(&mut self, chunk: &[u8]) {
        let Some(buf) = self.buf.as_mut() else {
            return;
        };
        buf.extend_from_slice(chunk);

        let encoding = match HeadDecoder::<RequestHead>::new().decode(buf) {
            Ok(None) => return,
            Ok(Some(head)) => accepted_encoding(&head),
            Err(e) => {
                debug!(cause = %e, "unparsable request head, response will not be transcoded");
                None
            }
        };
        trace!(encoding = ?encoding, "decided response encoding");

        self.buf = None;
        let _ = self.decision.set(encoding);
    }

    /// Whether the first request head has been seen.
    pub fn is_decided(&self) -> bool {
        self.buf.is_none()
    }

    pub fn encoding(&self) -> Option<ContentEncoding> {
        self.decision.get().copied().flatten()
    }
}

fn accepted_encoding(head: &RequestHead) -> Option<ContentEncoding> {
    if head.is_upgrade() || head.method() == Method::HEAD {
        return None;
    }
    head.fields().get_str(http::header::ACCEPT_ENCODING).and_then(ContentEncoding::select)
}

/// Response side: compresses eligible response bodies.
#[derive(Debug)]
pub struct ResponseTranscoder {
    decision: Decision,
    state: State,
}

#[derive(Debug)]
enum State {
    /// Buffering the response head before deciding
    Inspect { buf: BytesMut },
    Encode(Box<Encoding>),
    Passthrough,
}

#[derive(Debug)]
struct Encoding {
    body: BodyDecoder,
    encoder: Option<Encoder>,
    chunked: ChunkedEncoder,
    /// Original body bytes not decoded yet
    pending: BytesMut,
}

impl ResponseTranscoder {
    /// Feeds bytes read from the destination and appends what should be sent to
    /// the relay to `out`.
    ///
    /// # Errors
    ///
    /// Only compression failures are returned; parse problems switch to pass-through.
    pub fn transform(&mut self, chunk: &[u8], out: &mut BytesMut) -> io::Result<()> {
        match &mut self.state {
            State::Passthrough => {
                out.extend_from_slice(chunk);
                Ok(())
            }
            State::Encode(encoding) => {
                encoding.pending.extend_from_slice(chunk);
                self.pump(out)
            }
            State::Inspect { buf } => {
                let Some(content_encoding) = self.decision.get().copied().flatten() else {
                    out.extend_from_slice(buf);
                    out.extend_from_slice(chunk);
                    self.state = State::Passthrough;
                    return Ok(());
                };

                buf.extend_from_slice(chunk);
                // parse a copy: an ineligible response goes out byte for byte
                let mut rest = buf.clone();
                let head = match HeadDecoder::<ResponseHead>::new().decode(&mut rest) {
                    Ok(Some(head)) => head,
                    Ok(None) => return Ok(()),
                    Err(e) => {
                        debug!(cause = %e, "unparsable response head, passing through");
                        out.extend_from_slice(buf);
                        self.state = State::Passthrough;
                        return Ok(());
                    }
                };

                let body = match is_compressible(&head).then(|| BodyDecoder::for_response(&head)) {
                    Some(Ok(body)) => body,
                    _ => {
                        trace!(status = head.status().as_u16(), "response not eligible for compression");
                        out.extend_from_slice(buf);
                        self.state = State::Passthrough;
                        return Ok(());
                    }
                };

                debug!(status = head.status().as_u16(), encoding = %content_encoding, "compressing response");
                HeadEncoder.encode(&rewrite_head(head, content_encoding), out)?;
                self.state = State::Encode(Box::new(Encoding {
                    body,
                    encoder: Some(Encoder::new(content_encoding)),
                    chunked: ChunkedEncoder::new(),
                    pending: rest,
                }));
                self.pump(out)
            }
        }
    }

    /// Flushes everything still held back once the destination has closed.
    ///
    /// # Errors
    ///
    /// Fails when the compressor can not finish its stream.
    pub fn finish(&mut self, out: &mut BytesMut) -> io::Result<()> {
        match std::mem::replace(&mut self.state, State::Passthrough) {
            State::Inspect { buf } => {
                out.extend_from_slice(&buf);
                Ok(())
            }
            State::Encode(mut encoding) => {
                loop {
                    match encoding.body.decode_eof(&mut encoding.pending) {
                        Ok(Some(PayloadItem::Chunk(data))) => encoding.compress(&data, out)?,
                        Ok(Some(PayloadItem::Eof)) => break,
                        Ok(None) => break,
                        Err(e) => {
                            debug!(cause = %e, "response body cut short");
                            break;
                        }
                    }
                }
                encoding.end(out)
            }
            State::Passthrough => Ok(()),
        }
    }

    /// Whether a response is currently being compressed.
    pub fn is_encoding(&self) -> bool {
        matches!(self.state, State::Encode(_))
    }

    /// Decodes and compresses whatever body bytes are pending.
    fn pump(&mut self, out: &mut BytesMut) -> io::Result<()> {
        let State::Encode(encoding) = &mut self.state else {
            return Ok(());
        };

        loop {
            match encoding.body.decode(&mut encoding.pending) {
                Ok(Some(PayloadItem::Chunk(data))) => encoding.compress(&data, out)?,
                Ok(Some(PayloadItem::Eof)) => break,
                Ok(None) => return Ok(()),
                Err(e) => {
                    debug!(cause = %e, "invalid response body framing, ending compressed body");
                    break;
                }
            }
        }

        // the response is complete, anything after it is relayed as is
        encoding.end(out)?;
        out.extend_from_slice(&encoding.pending);
        self.state = State::Passthrough;
        Ok(())
    }
}

impl Encoding {
    fn compress(&mut self, data: &Bytes, out: &mut BytesMut) -> io::Result<()> {
        if let Some(encoder) = self.encoder.as_mut() {
            let compressed = encoder.encode(data)?;
            self.chunked.encode(PayloadItem::Chunk(compressed), out)?;
        }
        Ok(())
    }

    fn end(&mut self, out: &mut BytesMut) -> io::Result<()> {
        if let Some(encoder) = self.encoder.take() {
            let tail = encoder.finish()?;
            self.chunked.encode(PayloadItem::Chunk(tail), out)?;
        }
        self.chunked.encode(PayloadItem::<Bytes>::Eof, out)
    }
}

fn is_compressible(head: &ResponseHead) -> bool {
    if head.fields().contains(CONTENT_ENCODING) || !head.has_body() || !is_plain_framing(head) {
        return false;
    }
    // parameters after `;` are ignored, even malformed ones
    head.fields()
        .get_str(CONTENT_TYPE)
        .and_then(|value| value.split(';').next())
        .and_then(|essence| essence.trim().parse::<mime::Mime>().ok())
        .is_some_and(|mime| COMPRESSIBLE_TYPES.iter().any(|t| mime.essence_str().eq_ignore_ascii_case(t)))
}

/// Whether the body carries no transfer coding other than `chunked`.
fn is_plain_framing(head: &ResponseHead) -> bool {
    head.fields()
        .get_all(TRANSFER_ENCODING.as_str())
        .flat_map(|value| value.split(|b| *b == b','))
        .map(<[u8]>::trim_ascii)
        .filter(|coding| !coding.is_empty())
        .all(|coding| coding.eq_ignore_ascii_case(b"chunked"))
}

/// Drops the original framing fields and declares chunked, compressed content.
fn rewrite_head(mut head: ResponseHead, encoding: ContentEncoding) -> ResponseHead {
    let fields = head.fields_mut();
    fields.remove(TRANSFER_ENCODING);
    fields.remove(CONTENT_LENGTH);
    fields.push(HeaderField::new("Transfer-Encoding", "chunked"));
    fields.push(HeaderField::new("Content-Encoding", encoding.name()));
    head
}
