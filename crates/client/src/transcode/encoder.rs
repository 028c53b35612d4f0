use std::fmt;
use std::io;
use std::io::Write;

use bytes::{Bytes, BytesMut};
use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};
use tracing::trace;

/// A content coding the tunnel can apply to a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentEncoding {
    Gzip,
    Deflate,
}

impl ContentEncoding {
    /// Picks the first `gzip` or `deflate` token of an `Accept-Encoding` value.
    ///
    /// Tokens are delimited by anything that is not alphanumeric or `_`, so
    /// `x-gzip` matches while `gzipped` does not. Quality values are ignored.
    pub fn select(accept_encoding: &str) -> Option<Self> {
        accept_encoding.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_')).find_map(|token| {
            if token.eq_ignore_ascii_case("gzip") {
                Some(ContentEncoding::Gzip)
            } else if token.eq_ignore_ascii_case("deflate") {
                Some(ContentEncoding::Deflate)
            } else {
                None
            }
        })
    }

    /// The token written to `Content-Encoding`.
    pub fn name(&self) -> &'static str {
        match self {
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Deflate => "deflate",
        }
    }
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Collects compressor output.
#[derive(Debug)]
pub(crate) struct Writer {
    buf: BytesMut,
}

impl Writer {
    fn new() -> Self {
        Self { buf: BytesMut::with_capacity(4096) }
    }

    fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

impl io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Streaming compressor for one response body.
pub(crate) enum Encoder {
    Gzip(GzEncoder<Writer>),
    /// zlib-wrapped deflate, which is what HTTP `deflate` means
    Deflate(ZlibEncoder<Writer>),
}

impl Encoder {
    pub(crate) fn new(encoding: ContentEncoding) -> Self {
        match encoding {
            ContentEncoding::Gzip => Self::Gzip(GzEncoder::new(Writer::new(), Compression::default())),
            ContentEncoding::Deflate => Self::Deflate(ZlibEncoder::new(Writer::new(), Compression::default())),
        }
    }

    /// Compresses `data` and returns whatever output the compressor produced so far,
    /// possibly nothing.
    pub(crate) fn encode(&mut self, data: &[u8]) -> io::Result<Bytes> {
        let result = match self {
            Self::Gzip(encoder) => encoder.write_all(data),
            Self::Deflate(encoder) => encoder.write_all(data),
        };
        if let Err(e) = &result {
            trace!(cause = %e, "failed to compress response body");
        }
        result?;
        Ok(self.take())
    }

    fn take(&mut self) -> Bytes {
        match self {
            Self::Gzip(encoder) => encoder.get_mut().take(),
            Self::Deflate(encoder) => encoder.get_mut().take(),
        }
    }

    /// Ends the stream and returns the remaining output including the trailer.
    pub(crate) fn finish(self) -> io::Result<Bytes> {
        let mut writer = match self {
            Self::Gzip(encoder) => encoder.finish()?,
            Self::Deflate(encoder) => encoder.finish()?,
        };
        Ok(writer.take())
    }
}

impl fmt::Debug for Encoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gzip(_) => f.write_str("Encoder::Gzip"),
            Self::Deflate(_) => f.write_str("Encoder::Deflate"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::{GzDecoder, ZlibDecoder};
    use std::io::Read;

    #[test]
    fn select_from_accept_encoding() {
        assert_eq!(ContentEncoding::select("gzip, deflate, br"), Some(ContentEncoding::Gzip));
        assert_eq!(ContentEncoding::select("br;q=1.0, DEFLATE;q=0.5, gzip"), Some(ContentEncoding::Deflate));
        assert_eq!(ContentEncoding::select("x-gzip"), Some(ContentEncoding::Gzip));
        assert_eq!(ContentEncoding::select("gzipped, identity"), None);
        assert_eq!(ContentEncoding::select("br"), None);
        assert_eq!(ContentEncoding::select(""), None);
    }

    #[test]
    fn gzip_round_trip() {
        let mut encoder = Encoder::new(ContentEncoding::Gzip);
        let mut compressed = Vec::new();
        for part in ["body { color: red; }\n", "p { margin: 0; }\n"] {
            compressed.extend_from_slice(&encoder.encode(part.as_bytes()).unwrap());
        }
        compressed.extend_from_slice(&encoder.finish().unwrap());

        let mut plain = String::new();
        GzDecoder::new(&compressed[..]).read_to_string(&mut plain).unwrap();
        assert_eq!(plain, "body { color: red; }\np { margin: 0; }\n");
    }

    #[test]
    fn deflate_is_zlib_wrapped() {
        let mut encoder = Encoder::new(ContentEncoding::Deflate);
        let mut compressed = encoder.encode(b"hello hello hello").unwrap().to_vec();
        compressed.extend_from_slice(&encoder.finish().unwrap());

        let mut plain = String::new();
        ZlibDecoder::new(&compressed[..]).read_to_string(&mut plain).unwrap();
        assert_eq!(plain, "hello hello hello");
    }
}
