//! Serialises a [`ResponseHead`] back into its wire form.
//!
//! The encoder writes fields verbatim, in the order they are stored, with their
//! original casing. It does not add or fix up framing headers on its own: callers
//! that change the body framing edit the fields first.

use crate::protocol::ResponseHead;

use bytes::{BufMut, BytesMut};

use http::Version;
use std::io;
use std::io::{ErrorKind, Write};
use tokio_util::codec::Encoder;
use tracing::error;

/// Initial buffer size reserved for a head
const INIT_HEADER_SIZE: usize = 1024;

#[derive(Debug, Default)]
pub struct HeadEncoder;

impl Encoder<&ResponseHead> for HeadEncoder {
    type Error = io::Error;

    /// Writes `HTTP/<version> <code> <reason>\r\n`, every field and the final blank line.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Unsupported`] for versions other than HTTP/1.0 and HTTP/1.1.
    fn encode(&mut self, head: &ResponseHead, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let version = match head.version() {
            Version::HTTP_10 => "HTTP/1.0",
            Version::HTTP_11 => "HTTP/1.1",
            v => {
                error!(http_version = ?v, "unsupported http version");
                return Err(io::Error::from(ErrorKind::Unsupported));
            }
        };

        dst.reserve(INIT_HEADER_SIZE);
        write!(FastWrite(dst), "{version} {} {}\r\n", head.status().as_str(), head.reason())?;

        for field in head.fields() {
            dst.put_slice(field.name());
            dst.put_slice(b": ");
            dst.put_slice(field.value());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// `io::Write` adapter appending to a `BytesMut`.
pub(crate) struct FastWrite<'a>(pub(crate) &'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::HeadDecoder;
    use tokio_util::codec::Decoder;

    #[test]
    fn encode_parsed_head_verbatim() {
        let raw = &b"HTTP/1.1 200 OK\r\ncontent-type: text/css\r\nX-Custom:  spaced\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n"[..];
        let head = HeadDecoder::<ResponseHead>::new().decode(&mut BytesMut::from(raw)).unwrap().unwrap();

        let mut dst = BytesMut::new();
        HeadEncoder.encode(&head, &mut dst).unwrap();

        // httparse trims leading whitespace of values
        assert_eq!(
            &dst[..],
            &b"HTTP/1.1 200 OK\r\ncontent-type: text/css\r\nX-Custom: spaced\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n"[..]
        );
    }

    #[test]
    fn encode_keeps_custom_reason() {
        let raw = &b"HTTP/1.0 299 Totally Fine\r\n\r\n"[..];
        let head = HeadDecoder::<ResponseHead>::new().decode(&mut BytesMut::from(raw)).unwrap().unwrap();

        let mut dst = BytesMut::new();
        HeadEncoder.encode(&head, &mut dst).unwrap();
        assert_eq!(&dst[..], raw);
    }
}
