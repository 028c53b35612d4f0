//! Streaming codecs for HTTP/1.x messages.
//!
//! All codecs implement `tokio_util`'s [`Decoder`](tokio_util::codec::Decoder) or
//! [`Encoder`](tokio_util::codec::Encoder) on top of a `BytesMut`, so they can be
//! driven by hand from a read loop or wrapped in a `Framed`.
//!
//! A typical response pass looks like:
//!
//! ```
//! use bytes::BytesMut;
//! use rv_http::codec::{BodyDecoder, HeadDecoder};
//! use rv_http::protocol::{PayloadItem, ResponseHead};
//! use tokio_util::codec::Decoder;
//!
//! let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi"[..]);
//!
//! let head = HeadDecoder::<ResponseHead>::new().decode(&mut buf).unwrap().unwrap();
//! let mut body = BodyDecoder::for_response(&head).unwrap();
//!
//! assert_eq!(body.decode(&mut buf).unwrap().unwrap().as_bytes().unwrap().as_ref(), b"hi");
//! assert_eq!(body.decode(&mut buf).unwrap(), Some(PayloadItem::Eof));
//! ```

mod body;
mod header;

pub use body::{BodyDecoder, ChunkedDecoder, ChunkedEncoder};
pub use header::{HeadDecoder, HeadEncoder, MessageHead};
