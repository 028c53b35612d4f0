//! Incremental HTTP/1.x message framing for the rv reverse-tunnel client.
//!
//! The tunnel client never terminates HTTP itself: it relays raw bytes between a
//! relay server and a local destination. It still needs to *look* at the traffic
//! in a few places, and this crate provides the pieces for that:
//!
//! - parsing the relay's handshake response (`HTTP/1.1 200 ...` plus `X-RV-Host`)
//! - peeking at the first request head to learn the peer's `Accept-Encoding`
//! - parsing a response head to decide whether its body may be compressed
//! - decoding the original response body framing and re-framing it as chunked
//!
//! All codecs are sans-io and implement the [`tokio_util::codec`] traits, so they
//! work on a [`bytes::BytesMut`] that callers fill from whatever transport they have.
//! Parsing is chunk-boundary agnostic: feed bytes as they arrive and call `decode`
//! again; a complete head is split off the front of the buffer and everything after
//! the blank line stays where it was.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use rv_http::codec::HeadDecoder;
//! use rv_http::protocol::ResponseHead;
//! use tokio_util::codec::Decoder;
//!
//! let mut decoder = HeadDecoder::<ResponseHead>::new();
//! let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nX-RV-Host: http://localhost:9999"[..]);
//! assert!(decoder.decode(&mut buf).unwrap().is_none());
//!
//! buf.extend_from_slice(b"\r\n\r\nGET / HTTP/1.1\r\n");
//! let head = decoder.decode(&mut buf).unwrap().unwrap();
//! assert_eq!(head.status().as_u16(), 200);
//! assert_eq!(head.fields().get_str("x-rv-host"), Some("http://localhost:9999"));
//! assert_eq!(&buf[..], b"GET / HTTP/1.1\r\n");
//! ```
//!
//! # Limits
//!
//! - Maximum number of header fields: 64
//! - Maximum head size: 8KB
//! - HTTP/1.0 and HTTP/1.1 only

pub mod codec;
pub mod protocol;

mod utils;
pub(crate) use utils::ensure;
