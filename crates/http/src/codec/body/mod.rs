//! Message body framing.
//!
//! - [`BodyDecoder`]: removes `Content-Length`, chunked or close-delimited framing
//! - [`ChunkedEncoder`]: frames an outgoing body with chunked transfer encoding

mod body_decoder;
mod chunked_decoder;
mod chunked_encoder;

pub use body_decoder::BodyDecoder;
pub use chunked_decoder::ChunkedDecoder;
pub use chunked_encoder::ChunkedEncoder;
