//! Message head parsing and encoding.
//!
//! - [`HeadDecoder`]: parses request or response heads from raw bytes
//! - [`HeadEncoder`]: writes a response head back to raw bytes

mod header_decoder;
mod header_encoder;

pub(crate) use header_encoder::FastWrite;
pub use header_decoder::HeadDecoder;
pub use header_decoder::MessageHead;
pub use header_encoder::HeadEncoder;
