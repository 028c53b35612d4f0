//! Protocol types shared by the codecs.
//!
//! - [`RequestHead`] / [`ResponseHead`]: parsed message heads
//! - [`HeaderFields`] / [`HeaderField`]: header fields in wire order
//! - [`PayloadItem`] / [`PayloadSize`]: body stream items and body delimiting
//! - [`ParseError`]: everything that can go wrong while parsing

mod message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod fields;
pub use fields::HeaderField;
pub use fields::HeaderFields;

mod request;
pub use request::RequestHead;

mod response;
pub use response::ResponseHead;

mod error;
pub use error::ParseError;
