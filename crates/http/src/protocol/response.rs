//! HTTP response head handling.

use http::{StatusCode, Version};

use crate::protocol::{HeaderFields, ParseError, PayloadSize};

/// The status line and header fields of an HTTP/1.x response.
///
/// Unlike [`RequestHead`](crate::protocol::RequestHead) this type is mutable:
/// the transcoder edits its fields and serialises it again with
/// [`HeadEncoder`](crate::codec::HeadEncoder).
#[derive(Debug, Clone)]
pub struct ResponseHead {
    version: Version,
    status: StatusCode,
    reason: String,
    fields: HeaderFields,
}

impl ResponseHead {
    pub fn new(version: Version, status: StatusCode, reason: impl Into<String>, fields: HeaderFields) -> Self {
        Self { version, status, reason: reason.into(), fields }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The reason phrase exactly as received, possibly empty.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn fields(&self) -> &HeaderFields {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut HeaderFields {
        &mut self.fields
    }

    /// Informational, `204 No Content` and `304 Not Modified` responses never
    /// carry a body, whatever their headers say.
    pub fn has_body(&self) -> bool {
        !(self.status.is_informational() || self.status == StatusCode::NO_CONTENT || self.status == StatusCode::NOT_MODIFIED)
    }

    /// Determines how the body of this response is delimited.
    ///
    /// refer: <https://www.rfc-editor.org/rfc/rfc9112#section-6.3>
    ///
    /// - no body by status code: [`PayloadSize::Empty`]
    /// - `Transfer-Encoding` ending with `chunked`: [`PayloadSize::Chunked`],
    ///   which takes precedence over any `Content-Length`
    /// - any other `Transfer-Encoding`: [`PayloadSize::UntilClose`]
    /// - `Content-Length`: [`PayloadSize::Length`]
    /// - nothing: [`PayloadSize::UntilClose`]
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidContentLength`] when `Content-Length` is not a number.
    pub fn payload_size(&self) -> Result<PayloadSize, ParseError> {
        if !self.has_body() {
            return Ok(PayloadSize::Empty);
        }

        if let Some(te_value) = self.fields.get(http::header::TRANSFER_ENCODING) {
            return Ok(if is_chunked(te_value) { PayloadSize::Chunked } else { PayloadSize::UntilClose });
        }

        match self.fields.get(http::header::CONTENT_LENGTH) {
            Some(cl_value) => {
                let cl_str = std::str::from_utf8(cl_value).map_err(|_| ParseError::invalid_content_length("value is not utf-8"))?;
                let length = cl_str
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ParseError::invalid_content_length(format!("value {cl_str} is not u64")))?;
                Ok(PayloadSize::Length(length))
            }
            None => Ok(PayloadSize::UntilClose),
        }
    }
}

/// Checks if `chunked` is the final coding of a `Transfer-Encoding` value.
fn is_chunked(value: &[u8]) -> bool {
    const CHUNKED: &[u8] = b"chunked";
    value.rsplit(|b| *b == b',').next().is_some_and(|last| last.trim_ascii().eq_ignore_ascii_case(CHUNKED))
}
