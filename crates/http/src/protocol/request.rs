//! HTTP request head as seen by the tunnel.

use http::{Method, Uri, Version};

use crate::protocol::HeaderFields;

/// The request line and header fields of an HTTP/1.x request.
///
/// The tunnel only inspects request heads (it never rewrites them), so this type
/// is read-only once parsed.
#[derive(Debug, Clone)]
pub struct RequestHead {
    method: Method,
    uri: Uri,
    version: Version,
    fields: HeaderFields,
}

impl RequestHead {
    pub fn new(method: Method, uri: Uri, version: Version, fields: HeaderFields) -> Self {
        Self { method, uri, version, fields }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn fields(&self) -> &HeaderFields {
        &self.fields
    }

    /// Returns true when the connection is about to leave HTTP: the request
    /// carries an `Upgrade` field (e.g. WebSocket) or is a `CONNECT`.
    pub fn is_upgrade(&self) -> bool {
        self.method == Method::CONNECT || self.fields.contains(http::header::UPGRADE)
    }
}
