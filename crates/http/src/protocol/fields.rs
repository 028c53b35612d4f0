//! Header fields kept exactly as they appeared on the wire.
//!
//! `http::HeaderMap` normalises names to lowercase and groups repeated names,
//! which loses the original field order. A tunnel that rewrites a response head
//! must reproduce everything it does not touch byte for byte, so heads keep an
//! ordered list of raw `(name, value)` pairs instead and only offer
//! case-insensitive lookups on top of it.

use bytes::Bytes;
use std::fmt;

/// A single `name: value` header field.
#[derive(Clone, PartialEq, Eq)]
pub struct HeaderField {
    name: Bytes,
    value: Bytes,
}

impl HeaderField {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self { name: name.into(), value: value.into() }
    }

    /// The field name with its original casing.
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Returns the value as `&str` if it is valid UTF-8.
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    /// Case-insensitive name comparison.
    pub fn is(&self, name: impl AsRef<str>) -> bool {
        self.name.eq_ignore_ascii_case(name.as_ref().as_bytes())
    }
}

impl fmt::Debug for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", String::from_utf8_lossy(&self.name), String::from_utf8_lossy(&self.value))
    }
}

/// Ordered list of header fields.
///
/// Lookups accept anything that is `AsRef<str>`, so both `http::header` constants
/// and plain strings work:
///
/// ```
/// use rv_http::protocol::{HeaderField, HeaderFields};
///
/// let mut fields = HeaderFields::new();
/// fields.push(HeaderField::new("Content-Type", "text/css"));
/// assert_eq!(fields.get_str(http::header::CONTENT_TYPE), Some("text/css"));
/// assert_eq!(fields.get_str("content-type"), Some("text/css"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderFields {
    fields: Vec<HeaderField>,
}

impl HeaderFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { fields: Vec::with_capacity(capacity) }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the value of the first field named `name`.
    pub fn get(&self, name: impl AsRef<str>) -> Option<&[u8]> {
        let name = name.as_ref();
        self.fields.iter().find(|field| field.is(name)).map(HeaderField::value)
    }

    /// Like [`get`](Self::get) but only returns values that are valid UTF-8.
    pub fn get_str(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = name.as_ref();
        self.fields.iter().find(|field| field.is(name)).and_then(HeaderField::value_str)
    }

    /// Returns every value of fields named `name`, in wire order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.fields.iter().filter(move |field| field.is(name)).map(HeaderField::value)
    }

    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.get(name).is_some()
    }

    pub fn push(&mut self, field: HeaderField) {
        self.fields.push(field);
    }

    /// Removes every field named `name`, keeping the order of the rest.
    pub fn remove(&mut self, name: impl AsRef<str>) {
        let name = name.as_ref();
        self.fields.retain(|field| !field.is(name));
    }

    pub fn iter(&self) -> std::slice::Iter<'_, HeaderField> {
        self.fields.iter()
    }
}

impl<'a> IntoIterator for &'a HeaderFields {
    type Item = &'a HeaderField;
    type IntoIter = std::slice::Iter<'a, HeaderField>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

impl FromIterator<HeaderField> for HeaderFields {
    fn from_iter<T: IntoIterator<Item = HeaderField>>(iter: T) -> Self {
        Self { fields: iter.into_iter().collect() }
    }
}
