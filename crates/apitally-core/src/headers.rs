//! Header canonicalization and content classification

use http::{HeaderMap, HeaderValue};

/// Content types whose bodies are captured and masked.
///
/// Matched as case-sensitive prefixes so parameters such as
/// `; charset=utf-8` are accepted.
pub const SUPPORTED_CONTENT_TYPES: &[&str] = &[
    "application/json",
    "application/ld+json",
    "application/problem+json",
    "application/vnd.api+json",
    "application/x-ndjson",
    "text/plain",
    "text/html",
];

/// Normalize header pairs to lower-cased names, keeping order and duplicates.
///
/// Absent input yields an empty list.
pub fn convert_headers<I, K, V>(headers: Option<I>) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    match headers {
        Some(headers) => headers
            .into_iter()
            .map(|(name, value)| (name.as_ref().to_lowercase(), value.into()))
            .collect(),
        None => Vec::new(),
    }
}

/// Convert an [`HeaderMap`] into canonical pairs.
///
/// Values that are not valid UTF-8 are decoded lossily.
pub fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    convert_headers(Some(headers.iter().map(|(name, value)| {
        (
            name.as_str(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
    })))
}

/// Look up the first value of a header in a canonical pair list.
pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// A raw `Content-Length` value as it may arrive from a framework.
pub trait ContentLength {
    /// Interpret the value as a byte count, `None` if it is not one.
    fn to_length(&self) -> Option<u64>;
}

impl ContentLength for str {
    fn to_length(&self) -> Option<u64> {
        self.trim().parse().ok()
    }
}

impl ContentLength for String {
    fn to_length(&self) -> Option<u64> {
        self.as_str().to_length()
    }
}

impl ContentLength for [u8] {
    fn to_length(&self) -> Option<u64> {
        std::str::from_utf8(self).ok()?.to_length()
    }
}

impl ContentLength for HeaderValue {
    fn to_length(&self) -> Option<u64> {
        self.as_bytes().to_length()
    }
}

impl ContentLength for u64 {
    fn to_length(&self) -> Option<u64> {
        Some(*self)
    }
}

impl ContentLength for usize {
    fn to_length(&self) -> Option<u64> {
        u64::try_from(*self).ok()
    }
}

impl<T: ContentLength + ?Sized> ContentLength for &T {
    fn to_length(&self) -> Option<u64> {
        (**self).to_length()
    }
}

/// Parse a content length, returning `None` on absence or parse failure.
pub fn parse_content_length<T: ContentLength>(value: Option<T>) -> Option<u64> {
    value.and_then(|value| value.to_length())
}

/// Whether bodies of this content type are captured at all.
pub fn is_supported_content_type(content_type: Option<&str>) -> bool {
    match content_type {
        Some(content_type) if !content_type.is_empty() => SUPPORTED_CONTENT_TYPES
            .iter()
            .any(|supported| content_type.starts_with(supported)),
        _ => false,
    }
}
