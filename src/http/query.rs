//! URL percent-decoding and query / form parsing.

use memchr::memchr;
use percent_encoding::percent_decode;
use std::borrow::Cow;
use std::collections::HashMap;

/// Percent-decodes a path or query component as UTF-8.
///
/// Invalid UTF-8 after decoding yields `None`; callers reject the request
/// with `400` rather than guessing an encoding.
pub fn percent_decode_utf8(src: &str) -> Option<String> {
    match percent_decode(src.as_bytes()).decode_utf8() {
        Ok(Cow::Borrowed(s)) => Some(s.to_owned()),
        Ok(Cow::Owned(s)) => Some(s),
        Err(_) => None,
    }
}

/// Decodes one `application/x-www-form-urlencoded` component: `+` becomes a
/// space before percent-decoding.
fn decode_form_component(src: &[u8]) -> Option<String> {
    let mut bytes = Vec::with_capacity(src.len());
    for &b in src {
        bytes.push(if b == b'+' { b' ' } else { b });
    }
    match percent_decode(&bytes).decode_utf8() {
        Ok(decoded) => Some(decoded.into_owned()),
        Err(_) => None,
    }
}

/// Parses a query string (with or without the leading `?`) into a decoded
/// key-value mapping, last write winning for duplicate keys.
///
/// Components that do not decode to UTF-8 are dropped; the rest of the query
/// still parses. Empty segments (`a=1&&b=2`) are skipped.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    let data = query.strip_prefix('?').unwrap_or(query).as_bytes();
    let mut result = HashMap::new();

    let mut start = 0;
    while start < data.len() {
        let end = memchr(b'&', &data[start..])
            .map(|pos| start + pos)
            .unwrap_or(data.len());
        let segment = &data[start..end];
        start = end + 1;

        if segment.is_empty() {
            continue;
        }

        let split = memchr(b'=', segment).unwrap_or(segment.len());
        let key = &segment[..split];
        let value = segment.get(split + 1..).unwrap_or(b"");

        if let (Some(key), Some(value)) = (decode_form_component(key), decode_form_component(value))
        {
            result.insert(key, value);
        }
    }

    result
}

/// Parses an `application/x-www-form-urlencoded` body. Same grammar as a
/// query string, so this is the same function applied to the raw body bytes.
pub fn parse_urlencoded_form(body: &[u8]) -> HashMap<String, String> {
    match std::str::from_utf8(body) {
        Ok(text) => parse_query(text),
        Err(_) => HashMap::new(),
    }
}
