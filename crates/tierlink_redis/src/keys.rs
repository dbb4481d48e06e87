// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mapping between `(key, region)` pairs and Redis key names.
//!
//! A key without region is stored as `{prefix}{key}`, a key with region as
//! `{prefix}{region}:{key}`. When keyspace notifications are consumed the raw
//! key has to be split again, so segments containing `:` are written as
//! `base64:` followed by their standard base64 encoding.

use base64::{Engine, engine::general_purpose::STANDARD};

use crate::wire::REGION_SENTINEL;

const BASE64_MARKER: &str = "base64:";
const SEPARATOR: char = ':';

/// Builds and parses Redis key names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KeyCodec {
    prefix: String,
    encode_segments: bool,
}

impl KeyCodec {
    pub(crate) fn new(prefix: Option<&str>, encode_segments: bool) -> Self {
        Self {
            prefix: prefix.unwrap_or_default().to_owned(),
            encode_segments,
        }
    }

    /// Returns the Redis key holding the item hash.
    pub(crate) fn full_key(&self, key: &str, region: Option<&str>) -> String {
        match region {
            Some(region) => format!(
                "{}{}{SEPARATOR}{}",
                self.prefix,
                self.segment(region),
                self.segment(key)
            ),
            None => format!("{}{}", self.prefix, self.segment(key)),
        }
    }

    /// Returns the Redis key of the hash listing every member of `region`.
    pub(crate) fn region_key(&self, region: &str) -> String {
        format!("{}{}", self.prefix, self.segment(region))
    }

    /// Picks the item keys listed in a region lookup hash.
    ///
    /// A region hash shares its name with the item hash of a region-less key
    /// equal to the region name. Fields without the sentinel, or outside the
    /// region, belong to such an item and are skipped.
    pub(crate) fn region_members(&self, region: &str, fields: impl IntoIterator<Item = (String, String)>) -> Vec<String> {
        let member_prefix = format!("{}{}{SEPARATOR}", self.prefix, self.segment(region));
        fields
            .into_iter()
            .filter(|(member, marker)| marker == REGION_SENTINEL && member.starts_with(&member_prefix))
            .map(|(member, _)| member)
            .collect()
    }

    /// Returns the `SCAN MATCH` pattern covering every key under the prefix.
    ///
    /// Returns `None` without a prefix, where the whole database belongs to the handle.
    pub(crate) fn scan_pattern(&self) -> Option<String> {
        if self.prefix.is_empty() {
            return None;
        }

        let mut pattern = String::with_capacity(self.prefix.len() + 1);
        for c in self.prefix.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');
        Some(pattern)
    }

    /// Splits a raw key reported by the server into `(key, region)`.
    ///
    /// Returns `None` for keys outside this codec's prefix.
    pub(crate) fn parse_full_key(&self, raw: &str) -> Option<(String, Option<String>)> {
        let rest = raw.strip_prefix(self.prefix.as_str())?;
        if rest.is_empty() {
            return None;
        }

        let (region, key) = split_segments(rest);
        Some((decode_segment(key), region.map(decode_segment)))
    }

    fn segment<'a>(&self, segment: &'a str) -> std::borrow::Cow<'a, str> {
        if self.encode_segments && segment.contains(SEPARATOR) {
            std::borrow::Cow::Owned(format!("{BASE64_MARKER}{}", STANDARD.encode(segment)))
        } else {
            std::borrow::Cow::Borrowed(segment)
        }
    }
}

/// Splits on the first separator that is not part of a `base64:` marker.
fn split_segments(raw: &str) -> (Option<&str>, &str) {
    let search_from = if raw.starts_with(BASE64_MARKER) {
        BASE64_MARKER.len()
    } else {
        0
    };

    match raw[search_from..].find(SEPARATOR) {
        Some(index) => {
            let split = search_from + index;
            (Some(&raw[..split]), &raw[split + 1..])
        }
        None => (None, raw),
    }
}

fn decode_segment(segment: &str) -> String {
    segment
        .strip_prefix(BASE64_MARKER)
        .and_then(|encoded| STANDARD.decode(encoded).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| segment.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_keys() {
        let codec = KeyCodec::new(None, false);
        assert_eq!(codec.full_key("k", None), "k");
        assert_eq!(codec.full_key("k", Some("r")), "r:k");
        assert_eq!(codec.region_key("r"), "r");
    }

    #[test]
    fn prefix_is_prepended() {
        let codec = KeyCodec::new(Some("app/"), false);
        assert_eq!(codec.full_key("k", Some("r")), "app/r:k");
        assert_eq!(codec.parse_full_key("app/r:k"), Some(("k".into(), Some("r".into()))));
        assert_eq!(codec.parse_full_key("other/r:k"), None);
    }

    #[test]
    fn colons_are_encoded_when_enabled() {
        let codec = KeyCodec::new(None, true);
        let full = codec.full_key("a:b", Some("x:y"));
        assert_eq!(full, format!("base64:{}:base64:{}", STANDARD.encode("x:y"), STANDARD.encode("a:b")));
        assert_eq!(codec.parse_full_key(&full), Some(("a:b".into(), Some("x:y".into()))));
    }

    #[test]
    fn colons_are_kept_when_disabled() {
        let codec = KeyCodec::new(None, false);
        assert_eq!(codec.full_key("a:b", None), "a:b");
    }

    #[test]
    fn region_members_skip_item_fields() {
        let codec = KeyCodec::new(Some("app/"), false);
        let fields = [
            ("app/users:alice".to_owned(), REGION_SENTINEL.to_owned()),
            ("value".to_owned(), "\"admin\"".to_owned()),
            ("type".to_owned(), "alloc::string::String".to_owned()),
            ("app/other:bob".to_owned(), REGION_SENTINEL.to_owned()),
        ];

        assert_eq!(codec.region_members("users", fields), ["app/users:alice"]);
        assert_eq!(codec.region_key("users"), codec.full_key("users", None));
    }

    #[test]
    fn scan_pattern_escapes_globs() {
        assert_eq!(KeyCodec::new(None, false).scan_pattern(), None);
        assert_eq!(KeyCodec::new(Some("app/"), false).scan_pattern().as_deref(), Some("app/*"));
        assert_eq!(KeyCodec::new(Some("a*[b]"), false).scan_pattern().as_deref(), Some(r"a\*\[b\]*"));
    }

    #[test]
    fn parse_without_region() {
        let codec = KeyCodec::new(None, true);
        assert_eq!(codec.parse_full_key("plain"), Some(("plain".into(), None)));
        let encoded = codec.full_key("a:b", None);
        assert_eq!(codec.parse_full_key(&encoded), Some(("a:b".into(), None)));
    }
}
