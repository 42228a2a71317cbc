//! Typed, ordered webhook headers and the header resolver.
//!
//! Header documents arrive as flat string-keyed JSON objects whose values may
//! be of any kind. Only string values survive conversion into
//! `WebhookHeaders`; everything else is dropped without error. Iteration
//! order is the order in which keys appeared in the source document.
//!
//! Header values are credentials more often than not. `WebhookHeaders`
//! therefore never prints its values: `Debug` and `Display` render the
//! placeholder [`HEADERS_PLACEHOLDER`], and [`WebhookHeaders::redact`]
//! scrubs values out of foreign text such as HTTP client errors.

use std::fmt;

use serde::{
    de::{MapAccess, SeqAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use serde_json::Value;

/// Symbol rendered in place of a header mapping in any user-visible text.
pub const HEADERS_PLACEHOLDER: &str = "webhook_headers";

/// Content type sent with every webhook request unless overridden.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

const CONTENT_TYPE: &str = "Content-Type";
const REDACTED: &str = "***";
const MIN_EMBEDDED_REDACT_LEN: usize = 4;

/// Ordered string-to-string header mapping.
///
/// Keys are case-sensitive for storage and lookup. Inserting an existing key
/// replaces its value in place, keeping the original position.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct WebhookHeaders {
    entries: Vec<(String, String)>,
}

impl WebhookHeaders {
    /// Creates an empty header mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, returning the previous value if the key existed.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let name = name.into();
        let value = value.into();

        if let Some(entry) = self.entries.iter_mut().find(|(key, _)| *key == name) {
            return Some(std::mem::replace(&mut entry.1, value));
        }

        self.entries.push((name, value));
        None
    }

    /// Returns the value stored under `name`, matching case-sensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }

    /// Number of caller-supplied headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no headers were supplied.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Header names in insertion order. Safe to log.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(key, _)| key.as_str()).collect()
    }

    /// Parses headers from JSON text, keeping source key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid JSON or not an object.
    pub fn from_json_str(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Headers as they go on the wire.
    ///
    /// `Content-Type: application/json` comes first. A caller-supplied
    /// content type (matched case-insensitively) replaces the default at that
    /// position instead of being sent twice.
    pub fn resolved(&self) -> Vec<(String, String)> {
        let mut resolved = Vec::with_capacity(self.entries.len() + 1);

        match self.entries.iter().find(|(key, _)| is_content_type(key)) {
            Some((key, value)) => resolved.push((key.clone(), value.clone())),
            None => resolved.push((CONTENT_TYPE.to_string(), DEFAULT_CONTENT_TYPE.to_string())),
        }

        resolved.extend(self.entries.iter().filter(|(key, _)| !is_content_type(key)).cloned());
        resolved
    }

    /// Wire-format header lines, `"Key: Value"`, in send order.
    pub fn header_lines(&self) -> Vec<String> {
        self.resolved().into_iter().map(|(key, value)| format!("{key}: {value}")).collect()
    }

    /// Removes every header value from `text`.
    ///
    /// Longer values are scrubbed first so that a value containing another
    /// value is removed whole. Values shorter than four characters are only
    /// scrubbed where they stand alone, not inside longer words.
    pub fn redact(&self, text: &str) -> String {
        let mut values: Vec<&str> =
            self.entries.iter().map(|(_, value)| value.as_str()).filter(|v| !v.is_empty()).collect();
        values.sort_by_key(|value| std::cmp::Reverse(value.len()));

        values.into_iter().fold(text.to_string(), |acc, value| {
            if value.chars().count() < MIN_EMBEDDED_REDACT_LEN {
                replace_standalone(&acc, value)
            } else {
                acc.replace(value, REDACTED)
            }
        })
    }
}

/// Replaces occurrences of `value` not adjacent to an alphanumeric character.
fn replace_standalone(text: &str, value: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;

    for (start, _) in text.match_indices(value) {
        let end = start + value.len();
        let before = text[..start].chars().next_back();
        let after = text[end..].chars().next();
        if before.is_some_and(char::is_alphanumeric) || after.is_some_and(char::is_alphanumeric) {
            continue;
        }
        out.push_str(&text[copied..start]);
        out.push_str(REDACTED);
        copied = end;
    }

    out.push_str(&text[copied..]);
    out
}

fn is_content_type(name: &str) -> bool {
    name.eq_ignore_ascii_case(CONTENT_TYPE)
}

impl fmt::Debug for WebhookHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{HEADERS_PLACEHOLDER}{:?}", self.names())
    }
}

impl fmt::Display for WebhookHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(HEADERS_PLACEHOLDER)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for WebhookHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (key, value) in iter {
            headers.insert(key, value);
        }
        headers
    }
}

impl Serialize for WebhookHeaders {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for WebhookHeaders {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(HeadersVisitor)
    }
}

struct HeadersVisitor;

impl<'de> Visitor<'de> for HeadersVisitor {
    type Value = WebhookHeaders;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a flat object of header names to values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut headers = WebhookHeaders::new();
        while let Some((key, value)) = access.next_entry::<String, Value>()? {
            if let Value::String(value) = value {
                headers.insert(key, value);
            }
        }
        Ok(headers)
    }

    fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
        Ok(WebhookHeaders::new())
    }

    fn visit_none<E: serde::de::Error>(self) -> Result<Self::Value, E> {
        Ok(WebhookHeaders::new())
    }

    // Scalars get a fixed message: serde's default names the offending
    // value, which may be a credential.
    fn visit_str<E: serde::de::Error>(self, _value: &str) -> Result<Self::Value, E> {
        Err(not_a_table())
    }

    fn visit_bytes<E: serde::de::Error>(self, _value: &[u8]) -> Result<Self::Value, E> {
        Err(not_a_table())
    }

    fn visit_bool<E: serde::de::Error>(self, _value: bool) -> Result<Self::Value, E> {
        Err(not_a_table())
    }

    fn visit_i64<E: serde::de::Error>(self, _value: i64) -> Result<Self::Value, E> {
        Err(not_a_table())
    }

    fn visit_u64<E: serde::de::Error>(self, _value: u64) -> Result<Self::Value, E> {
        Err(not_a_table())
    }

    fn visit_f64<E: serde::de::Error>(self, _value: f64) -> Result<Self::Value, E> {
        Err(not_a_table())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, _access: A) -> Result<Self::Value, A::Error> {
        Err(not_a_table())
    }
}

fn not_a_table<E: serde::de::Error>() -> E {
    E::custom(format!("{HEADERS_PLACEHOLDER} must be a table of header names to values"))
}
