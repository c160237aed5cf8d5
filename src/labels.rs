//! Label derivation and the label set handed to handlers.
//!
//! Every observed event is normalized into one canonical label tuple over
//! the fixed key set in [`TAGS`], plus any caller-configured default tags.
//! Derivation is a pure function of the decoded event; default tags are
//! merged afterwards and never overwrite a computed key.

use std::collections::BTreeMap;

use crate::event::RequestEvent;

/// The fixed label schema shared by all six instruments.
pub const TAGS: &[&str] = &["controller", "action", "status", "format", "method"];

/// A set of label key/value pairs attached to an instrument update.
///
/// Created fresh per event and treated as immutable once passed to
/// handlers. Keys are held sorted so that rendering is stable regardless of
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSet {
    values: BTreeMap<String, String>,
}

impl LabelSet {
    /// Create an empty label set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a label, replacing any previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Look up a label value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Whether a key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over key/value pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merge `tags` in, keeping any key already present.
    ///
    /// This is the default-tag merge: default-tag keys are added only where
    /// the deriver did not produce the key, so computed labels always win.
    pub fn merge_missing(&mut self, tags: &BTreeMap<String, String>) {
        for (key, value) in tags {
            self.values
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    /// Render as `key="value",...` with keys in sorted order.
    ///
    /// Stable for a given set of labels, so backends can use it as a series
    /// key.
    pub fn render(&self) -> String {
        let pairs: Vec<String> = self
            .values
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect();
        pairs.join(",")
    }
}

/// Derive the canonical label tuple for a decoded event.
///
/// Pure and deterministic: the same event always yields the same label set.
/// `method` is lowercased; `status` renders as its decimal string. Shape
/// errors cannot occur here because [`RequestEvent::decode`] already
/// rejected malformed payloads.
pub fn derive(event: &RequestEvent) -> LabelSet {
    let mut labels = LabelSet::new();
    labels.insert("controller", event.controller.clone());
    labels.insert("action", event.action.clone());
    labels.insert("status", event.status.to_string());
    labels.insert("format", event.format.clone());
    labels.insert("method", event.method.to_lowercase());
    labels
}

/// Parse comma-separated `key=value` pairs into a tag mapping.
///
/// Pairs without a `=` are skipped; keys and values are trimmed.
pub fn parse_tags(s: &str) -> BTreeMap<String, String> {
    s.split(',')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            match (parts.next(), parts.next()) {
                (Some(k), Some(v)) if !k.trim().is_empty() => {
                    Some((k.trim().to_string(), v.trim().to_string()))
                }
                _ => None,
            }
        })
        .collect()
}
