//! Record metadata carried by a [`Context`].
//!
//! Metadata attached with [`with_metadata`] is sent as headers on every record
//! produced with that context. Once attached it cannot be changed; attach a new
//! map to derive a new context instead.

use std::collections::{BTreeMap, HashMap};

use crate::context::Context;
use crate::record::Header;

/// Ordered string map, keys are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// One header per entry, sorted by key.
    pub fn to_headers(&self) -> Vec<Header> {
        self.0
            .iter()
            .map(|(k, v)| Header::new(k.as_str(), v.as_bytes()))
            .collect()
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Metadata(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<HashMap<String, String>> for Metadata {
    fn from(value: HashMap<String, String>) -> Self {
        Metadata(value.into_iter().collect())
    }
}

impl From<BTreeMap<String, String>> for Metadata {
    fn from(value: BTreeMap<String, String>) -> Self {
        Metadata(value)
    }
}

/// Returns a context derived from `ctx` that carries `metadata`.
pub fn with_metadata(ctx: &Context, metadata: impl Into<Metadata>) -> Context {
    ctx.with_metadata(metadata.into())
}

/// The metadata carried by `ctx`, if any.
pub fn metadata(ctx: &Context) -> Option<&Metadata> {
    ctx.metadata()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_metadata() {
        assert!(metadata(&Context::background()).is_none());
    }

    #[test]
    fn test_attach_and_read_back() {
        let mut map = HashMap::new();
        map.insert("c".to_string(), "d".to_string());
        map.insert("a".to_string(), "b".to_string());

        let ctx = with_metadata(&Context::background(), map);
        let md = metadata(&ctx).expect("metadata should be attached");
        assert_eq!(md.len(), 2);
        assert_eq!(md.get("a"), Some("b"));
        assert_eq!(
            md.to_headers(),
            vec![Header::new("a", "b"), Header::new("c", "d")]
        );
    }

    #[test]
    fn test_reattaching_does_not_touch_parent() {
        let parent = with_metadata(&Context::background(), Metadata::from_iter([("a", "b")]));
        let child = with_metadata(&parent, Metadata::from_iter([("x", "y")]));

        assert_eq!(metadata(&parent).and_then(|m| m.get("x")), None);
        assert_eq!(metadata(&child).and_then(|m| m.get("a")), None);
        assert_eq!(metadata(&child).and_then(|m| m.get("x")), Some("y"));
    }

    #[test]
    fn test_keys_are_unique() {
        let mut md = Metadata::new();
        assert_eq!(md.insert("a", "1"), None);
        assert_eq!(md.insert("a", "2"), Some("1".to_string()));
        assert_eq!(md.iter().collect::<Vec<_>>(), vec![("a", "2")]);
    }
}
