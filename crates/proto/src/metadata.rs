use serde::{Deserialize, Serialize};

/// Metadata key carrying the caller identity attached to every stream.
pub const IDENTITY_KEY: &str = "gid";

/// Outgoing stream metadata: an ordered list of key/value pairs.
///
/// Keys may repeat; joining two sets keeps every pair in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata(Vec<(String, String)>);

impl Metadata {
    /// Creates an empty metadata set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds metadata from key/value pairs.
    pub fn pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Metadata holding only the identity pair.
    pub fn identity(value: impl Into<String>) -> Self {
        Self::pairs([(IDENTITY_KEY, value.into())])
    }

    /// Appends one pair.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    /// Appends every pair of `other` after the pairs of `self`.
    pub fn join(mut self, other: Metadata) -> Self {
        self.0.extend(other.0);
        self
    }

    /// All values stored under `key`, in insertion order.
    pub fn get(&self, key: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// First value stored under `key`.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterates over pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_keeps_caller_pairs_before_identity() {
        let caller = Metadata::pairs([("region", "eu"), ("gid", "custom")]);
        let merged = caller.join(Metadata::identity("1"));

        assert_eq!(merged.len(), 3);
        assert_eq!(merged.get("gid"), vec!["custom", "1"]);
        assert_eq!(merged.first("region"), Some("eu"));
    }

    #[test]
    fn empty_metadata_join_yields_identity_only() {
        let merged = Metadata::new().join(Metadata::identity("7"));
        assert_eq!(merged.iter().collect::<Vec<_>>(), vec![("gid", "7")]);
    }

    #[test]
    fn first_returns_none_for_missing_key() {
        let mut md = Metadata::new();
        assert!(md.is_empty());
        md.insert("a", "b");
        assert_eq!(md.first("missing"), None);
        assert!(md.get("missing").is_empty());
    }
}
