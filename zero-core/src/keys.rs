//! Canonical row identities.
//!
//! A row is identified by `(schema, table, key columns)`. The key columns
//! are normalised into a canonical JSON string so that the same upstream
//! row always maps to the same identity, regardless of the column order a
//! producer happened to use. That string is what the CVR `rows` table and
//! the row-record cache key on.

use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The key-column values of a row, sorted by column name.
#[derive(Debug, Clone)]
pub struct RowKey {
    entries: Vec<(String, Value)>,
    canonical: String,
}

impl RowKey {
    pub fn new(mut entries: Vec<(String, Value)>) -> Self {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical = serde_json::to_string(&entries).expect("key values are plain JSON");
        RowKey { entries, canonical }
    }

    pub fn entries(&self) -> &[(String, Value)] {
        &self.entries
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(c, _)| c.as_str())
    }

    /// The canonical string form. Equality, ordering and hashing all
    /// operate on this.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl PartialEq for RowKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for RowKey {}

impl PartialOrd for RowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl Hash for RowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl Serialize for RowKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.entries, serializer)
    }
}

impl<'de> Deserialize<'de> for RowKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<(String, Value)>::deserialize(deserializer)?;
        Ok(RowKey::new(entries))
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Fully qualified row identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId {
    pub schema: String,
    pub table: String,
    #[serde(rename = "rowKey")]
    pub key: RowKey,
}

impl RowId {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, key: RowKey) -> Self {
        RowId { schema: schema.into(), table: table.into(), key }
    }

    /// Deterministic string used as a cache key. JSON-escaped so that
    /// unusual schema or table names cannot collide.
    pub fn fingerprint(&self) -> String {
        let mut s =
            serde_json::to_string(&[&self.schema, &self.table]).expect("strings serialize");
        s.push_str(self.key.canonical());
        s
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.schema, self.table, self.key)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn key(entries: Vec<(&str, Value)>) -> RowKey {
        RowKey::new(
            entries
                .into_iter()
                .map(|(c, v)| (c.to_string(), v))
                .collect(),
        )
    }

    #[test]
    fn column_order_is_normalised() {
        let a = key(vec![("id2", json!(2)), ("id1", json!(1))]);
        let b = key(vec![("id1", json!(1)), ("id2", json!(2))]);
        assert_eq!(a, b);
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.columns().collect::<Vec<_>>(), vec!["id1", "id2"]);
    }

    #[test]
    fn value_changes_change_identity() {
        let a = key(vec![("id", json!(1))]);
        let b = key(vec![("id", json!("1"))]);
        let c = key(vec![("id", json!(1))]);
        assert_ne!(a, b, "1 and \"1\" are different keys");
        assert_eq!(a, c);
    }

    #[test]
    fn fingerprint_escapes_separators() {
        let plain = RowId::new("my", "boo.x", key(vec![("a", json!(1))]));
        let tricky = RowId::new("my.boo", "x", key(vec![("a", json!(1))]));
        assert_ne!(plain.fingerprint(), tricky.fingerprint());
    }

    #[test]
    fn serde_roundtrip() {
        let id = RowId::new("public", "foo", key(vec![("id1", json!(7)), ("id2", json!("x"))]));
        let encoded = serde_json::to_string(&id).unwrap();
        let decoded: RowId = serde_json::from_str(&encoded).unwrap();
        assert_eq!(id, decoded);
    }
}
