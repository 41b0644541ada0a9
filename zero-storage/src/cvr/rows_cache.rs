//! In-memory shadow of a client group's row records.
//!
//! The view-syncer owns one cache per client group and consults it for
//! every ref-count merge instead of re-reading `cvr.rows`. Writes are
//! staged here and flushed in batches; the flush updates `rowsVersion`
//! and may intentionally run after the instance commit ("allow-defer"),
//! which is why `rowsVersion` can lag `instances.version`.
//!
//! The cache is a derived structure: on any flush failure, or on
//! ownership transfer, it is cleared so the next access rebuilds it from
//! the store.

use std::collections::HashMap;

use tracing::warn;
use zero_core::{keys::RowId, protocol::QueryHash, version::CvrVersion};

use super::{store::CvrPersistence, StoreError, RowRecord};

#[derive(Default)]
pub struct RowRecordCache {
    records: Option<HashMap<RowId, RowRecord>>,
    pending: HashMap<RowId, RowRecord>,
}

impl RowRecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache that is already loaded and empty: the state of a brand
    /// new client group, which has no row records to fetch.
    pub fn loaded_empty() -> Self {
        RowRecordCache { records: Some(HashMap::new()), pending: HashMap::new() }
    }

    /// All current (loaded plus staged) records.
    pub fn records(&self) -> impl Iterator<Item = &RowRecord> {
        self.records
            .iter()
            .flat_map(|records| records.values())
    }

    pub fn is_loaded(&self) -> bool {
        self.records.is_some()
    }

    /// Ensures the cache is populated, fetching from the store on first
    /// use or after a `clear`.
    pub async fn ensure_loaded(
        &mut self,
        store: &dyn CvrPersistence,
        client_group_id: &str,
    ) -> Result<(), StoreError> {
        if self.records.is_none() {
            let records = store.row_records(client_group_id).await?;
            self.records = Some(
                records
                    .into_iter()
                    .map(|r| (r.id.clone(), r))
                    .collect(),
            );
        }
        Ok(())
    }

    pub fn get(&self, id: &RowId) -> Option<&RowRecord> {
        self.records.as_ref()?.get(id)
    }

    /// Row ids whose records hold a positive reference from `hash`.
    pub fn rows_referencing(&self, hash: &QueryHash) -> Vec<RowId> {
        let Some(records) = &self.records else { return Vec::new() };
        records
            .values()
            .filter(|r| {
                r.ref_counts
                    .as_ref()
                    .is_some_and(|counts| counts.get(hash).is_some_and(|n| *n > 0))
            })
            .map(|r| r.id.clone())
            .collect()
    }

    /// Stages a record for flush and applies it to the in-memory view.
    pub fn put(&mut self, record: RowRecord) {
        if let Some(records) = &mut self.records {
            records.insert(record.id.clone(), record.clone());
        }
        self.pending.insert(record.id.clone(), record);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Flushes staged records and advances `rowsVersion` to `version`.
    /// On failure the whole cache is dropped so the next access reloads
    /// a consistent view.
    pub async fn flush(
        &mut self,
        store: &dyn CvrPersistence,
        client_group_id: &str,
        version: &CvrVersion,
    ) -> Result<(), StoreError> {
        let staged: Vec<RowRecord> = self.pending.values().cloned().collect();
        match store
            .flush_rows(client_group_id, &staged, version)
            .await
        {
            Ok(()) => {
                self.pending.clear();
                Ok(())
            }
            Err(err) => {
                warn!(client_group_id, %err, "row flush failed; dropping row cache");
                self.clear();
                Err(err)
            }
        }
    }

    pub fn clear(&mut self) {
        self.records = None;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use zero_core::{
        keys::RowKey,
        version::{CvrVersion, StateVersion},
    };

    use super::*;

    fn record(table: &str, id: i64, hash: &str, count: i32) -> RowRecord {
        RowRecord {
            id: RowId::new(
                "public",
                table,
                RowKey::new(vec![("id".to_string(), json!(id))]),
            ),
            row_version: StateVersion::parse("101").unwrap(),
            patch_version: CvrVersion::parse_cookie("101").unwrap(),
            ref_counts: Some([(hash.to_string(), count)].into_iter().collect()),
        }
    }

    #[test]
    fn tracks_positive_references() {
        let mut cache = RowRecordCache::new();
        cache.records = Some(HashMap::new());
        cache.put(record("foo", 1, "h1", 1));
        cache.put(record("foo", 2, "h2", 1));
        cache.put(record("foo", 3, "h1", 0));

        let mut referencing = cache.rows_referencing(&"h1".to_string());
        referencing.sort();
        assert_eq!(referencing.len(), 1);
        assert_eq!(referencing[0].key.canonical(), r#"[["id",1]]"#);
        assert_eq!(cache.pending_count(), 3);
    }

    #[test]
    fn clear_forgets_everything() {
        let mut cache = RowRecordCache::new();
        cache.records = Some(HashMap::new());
        cache.put(record("foo", 1, "h1", 1));
        cache.clear();
        assert!(!cache.is_loaded());
        assert_eq!(cache.pending_count(), 0);
    }
}
