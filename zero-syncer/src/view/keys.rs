//! Row-identity change tracking.
//!
//! A table's key columns can change while a CVR still holds row records
//! under the old identity (replica-identity changes, key-column swaps).
//! When an incoming row arrives keyed differently than the stored record
//! for the same content row, the old record must receive a `del` patch —
//! and the new put must not be elided as a no-op even though the row
//! content is unchanged.

use std::collections::{HashMap, HashSet};

use zero_core::{
    change::{Row, TableId},
    keys::{RowId, RowKey},
};
use zero_storage::cvr::RowRecord;

pub struct KeyColumns {
    /// Key column names per table, as recorded in existing row records.
    stored: HashMap<TableId, Vec<String>>,
    /// Row ids whose put patches must not be elided.
    forced: HashSet<RowId>,
}

impl KeyColumns {
    /// Derives stored key columns from the CVR's current row records.
    pub fn new<'a>(records: impl Iterator<Item = &'a RowRecord>) -> Self {
        let mut stored: HashMap<TableId, Vec<String>> = HashMap::new();
        for record in records {
            stored
                .entry(TableId::new(&record.id.schema, &record.id.table))
                .or_insert_with(|| {
                    record
                        .id
                        .key
                        .columns()
                        .map(str::to_string)
                        .collect()
                });
        }
        KeyColumns { stored, forced: HashSet::new() }
    }

    /// If `incoming`'s key columns differ from what the CVR stored for
    /// this table, returns the row's identity under the old columns so
    /// the caller can cancel the stale record. The full row must carry
    /// the old key columns for this to resolve.
    pub fn old_id(&self, incoming: &RowId, full_row: &Row) -> Option<RowId> {
        let table = TableId::new(&incoming.schema, &incoming.table);
        let stored_columns = self.stored.get(&table)?;
        let incoming_columns: Vec<&str> = incoming.key.columns().collect();
        if stored_columns
            .iter()
            .map(String::as_str)
            .eq(incoming_columns.iter().copied())
        {
            return None;
        }
        let entries: Vec<(String, serde_json::Value)> = stored_columns
            .iter()
            .filter_map(|c| full_row.get(c).map(|v| (c.clone(), v.clone())))
            .collect();
        if entries.len() != stored_columns.len() {
            return None;
        }
        Some(RowId::new(
            incoming.schema.clone(),
            incoming.table.clone(),
            RowKey::new(entries),
        ))
    }

    /// Marks both sides of an identity move so that the replacement put
    /// bypasses no-op elision.
    pub fn force_updates(&mut self, old_id: &RowId, new_id: &RowId) {
        self.forced.insert(old_id.clone());
        self.forced.insert(new_id.clone());
    }

    pub fn is_forced(&self, id: &RowId) -> bool {
        self.forced.contains(id)
    }
}
