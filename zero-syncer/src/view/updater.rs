//! CVR updaters.
//!
//! Two variants over a shared outcome shape:
//!
//! * [`ConfigUpdater`] — client and desired-query changes; bumps only the
//!   minor version, and only when something actually changed.
//! * [`QueryUpdater`] — the version-ready path; merges received rows into
//!   ref counts, tombstones rows that lose their last reference, marks
//!   queries gotten, and advances the state version.
//!
//! Updaters never touch the database themselves: they produce a
//! [`CvrFlush`] plus the poke payload, and the view-syncer decides when
//! to persist and emit.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::debug;
use zero_core::{
    keys::RowId,
    protocol::{
        ClientId, DesiredQueriesPatchOp, QueriesPatchOp, QueryHash, RowPatchOp,
    },
    version::{CvrVersion, StateVersion},
};
use zero_storage::cvr::{
    normalize_ttl, rows_cache::RowRecordCache, store::CvrFlush, ClientRecord, Cvr, DesireRecord,
    QueryRecord, RowRecord,
};

use super::{
    keys::KeyColumns,
    pipeline::{PipelineChange, RowOp},
    pokes::PokePartData,
};

/// What an updater wants persisted and broadcast.
pub struct UpdateOutcome {
    /// Version the CVR was at before this update.
    pub expected_version: CvrVersion,
    /// Version the CVR is at after this update.
    pub version: CvrVersion,
    pub flush: CvrFlush,
    pub parts: PokePartData,
    /// False when the update turned out to be a no-op; the version was
    /// not bumped and nothing needs flushing.
    pub changed: bool,
}

// ---------------------------------------------------------------------
// Config-driven updates
// ---------------------------------------------------------------------

pub struct ConfigUpdater<'a> {
    cvr: &'a mut Cvr,
    expected_version: CvrVersion,
    version: CvrVersion,
    flush: CvrFlush,
    parts: PokePartData,
    changed: bool,
}

impl<'a> ConfigUpdater<'a> {
    pub fn new(cvr: &'a mut Cvr) -> Self {
        let expected_version = cvr.version.clone();
        let version = cvr.version.next_minor();
        ConfigUpdater {
            cvr,
            expected_version,
            version,
            flush: CvrFlush::default(),
            parts: PokePartData::default(),
            changed: false,
        }
    }

    pub fn ensure_client(&mut self, client_id: &ClientId) {
        if self.cvr.clients.contains_key(client_id) {
            return;
        }
        let record = ClientRecord {
            client_id: client_id.clone(),
            patch_version: self.version.clone(),
            last_mutation_id: 0,
        };
        self.cvr
            .clients
            .insert(client_id.clone(), record.clone());
        self.flush
            .client_puts
            .insert(client_id.clone(), record);
        self.changed = true;
    }

    pub fn set_client_schema(&mut self, schema: serde_json::Value) {
        if self.cvr.client_schema.as_ref() == Some(&schema) {
            return;
        }
        self.cvr.client_schema = Some(schema.clone());
        self.flush.client_schema = Some(schema);
        self.changed = true;
    }

    /// Applies one client's desired-queries patch.
    pub fn apply_desired_patch(&mut self, client_id: &ClientId, ops: &[DesiredQueriesPatchOp]) {
        for op in ops {
            match op {
                DesiredQueriesPatchOp::Put { hash, query, ttl_ms } => {
                    self.put_desire(client_id, hash, query.clone(), normalize_ttl(*ttl_ms));
                }
                DesiredQueriesPatchOp::Del { hash } => {
                    self.del_desire(client_id, hash);
                }
            }
        }
    }

    fn put_desire(
        &mut self,
        client_id: &ClientId,
        hash: &QueryHash,
        query: zero_core::protocol::QuerySpec,
        ttl_ms: Option<f64>,
    ) {
        match self.cvr.queries.get_mut(hash) {
            None => {
                let record = QueryRecord::new(hash.clone(), query);
                self.cvr
                    .queries
                    .insert(hash.clone(), record.clone());
                self.flush.query_puts.insert(hash.clone(), record);
                self.changed = true;
            }
            Some(existing) if existing.deleted => {
                existing.deleted = false;
                let record = existing.clone();
                self.flush.query_puts.insert(hash.clone(), record);
                self.changed = true;
            }
            Some(_) => {}
        }

        let key = (client_id.clone(), hash.clone());
        let needs_write = match self.cvr.desires.get(&key) {
            Some(d) => d.deleted || d.inactivated_at_ms.is_some() || d.ttl_ms != ttl_ms,
            None => true,
        };
        if needs_write {
            let record = DesireRecord {
                client_id: client_id.clone(),
                query_hash: hash.clone(),
                patch_version: self.version.clone(),
                deleted: false,
                ttl_ms,
                inactivated_at_ms: None,
                retry_error_version: None,
            };
            self.cvr.desires.insert(key.clone(), record.clone());
            self.flush.desire_puts.insert(key, record);
            self.parts
                .desired_queries_patches
                .entry(client_id.clone())
                .or_default()
                .push(QueriesPatchOp::Put { hash: hash.clone() });
            self.changed = true;
        }
    }

    fn del_desire(&mut self, client_id: &ClientId, hash: &QueryHash) {
        let key = (client_id.clone(), hash.clone());
        let ttl_clock = self.cvr.ttl_clock;
        let Some(desire) = self.cvr.desires.get_mut(&key) else { return };
        if desire.deleted {
            return;
        }
        if desire.ttl_ms.is_some() {
            // Soft inactivation: the query stays gotten until the TTL
            // expires against the group's ttlClock.
            desire.inactivated_at_ms = Some(ttl_clock);
        } else {
            desire.deleted = true;
        }
        desire.patch_version = self.version.clone();
        let record = desire.clone();
        self.flush.desire_puts.insert(key, record);
        self.parts
            .desired_queries_patches
            .entry(client_id.clone())
            .or_default()
            .push(QueriesPatchOp::Del { hash: hash.clone() });
        self.changed = true;
    }

    /// Removes clients and their desires. Returns the ids that actually
    /// existed.
    pub fn delete_clients(&mut self, client_ids: &[ClientId]) -> Vec<ClientId> {
        let mut deleted = Vec::new();
        for client_id in client_ids {
            if self.cvr.clients.remove(client_id).is_none() {
                continue;
            }
            deleted.push(client_id.clone());
            self.flush.client_puts.remove(client_id);
            self.flush
                .client_deletes
                .insert(client_id.clone());
            let hashes: Vec<QueryHash> = self
                .cvr
                .desires
                .keys()
                .filter(|(c, _)| c == client_id)
                .map(|(_, h)| h.clone())
                .collect();
            for hash in hashes {
                self.cvr
                    .desires
                    .remove(&(client_id.clone(), hash));
            }
            self.changed = true;
        }
        deleted
    }

    pub fn advance_last_mutation_id(&mut self, client_id: &ClientId, last_mutation_id: u64) {
        let Some(client) = self.cvr.clients.get_mut(client_id) else { return };
        if last_mutation_id <= client.last_mutation_id {
            return;
        }
        client.last_mutation_id = last_mutation_id;
        self.flush
            .client_puts
            .insert(client_id.clone(), client.clone());
        self.parts
            .last_mutation_id_changes
            .insert(client_id.clone(), last_mutation_id);
        self.changed = true;
    }

    /// Advances the ttlClock by an observed wall-clock delta.
    pub fn tick_ttl_clock(&mut self, delta_ms: f64) {
        if delta_ms <= 0.0 {
            return;
        }
        self.cvr.ttl_clock += delta_ms;
        self.changed = true;
    }

    pub fn finish(self) -> UpdateOutcome {
        let version = if self.changed {
            self.cvr.version = self.version.clone();
            self.version
        } else {
            self.expected_version.clone()
        };
        let mut flush = self.flush;
        flush.last_active = Some(Utc::now());
        flush.ttl_clock = Some(self.cvr.ttl_clock);
        UpdateOutcome {
            expected_version: self.expected_version,
            version,
            flush,
            parts: self.parts,
            changed: self.changed,
        }
    }
}

// ---------------------------------------------------------------------
// Query-driven updates
// ---------------------------------------------------------------------

pub struct QueryUpdater<'a> {
    cvr: &'a mut Cvr,
    cache: &'a mut RowRecordCache,
    keys: KeyColumns,
    expected_version: CvrVersion,
    version: CvrVersion,
    flush: CvrFlush,
    parts: PokePartData,
}

impl<'a> QueryUpdater<'a> {
    pub fn new(cvr: &'a mut Cvr, cache: &'a mut RowRecordCache, state: StateVersion) -> Self {
        let expected_version = cvr.version.clone();
        let version = cvr.version.advanced_to(state);
        let keys = KeyColumns::new(std::iter::empty());
        QueryUpdater { cvr, cache, keys, expected_version, version, flush: CvrFlush::default(), parts: PokePartData::default() }
    }

    pub fn with_key_columns(mut self, keys: KeyColumns) -> Self {
        self.keys = keys;
        self
    }

    pub fn version(&self) -> &CvrVersion {
        &self.version
    }

    /// The stored definition of a query, for hydration.
    pub fn query_spec(&self, hash: &QueryHash) -> Option<zero_core::protocol::QuerySpec> {
        self.cvr
            .queries
            .get(hash)
            .map(|q| q.spec.clone())
    }

    /// Merges one pipeline change into the row records.
    pub fn received(&mut self, change: &PipelineChange) {
        let id = RowId::new(
            change.table.schema.clone(),
            change.table.table.clone(),
            change.row_key.clone(),
        );

        // A row arriving under new key columns cancels its old identity.
        if let (Some(row), RowOp::Add | RowOp::Edit) = (&change.row, change.op) {
            if let Some(old_id) = self.keys.old_id(&id, row) {
                self.tombstone(&old_id);
                self.keys.force_updates(&old_id, &id);
            }
        }

        let delta = match change.op {
            RowOp::Add => 1,
            RowOp::Edit => 0,
            RowOp::Remove => -1,
        };

        let existing = self.cache.get(&id).cloned();
        let mut counts: BTreeMap<QueryHash, i32> = existing
            .as_ref()
            .and_then(|r| r.ref_counts.clone())
            .unwrap_or_default();
        if delta != 0 {
            let count = counts.entry(change.query_hash.clone()).or_insert(0);
            *count += delta;
            if *count <= 0 {
                counts.remove(&change.query_hash);
            }
        }

        if counts.is_empty() && delta <= 0 {
            if existing.as_ref().is_some_and(RowRecord::is_tombstone) {
                return; // already tombstoned
            }
            self.tombstone(&id);
            return;
        }

        let row_version = change
            .row
            .as_ref()
            .and_then(|r| r.get("_0_version"))
            .and_then(|v| v.as_str())
            .and_then(|v| StateVersion::parse(v).ok())
            // Ref-count-only changes keep the stored row version.
            .or_else(|| existing.as_ref().map(|r| r.row_version.clone()))
            .unwrap_or_else(|| self.version.state_version.clone());

        let unchanged = existing.as_ref().is_some_and(|r| {
            r.row_version == row_version && r.ref_counts.as_ref() == Some(&counts)
        });
        if unchanged && !self.keys.is_forced(&id) {
            debug!(row = %id, "elided no-op row update");
            return;
        }

        let record = RowRecord {
            id: id.clone(),
            row_version,
            patch_version: self.version.clone(),
            ref_counts: Some(counts),
        };
        self.cache.put(record);
        if let Some(row) = &change.row {
            self.parts
                .rows_patch
                .push(RowPatchOp::Put { id, value: row.clone() });
        }
    }

    fn tombstone(&mut self, id: &RowId) {
        let row_version = self
            .cache
            .get(id)
            .map(|r| r.row_version.clone())
            .unwrap_or_else(|| self.version.state_version.clone());
        self.cache.put(RowRecord {
            id: id.clone(),
            row_version,
            patch_version: self.version.clone(),
            ref_counts: None,
        });
        self.parts
            .rows_patch
            .push(RowPatchOp::Del { id: id.clone() });
    }

    /// Marks a freshly hydrated query as gotten.
    pub fn mark_gotten(
        &mut self,
        hash: &QueryHash,
        transformation_hash: String,
        transformation_version: StateVersion,
    ) {
        let Some(query) = self.cvr.queries.get_mut(hash) else { return };
        query.patch_version = Some(self.version.clone());
        query.transformation_hash = Some(transformation_hash);
        query.transformation_version = Some(transformation_version);
        query.error_message = None;
        query.error_version = None;
        self.flush
            .query_puts
            .insert(hash.clone(), query.clone());
        self.parts
            .got_queries_patch
            .push(QueriesPatchOp::Put { hash: hash.clone() });
    }

    /// Removes a no-longer-desired query: decrements every row that
    /// references it, emitting `del` patches where the last reference
    /// drops, and soft-deletes the query record.
    pub fn mark_removed(&mut self, hash: &QueryHash) {
        for id in self.cache.rows_referencing(hash) {
            let Some(existing) = self.cache.get(&id).cloned() else { continue };
            let mut counts = existing.ref_counts.clone().unwrap_or_default();
            counts.remove(hash);
            if counts.is_empty() {
                self.tombstone(&id);
            } else {
                self.cache.put(RowRecord {
                    id,
                    row_version: existing.row_version,
                    patch_version: self.version.clone(),
                    ref_counts: Some(counts),
                });
            }
        }

        if let Some(query) = self.cvr.queries.get_mut(hash) {
            query.deleted = true;
            query.patch_version = Some(self.version.clone());
            self.flush
                .query_puts
                .insert(hash.clone(), query.clone());
        }
        self.parts
            .got_queries_patch
            .push(QueriesPatchOp::Del { hash: hash.clone() });
    }

    /// Records a hydration failure on the query so clients can observe
    /// and retry it.
    pub fn record_query_error(&mut self, hash: &QueryHash, message: String) {
        let Some(query) = self.cvr.queries.get_mut(hash) else { return };
        query.error_message = Some(message);
        query.error_version = Some(self.version.clone());
        self.flush
            .query_puts
            .insert(hash.clone(), query.clone());
    }

    pub fn finish(self) -> UpdateOutcome {
        self.cvr.version = self.version.clone();
        let mut flush = self.flush;
        flush.last_active = Some(Utc::now());
        flush.ttl_clock = Some(self.cvr.ttl_clock);
        UpdateOutcome {
            expected_version: self.expected_version,
            version: self.version,
            flush,
            parts: self.parts,
            changed: true,
        }
    }
}
