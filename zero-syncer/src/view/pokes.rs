//! Per-client poke emission.
//!
//! Every client connection owns a [`PokeHandler`] that turns CVR updates
//! into the `pokeStart, pokePart*, pokeEnd` wire sequence. Pokes are
//! strictly serialized per client: a second `start_poke` while one is
//! open is a programming error. A poke whose final cookie does not
//! advance past the client's accepted cookie is suppressed entirely —
//! the client never observes no-op or backward traffic — and a cancelled
//! poke leaves the accepted cookie untouched.

use std::collections::BTreeMap;

use thiserror::Error;
use tokio::sync::mpsc;
use zero_core::{
    protocol::{
        ClientId, Downstream, PokeEnd, PokePart, PokeStart, QueriesPatchOp, RowPatchOp,
        SchemaVersions,
    },
    version::CvrVersion,
};

/// Row patches per pokePart; keeps individual frames bounded.
pub const MAX_ROW_PATCHES_PER_PART: usize = 128;

#[derive(Error, Debug)]
pub enum PokeError {
    #[error("poke already open")]
    AlreadyOpen,
    #[error("no poke open")]
    NotOpen,
    #[error("client disconnected")]
    Disconnected,
}

/// Patch payload accumulated by an updater, broadcast to every client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PokePartData {
    pub last_mutation_id_changes: BTreeMap<ClientId, u64>,
    pub desired_queries_patches: BTreeMap<ClientId, Vec<QueriesPatchOp>>,
    pub got_queries_patch: Vec<QueriesPatchOp>,
    pub rows_patch: Vec<RowPatchOp>,
}

impl PokePartData {
    pub fn is_empty(&self) -> bool {
        self.last_mutation_id_changes.is_empty()
            && self.desired_queries_patches.is_empty()
            && self.got_queries_patch.is_empty()
            && self.rows_patch.is_empty()
    }

    pub fn merge(&mut self, other: PokePartData) {
        self.last_mutation_id_changes
            .extend(other.last_mutation_id_changes);
        for (client, patches) in other.desired_queries_patches {
            self.desired_queries_patches
                .entry(client)
                .or_default()
                .extend(patches);
        }
        self.got_queries_patch
            .extend(other.got_queries_patch);
        self.rows_patch.extend(other.rows_patch);
    }

    fn into_parts(self, poke_id: &str) -> Vec<PokePart> {
        if self.is_empty() {
            return Vec::new();
        }
        let mut rows = self.rows_patch.into_iter();
        let first_rows: Vec<RowPatchOp> = rows
            .by_ref()
            .take(MAX_ROW_PATCHES_PER_PART)
            .collect();
        let mut parts = vec![PokePart {
            poke_id: poke_id.to_string(),
            last_mutation_id_changes: non_empty_map(self.last_mutation_id_changes),
            desired_queries_patches: non_empty_map(self.desired_queries_patches),
            got_queries_patch: non_empty_vec(self.got_queries_patch),
            rows_patch: non_empty_vec(first_rows),
        }];
        loop {
            let chunk: Vec<RowPatchOp> = rows
                .by_ref()
                .take(MAX_ROW_PATCHES_PER_PART)
                .collect();
            if chunk.is_empty() {
                break;
            }
            parts.push(PokePart {
                poke_id: poke_id.to_string(),
                rows_patch: Some(chunk),
                ..Default::default()
            });
        }
        parts
    }
}

fn non_empty_map<K: Ord, V>(map: BTreeMap<K, V>) -> Option<BTreeMap<K, V>> {
    (!map.is_empty()).then_some(map)
}

fn non_empty_vec<T>(vec: Vec<T>) -> Option<Vec<T>> {
    (!vec.is_empty()).then_some(vec)
}

struct PendingPoke {
    poke_id: String,
    parts: PokePartData,
    cancelled: bool,
}

pub struct PokeHandler {
    client_id: ClientId,
    sink: mpsc::Sender<Downstream>,
    base_cookie: Option<CvrVersion>,
    open: Option<PendingPoke>,
    poke_counter: u64,
}

impl PokeHandler {
    pub fn new(
        client_id: ClientId,
        base_cookie: Option<CvrVersion>,
        sink: mpsc::Sender<Downstream>,
    ) -> Self {
        PokeHandler { client_id, sink, base_cookie, open: None, poke_counter: 0 }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// The cookie the client last accepted; the next emitted poke's
    /// `baseCookie`.
    pub fn base_cookie(&self) -> Option<&CvrVersion> {
        self.base_cookie.as_ref()
    }

    pub fn start_poke(&mut self) -> Result<(), PokeError> {
        if self.open.is_some() {
            return Err(PokeError::AlreadyOpen);
        }
        self.poke_counter += 1;
        self.open = Some(PendingPoke {
            poke_id: format!("{}:{}", self.client_id, self.poke_counter),
            parts: PokePartData::default(),
            cancelled: false,
        });
        Ok(())
    }

    pub fn add_parts(&mut self, data: PokePartData) -> Result<(), PokeError> {
        let pending = self.open.as_mut().ok_or(PokeError::NotOpen)?;
        pending.parts.merge(data);
        Ok(())
    }

    /// Cancels the open poke; the client receives nothing and the base
    /// cookie stays put.
    pub fn cancel_poke(&mut self) {
        if let Some(pending) = self.open.as_mut() {
            pending.cancelled = true;
        }
    }

    /// Closes the open poke at `final_version`. Returns whether anything
    /// was emitted: cancelled pokes and pokes that do not advance the
    /// cookie are suppressed.
    pub async fn end_poke(
        &mut self,
        final_version: &CvrVersion,
        schema_versions: Option<SchemaVersions>,
    ) -> Result<bool, PokeError> {
        let pending = self.open.take().ok_or(PokeError::NotOpen)?;
        if pending.cancelled {
            return Ok(false);
        }
        if let Some(base) = &self.base_cookie {
            if final_version <= base {
                return Ok(false);
            }
        }

        let cookie = final_version.cookie();
        self.send(Downstream::PokeStart(PokeStart {
            poke_id: pending.poke_id.clone(),
            base_cookie: self.base_cookie.as_ref().map(CvrVersion::cookie),
            cookie: cookie.clone(),
            schema_versions,
        }))
        .await?;
        for part in pending.parts.into_parts(&pending.poke_id) {
            self.send(Downstream::PokePart(part)).await?;
        }
        self.send(Downstream::PokeEnd(PokeEnd { poke_id: pending.poke_id, cookie }))
            .await?;

        self.base_cookie = Some(final_version.clone());
        Ok(true)
    }

    pub async fn send(&self, message: Downstream) -> Result<(), PokeError> {
        self.sink
            .send(message)
            .await
            .map_err(|_| PokeError::Disconnected)
    }
}
