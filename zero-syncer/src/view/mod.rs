//! The per-client-group view syncer.
//!
//! One long-running task per client group, processing events from a
//! single queue one at a time: new connections, desired-query changes,
//! version-ready ticks from the replicator, client deletions, mutation
//! acknowledgements, and drain. All CVR mutations flow through the
//! updaters; this module owns scheduling, persistence retries, poke
//! broadcast, and connection lifecycle.
//!
//! Failure policy: a flush that hits a concurrent modification reloads
//! the CVR and retries once, then surfaces a protocol error; losing the
//! ownership lease disconnects every client with `Rehome`; a replica
//! reset aborts all clients with `ClientNotFound` and drops the row
//! cache.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};
use zero_core::{
    error::ErrorKind,
    protocol::{
        ClientId, DesiredQueriesPatchOp, Downstream, ErrorBody, InitConnectionBody, QueryHash,
        RowPatchOp,
    },
    version::CvrVersion,
};
use zero_core::version::StateVersion;
use zero_storage::{
    cvr::{rows_cache::RowRecordCache, store::CvrPersistence, Cvr, StoreError},
    replica::snapshot::Snapshotter,
};

use crate::drain::DrainCoordinator;

pub mod keys;
pub mod pipeline;
pub mod pokes;
pub mod updater;

use keys::KeyColumns;
use pipeline::{PipelineChange, PipelineDriver, PipelineError};
use pokes::{PokeHandler, PokePartData};
use updater::{ConfigUpdater, QueryUpdater, UpdateOutcome};

const OUTBOUND_QUEUE: usize = 256;

/// Handshake data for a new client connection.
#[derive(Debug)]
pub struct SyncContext {
    pub client_id: ClientId,
    pub base_cookie: Option<String>,
    pub last_connect_time: DateTime<Utc>,
    pub init: InitConnectionBody,
}

pub enum ViewSyncerEvent {
    Connect {
        ctx: SyncContext,
        reply: oneshot::Sender<Result<mpsc::Receiver<Downstream>, ErrorBody>>,
    },
    ChangeDesiredQueries {
        client_id: ClientId,
        patch: Vec<DesiredQueriesPatchOp>,
    },
    DeleteClients {
        client_ids: Vec<ClientId>,
    },
    AdvanceLastMutationIds {
        changes: Vec<(ClientId, u64)>,
    },
    VersionReady,
    Stop,
}

/// Queue handle for a running view syncer.
#[derive(Clone)]
pub struct ViewSyncerHandle {
    queue: mpsc::Sender<ViewSyncerEvent>,
}

impl ViewSyncerHandle {
    pub async fn connect(
        &self,
        ctx: SyncContext,
    ) -> Result<mpsc::Receiver<Downstream>, ErrorBody> {
        let (reply, response) = oneshot::channel();
        self.queue
            .send(ViewSyncerEvent::Connect { ctx, reply })
            .await
            .map_err(|_| ErrorBody::new(ErrorKind::Internal, "view syncer stopped"))?;
        response
            .await
            .map_err(|_| ErrorBody::new(ErrorKind::Internal, "view syncer stopped"))?
    }

    pub async fn send(&self, event: ViewSyncerEvent) -> bool {
        self.queue.send(event).await.is_ok()
    }

    /// Non-blocking version-ready tick; coalesces are fine since the
    /// syncer advances to the latest snapshot anyway.
    pub fn notify_version_ready(&self) {
        let _ = self.queue.try_send(ViewSyncerEvent::VersionReady);
    }
}

pub struct ViewSyncer<D: PipelineDriver> {
    client_group_id: String,
    store: Arc<dyn CvrPersistence>,
    snapshotter: Snapshotter,
    driver: D,
    drain: Arc<DrainCoordinator>,

    cvr: Option<Cvr>,
    cache: RowRecordCache,
    /// Queries currently installed in the pipeline driver.
    hydrated: HashSet<QueryHash>,
    connections: HashMap<ClientId, PokeHandler>,
    last_connect_time: DateTime<Utc>,
    last_ttl_tick: Instant,
    last_hydration_time: std::time::Duration,
    stopped: bool,
}

impl<D: PipelineDriver> ViewSyncer<D> {
    pub fn spawn(
        client_group_id: String,
        store: Arc<dyn CvrPersistence>,
        snapshotter: Snapshotter,
        driver: D,
        drain: Arc<DrainCoordinator>,
    ) -> ViewSyncerHandle
    where
        D: 'static,
    {
        let (queue, events) = mpsc::channel(64);
        let syncer = ViewSyncer {
            client_group_id,
            store,
            snapshotter,
            driver,
            drain,
            cvr: None,
            cache: RowRecordCache::new(),
            hydrated: HashSet::new(),
            connections: HashMap::new(),
            last_connect_time: Utc::now(),
            last_ttl_tick: Instant::now(),
            last_hydration_time: std::time::Duration::ZERO,
            stopped: false,
        };
        tokio::spawn(syncer.run(events));
        ViewSyncerHandle { queue }
    }

    #[instrument(skip_all, fields(client_group_id = %self.client_group_id))]
    async fn run(mut self, mut events: mpsc::Receiver<ViewSyncerEvent>) {
        info!("view syncer started");
        metrics::gauge!("view_syncer_running").increment(1.0);
        while let Some(event) = events.recv().await {
            let started = Instant::now();
            match event {
                ViewSyncerEvent::Connect { ctx, reply } => {
                    let result = self.handle_connect(ctx).await;
                    let _ = reply.send(result);
                }
                ViewSyncerEvent::ChangeDesiredQueries { client_id, patch } => {
                    self.handle_change_desired_queries(&client_id, &patch)
                        .await;
                }
                ViewSyncerEvent::DeleteClients { client_ids } => {
                    self.handle_delete_clients(&client_ids).await;
                }
                ViewSyncerEvent::AdvanceLastMutationIds { changes } => {
                    self.handle_last_mutation_ids(&changes).await;
                }
                ViewSyncerEvent::VersionReady => {
                    self.handle_version_ready().await;
                    self.last_hydration_time = started.elapsed();
                }
                ViewSyncerEvent::Stop => break,
            }
            if self.stopped {
                break;
            }
            // Cooperative drain at the iteration boundary.
            if self.drain.should_drain() {
                info!("draining view syncer");
                self.drain
                    .drain_next_in(self.last_hydration_time);
                self.disconnect_all(ErrorBody {
                    max_backoff_ms: Some(0),
                    ..ErrorBody::new(ErrorKind::Rebalance, "worker draining")
                })
                .await;
                break;
            }
        }
        metrics::gauge!("view_syncer_running").decrement(1.0);
        info!("view syncer stopped");
    }

    // -----------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------

    async fn handle_connect(
        &mut self,
        ctx: SyncContext,
    ) -> Result<mpsc::Receiver<Downstream>, ErrorBody> {
        self.last_connect_time = self.last_connect_time.max(ctx.last_connect_time);
        self.ensure_loaded(ctx.last_connect_time).await?;
        let cvr = self.cvr.as_ref().expect("loaded above");

        let base_cookie = validate_base_cookie(
            ctx.base_cookie.as_deref(),
            &cvr.version,
            cvr_exists(cvr),
        )?;

        let (sink, receiver) = mpsc::channel(OUTBOUND_QUEUE);
        let mut handler = PokeHandler::new(ctx.client_id.clone(), base_cookie.clone(), sink);

        // Catch the client up from its cookie to the current CVR.
        if let Some(base) = &base_cookie {
            if *base < cvr.version {
                if let Err(body) = self.catch_up(&mut handler, base.clone()).await {
                    return Err(body);
                }
            }
        }
        self.connections
            .insert(ctx.client_id.clone(), handler);
        metrics::counter!("view_syncer_connects").increment(1);

        if let Some(schema) = ctx.init.client_schema.clone() {
            self.apply_config(move |updater| {
                updater.set_client_schema(schema.clone());
            })
            .await;
        }
        let client_id = ctx.client_id.clone();
        let patch = ctx.init.desired_queries_patch.clone();
        self.apply_config(move |updater| {
            updater.ensure_client(&client_id);
            updater.apply_desired_patch(&client_id, &patch);
        })
        .await;
        self.hydrate_and_prune().await;

        Ok(receiver)
    }

    async fn handle_change_desired_queries(
        &mut self,
        client_id: &ClientId,
        patch: &[DesiredQueriesPatchOp],
    ) {
        if self.cvr.is_none() {
            warn!(client_id, "desired-query change before any connection");
            return;
        }
        let client_id = client_id.clone();
        let patch = patch.to_vec();
        self.apply_config(move |updater| {
            updater.ensure_client(&client_id);
            updater.apply_desired_patch(&client_id, &patch);
        })
        .await;
        self.hydrate_and_prune().await;
    }

    async fn handle_delete_clients(&mut self, client_ids: &[ClientId]) {
        if self.cvr.is_none() {
            return;
        }
        let ids = client_ids.to_vec();
        self.apply_config(move |updater| {
            updater.delete_clients(&ids);
        })
        .await;
        for client_id in client_ids {
            self.connections.remove(client_id);
        }
        let notice = Downstream::DeleteClients { client_ids: client_ids.to_vec() };
        for handler in self.connections.values() {
            let _ = handler.send(notice.clone()).await;
        }
        self.hydrate_and_prune().await;
    }

    async fn handle_last_mutation_ids(&mut self, changes: &[(ClientId, u64)]) {
        if self.cvr.is_none() || changes.is_empty() {
            return;
        }
        let changes = changes.to_vec();
        self.apply_config(move |updater| {
            for (client_id, lmid) in &changes {
                updater.advance_last_mutation_id(client_id, *lmid);
            }
        })
        .await;
    }

    // -----------------------------------------------------------------
    // Updates
    // -----------------------------------------------------------------

    /// Runs a config update with reload-and-retry-once semantics. A
    /// second consecutive conflict is promoted to a per-connection
    /// protocol error.
    async fn apply_config(&mut self, apply: impl Fn(&mut ConfigUpdater<'_>) + Send) {
        for attempt in 0..2 {
            let Some(cvr) = self.cvr.as_mut() else { return };
            let mut updater = ConfigUpdater::new(cvr);
            updater.tick_ttl_clock(ttl_delta_ms(&mut self.last_ttl_tick));
            apply(&mut updater);
            let outcome = updater.finish();
            if !outcome.changed {
                return;
            }
            match self.persist_and_poke(outcome).await {
                Ok(()) => return,
                // Reloaded; recompute against the fresh CVR.
                Err(true) if attempt == 0 => continue,
                Err(true) => {
                    self.escalate_conflict().await;
                    return;
                }
                Err(false) => return,
            }
        }
    }

    async fn handle_version_ready(&mut self) {
        if self.cvr.is_none() {
            // Nobody connected yet; nothing to maintain.
            return;
        }
        // The snapshot diff is consumed by `advance`; compute the
        // pipeline changes once and re-merge the same batch if the
        // flush conflicts and the CVR reloads.
        let Some((version, changes)) = self.advance_pipelines() else { return };

        for attempt in 0..2 {
            if self.stopped || self.cvr.is_none() {
                return;
            }
            if let Err(err) = self
                .cache
                .ensure_loaded(&*self.store, &self.client_group_id)
                .await
            {
                warn!(%err, "row cache load failed");
                if !self.reload().await || attempt > 0 {
                    return;
                }
                continue;
            }

            let cvr = self.cvr.as_mut().expect("checked above");
            let key_columns = {
                let stored: Vec<_> = self.cache.records().cloned().collect();
                KeyColumns::new(stored.iter())
            };
            let mut updater = QueryUpdater::new(cvr, &mut self.cache, version.clone())
                .with_key_columns(key_columns);
            for change in &changes {
                updater.received(change);
            }
            let outcome = updater.finish();
            metrics::counter!("view_syncer_rows_considered").increment(changes.len() as u64);
            match self.persist_and_poke(outcome).await {
                Ok(()) => return,
                // Reloaded; re-merge this tick's changes against the
                // fresh CVR rather than dropping them.
                Err(true) if attempt == 0 => continue,
                Err(true) => {
                    self.escalate_conflict().await;
                    return;
                }
                Err(false) => return,
            }
        }
    }

    /// Advances the snapshot and runs the pipeline driver over the diff.
    /// Scoped so no snapshot borrow escapes (snapshots are not Sync).
    fn advance_pipelines(&mut self) -> Option<(StateVersion, Vec<PipelineChange>)> {
        let advancement = match self.snapshotter.advance() {
            Ok(a) => a,
            Err(err) => {
                // Retried on the next version-ready tick.
                warn!(%err, "snapshot advance failed");
                return None;
            }
        };
        if advancement.changes.is_empty() {
            return None;
        }
        let version = advancement.version.clone();
        match self
            .driver
            .advance(advancement.snapshot, &advancement.changes)
        {
            Ok(changes) => Some((version, changes)),
            Err(err) => {
                error!(%err, "pipeline advance failed; resetting pipelines");
                self.hydrated.clear();
                None
            }
        }
    }

    /// Installs newly desired queries and removes undesired ones. A
    /// flush conflict reloads the CVR (which resets the pipelines), so
    /// the retry re-derives the add/remove sets and re-hydrates; a
    /// second conflict escalates.
    async fn hydrate_and_prune(&mut self) {
        for attempt in 0..2 {
            if self.stopped {
                return;
            }
            let Some(cvr) = self.cvr.as_ref() else { return };
            let desired: HashSet<QueryHash> = cvr.desired_query_hashes().into_iter().collect();
            let to_add: Vec<QueryHash> = desired
                .difference(&self.hydrated)
                .cloned()
                .collect();
            let to_remove: Vec<QueryHash> = self
                .hydrated
                .difference(&desired)
                .cloned()
                .collect();
            if to_add.is_empty() && to_remove.is_empty() {
                return;
            }

            if let Err(err) = self
                .cache
                .ensure_loaded(&*self.store, &self.client_group_id)
                .await
            {
                warn!(%err, "row cache load failed before hydration");
                return;
            }

            let started = Instant::now();
            let snapshot_version = self.snapshotter.current().version().clone();
            let cvr = self.cvr.as_mut().expect("checked above");
            let key_columns = {
                let stored: Vec<_> = self.cache.records().cloned().collect();
                KeyColumns::new(stored.iter())
            };
            let mut updater = QueryUpdater::new(cvr, &mut self.cache, snapshot_version.clone())
                .with_key_columns(key_columns);

            for hash in &to_remove {
                self.driver.remove_query(hash);
                self.hydrated.remove(hash);
                updater.mark_removed(hash);
            }

            for hash in &to_add {
                let Some(spec) = updater.query_spec(hash) else { continue };
                match self
                    .driver
                    .add_query(hash, &spec, self.snapshotter.current())
                {
                    Ok(adds) => {
                        for change in &adds {
                            updater.received(change);
                        }
                        let transformation_hash = self.driver.transformation_hash(&spec);
                        updater.mark_gotten(hash, transformation_hash, snapshot_version.clone());
                        self.hydrated.insert(hash.clone());
                    }
                    Err(PipelineError::UnsupportedQuery(message)) => {
                        warn!(hash, message, "query rejected by pipeline driver");
                        updater.record_query_error(hash, message);
                    }
                    Err(err) => {
                        error!(hash, %err, "hydration failed");
                        updater.record_query_error(hash, err.to_string());
                    }
                }
            }

            let outcome = updater.finish();
            self.last_hydration_time = started.elapsed();
            match self.persist_and_poke(outcome).await {
                Ok(()) => return,
                // Reloaded: hydrated/driver state was reset, so the next
                // attempt re-hydrates everything the fresh CVR desires.
                Err(true) if attempt == 0 => continue,
                Err(true) => {
                    self.escalate_conflict().await;
                    return;
                }
                Err(false) => return,
            }
        }
    }

    /// A conflict survived the reload-and-retry: per the failure policy
    /// it becomes a per-connection protocol error and the connections
    /// close.
    async fn escalate_conflict(&mut self) {
        error!("CVR conflict persisted after retry; closing connections");
        self.disconnect_all(ErrorBody::new(
            ErrorKind::Internal,
            "concurrent CVR modification persisted after retry",
        ))
        .await;
        self.stopped = true;
    }

    /// Persists an update and broadcasts the poke. `Err(true)` means the
    /// caller should recompute and retry once (the CVR was reloaded).
    async fn persist_and_poke(&mut self, outcome: UpdateOutcome) -> Result<(), bool> {
        if !outcome.changed {
            return Ok(());
        }
        let UpdateOutcome { expected_version, version, flush, parts, .. } = outcome;

        match self
            .store
            .flush(
                &self.client_group_id,
                &expected_version,
                &version,
                self.last_connect_time,
                &flush,
            )
            .await
        {
            Ok(()) => {}
            Err(StoreError::ConcurrentModification { expected, actual }) => {
                warn!(expected, actual, "concurrent CVR modification; reloading");
                return Err(self.reload().await);
            }
            Err(StoreError::Ownership { owner, .. }) => {
                info!(new_owner = %owner, "ownership lost during flush");
                self.disconnect_all(ErrorBody::rehome("client group moved")).await;
                self.stopped = true;
                return Err(false);
            }
            Err(err) => {
                error!(%err, "CVR flush failed");
                self.disconnect_all(ErrorBody::new(ErrorKind::Internal, err.to_string()))
                    .await;
                self.stopped = true;
                return Err(false);
            }
        }

        // Row records flush outside the instance lock; rowsVersion may
        // briefly lag, which the load path tolerates.
        if let Err(err) = self
            .cache
            .flush(&*self.store, &self.client_group_id, &version)
            .await
        {
            warn!(%err, "deferred row flush failed");
        }

        self.broadcast(&version, parts).await;
        Ok(())
    }

    async fn broadcast(&mut self, version: &CvrVersion, parts: PokePartData) {
        let mut gone = Vec::new();
        for (client_id, handler) in self.connections.iter_mut() {
            let result = async {
                handler.start_poke()?;
                handler.add_parts(parts.clone())?;
                handler.end_poke(version, None).await
            }
            .await;
            match result {
                Ok(emitted) => {
                    if emitted {
                        metrics::counter!("view_syncer_pokes").increment(1);
                    }
                }
                Err(err) => {
                    debug!(client_id, %err, "dropping connection");
                    gone.push(client_id.clone());
                }
            }
        }
        for client_id in gone {
            self.connections.remove(&client_id);
        }
    }

    // -----------------------------------------------------------------
    // Catch-up and lifecycle
    // -----------------------------------------------------------------

    async fn catch_up(
        &mut self,
        handler: &mut PokeHandler,
        base: CvrVersion,
    ) -> Result<(), ErrorBody> {
        let cvr = self.cvr.as_ref().expect("loaded");
        let config = self
            .store
            .catchup_config_patches(&base, cvr)
            .await
            .map_err(map_store_error)?;
        let rows = self
            .store
            .catchup_row_patches(&base, cvr, &HashSet::new())
            .await
            .map_err(map_store_error)?;

        let mut parts = PokePartData::default();
        for (_, op) in config.queries {
            parts.got_queries_patch.push(op);
        }
        for (_, client_id, op) in config.desires {
            parts
                .desired_queries_patches
                .entry(client_id)
                .or_default()
                .push(op);
        }
        {
            // Scoped: the snapshot borrow must not outlive this block
            // (snapshots are not Sync and the poke send awaits below).
            let snapshot = self.snapshotter.current();
            for record in rows {
                if record.is_tombstone() {
                    parts
                        .rows_patch
                        .push(RowPatchOp::Del { id: record.id });
                    continue;
                }
                let table = zero_core::change::TableId::new(&record.id.schema, &record.id.table);
                let mut key = zero_core::change::Row::new();
                for (column, value) in record.id.key.entries() {
                    key.insert(column.clone(), value.clone());
                }
                match snapshot.get_row(&table, &key) {
                    Ok(Some(row)) => parts
                        .rows_patch
                        .push(RowPatchOp::Put { id: record.id, value: row }),
                    Ok(None) => parts
                        .rows_patch
                        .push(RowPatchOp::Del { id: record.id }),
                    Err(err) => {
                        warn!(%err, "catch-up row read failed");
                        return Err(ErrorBody::new(ErrorKind::Internal, err.to_string()));
                    }
                }
            }
        }

        let version = cvr.version.clone();
        let result = async {
            handler.start_poke()?;
            handler.add_parts(parts)?;
            handler.end_poke(&version, None).await
        }
        .await;
        result.map_err(|e| ErrorBody::new(ErrorKind::Internal, e.to_string()))?;
        Ok(())
    }

    async fn ensure_loaded(&mut self, last_connect_time: DateTime<Utc>) -> Result<(), ErrorBody> {
        if self.cvr.is_some() {
            return Ok(());
        }
        let replica_version = self
            .snapshotter
            .current()
            .version()
            .clone();
        let cvr = self
            .store
            .load(&self.client_group_id, last_connect_time, Some(&replica_version))
            .await
            .map_err(map_store_error)?;
        self.cvr = Some(cvr);
        Ok(())
    }

    /// Reloads CVR and row cache after a conflict. Returns whether the
    /// reload succeeded (and a retry makes sense).
    async fn reload(&mut self) -> bool {
        self.cache.clear();
        for hash in std::mem::take(&mut self.hydrated) {
            self.driver.remove_query(&hash);
        }
        let replica_version = self
            .snapshotter
            .current()
            .version()
            .clone();
        match self
            .store
            .load(&self.client_group_id, self.last_connect_time, Some(&replica_version))
            .await
        {
            Ok(cvr) => {
                self.cvr = Some(cvr);
                true
            }
            Err(err) => {
                error!(%err, "CVR reload failed");
                self.disconnect_all(map_store_error(err)).await;
                self.stopped = true;
                false
            }
        }
    }

    async fn disconnect_all(&mut self, body: ErrorBody) {
        for handler in self.connections.values() {
            let _ = handler.send(Downstream::Error(body.clone())).await;
        }
        self.connections.clear();
    }
}

fn cvr_exists(cvr: &Cvr) -> bool {
    cvr.version != CvrVersion::initial() || !cvr.clients.is_empty()
}

fn ttl_delta_ms(last_tick: &mut Instant) -> f64 {
    let now = Instant::now();
    let delta = now.duration_since(*last_tick);
    *last_tick = now;
    delta.as_secs_f64() * 1000.0
}

/// Validates a handshake `baseCookie` against the current CVR.
fn validate_base_cookie(
    raw: Option<&str>,
    current: &CvrVersion,
    exists: bool,
) -> Result<Option<CvrVersion>, ErrorBody> {
    let Some(raw) = raw else { return Ok(None) };
    if !exists {
        return Err(ErrorBody::new(
            ErrorKind::ClientNotFound,
            format!("no client view record for baseCookie {raw}"),
        ));
    }
    let base = CvrVersion::parse_cookie(raw).map_err(|e| {
        ErrorBody::new(ErrorKind::InvalidConnectionRequestBaseCookie, e.to_string())
    })?;
    if base > *current {
        return Err(ErrorBody::new(
            ErrorKind::InvalidConnectionRequestBaseCookie,
            format!("client at {raw} is ahead of server at {current}"),
        ));
    }
    Ok(Some(base))
}

fn map_store_error(err: StoreError) -> ErrorBody {
    match &err {
        StoreError::ClientNotFound(_) => ErrorBody::new(ErrorKind::ClientNotFound, err.to_string()),
        StoreError::OlderReplica { .. } => {
            ErrorBody::new(ErrorKind::ClientNotFound, err.to_string())
        }
        StoreError::Ownership { .. } => ErrorBody::rehome(err.to_string()),
        _ => ErrorBody::new(ErrorKind::Internal, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use serde_json::json;
    use zero_core::{
        change::{
            ColumnSpec, DataChange, Relation, ReplicaIdentity, RowKeySpec, TableId, TableSpec,
        },
        lite::ColumnMetadata,
        protocol::QuerySpec,
        version::{Lsn, StateVersion},
    };
    use zero_storage::{
        cvr::{
            store::{ConfigPatches, CvrFlush},
            RowRecord,
        },
        replica::Replica,
    };

    use super::{pipeline::TableScanDriver, *};

    fn cookie(n: u64) -> CvrVersion {
        CvrVersion::of(StateVersion::from_lsn(Lsn(n)))
    }

    fn state(n: u64) -> StateVersion {
        StateVersion::from_lsn(Lsn(n))
    }

    /// Scripted persistence: flush outcomes are consumed in order
    /// (anything beyond the script succeeds), loads hand back a fresh
    /// CVR.
    struct FlakyStore {
        flush_results: Mutex<VecDeque<Result<(), StoreError>>>,
        flushes: AtomicUsize,
        loads: AtomicUsize,
    }

    impl FlakyStore {
        fn new(flush_results: Vec<Result<(), StoreError>>) -> Self {
            FlakyStore {
                flush_results: Mutex::new(flush_results.into_iter().collect()),
                flushes: AtomicUsize::new(0),
                loads: AtomicUsize::new(0),
            }
        }

        fn conflict() -> StoreError {
            StoreError::ConcurrentModification {
                expected: "00".to_string(),
                actual: "00:01".to_string(),
            }
        }
    }

    #[async_trait]
    impl CvrPersistence for FlakyStore {
        async fn load(
            &self,
            client_group_id: &str,
            _last_connect_time: DateTime<Utc>,
            _live_replica_version: Option<&StateVersion>,
        ) -> Result<Cvr, StoreError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Cvr::new(client_group_id))
        }

        async fn flush(
            &self,
            _client_group_id: &str,
            _expected: &CvrVersion,
            _version: &CvrVersion,
            _last_connect_time: DateTime<Utc>,
            _flush: &CvrFlush,
        ) -> Result<(), StoreError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            self.flush_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }

        async fn flush_rows(
            &self,
            _client_group_id: &str,
            _records: &[RowRecord],
            _version: &CvrVersion,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn row_records(&self, _client_group_id: &str) -> Result<Vec<RowRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn catchup_config_patches(
            &self,
            _after: &CvrVersion,
            _up_to: &Cvr,
        ) -> Result<ConfigPatches, StoreError> {
            Ok(ConfigPatches::default())
        }

        async fn catchup_row_patches(
            &self,
            _after: &CvrVersion,
            _up_to: &Cvr,
            _exclude_hashes: &HashSet<QueryHash>,
        ) -> Result<Vec<RowRecord>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn foo_relation() -> Relation {
        Relation {
            id: TableId::new("public", "foo"),
            oid: 16384,
            row_key: RowKeySpec {
                columns: vec!["id".to_string()],
                identity: ReplicaIdentity::Default,
            },
            columns: vec![
                ColumnSpec {
                    name: "id".to_string(),
                    metadata: ColumnMetadata::of("int8").not_null(),
                },
                ColumnSpec { name: "label".to_string(), metadata: ColumnMetadata::of("text") },
            ],
        }
    }

    fn foo_table_spec() -> TableSpec {
        TableSpec {
            id: TableId::new("public", "foo"),
            columns: foo_relation().columns,
            primary_key: vec!["id".to_string()],
        }
    }

    fn insert_foo(id: i64, label: &str) -> DataChange {
        DataChange::Insert {
            relation: foo_relation(),
            new: [("id".to_string(), json!(id)), ("label".to_string(), json!(label))]
                .into_iter()
                .collect(),
        }
    }

    fn connect_ctx(hash: &str) -> SyncContext {
        SyncContext {
            client_id: "c1".to_string(),
            base_cookie: None,
            last_connect_time: Utc::now(),
            init: InitConnectionBody {
                desired_queries_patch: vec![DesiredQueriesPatchOp::Put {
                    hash: hash.to_string(),
                    query: QuerySpec::Ast { ast: json!({"table": "foo"}) },
                    ttl_ms: None,
                }],
                client_schema: None,
                active_clients: None,
            },
        }
    }

    async fn expect_protocol_error(receiver: &mut mpsc::Receiver<Downstream>) -> ErrorBody {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match receiver.recv().await {
                    Some(Downstream::Error(body)) => break body,
                    Some(_) => continue,
                    None => panic!("connection closed without a protocol error"),
                }
            }
        })
        .await
        .expect("protocol error within deadline")
    }

    #[tokio::test]
    async fn second_config_conflict_closes_the_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");
        drop(Replica::open(&path).unwrap());

        // Both config flush attempts conflict: one retry, then the
        // connection must be closed with a protocol error.
        let store = Arc::new(FlakyStore::new(vec![
            Err(FlakyStore::conflict()),
            Err(FlakyStore::conflict()),
        ]));
        let handle = ViewSyncer::spawn(
            "g1".to_string(),
            store.clone(),
            Snapshotter::new(&path).unwrap(),
            TableScanDriver::new(),
            Arc::new(DrainCoordinator::new()),
        );

        let mut receiver = handle.connect(connect_ctx("h1")).await.unwrap();
        let error = expect_protocol_error(&mut receiver).await;
        assert_eq!(error.kind, ErrorKind::Internal);
        assert!(error.message.contains("concurrent"), "{}", error.message);
        assert!(receiver.recv().await.is_none(), "connection closed");

        assert_eq!(store.flushes.load(Ordering::SeqCst), 2, "one retry, then escalation");
        assert!(store.loads.load(Ordering::SeqCst) >= 2, "CVR reloaded between attempts");
    }

    #[tokio::test]
    async fn second_conflict_on_version_ready_closes_the_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");
        let mut replica = Replica::open(&path).unwrap();
        let mut tx = replica.begin(state(100)).unwrap();
        tx.apply(&DataChange::CreateTable { spec: foo_table_spec() }).unwrap();
        tx.apply(&insert_foo(1, "one")).unwrap();
        tx.commit().unwrap();

        // Connect-time flushes (config + hydration) succeed; the
        // version-ready tick conflicts twice.
        let store = Arc::new(FlakyStore::new(vec![
            Ok(()),
            Ok(()),
            Err(FlakyStore::conflict()),
            Err(FlakyStore::conflict()),
        ]));
        let handle = ViewSyncer::spawn(
            "g1".to_string(),
            store.clone(),
            Snapshotter::new(&path).unwrap(),
            TableScanDriver::new(),
            Arc::new(DrainCoordinator::new()),
        );
        let mut receiver = handle.connect(connect_ctx("h1")).await.unwrap();

        let mut tx = replica.begin(state(101)).unwrap();
        tx.apply(&insert_foo(2, "two")).unwrap();
        tx.commit().unwrap();
        handle.notify_version_ready();

        let error = expect_protocol_error(&mut receiver).await;
        assert_eq!(error.kind, ErrorKind::Internal);
        assert!(receiver.recv().await.is_none(), "connection closed");

        // connect config + hydration, then the tick's flush and its
        // recomputed retry against the reloaded CVR.
        assert_eq!(store.flushes.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn fresh_clients_have_no_base_cookie() {
        assert_eq!(validate_base_cookie(None, &cookie(100), true).unwrap(), None);
        assert_eq!(validate_base_cookie(None, &cookie(100), false).unwrap(), None);
    }

    #[test]
    fn base_cookie_without_cvr_is_client_not_found() {
        let err = validate_base_cookie(Some("0a"), &CvrVersion::initial(), false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ClientNotFound);
    }

    #[test]
    fn base_cookie_ahead_of_server_is_rejected() {
        let ahead = cookie(200).cookie();
        let err = validate_base_cookie(Some(&ahead), &cookie(100), true).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidConnectionRequestBaseCookie);

        let behind = cookie(50).cookie();
        let ok = validate_base_cookie(Some(&behind), &cookie(100), true).unwrap();
        assert_eq!(ok, Some(cookie(50)));
    }

    #[test]
    fn older_replica_error_surfaces_as_client_not_found() {
        let body = map_store_error(StoreError::OlderReplica {
            cvr: "101".to_string(),
            db: "01".to_string(),
        });
        assert_eq!(body.kind, ErrorKind::ClientNotFound);
        assert_eq!(body.message, "Cannot sync from older replica: CVR=101, DB=01");
    }

    #[test]
    fn ownership_errors_rehome_with_immediate_reconnect() {
        let body = map_store_error(StoreError::Ownership {
            owner: "other-task".to_string(),
            granted_at: Utc::now(),
        });
        assert_eq!(body.kind, ErrorKind::Rehome);
        assert_eq!(body.max_backoff_ms, Some(0));
    }
}
