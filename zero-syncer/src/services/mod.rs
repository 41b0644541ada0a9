//! Wiring the sync services together.
//!
//! [`ServicesBuilder`] assembles one shard's pipeline: CVR/CDC schemas,
//! the change source feeding the multiplexer, the replicator applying
//! the multiplexed stream to the replica, the view-syncer registry (one
//! task per client group, created on demand), the pusher pool, and the
//! drain coordinator. The websocket surface lives outside this crate;
//! its seam is [`Services::connect`], which yields the per-connection
//! downstream receiver.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;
use zero_core::{
    change::TableId,
    protocol::{ClientGroupId, Downstream, ErrorBody, PushBody},
    version::StateVersion,
};
use zero_storage::{
    cdc::CdcStore,
    cvr::{self, store::CvrStore, StoreError},
    postgres::{self, Shard},
    replica::{snapshot::Snapshotter, Replica, ReplicaError},
};

use crate::{
    backfill::{plan_backfill, BackfillError, BackfillStreamer},
    change_source::{ChangeSource, ChangeSourceConfig, ChangeSourceError},
    drain::DrainCoordinator,
    multiplexer::Multiplexer,
    pusher::{PushError, PusherConfig, PusherPool, PushResult},
    replicator::{self, ReplicatorError},
    view::{
        pipeline::{PipelineDriver, TableScanDriver},
        SyncContext, ViewSyncer, ViewSyncerEvent, ViewSyncerHandle,
    },
};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("replica error: {0}")]
    Replica(#[from] ReplicaError),
    #[error("change source error: {0}")]
    ChangeSource(#[from] ChangeSourceError),
    #[error("backfill error: {0}")]
    Backfill(#[from] BackfillError),
    #[error("replicator error: {0}")]
    Replicator(#[from] ReplicatorError),
    #[error("upstream error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

type DriverFactory = Arc<dyn Fn() -> Box<dyn PipelineDriver> + Send + Sync>;

pub struct ServicesBuilder {
    upstream_url: String,
    cvr_url: String,
    replica_path: PathBuf,
    shard: Shard,
    publications: Vec<String>,
    ignored_tables: HashSet<TableId>,
    ddl_triggers: bool,
    push_endpoint: Option<Url>,
    pusher_workers: usize,
    driver_factory: DriverFactory,
}

impl ServicesBuilder {
    pub fn new(
        upstream_url: impl Into<String>,
        cvr_url: impl Into<String>,
        replica_path: impl Into<PathBuf>,
        shard: Shard,
    ) -> Self {
        ServicesBuilder {
            upstream_url: upstream_url.into(),
            cvr_url: cvr_url.into(),
            replica_path: replica_path.into(),
            shard,
            publications: vec!["zero_all".to_string()],
            ignored_tables: HashSet::new(),
            ddl_triggers: false,
            push_endpoint: None,
            pusher_workers: 4,
            driver_factory: Arc::new(|| Box::new(TableScanDriver::new())),
        }
    }

    pub fn publications(mut self, publications: Vec<String>) -> Self {
        self.publications = publications;
        self
    }

    pub fn ignore_table(mut self, schema: &str, table: &str) -> Self {
        self.ignored_tables
            .insert(TableId::new(schema, table));
        self
    }

    pub fn ddl_triggers(mut self, enabled: bool) -> Self {
        self.ddl_triggers = enabled;
        self
    }

    pub fn push_endpoint(mut self, endpoint: Url) -> Self {
        self.push_endpoint = Some(endpoint);
        self
    }

    pub fn pusher_workers(mut self, workers: usize) -> Self {
        self.pusher_workers = workers;
        self
    }

    pub fn pipeline_driver(
        mut self,
        factory: impl Fn() -> Box<dyn PipelineDriver> + Send + Sync + 'static,
    ) -> Self {
        self.driver_factory = Arc::new(factory);
        self
    }

    pub async fn run(self) -> Result<Services, ServiceError> {
        let task_id = format!("zero-syncer-{}", Uuid::new_v4().simple());
        info!(shard = %self.shard, task_id, "starting sync services");

        let pool = postgres::connect(&self.cvr_url)?;
        cvr::ensure_schema(&pool, &self.shard).await?;
        let cdc = Arc::new(CdcStore::new(pool.clone(), self.shard.clone()));
        cdc.ensure_schema().await?;
        let store = Arc::new(CvrStore::new(pool, self.shard.clone(), task_id));

        // The replica file; opening runs bookkeeping migrations.
        let replica = Replica::open(&self.replica_path)?;
        let fresh_replica = replica.replica_version()? == StateVersion::min();

        let (mux, consumer) = Multiplexer::new(cdc.last_watermark().await?);
        let source_config = ChangeSourceConfig {
            upstream_url: self.upstream_url.clone(),
            shard: self.shard.clone(),
            publications: self.publications.clone(),
            ignored_tables: self.ignored_tables.clone(),
            ddl_triggers: self.ddl_triggers,
        };
        let source = ChangeSource::new(source_config, cdc.clone(), mux.clone());
        let published = source.published_tables().await?;

        // The replicator consumes the multiplexer before anything can
        // produce into it, so initial-sync backfills never stall.
        let (ack_tx, ack_rx) = mpsc::channel(64);
        let replicator = replicator::spawn(self.replica_path.clone(), consumer, ack_tx)?;
        spawn_stream_supervisor(source, ack_rx);

        if fresh_replica {
            initial_sync(&self.upstream_url, &published, &mux, &cdc, &replica).await?;
        }
        drop(replica);

        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        spawn_version_ready_fanout(replicator.version_ready.clone(), registry.clone());

        let pusher = self.push_endpoint.map(|endpoint| {
            PusherPool::spawn(PusherConfig {
                endpoint,
                api_key: None,
                workers: self.pusher_workers,
            })
        });

        Ok(Services {
            replica_path: self.replica_path,
            store,
            drain: Arc::new(DrainCoordinator::new()),
            registry,
            pusher,
            driver_factory: self.driver_factory,
        })
    }
}

type Registry = Arc<Mutex<HashMap<ClientGroupId, ViewSyncerHandle>>>;

static STREAM_BACKOFF: Lazy<ExponentialBackoff> =
    Lazy::new(|| ExponentialBackoff::from_millis(500).max_delay(Duration::from_secs(45)));

/// Keeps the change stream alive: transient upstream failures reconnect
/// with exponential backoff, fatal ones (auto-reset, unsupported schema
/// changes) stop the stream for good. The replicator's acks are
/// forwarded to whichever stream incarnation is current.
fn spawn_stream_supervisor(
    source: ChangeSource,
    mut acks: mpsc::Receiver<StateVersion>,
) {
    tokio::spawn(async move {
        let mut backoff = STREAM_BACKOFF.clone();
        loop {
            match source.start_stream(None).await {
                Ok(mut stream) => {
                    // A healthy connection resets the backoff.
                    backoff = STREAM_BACKOFF.clone();
                    let outcome = loop {
                        tokio::select! {
                            ack = acks.recv() => match ack {
                                Some(watermark) => {
                                    if stream.acks.send(watermark).await.is_err() {
                                        break None;
                                    }
                                }
                                None => {
                                    info!("replicator gone; stopping change stream");
                                    return;
                                }
                            },
                            result = &mut stream.handle => break Some(result),
                        }
                    };
                    match outcome {
                        Some(Ok(Ok(()))) => {
                            info!("change stream completed");
                            return;
                        }
                        Some(Ok(Err(err))) if is_fatal(&err) => {
                            error!(%err, "change stream failed fatally");
                            return;
                        }
                        Some(Ok(Err(err))) => warn!(%err, "change stream failed; reconnecting"),
                        Some(Err(err)) => error!(%err, "change stream task panicked"),
                        None => warn!("change stream stopped accepting acks; reconnecting"),
                    }
                }
                Err(err) if is_fatal(&err) => {
                    error!(%err, "change stream cannot start");
                    return;
                }
                Err(err) => warn!(%err, "unable to open change stream"),
            }
            if let Some(delay) = backoff.next() {
                info!(?delay, "reconnecting change stream");
                tokio::time::sleep(delay).await;
            }
        }
    });
}

fn is_fatal(err: &ChangeSourceError) -> bool {
    matches!(
        err,
        ChangeSourceError::AutoReset(_)
            | ChangeSourceError::UnsupportedSchemaChange(_)
            | ChangeSourceError::UnsupportedTableSchema(_)
    )
}

/// Copies every published table at a consistent LSN and stamps the
/// replica's identity; the first-start path.
async fn initial_sync(
    upstream_url: &str,
    tables: &[TableId],
    mux: &Multiplexer,
    cdc: &Arc<CdcStore>,
    replica: &Replica,
) -> Result<(), ServiceError> {
    info!(count = tables.len(), "initial sync starting");

    let (client, connection) = tokio_postgres::connect(upstream_url, tokio_postgres::NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let streamer = BackfillStreamer::new(upstream_url.to_string(), mux.clone(), cdc.clone());
    let mut max_watermark = StateVersion::min();
    for table in tables {
        let request = plan_backfill(&client, table).await?;
        let watermark = streamer.run(request).await?;
        max_watermark = max_watermark.max(watermark);
    }
    replica.set_replica_version(&max_watermark)?;
    info!(version = %max_watermark, "initial sync complete");
    Ok(())
}

fn spawn_version_ready_fanout(
    mut version_ready: tokio::sync::watch::Receiver<StateVersion>,
    registry: Registry,
) {
    tokio::spawn(async move {
        while version_ready.changed().await.is_ok() {
            let handles: Vec<ViewSyncerHandle> = registry
                .lock()
                .expect("registry")
                .values()
                .cloned()
                .collect();
            for handle in handles {
                handle.notify_version_ready();
            }
        }
        warn!("version-ready fanout ended");
    });
}

pub struct Services {
    replica_path: PathBuf,
    store: Arc<CvrStore>,
    drain: Arc<DrainCoordinator>,
    registry: Registry,
    pusher: Option<PusherPool>,
    driver_factory: DriverFactory,
}

impl Services {
    /// Connects a client to its group's view syncer, creating the syncer
    /// task on first use.
    pub async fn connect(
        &self,
        client_group_id: &ClientGroupId,
        ctx: SyncContext,
    ) -> Result<mpsc::Receiver<Downstream>, ErrorBody> {
        let handle = self.view_syncer(client_group_id)?;
        handle.connect(ctx).await
    }

    pub async fn change_desired_queries(
        &self,
        client_group_id: &ClientGroupId,
        client_id: String,
        patch: Vec<zero_core::protocol::DesiredQueriesPatchOp>,
    ) -> Result<(), ErrorBody> {
        let handle = self.view_syncer(client_group_id)?;
        handle
            .send(ViewSyncerEvent::ChangeDesiredQueries { client_id, patch })
            .await;
        Ok(())
    }

    pub async fn delete_clients(
        &self,
        client_group_id: &ClientGroupId,
        client_ids: Vec<String>,
    ) -> Result<(), ErrorBody> {
        let handle = self.view_syncer(client_group_id)?;
        handle
            .send(ViewSyncerEvent::DeleteClients { client_ids })
            .await;
        Ok(())
    }

    /// Forwards a mutation batch and applies the resulting
    /// `lastMutationID` advances to the group's CVR.
    pub async fn push(
        &self,
        client_group_id: &ClientGroupId,
        body: PushBody,
    ) -> Result<PushResult, PushError> {
        let Some(pusher) = &self.pusher else {
            return Err(PushError::InvalidPush("no push endpoint configured".to_string()));
        };
        let result = pusher.push(body).await?;
        if !result.lmid_advances.is_empty() {
            if let Ok(handle) = self.view_syncer(client_group_id) {
                handle
                    .send(ViewSyncerEvent::AdvanceLastMutationIds {
                        changes: result.lmid_advances.clone(),
                    })
                    .await;
            }
        }
        Ok(result)
    }

    /// Starts a cooperative drain of this worker's view syncers.
    pub fn force_drain(&self) {
        self.drain.force_drain();
    }

    fn view_syncer(&self, client_group_id: &ClientGroupId) -> Result<ViewSyncerHandle, ErrorBody> {
        let mut registry = self.registry.lock().expect("registry");
        if let Some(handle) = registry.get(client_group_id) {
            return Ok(handle.clone());
        }
        let snapshotter = Snapshotter::new(&self.replica_path).map_err(|err| {
            error!(%err, "snapshotter open failed");
            ErrorBody::new(zero_core::error::ErrorKind::Internal, err.to_string())
        })?;
        let handle = ViewSyncer::spawn(
            client_group_id.clone(),
            self.store.clone(),
            snapshotter,
            (self.driver_factory)(),
            self.drain.clone(),
        );
        registry.insert(client_group_id.clone(), handle.clone());
        Ok(handle)
    }
}
