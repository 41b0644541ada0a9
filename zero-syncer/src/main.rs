use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;
use zero_storage::postgres::Shard;
use zero_syncer::services::ServicesBuilder;

/// One shard's worth of sync services: change source, replicator, view
/// syncers, pusher.
#[derive(Parser, Debug)]
#[command(name = "zero-syncer", version)]
struct SyncerArgs {
    /// Upstream Postgres (logical replication enabled).
    #[arg(long, env = "ZERO_UPSTREAM_DB")]
    upstream_db: String,

    /// CVR/CDC Postgres database.
    #[arg(long, env = "ZERO_CVR_DB")]
    cvr_db: String,

    /// Path of the local replica file.
    #[arg(long, env = "ZERO_REPLICA_FILE")]
    replica_file: String,

    #[arg(long, env = "ZERO_APP_ID", default_value = "zero")]
    app_id: String,

    #[arg(long, env = "ZERO_SHARD_NUM", default_value_t = 0)]
    shard_num: u16,

    /// Publications to replicate, comma separated.
    #[arg(long, env = "ZERO_PUBLICATIONS", value_delimiter = ',', default_value = "zero_all")]
    publications: Vec<String>,

    /// Tables excluded from replication, as schema.table, comma
    /// separated.
    #[arg(long, env = "ZERO_IGNORED_TABLES", value_delimiter = ',')]
    ignored_tables: Vec<String>,

    /// Whether DDL event triggers are installed upstream.
    #[arg(long, env = "ZERO_DDL_TRIGGERS", default_value_t = false)]
    ddl_triggers: bool,

    /// Custom-mutator push endpoint.
    #[arg(long, env = "ZERO_PUSH_URL")]
    push_url: Option<Url>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = SyncerArgs::parse();
    let shard = Shard::new(args.app_id.clone(), args.shard_num);

    let mut builder = ServicesBuilder::new(
        &args.upstream_db,
        &args.cvr_db,
        &args.replica_file,
        shard,
    )
    .publications(args.publications.clone())
    .ddl_triggers(args.ddl_triggers);
    for spec in &args.ignored_tables {
        let (schema, table) = spec
            .split_once('.')
            .with_context(|| format!("ignored table {spec} is not schema.table"))?;
        builder = builder.ignore_table(schema, table);
    }
    if let Some(push_url) = args.push_url.clone() {
        builder = builder.push_endpoint(push_url);
    }

    let services = builder
        .run()
        .await
        .context("starting sync services")?;
    info!(shard = %args.shard_num, "zero-syncer up");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested; draining");
    services.force_drain();
    Ok(())
}
