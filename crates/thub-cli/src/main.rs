use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use thub_core::ChannelRegistry;
use thub_ingest::{assemble_jobs, load_schedules, IngestConfig, IngestScheduler, Normalizer};
use thub_sources::{build_default_sources, HttpClientConfig, HttpFetcher, SourceSettings};
use thub_storage::{ConnectRetryPolicy, MemoryCache, MemoryShards, PgShards, ShardBackend, Store};
use thub_web::AppState;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "thub")]
#[command(about = "TrendingHub ingestion and read API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API, with scheduled ingestion unless disabled.
    Serve,
    /// Run one ingestion cycle and print the per-source outcomes.
    Collect {
        /// Only this source.
        #[arg(long)]
        source: Option<String>,
        /// Keep fetched records in memory instead of writing to Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Create or upgrade the shard tables and exit.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    let json = std::env::var("THUB_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&config).await?,
        Commands::Collect { source, dry_run } => {
            if dry_run {
                let store = Store::new(MemoryShards::new(), Arc::new(ChannelRegistry::standard()));
                store.ensure_schema().await?;
                collect(&config, &store, source.as_deref()).await?;
            } else {
                let store = open_store(&config).await?;
                collect(&config, &store, source.as_deref()).await?;
            }
        }
        Commands::Migrate => {
            open_store(&config).await?;
            println!("schema up to date");
        }
    }
    Ok(())
}

async fn open_store(config: &IngestConfig) -> Result<Store<PgShards>> {
    let retry = ConnectRetryPolicy {
        attempts: config.db_connect_attempts,
        delay: config.db_connect_delay,
    };
    let shards = PgShards::connect(
        &config.database_url,
        config.db_max_connections,
        config.db_statement_timeout,
        retry,
    )
    .await
    .context("connecting to postgres")?;
    let store = Store::new(shards, Arc::new(ChannelRegistry::standard()))
        .with_cache(Arc::new(MemoryCache::new(config.cache_max_entries)), config.cache_ttl);
    store.ensure_schema().await.context("ensuring shard schema")?;
    Ok(store)
}

fn build_scheduler<B: ShardBackend>(config: &IngestConfig, store: &Store<B>) -> Result<IngestScheduler> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })
    .context("building http client")?;
    let sources = build_default_sources(Arc::new(http), &SourceSettings::from_env());
    let schedules = load_schedules(&config.sources_file)?;
    let jobs = assemble_jobs(sources, &schedules, Some(Arc::new(store.clone())));
    info!(jobs = jobs.len(), "ingestion jobs assembled");
    Ok(IngestScheduler::new(jobs, Arc::new(store.clone()), Normalizer::default()))
}

async fn serve(config: &IngestConfig) -> Result<()> {
    let store = open_store(config).await?;
    let mut state = AppState::new(Arc::new(store.clone()));

    // Held for the lifetime of the server; dropping it stops the cron jobs.
    let mut _cron = None;
    if config.scheduler_enabled {
        let scheduler = Arc::new(build_scheduler(config, &store)?);
        _cron = Some(Arc::clone(&scheduler).start(config.startup_delay).await?);
        state = state.with_scheduler(scheduler);
    } else {
        info!("scheduled ingestion disabled");
    }

    thub_web::serve(state, config.web_port).await
}

async fn collect<B: ShardBackend>(
    config: &IngestConfig,
    store: &Store<B>,
    only: Option<&str>,
) -> Result<()> {
    let scheduler = build_scheduler(config, store)?;
    let reports = match only {
        Some(name) => vec![scheduler
            .run_source(name)
            .await
            .with_context(|| format!("no enabled source named {name}"))?],
        None => scheduler.run_all_once().await,
    };
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}
