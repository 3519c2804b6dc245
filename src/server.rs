use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    bus::{EventBus, MemoryBus, SqliteJournal, StreamConfig, Subscription},
    config::{Config, ObjectStoreBackend},
    consumers::{self, ArchiveWriter, ArchiverConsumer, HotStorageConsumer},
    handlers::{self, AppState},
    index::MemoryIndex,
    ingest::IngestGateway,
    metrics,
    search::SearchService,
    signals::setup_signal_handlers,
    storage::{FsObjectStore, MemoryObjectStore, ObjectStore, SqliteKvStore},
    tail::LiveTail,
};

/// Start the log-beacon server
///
/// This function:
/// 1. Initializes metrics
/// 2. Sets up signal handlers for graceful shutdown
/// 3. Starts the pipeline (bus, stores, consumers)
/// 4. Binds to the configured address
/// 5. Serves requests until shutdown, then stops the pipeline
pub async fn start_server(config: Config) -> Result<()> {
    let metrics_handle = if config.metrics.enabled {
        info!("Initializing Prometheus metrics...");
        Some(Arc::new(metrics::init_metrics()?))
    } else {
        None
    };

    let shutdown = CancellationToken::new();
    let signal_handle = setup_signal_handlers(shutdown.clone());

    let pipeline = Pipeline::start(&config).await?;
    let state = pipeline.app_state(&config, shutdown.clone());

    let metrics_route = metrics_handle.map(|handle| (config.metrics.endpoint.as_str(), handle));
    let app = create_router(state, metrics_route);

    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    info!("Starting log-beacon on {}", addr);
    info!(
        "Configuration: stream '{}', subject '{}', archiver {}, hot storage {}",
        config.bus.stream,
        config.bus.subject,
        enabled_label(config.archiver.enabled),
        enabled_label(config.hot_storage.enabled),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let graceful = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            graceful.cancelled().await;
            info!("Shutdown signal received, draining connections...");
        })
        .await;

    // Serve errors still tear the pipeline down
    shutdown.cancel();
    pipeline.shutdown().await;
    signal_handle.await?;
    served?;

    info!("Server stopped gracefully");
    Ok(())
}

/// Create the Axum router with all routes and middleware
///
/// Log endpoints are mounted at the root and under `/api/v1`.
pub fn create_router(
    state: AppState,
    metrics: Option<(&str, Arc<PrometheusHandle>)>,
) -> Router {
    let api = Router::new()
        .route("/ingest", post(handlers::ingest::ingest_log))
        .route("/search", get(handlers::search::search_logs))
        .route("/tail", get(handlers::tail::tail_logs));

    let mut app = Router::new()
        .merge(api.clone())
        .nest("/api/v1", api)
        .with_state(state)
        .route("/health", get(handlers::health::health_check));

    if let Some((endpoint, handle)) = metrics {
        app = app.merge(
            Router::new()
                .route(endpoint, get(handlers::metrics_handler::metrics))
                .with_state(handle),
        );
    }

    app
        // Limit request body size to 10MB
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
}

/// The running ingest pipeline: bus, stores and durable consumers
pub struct Pipeline {
    pub bus: Arc<MemoryBus>,
    pub kv: Arc<SqliteKvStore>,
    pub index: Arc<MemoryIndex>,
    pub objects: Arc<dyn ObjectStore>,
    journal: Option<Arc<SqliteJournal>>,
    drain_timeout: Duration,
    subscriptions: Vec<Subscription>,
}

impl Pipeline {
    /// Provision the stream and stores, then start the enabled consumers
    ///
    /// Fails if the archive bucket cannot be ensured within the configured
    /// retry budget or the key-value store cannot be opened.
    pub async fn start(config: &Config) -> Result<Self> {
        let (bus, journal) = if config.bus.is_durable() {
            ensure_database_dir(&config.bus.journal_url)?;
            let journal = Arc::new(
                SqliteJournal::connect(&config.bus.journal_url)
                    .await
                    .context("Failed to open bus journal")?,
            );
            let bus = MemoryBus::open(config.bus.bus_options(), journal.clone())
                .await
                .context("Failed to restore bus state")?;
            (Arc::new(bus), Some(journal))
        } else {
            warn!("Bus journal disabled; unprocessed records are lost on restart");
            (Arc::new(MemoryBus::new(config.bus.bus_options())), None)
        };

        let created = bus
            .ensure_stream(StreamConfig {
                name: config.bus.stream.clone(),
                subjects: vec![config.bus.subject.clone()],
            })
            .await?;
        info!(
            stream = %config.bus.stream,
            created = created,
            "Stream ready"
        );

        let objects: Arc<dyn ObjectStore> = match config.object_store.backend {
            ObjectStoreBackend::Filesystem => {
                Arc::new(FsObjectStore::new(&config.object_store.root))
            }
            ObjectStoreBackend::Memory => Arc::new(MemoryObjectStore::new()),
        };

        ensure_database_dir(&config.hot_storage.database_url)?;
        let kv = Arc::new(
            SqliteKvStore::connect(&config.hot_storage.database_url)
                .await
                .context("Failed to open hot storage")?,
        );
        let index = Arc::new(MemoryIndex::new());

        let mut pipeline = Self {
            bus,
            kv,
            index,
            objects,
            journal,
            drain_timeout: config.bus.drain_timeout(),
            subscriptions: Vec::new(),
        };

        if config.hot_storage.reindex_on_startup {
            consumers::reconcile_index(
                pipeline.kv.as_ref(),
                pipeline.index.as_ref(),
                config.hot_storage.reindex_batch_size,
            )
            .await
            .context("Failed to rebuild search index")?;
        }

        let started = pipeline.start_consumers(config).await;
        if let Err(e) = started {
            pipeline.shutdown().await;
            return Err(e);
        }

        Ok(pipeline)
    }

    async fn start_consumers(&mut self, config: &Config) -> Result<()> {
        if config.archiver.enabled {
            let writer = ArchiveWriter::new(self.objects.clone(), &config.archiver.bucket);
            writer
                .ensure_bucket(
                    config.archiver.bucket_retry_attempts,
                    Duration::from_secs(config.archiver.bucket_retry_delay_seconds),
                )
                .await
                .with_context(|| {
                    format!("Failed to ensure bucket '{}'", config.archiver.bucket)
                })?;

            let subscription = consumers::start_consumer(
                self.bus.as_ref(),
                &config.bus.subject,
                &config.archiver.queue_group,
                Arc::new(ArchiverConsumer::new(writer)),
            )
            .await?;
            self.subscriptions.push(subscription);
        } else {
            warn!("Archiver disabled; records will not be archived");
        }

        if config.hot_storage.enabled {
            let subscription = consumers::start_consumer(
                self.bus.as_ref(),
                &config.bus.subject,
                &config.hot_storage.queue_group,
                Arc::new(HotStorageConsumer::new(self.kv.clone(), self.index.clone())),
            )
            .await?;
            self.subscriptions.push(subscription);
        } else {
            warn!("Hot storage disabled; new records will not be searchable");
        }

        Ok(())
    }

    /// Handler state over this pipeline
    pub fn app_state(&self, config: &Config, shutdown: CancellationToken) -> AppState {
        let bus: Arc<dyn EventBus> = self.bus.clone();
        AppState {
            gateway: Arc::new(IngestGateway::new(bus.clone(), &config.bus.subject)),
            search: Arc::new(SearchService::new(self.index.clone(), self.kv.clone())),
            tail: Arc::new(LiveTail::new(bus, &config.bus.subject, config.tail.settings())),
            shutdown,
        }
    }

    /// Leave the queue groups and drain the bus before closing the stores
    ///
    /// Handlers still writing to the key-value store finish first, up to the
    /// configured drain timeout.
    pub async fn shutdown(mut self) {
        for subscription in self.subscriptions.drain(..) {
            info!(durable = subscription.durable_name(), "Unsubscribing consumer");
            subscription.unsubscribe();
        }
        self.bus.shutdown(self.drain_timeout).await;
        if let Some(journal) = &self.journal {
            journal.close().await;
        }
        self.kv.close().await;
        info!("Pipeline stopped");
    }
}

/// Create the parent directory of a file-backed SQLite URL
fn ensure_database_dir(database_url: &str) -> Result<()> {
    if database_url.contains(":memory:") {
        return Ok(());
    }
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = path.split('?').next().unwrap_or(path);

    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
    }
    Ok(())
}

fn enabled_label(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}
