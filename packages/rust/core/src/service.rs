//! The [`Conveyor`] service: queue, workers, and builder chain wired together.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};
use url::Url;

use conveyor_builder::{
    Builder, CancelTracker, EventNotifier, EventSink, StatsRecorder, StatsSink, StatusSink,
    StatusUpdater,
};
use conveyor_logs::{
    ChannelLoggerFactory, CloudWatchTransport, LogChannel, LogTransport, LoggerFactory,
    MemoryTransport,
};
use conveyor_shared::{
    BuildContext, BuildOptions, Clock, ConveyorError, IdGenerator, LogBackend, LogConfig,
    PoolConfig, Result, split_repository,
};
use conveyor_storage::Storage;

use crate::lifecycle::BuildLifecycle;
use crate::push::PushEvent;
use crate::queue::BuildQueue;
use crate::worker::WorkerPool;

// ---------------------------------------------------------------------------
// Builder chain
// ---------------------------------------------------------------------------

/// Collaborators the builder decorators report to.
#[derive(Clone)]
pub struct Sinks {
    pub status: Arc<dyn StatusSink>,
    pub stats: Arc<dyn StatsSink>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
}

/// Wrap `executor` in the standard decorator chain:
/// `EventNotifier(StatsRecorder(StatusUpdater(CancelTracker(executor))))`.
pub fn decorate(executor: Arc<dyn Builder>, sinks: &Sinks) -> Arc<dyn Builder> {
    let tracked: Arc<dyn Builder> = Arc::new(CancelTracker::new(executor));
    let status: Arc<dyn Builder> = Arc::new(StatusUpdater::new(
        tracked,
        sinks.status.clone(),
        sinks.clock.clone(),
    ));
    let stats: Arc<dyn Builder> = Arc::new(StatsRecorder::new(
        status,
        sinks.stats.clone(),
        sinks.clock.clone(),
    ));
    Arc::new(EventNotifier::new(
        stats,
        sinks.events.clone(),
        sinks.clock.clone(),
    ))
}

// ---------------------------------------------------------------------------
// Log transports
// ---------------------------------------------------------------------------

/// Open the configured log transport.
///
/// `readonly` opens the local store without write access, for log viewers.
pub async fn open_log_transport(config: &LogConfig, readonly: bool) -> Result<Arc<dyn LogTransport>> {
    debug!(backend = ?config.backend, readonly, "opening log transport");
    match config.backend {
        LogBackend::Memory => Ok(Arc::new(MemoryTransport::new())),
        LogBackend::Local if readonly => Ok(Arc::new(Storage::open_readonly(&config.local_path).await?)),
        LogBackend::Local => Ok(Arc::new(Storage::open(&config.local_path).await?)),
        LogBackend::Cloudwatch => Ok(Arc::new(CloudWatchTransport::new(parse_endpoint(
            &config.endpoint,
        )?)?)),
    }
}

/// Parse a service endpoint from config.
pub fn parse_endpoint(endpoint: &str) -> Result<Url> {
    Url::parse(endpoint)
        .map_err(|e| ConveyorError::config(format!("invalid endpoint '{endpoint}': {e}")))
}

/// Build logs channel for `config`.
pub fn log_channel(transport: Arc<dyn LogTransport>, config: &LogConfig) -> LogChannel {
    LogChannel::new(transport, config.group.clone()).with_throttle(config.throttle)
}

/// One log stream per build, linked from `url_base` when configured.
pub fn logger_factory(channel: LogChannel, config: &LogConfig) -> ChannelLoggerFactory {
    let factory = ChannelLoggerFactory::new(channel);
    match &config.url_base {
        Some(base) => factory.with_url_base(base.clone()),
        None => factory,
    }
}

// ---------------------------------------------------------------------------
// Conveyor
// ---------------------------------------------------------------------------

/// A build to enqueue; the service assigns its ID.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub repository: String,
    pub sha: String,
    pub branch: String,
    pub no_cache: bool,
}

/// Accepts builds and runs them on a worker pool.
pub struct Conveyor {
    queue: BuildQueue,
    pool: WorkerPool,
    ids: Arc<dyn IdGenerator>,
    build_timeout: Duration,
    root: BuildContext,
}

impl Conveyor {
    pub fn new(
        builder: Arc<dyn Builder>,
        loggers: Arc<dyn LoggerFactory>,
        lifecycle: Arc<dyn BuildLifecycle>,
        ids: Arc<dyn IdGenerator>,
        config: &PoolConfig,
    ) -> Self {
        let queue = BuildQueue::new(config.queue_capacity);
        let pool = WorkerPool::new(builder, loggers, lifecycle, queue.subscribe(), config.workers);
        Self {
            queue,
            pool,
            ids,
            build_timeout: config.build_timeout,
            root: BuildContext::background(),
        }
    }

    pub fn start(&mut self) {
        self.pool.start();
    }

    pub fn queue(&self) -> &BuildQueue {
        &self.queue
    }

    /// Enqueue a build with a fresh ID and the configured timeout.
    ///
    /// Waits while the queue is full.
    #[instrument(skip_all, fields(repository = %build.repository, sha = %build.sha))]
    pub async fn enqueue(&self, build: NewBuild) -> Result<BuildOptions> {
        split_repository(&build.repository)?;
        let options = BuildOptions {
            id: self.ids.next_id(),
            repository: build.repository,
            sha: build.sha,
            branch: build.branch,
            no_cache: build.no_cache,
        };
        let ctx = self.root.with_timeout(self.build_timeout);
        self.queue.push(&ctx, options.clone()).await?;
        info!(build_id = %options.id, "build enqueued");
        Ok(options)
    }

    /// Enqueue the build for a GitHub push payload.
    ///
    /// Returns `None` for pushes that are not built.
    pub async fn handle_push(&self, payload: &[u8]) -> Result<Option<BuildOptions>> {
        let event = PushEvent::parse(payload)?;
        let Some(options) = event.build_options(self.ids.next_id()) else {
            debug!(git_ref = %event.git_ref, "ignoring push");
            return Ok(None);
        };
        let ctx = self.root.with_timeout(self.build_timeout);
        self.queue.push(&ctx, options.clone()).await?;
        info!(build_id = %options.id, repository = %options.repository, "push enqueued");
        Ok(Some(options))
    }

    /// Stop the workers, cancel in-flight builds, and abandon queued ones.
    pub async fn shutdown(&mut self) -> Result<()> {
        let result = self.pool.shutdown().await;
        self.root.cancel();
        result
    }
}
