//! Worker pool that drains the build queue.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use conveyor_builder::Builder;
use conveyor_logs::LoggerFactory;
use conveyor_shared::{ConveyorError, Result};

use crate::lifecycle::BuildLifecycle;
use crate::queue::{BuildRequest, Subscription};

/// Everything a worker task needs, shared by all of them.
struct WorkerShared {
    builder: Arc<dyn Builder>,
    loggers: Arc<dyn LoggerFactory>,
    lifecycle: Arc<dyn BuildLifecycle>,
    queue: Subscription,
    shutdown: CancellationToken,
}

/// `workers` tasks, each running one build at a time.
pub struct WorkerPool {
    shared: Arc<WorkerShared>,
    workers: usize,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        builder: Arc<dyn Builder>,
        loggers: Arc<dyn LoggerFactory>,
        lifecycle: Arc<dyn BuildLifecycle>,
        queue: Subscription,
        workers: usize,
    ) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                builder,
                loggers,
                lifecycle,
                queue,
                shutdown: CancellationToken::new(),
            }),
            workers: workers.max(1),
            handles: Vec::new(),
        }
    }

    /// Spawn the worker tasks. Calling it again is a no-op.
    pub fn start(&mut self) {
        if !self.handles.is_empty() {
            return;
        }
        info!(workers = self.workers, "starting worker pool");
        for n in 0..self.workers {
            let shared = self.shared.clone();
            self.handles.push(tokio::spawn(run_worker(n, shared)));
        }
    }

    /// Stop pulling new builds, cancel in-flight ones if the builder can,
    /// and wait for every worker to exit.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("shutting down worker pool");
        self.shared.shutdown.cancel();

        if let Some(canceler) = self.shared.builder.canceler() {
            canceler.cancel().await?;
        }

        let mut panicked = 0;
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task failed");
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(ConveyorError::Backend(format!(
                "{panicked} worker task(s) did not exit cleanly"
            )));
        }
        debug!("worker pool stopped");
        Ok(())
    }
}

async fn run_worker(n: usize, shared: Arc<WorkerShared>) {
    debug!(worker = n, "worker started");
    loop {
        let request = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            request = shared.queue.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        process(&shared, request).await;
    }
    debug!(worker = n, "worker stopped");
}

#[instrument(skip_all, fields(build_id = %request.options.id, repository = %request.options.repository))]
async fn process(shared: &WorkerShared, request: BuildRequest) {
    let BuildRequest { options, ctx } = request;
    shared.lifecycle.started(&options);

    let mut logger = match shared.loggers.create(&options).await {
        Ok(logger) => logger,
        Err(e) => {
            shared.lifecycle.failed(&options, &e);
            return;
        }
    };

    let result = shared.builder.build(&ctx, logger.as_mut(), &options).await;

    if let Err(e) = logger.close().await {
        warn!(error = %e, "failed to close build log");
    }

    match result {
        Ok(image) => shared.lifecycle.complete(&options, &image),
        Err(e) => shared.lifecycle.failed(&options, &e),
    }
}
