//! Builds executed by a managed remote build service.
//!
//! [`RemoteBuildExecutor`] submits a build, creating the remote project on
//! first use, then polls it to a terminal state while tailing its log stream
//! into the caller's logger. Polling and tailing run concurrently and are
//! both finished before `build` returns.

pub mod backend;
pub mod codebuild;
pub mod project;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, instrument, warn};

use conveyor_logs::{BuildLogger, LogChannel, LogTransport, StreamName, copy};
use conveyor_shared::{
    BuildContext, BuildOptions, ContextError, ConveyorError, ExecutorConfig, Image, Result,
};

use crate::builder::Builder;

pub use backend::{
    BuildBackend, EnvVar, PollState, ProjectSpec, RemoteBuildStatus, StartBuild,
};
pub use codebuild::CodeBuildBackend;
pub use project::{buildspec, image_repository, project_name};

/// Tracked state of one submitted remote build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBuild {
    pub remote_id: String,
    pub log_group: Option<String>,
    pub log_stream: Option<String>,
    pub poll_state: PollState,
}

impl RemoteBuild {
    fn submitted(remote_id: String) -> Self {
        Self {
            remote_id,
            log_group: None,
            log_stream: None,
            poll_state: PollState::Submitted,
        }
    }

    /// Apply a status observation. Returns the log stream the first time the
    /// remote reports one.
    fn observe(&mut self, status: RemoteBuildStatus) -> Option<StreamName> {
        self.poll_state = status.state;
        let first = self.log_stream.is_none();
        if let (Some(group), Some(stream)) = (status.log_group, status.log_stream) {
            self.log_group = Some(group.clone());
            self.log_stream = Some(stream.clone());
            if first {
                return Some(StreamName::new(group, stream));
            }
        }
        None
    }
}

/// A [`Builder`] backed by a [`BuildBackend`].
pub struct RemoteBuildExecutor {
    backend: Arc<dyn BuildBackend>,
    logs: Arc<dyn LogTransport>,
    config: ExecutorConfig,
}

impl RemoteBuildExecutor {
    /// `logs` must be able to read the log streams the backend reports.
    pub fn new(
        backend: Arc<dyn BuildBackend>,
        logs: Arc<dyn LogTransport>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            backend,
            logs,
            config,
        }
    }

    fn image_repository(&self, opts: &BuildOptions) -> String {
        image_repository(
            self.config.image_repository_prefix.as_deref(),
            &opts.repository,
        )
    }

    fn project_spec(&self, project: &str, opts: &BuildOptions) -> ProjectSpec {
        let image = self.image_repository(opts);
        let mut env = Vec::new();
        if let Some(secret) = &self.config.docker_credentials_secret {
            env.push(EnvVar::secret("DOCKER_CREDENTIALS", secret));
        }
        ProjectSpec {
            name: project.to_string(),
            source_location: format!("https://github.com/{}.git", opts.repository),
            buildspec: buildspec(&opts.repository, &image, &opts.sha, &opts.branch),
            compute_type: self.config.compute_type.clone(),
            image: self.config.build_image.clone(),
            service_role: self.config.service_role.clone(),
            env,
        }
    }

    /// Start the build, creating the project and retrying once if it is
    /// missing.
    async fn submit(&self, opts: &BuildOptions) -> Result<String> {
        let project = project_name(&opts.repository);
        let req = StartBuild {
            project: project.clone(),
            source_version: opts.sha.clone(),
            env: vec![
                EnvVar::plain("BUILD_ID", opts.id.to_string()),
                EnvVar::plain("SHA", &opts.sha),
                EnvVar::plain("BRANCH", &opts.branch),
                EnvVar::plain("NO_CACHE", if opts.no_cache { "1" } else { "0" }),
            ],
        };

        match self.backend.start_build(&req).await {
            Err(ConveyorError::ProjectNotFound { .. }) => {
                info!(%project, "build project not found, creating it");
                self.backend
                    .create_project(&self.project_spec(&project, opts))
                    .await?;
                self.backend.start_build(&req).await
            }
            other => other,
        }
    }

    /// Poll until the remote build is terminal.
    ///
    /// The first reported log stream is sent on `stream_tx`. Once `ctx` is
    /// done a stop is requested before the next status poll, and polling
    /// continues until the remote confirms a terminal state.
    async fn poll(
        &self,
        ctx: &BuildContext,
        opts: &BuildOptions,
        remote_id: String,
        stream_tx: oneshot::Sender<StreamName>,
    ) -> Result<Image> {
        let mut build = RemoteBuild::submitted(remote_id);
        let mut stream_tx = Some(stream_tx);
        let mut stop_reason: Option<ContextError> = None;
        let mut throttles = 0u32;

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                reason = ctx.done(), if stop_reason.is_none() => {
                    warn!(remote_id = %build.remote_id, %reason, "stopping remote build");
                    self.backend.stop_build(&build.remote_id).await?;
                    stop_reason = Some(reason);
                    continue;
                }
                _ = ticker.tick() => {}
            }

            let status = match self.backend.get_build(&build.remote_id).await {
                Ok(status) => {
                    throttles = 0;
                    status
                }
                Err(ConveyorError::Throttled(msg)) if throttles < self.config.max_throttles => {
                    throttles += 1;
                    debug!(remote_id = %build.remote_id, throttles, %msg, "status poll throttled");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let description = status.description.clone();
            if let Some(name) = build.observe(status) {
                debug!(remote_id = %build.remote_id, stream = %name, "remote log stream available");
                if let Some(tx) = stream_tx.take() {
                    let _ = tx.send(name);
                }
            }

            if build.poll_state.is_terminal() {
                info!(remote_id = %build.remote_id, state = ?build.poll_state, "remote build finished");
                return self.outcome(opts, &build, description, stop_reason);
            }
        }
    }

    fn outcome(
        &self,
        opts: &BuildOptions,
        build: &RemoteBuild,
        description: Option<String>,
        stop_reason: Option<ContextError>,
    ) -> Result<Image> {
        if let Some(reason) = stop_reason {
            return Err(ConveyorError::Canceled(reason));
        }
        match build.poll_state {
            PollState::Succeeded => Ok(Image::new(&self.image_repository(opts), &opts.sha)),
            PollState::Stopped => Err(ConveyorError::build_failed(
                description.unwrap_or_else(|| "build stopped".into()),
            )),
            _ => Err(ConveyorError::build_failed(
                description.unwrap_or_else(|| "build failed".into()),
            )),
        }
    }

    /// Copy the remote log stream into `logger` once it is known.
    ///
    /// After `done_rx` fires, keeps reading until the sentinel or the drain
    /// timeout, whichever comes first.
    async fn tail(
        &self,
        stream_rx: oneshot::Receiver<StreamName>,
        mut done_rx: watch::Receiver<bool>,
        logger: &mut dyn BuildLogger,
    ) -> Result<()> {
        let Ok(name) = stream_rx.await else {
            return Ok(());
        };

        let channel = LogChannel::new(self.logs.clone(), name.group.clone())
            .with_throttle(self.config.log_throttle);
        let mut reader = channel.open(&name.stream);
        let copying = copy(&mut reader, logger);
        tokio::pin!(copying);

        tokio::select! {
            res = &mut copying => return res.map(|_| ()),
            _ = done_rx.changed() => {}
        }

        match tokio::time::timeout(self.config.drain_timeout, copying).await {
            Ok(res) => res.map(|_| ()),
            Err(_) => {
                warn!(stream = %name, "timed out draining remote log stream");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Builder for RemoteBuildExecutor {
    #[instrument(skip_all, fields(build_id = %opts.id, repository = %opts.repository, sha = %opts.sha))]
    async fn build(
        &self,
        ctx: &BuildContext,
        logger: &mut dyn BuildLogger,
        opts: &BuildOptions,
    ) -> Result<Image> {
        if let Some(reason) = ctx.err() {
            return Err(ConveyorError::Canceled(reason));
        }

        let remote_id = self.submit(opts).await?;
        info!(%remote_id, "remote build submitted");

        let (stream_tx, stream_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);

        let polling = async {
            let res = self.poll(ctx, opts, remote_id, stream_tx).await;
            done_tx.send_replace(true);
            res
        };
        let tailing = self.tail(stream_rx, done_rx, logger);

        let (image, tailed) = tokio::join!(polling, tailing);
        let image = image?;
        if let Err(e) = tailed {
            warn!(error = %e, "remote log tail failed");
            return Err(e);
        }
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::testing::options;
    use conveyor_logs::{BufferLogger, EventPage, MemoryTransport, SENTINEL};

    const GROUP: &str = "/aws/codebuild/remind101-acme-inc";

    #[derive(Default)]
    struct FakeBackend {
        starts: Mutex<VecDeque<Result<String>>>,
        statuses: Mutex<VecDeque<Result<RemoteBuildStatus>>>,
        calls: Mutex<Vec<&'static str>>,
        stopped: Mutex<bool>,
    }

    impl FakeBackend {
        fn new(
            starts: Vec<Result<String>>,
            statuses: Vec<Result<RemoteBuildStatus>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                starts: Mutex::new(starts.into()),
                statuses: Mutex::new(statuses.into()),
                ..Default::default()
            })
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, call: &str) -> usize {
            self.calls().iter().filter(|c| **c == call).count()
        }
    }

    #[async_trait]
    impl BuildBackend for FakeBackend {
        async fn start_build(&self, _req: &StartBuild) -> Result<String> {
            self.calls.lock().unwrap().push("start");
            self.starts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("remind101-acme-inc:1".into()))
        }

        async fn create_project(&self, spec: &ProjectSpec) -> Result<()> {
            assert_eq!(spec.name, "remind101-acme-inc");
            self.calls.lock().unwrap().push("create");
            Ok(())
        }

        async fn get_build(&self, _remote_id: &str) -> Result<RemoteBuildStatus> {
            self.calls.lock().unwrap().push("get");
            if *self.stopped.lock().unwrap() {
                return Ok(RemoteBuildStatus::new(PollState::Stopped));
            }
            self.statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(RemoteBuildStatus::new(PollState::Running)))
        }

        async fn stop_build(&self, _remote_id: &str) -> Result<()> {
            self.calls.lock().unwrap().push("stop");
            *self.stopped.lock().unwrap() = true;
            Ok(())
        }
    }

    fn config() -> ExecutorConfig {
        ExecutorConfig {
            poll_interval: Duration::from_secs(5),
            log_throttle: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(10),
            max_throttles: 3,
            ..ExecutorConfig::default()
        }
    }

    fn executor(backend: Arc<FakeBackend>, logs: Arc<dyn LogTransport>) -> RemoteBuildExecutor {
        RemoteBuildExecutor::new(backend, logs, config())
    }

    fn running() -> Result<RemoteBuildStatus> {
        Ok(RemoteBuildStatus::new(PollState::Running).with_logs(GROUP, "1"))
    }

    fn terminal(state: PollState) -> Result<RemoteBuildStatus> {
        Ok(RemoteBuildStatus::new(state).with_logs(GROUP, "1"))
    }

    async fn remote_log(lines: &[&str]) -> Arc<MemoryTransport> {
        let logs = Arc::new(MemoryTransport::new());
        let mut events: Vec<Vec<u8>> = lines.iter().map(|l| l.as_bytes().to_vec()).collect();
        events.push(vec![SENTINEL, b'\n']);
        logs.put_events(&StreamName::new(GROUP, "1"), &events)
            .await
            .unwrap();
        logs
    }

    #[tokio::test(start_paused = true)]
    async fn success_tails_logs_and_tags_image() {
        let backend = FakeBackend::new(vec![], vec![running(), terminal(PollState::Succeeded)]);
        let logs = remote_log(&["Step 1/2\n", "Step 2/2\n"]).await;
        let executor = executor(backend.clone(), logs);
        let opts = options();

        let mut logger = BufferLogger::new();
        let image = executor
            .build(&BuildContext::background(), &mut logger, &opts)
            .await
            .unwrap();

        assert_eq!(image.to_string(), format!("remind101/acme-inc:{}", opts.sha));
        assert_eq!(logger.contents(), b"Step 1/2\nStep 2/2\n");
        assert_eq!(backend.calls(), vec!["start", "get", "get"]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_project_is_created_once() {
        let not_found = || {
            Err(ConveyorError::ProjectNotFound {
                project: "remind101-acme-inc".into(),
            })
        };
        let backend = FakeBackend::new(
            vec![not_found(), Ok("remind101-acme-inc:1".into())],
            vec![terminal(PollState::Succeeded)],
        );
        let executor = executor(backend.clone(), remote_log(&[]).await);

        let mut logger = BufferLogger::new();
        executor
            .build(&BuildContext::background(), &mut logger, &options())
            .await
            .unwrap();
        assert_eq!(backend.count("create"), 1);
        assert_eq!(backend.count("start"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_project_after_create_is_not_retried_again() {
        let not_found = || {
            Err(ConveyorError::ProjectNotFound {
                project: "remind101-acme-inc".into(),
            })
        };
        let backend = FakeBackend::new(vec![not_found(), not_found(), Ok("x".into())], vec![]);
        let executor = executor(backend.clone(), Arc::new(MemoryTransport::new()));

        let mut logger = BufferLogger::new();
        let err = executor
            .build(&BuildContext::background(), &mut logger, &options())
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::ProjectNotFound { .. }));
        assert_eq!(backend.calls(), vec!["start", "create", "start"]);
    }

    #[tokio::test(start_paused = true)]
    async fn other_submission_errors_are_fatal() {
        let backend = FakeBackend::new(vec![Err(ConveyorError::Backend("boom".into()))], vec![]);
        let executor = executor(backend.clone(), Arc::new(MemoryTransport::new()));

        let mut logger = BufferLogger::new();
        let err = executor
            .build(&BuildContext::background(), &mut logger, &options())
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::Backend(_)));
        assert_eq!(backend.calls(), vec!["start"]);
    }

    #[tokio::test(start_paused = true)]
    async fn done_context_never_contacts_backend() {
        let backend = FakeBackend::new(vec![], vec![]);
        let executor = executor(backend.clone(), Arc::new(MemoryTransport::new()));
        let ctx = BuildContext::background();
        ctx.cancel();

        let mut logger = BufferLogger::new();
        let err = executor.build(&ctx, &mut logger, &options()).await.unwrap_err();
        assert_eq!(err.cancel_reason(), Some(ContextError::Canceled));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_stops_before_next_poll() {
        let backend = FakeBackend::new(vec![], vec![]);
        let executor = executor(backend.clone(), Arc::new(MemoryTransport::new()));
        let ctx = BuildContext::background().with_timeout(Duration::from_secs(12));

        let mut logger = BufferLogger::new();
        let err = executor.build(&ctx, &mut logger, &options()).await.unwrap_err();

        assert_eq!(err.cancel_reason(), Some(ContextError::DeadlineExceeded));
        // Polls at 0s, 5s and 10s; the deadline at 12s stops the build and
        // the 15s poll observes STOPPED.
        assert_eq!(backend.calls(), vec!["start", "get", "get", "get", "stop", "get"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_tailing_keeps_partial_logs() {
        let backend = FakeBackend::new(vec![], vec![running()]);
        let logs = Arc::new(MemoryTransport::new());
        logs.put_events(&StreamName::new(GROUP, "1"), &[b"Step 1/2\n".to_vec()])
            .await
            .unwrap();
        let executor = executor(backend.clone(), logs);
        let ctx = BuildContext::background();

        let canceler = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            canceler.cancel();
        });

        let mut logger = BufferLogger::new();
        let err = executor.build(&ctx, &mut logger, &options()).await.unwrap_err();
        assert_eq!(err.cancel_reason(), Some(ContextError::Canceled));
        assert_eq!(logger.contents(), b"Step 1/2\n");
        assert_eq!(backend.count("stop"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_polls_are_skipped() {
        let throttled = || Err(ConveyorError::Throttled("Rate exceeded".into()));
        let backend = FakeBackend::new(
            vec![],
            vec![throttled(), throttled(), terminal(PollState::Succeeded)],
        );
        let executor = executor(backend.clone(), remote_log(&[]).await);

        let mut logger = BufferLogger::new();
        executor
            .build(&BuildContext::background(), &mut logger, &options())
            .await
            .unwrap();
        assert_eq!(backend.count("get"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn too_many_throttles_fail_the_build() {
        let throttled = || Err(ConveyorError::Throttled("Rate exceeded".into()));
        let backend = FakeBackend::new(
            vec![],
            vec![throttled(), throttled(), throttled(), throttled()],
        );
        let executor = executor(backend.clone(), Arc::new(MemoryTransport::new()));

        let mut logger = BufferLogger::new();
        let err = executor
            .build(&BuildContext::background(), &mut logger, &options())
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::Throttled(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_failure_carries_description() {
        let failed = Ok(RemoteBuildStatus::new(PollState::Failed)
            .with_logs(GROUP, "1")
            .with_description("BUILD: exit status 1"));
        let backend = FakeBackend::new(vec![], vec![failed]);
        let executor = executor(backend, remote_log(&["oops\n"]).await);

        let mut logger = BufferLogger::new();
        let err = executor
            .build(&BuildContext::background(), &mut logger, &options())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "build failed: BUILD: exit status 1");
        assert_eq!(logger.contents(), b"oops\n");
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_without_local_request_is_a_failure() {
        let backend = FakeBackend::new(vec![], vec![terminal(PollState::Stopped)]);
        let executor = executor(backend, remote_log(&[]).await);

        let mut logger = BufferLogger::new();
        let err = executor
            .build(&BuildContext::background(), &mut logger, &options())
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::BuildFailed { .. }));
        assert_eq!(err.cancel_reason(), None);
    }

    struct BrokenLogs;

    #[async_trait]
    impl LogTransport for BrokenLogs {
        async fn create_stream(&self, _name: &StreamName) -> Result<()> {
            Ok(())
        }

        async fn put_events(&self, _name: &StreamName, _events: &[Vec<u8>]) -> Result<()> {
            Ok(())
        }

        async fn get_events(&self, _name: &StreamName, _token: Option<&str>) -> Result<EventPage> {
            Err(ConveyorError::LogTransport("AccessDeniedException".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn log_errors_surface_on_success() {
        let backend = FakeBackend::new(vec![], vec![running(), terminal(PollState::Succeeded)]);
        let executor = executor(backend, Arc::new(BrokenLogs));

        let mut logger = BufferLogger::new();
        let err = executor
            .build(&BuildContext::background(), &mut logger, &options())
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::LogTransport(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_sentinel_is_bounded_by_drain_timeout() {
        let backend = FakeBackend::new(vec![], vec![terminal(PollState::Succeeded)]);
        let logs = Arc::new(MemoryTransport::new());
        logs.put_events(&StreamName::new(GROUP, "1"), &[b"partial\n".to_vec()])
            .await
            .unwrap();
        let executor = executor(backend, logs);

        let started = tokio::time::Instant::now();
        let mut logger = BufferLogger::new();
        executor
            .build(&BuildContext::background(), &mut logger, &options())
            .await
            .unwrap();
        assert_eq!(logger.contents(), b"partial\n");
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_trailer_after_sentinel_is_not_copied() {
        let backend = FakeBackend::new(vec![], vec![terminal(PollState::Succeeded)]);
        let logs = Arc::new(MemoryTransport::new());
        logs.put_events(
            &StreamName::new(GROUP, "1"),
            &[
                b"Step 1/1\n".to_vec(),
                vec![SENTINEL],
                b"[Container] 2024/01/01 Phase complete: POST_BUILD State: SUCCEEDED\n".to_vec(),
            ],
        )
        .await
        .unwrap();
        let executor = executor(backend, logs);

        let started = tokio::time::Instant::now();
        let mut logger = BufferLogger::new();
        executor
            .build(&BuildContext::background(), &mut logger, &options())
            .await
            .unwrap();

        assert_eq!(logger.contents(), b"Step 1/1\n");
        assert!(!logger.contents().contains(&SENTINEL));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
