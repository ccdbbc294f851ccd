//! Commit status reporting around a build.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use conveyor_logs::BuildLogger;
use conveyor_shared::{BuildContext, BuildOptions, Clock, Image, Result, format_duration};

use crate::builder::{Builder, Canceler};

/// GitHub rejects status descriptions longer than this.
pub const MAX_DESCRIPTION_LEN: usize = 140;

const PENDING_DESCRIPTION: &str = "Image building.";

/// State of a commit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Pending,
    Success,
    Failure,
    Error,
}

impl StatusState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status report for a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitStatus {
    pub owner: String,
    pub repo: String,
    pub sha: String,
    pub state: StatusState,
    pub description: String,
    pub target_url: Option<String>,
}

/// Where commit statuses are published.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn set_status(&self, status: &CommitStatus) -> Result<()>;
}

/// Reports `pending` before a build and its outcome after.
pub struct StatusUpdater {
    inner: Arc<dyn Builder>,
    sink: Arc<dyn StatusSink>,
    clock: Arc<dyn Clock>,
}

impl StatusUpdater {
    pub fn new(inner: Arc<dyn Builder>, sink: Arc<dyn StatusSink>, clock: Arc<dyn Clock>) -> Self {
        Self { inner, sink, clock }
    }
}

/// Truncate to [`MAX_DESCRIPTION_LEN`] characters.
pub fn truncate_description(description: &str) -> String {
    description.chars().take(MAX_DESCRIPTION_LEN).collect()
}

/// The status reported once a build returned.
fn outcome(result: &Result<Image>, elapsed: String) -> (StatusState, String) {
    match result {
        Ok(_) => (StatusState::Success, format!("Image built in {elapsed}.")),
        Err(err) if err.is_interrupted() => (StatusState::Error, err.to_string()),
        Err(err) => (StatusState::Failure, err.to_string()),
    }
}

async fn publish(sink: &dyn StatusSink, status: CommitStatus) {
    if let Err(e) = sink.set_status(&status).await {
        warn!(
            sha = %status.sha,
            state = %status.state,
            error = %e,
            "failed to update commit status"
        );
    }
}

/// Reports a terminal `error` status if the build future is dropped before
/// the final status went out.
///
/// A dropped future cannot await, so this report is published from a spawned
/// task and is the only work here that outlives `build`.
struct FinalStatus {
    sink: Arc<dyn StatusSink>,
    status: Option<CommitStatus>,
}

impl FinalStatus {
    fn disarm(&mut self) -> Option<CommitStatus> {
        self.status.take()
    }
}

impl Drop for FinalStatus {
    fn drop(&mut self) {
        let Some(mut status) = self.status.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        status.state = StatusState::Error;
        status.description = "Build interrupted.".into();
        let sink = self.sink.clone();
        handle.spawn(async move { publish(sink.as_ref(), status).await });
    }
}

#[async_trait]
impl Builder for StatusUpdater {
    async fn build(
        &self,
        ctx: &BuildContext,
        logger: &mut dyn BuildLogger,
        opts: &BuildOptions,
    ) -> Result<Image> {
        let Ok((owner, repo)) = opts.owner_and_name() else {
            warn!(
                repository = %opts.repository,
                sha = %opts.sha,
                "repository is not owner/name, skipping commit statuses"
            );
            return self.inner.build(ctx, logger, opts).await;
        };
        let template = CommitStatus {
            owner: owner.to_string(),
            repo: repo.to_string(),
            sha: opts.sha.clone(),
            state: StatusState::Pending,
            description: PENDING_DESCRIPTION.into(),
            target_url: logger.url().map(str::to_string),
        };

        publish(self.sink.as_ref(), template.clone()).await;

        let mut guard = FinalStatus {
            sink: self.sink.clone(),
            status: Some(template),
        };
        let started = self.clock.now();
        let result = self.inner.build(ctx, logger, opts).await;
        let elapsed = format_duration(self.clock.since(started));

        if let Some(mut status) = guard.disarm() {
            let (state, description) = outcome(&result, elapsed);
            status.state = state;
            status.description = truncate_description(&description);
            publish(self.sink.as_ref(), status).await;
        }
        result
    }

    fn canceler(&self) -> Option<&dyn Canceler> {
        self.inner.canceler()
    }
}
