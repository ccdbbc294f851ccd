//! Fakes shared by the unit tests in this crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;

use conveyor_logs::BuildLogger;
use conveyor_shared::{
    BuildContext, BuildId, BuildOptions, Clock, ConveyorError, Image, Result,
};

use crate::builder::Builder;
use crate::status::{CommitStatus, StatusSink};

pub fn options() -> BuildOptions {
    BuildOptions {
        id: BuildId::new(),
        repository: "remind101/acme-inc".into(),
        sha: "827fecd2d36ebeaa2fd05aa8ef3eed1e56a8cd57".into(),
        branch: "master".into(),
        no_cache: false,
    }
}

/// Returns whatever the closure returns, after writing one log line.
pub struct FnBuilder<F> {
    f: F,
}

impl<F> FnBuilder<F>
where
    F: Fn(&BuildOptions) -> Result<Image> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Builder for FnBuilder<F>
where
    F: Fn(&BuildOptions) -> Result<Image> + Send + Sync,
{
    async fn build(
        &self,
        _ctx: &BuildContext,
        logger: &mut dyn BuildLogger,
        opts: &BuildOptions,
    ) -> Result<Image> {
        logger.write_line("building").await?;
        (self.f)(opts)
    }
}

/// Blocks until its context is done.
pub struct BlockingBuilder {
    calls: Arc<AtomicUsize>,
    started: watch::Sender<usize>,
}

impl Default for BlockingBuilder {
    fn default() -> Self {
        Self::counting(Arc::new(AtomicUsize::new(0)))
    }
}

impl BlockingBuilder {
    pub fn counting(calls: Arc<AtomicUsize>) -> Self {
        let (started, _) = watch::channel(0);
        Self { calls, started }
    }

    /// Wait until `n` builds have entered.
    pub async fn wait_started(&self, n: usize) {
        let mut rx = self.started.subscribe();
        rx.wait_for(|count| *count >= n).await.unwrap();
    }
}

#[async_trait]
impl Builder for BlockingBuilder {
    async fn build(
        &self,
        ctx: &BuildContext,
        _logger: &mut dyn BuildLogger,
        _opts: &BuildOptions,
    ) -> Result<Image> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.send_modify(|n| *n += 1);
        Err(ConveyorError::Canceled(ctx.done().await))
    }
}

/// Records every status it is given.
#[derive(Default)]
pub struct RecordingStatus {
    calls: Mutex<Vec<CommitStatus>>,
    fail: bool,
}

impl RecordingStatus {
    pub fn failing() -> Self {
        Self {
            calls: Mutex::default(),
            fail: true,
        }
    }

    pub fn calls(&self) -> Vec<CommitStatus> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusSink for RecordingStatus {
    async fn set_status(&self, status: &CommitStatus) -> Result<()> {
        self.calls.lock().unwrap().push(status.clone());
        if self.fail {
            return Err(ConveyorError::Status("github unavailable".into()));
        }
        Ok(())
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).unwrap();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
