//! Build timing, counters, and summary events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use conveyor_logs::BuildLogger;
use conveyor_shared::{
    BuildContext, BuildOptions, Clock, ContextError, ConveyorError, Image, Result,
    format_duration,
};

use crate::builder::{Builder, Canceler};

pub const BUILD_TIME: &str = "conveyor.build.time";
pub const BUILD_ERROR: &str = "conveyor.build.error";
pub const BUILD_CANCELED: &str = "conveyor.build.canceled";
pub const BUILD_TIMEOUT: &str = "conveyor.build.timeout";
pub const BUILD_FAILED: &str = "conveyor.build.failed";

/// Metrics backend (statsd-style).
pub trait StatsSink: Send + Sync {
    fn timing(&self, name: &str, value: Duration, tags: &[String]);
    fn incr(&self, name: &str, tags: &[String]);
    fn event(&self, title: &str, text: &str, tags: &[String]);
}

/// Writes metrics as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStats;

impl StatsSink for TracingStats {
    fn timing(&self, name: &str, value: Duration, tags: &[String]) {
        debug!(metric = name, ms = value.as_millis() as u64, ?tags, "timing");
    }

    fn incr(&self, name: &str, tags: &[String]) {
        debug!(metric = name, ?tags, "incr");
    }

    fn event(&self, title: &str, text: &str, tags: &[String]) {
        info!(title, text, ?tags, "event");
    }
}

/// Which counter a failed build lands in.
pub fn failure_metric(err: &ConveyorError) -> &'static str {
    match err.cancel_reason() {
        Some(ContextError::Canceled) => BUILD_CANCELED,
        Some(ContextError::DeadlineExceeded) => BUILD_TIMEOUT,
        None => BUILD_FAILED,
    }
}

/// Records duration and outcome counters for every build.
pub struct StatsRecorder {
    inner: Arc<dyn Builder>,
    stats: Arc<dyn StatsSink>,
    clock: Arc<dyn Clock>,
}

impl StatsRecorder {
    pub fn new(inner: Arc<dyn Builder>, stats: Arc<dyn StatsSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            stats,
            clock,
        }
    }
}

fn summary(
    opts: &BuildOptions,
    result: &Result<Image>,
    elapsed: Duration,
    url: Option<&str>,
) -> (String, String) {
    let (title, outcome) = match result {
        Ok(image) => (
            format!("Conveyor built {}", opts.repository),
            format!("Image: {image}"),
        ),
        Err(err) => (
            format!("Conveyor failed to build {}", opts.repository),
            format!("Error: {err}"),
        ),
    };
    let mut text = format!(
        "Repository: {}\nBranch: {}\nSha: {}\nDuration: {}\n{outcome}",
        opts.repository,
        opts.branch,
        opts.sha,
        format_duration(elapsed)
    );
    if let Some(url) = url {
        text.push_str(&format!("\nLogs: {url}"));
    }
    (title, text)
}

#[async_trait]
impl Builder for StatsRecorder {
    async fn build(
        &self,
        ctx: &BuildContext,
        logger: &mut dyn BuildLogger,
        opts: &BuildOptions,
    ) -> Result<Image> {
        let tags = vec![
            format!("repository:{}", opts.repository),
            format!("branch:{}", opts.branch),
        ];

        let started = self.clock.now();
        let result = self.inner.build(ctx, logger, opts).await;
        let elapsed = self.clock.since(started);

        self.stats.timing(BUILD_TIME, elapsed, &tags);
        if let Err(err) = &result {
            self.stats.incr(BUILD_ERROR, &tags);
            self.stats.incr(failure_metric(err), &tags);
        }

        let (title, text) = summary(opts, &result, elapsed, logger.url());
        self.stats.event(&title, &text, &tags);
        result
    }

    fn canceler(&self) -> Option<&dyn Canceler> {
        self.inner.canceler()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::testing::{FnBuilder, ManualClock, options};
    use conveyor_logs::BufferLogger;

    #[derive(Default)]
    struct RecordingStats {
        timings: Mutex<Vec<(String, Duration)>>,
        counters: Mutex<Vec<String>>,
        events: Mutex<Vec<(String, String)>>,
    }

    impl StatsSink for RecordingStats {
        fn timing(&self, name: &str, value: Duration, _tags: &[String]) {
            self.timings.lock().unwrap().push((name.into(), value));
        }

        fn incr(&self, name: &str, _tags: &[String]) {
            self.counters.lock().unwrap().push(name.into());
        }

        fn event(&self, title: &str, text: &str, _tags: &[String]) {
            self.events.lock().unwrap().push((title.into(), text.into()));
        }
    }

    async fn run(result: fn() -> Result<Image>, logger: &mut BufferLogger) -> Arc<RecordingStats> {
        let stats = Arc::new(RecordingStats::default());
        let inner = Arc::new(FnBuilder::new(move |_| result()));
        let recorder = StatsRecorder::new(inner, stats.clone(), Arc::new(ManualClock::default()));
        let _ = recorder
            .build(&BuildContext::background(), logger, &options())
            .await;
        stats
    }

    #[tokio::test]
    async fn success_records_timing_only() {
        let mut logger = BufferLogger::new().with_url("https://conveyor.example.com/logs/1");
        let stats = run(|| Ok(Image::new("remind101/acme-inc", "abc")), &mut logger).await;

        assert_eq!(stats.timings.lock().unwrap()[0].0, BUILD_TIME);
        assert!(stats.counters.lock().unwrap().is_empty());
        let events = stats.events.lock().unwrap();
        assert_eq!(events[0].0, "Conveyor built remind101/acme-inc");
        assert!(events[0].1.contains("Logs: https://conveyor.example.com/logs/1"));
    }

    #[tokio::test]
    async fn failures_are_distinguished_by_cause() {
        let cases: [(fn() -> Result<Image>, &str); 3] = [
            (|| Err(ConveyorError::Canceled(ContextError::Canceled)), BUILD_CANCELED),
            (
                || Err(ConveyorError::Canceled(ContextError::DeadlineExceeded)),
                BUILD_TIMEOUT,
            ),
            (|| Err(ConveyorError::build_failed("exit 1")), BUILD_FAILED),
        ];

        for (result, expected) in cases {
            let mut logger = BufferLogger::new();
            let stats = run(result, &mut logger).await;
            assert_eq!(
                *stats.counters.lock().unwrap(),
                vec![BUILD_ERROR.to_string(), expected.to_string()]
            );
            let events = stats.events.lock().unwrap();
            assert!(!events[0].1.contains("Logs:"));
        }
    }
}
