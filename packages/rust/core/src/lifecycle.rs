//! Build lifecycle reporting.

use tracing::{info, warn};

use conveyor_shared::{BuildOptions, ConveyorError, Image};

/// Told about every build a worker runs.
///
/// `started` always comes before `complete` or `failed` for the same build.
pub trait BuildLifecycle: Send + Sync {
    fn started(&self, opts: &BuildOptions);
    fn complete(&self, opts: &BuildOptions, image: &Image);
    fn failed(&self, opts: &BuildOptions, err: &ConveyorError);
}

/// Reports lifecycle events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingLifecycle;

impl BuildLifecycle for LoggingLifecycle {
    fn started(&self, opts: &BuildOptions) {
        info!(build_id = %opts.id, repository = %opts.repository, sha = %opts.sha, "build started");
    }

    fn complete(&self, opts: &BuildOptions, image: &Image) {
        info!(build_id = %opts.id, %image, "build complete");
    }

    fn failed(&self, opts: &BuildOptions, err: &ConveyorError) {
        warn!(build_id = %opts.id, error = %err, "build failed");
    }
}
