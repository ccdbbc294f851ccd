//! Image builders for Conveyor.
//!
//! This crate provides:
//! - [`Builder`], the single-build capability, and [`Canceler`]
//! - [`RemoteBuildExecutor`], which runs builds on a managed build service
//! - Decorators that wrap any builder: [`StatusUpdater`], [`StatsRecorder`],
//!   [`EventNotifier`] and [`CancelTracker`]
//!
//! A typical chain, outermost first:
//! `EventNotifier(StatsRecorder(StatusUpdater(CancelTracker(RemoteBuildExecutor))))`.
//! [`CancelTracker`] must wrap the executor directly.

pub mod builder;
pub mod cancel;
pub mod events;
pub mod github;
pub mod remote;
pub mod stats;
pub mod status;

#[cfg(test)]
mod testing;

pub use builder::{Builder, Canceler};
pub use cancel::{CancelTracker, TrackerState};
pub use events::{BroadcastEvents, BuildEvent, EventNotifier, EventSink};
pub use github::GitHubStatusClient;
pub use remote::{BuildBackend, CodeBuildBackend, PollState, RemoteBuildExecutor};
pub use stats::{StatsRecorder, StatsSink, TracingStats};
pub use status::{CommitStatus, StatusSink, StatusState, StatusUpdater};
