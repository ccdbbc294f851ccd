//! Build orchestration for Conveyor.
//!
//! This crate ties the builder chain, build queue, and worker pool together
//! into the [`Conveyor`] service.

pub mod lifecycle;
pub mod push;
pub mod queue;
pub mod service;
pub mod worker;

pub use lifecycle::{BuildLifecycle, LoggingLifecycle};
pub use push::PushEvent;
pub use queue::{BuildQueue, BuildRequest, Subscription};
pub use service::{
    Conveyor, NewBuild, Sinks, decorate, log_channel, logger_factory, open_log_transport,
    parse_endpoint,
};
pub use worker::WorkerPool;
