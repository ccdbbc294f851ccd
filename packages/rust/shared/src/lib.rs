//! Shared types, error model, and configuration for Conveyor.
//!
//! This crate is the foundation depended on by all other Conveyor crates.
//! It provides:
//! - [`ConveyorError`]: the unified error type
//! - Domain types ([`BuildId`], [`BuildOptions`], [`Image`])
//! - [`BuildContext`]: per-build cancellation and deadlines
//! - Injectable [`Clock`] and [`IdGenerator`]
//! - Configuration ([`AppConfig`] and the runtime configs derived from it)
//! - [`aws::AwsJsonClient`] for the AWS JSON-protocol services Conveyor talks to

pub mod aws;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use clock::{Clock, IdGenerator, SystemClock, UuidGenerator, format_duration};
pub use config::{
    AppConfig, ExecutorConfig, GitHubSection, LogBackend, LogConfig, LogsSection, PoolConfig,
    RemoteSection, WorkerSection, config_dir, config_file_path, expand_home, github_token,
    init_config, load_config, load_config_from,
};
pub use context::{BuildContext, ContextError};
pub use error::{ConveyorError, Result};
pub use types::{BuildId, BuildOptions, Image, split_repository};
