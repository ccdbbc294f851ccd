//! Streaming build logs for Conveyor.
//!
//! This crate provides:
//! - [`LogChannel`]: named, sentinel-terminated log streams with independent
//!   polling readers
//! - [`LogTransport`]: the storage seam, with [`MemoryTransport`] and
//!   [`CloudWatchTransport`] implementations (a libSQL one lives in
//!   `conveyor-storage`)
//! - [`BuildLogger`] / [`LoggerFactory`]: the sinks builds write into

pub mod channel;
pub mod cloudwatch;
pub mod logger;
pub mod memory;
pub mod transport;

pub use channel::{DEFAULT_THROTTLE, LogChannel, LogReader, LogWriter, Read, SENTINEL, copy};
pub use cloudwatch::CloudWatchTransport;
pub use logger::{BufferLogger, BuildLogger, ChannelLoggerFactory, LoggerFactory, WriterLogger};
pub use memory::MemoryTransport;
pub use transport::{EventPage, LogTransport, StreamName};
