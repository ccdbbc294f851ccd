//! The storage seam underneath a [`LogChannel`](crate::LogChannel).

use std::fmt;

use async_trait::async_trait;

use conveyor_shared::Result;

/// Fully qualified name of a log stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamName {
    pub group: String,
    pub stream: String,
}

impl StreamName {
    pub fn new(group: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            stream: stream.into(),
        }
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.stream)
    }
}

/// One batch of events returned by [`LogTransport::get_events`].
#[derive(Debug, Clone, Default)]
pub struct EventPage {
    /// Event payloads, oldest first.
    pub events: Vec<Vec<u8>>,
    /// Token to pass to the next call to continue after this page. `None`
    /// means "no new position"; callers keep their previous token.
    pub next_token: Option<String>,
}

/// An append-only, named event store with forward-token pagination.
///
/// The transport has no notion of end-of-stream; readers discover the end
/// through the sentinel byte written by [`LogWriter::close`](crate::LogWriter::close).
#[async_trait]
pub trait LogTransport: Send + Sync {
    /// Create the stream if it does not exist yet.
    async fn create_stream(&self, name: &StreamName) -> Result<()>;

    /// Append events to the stream, preserving their order.
    async fn put_events(&self, name: &StreamName, events: &[Vec<u8>]) -> Result<()>;

    /// Fetch events after `token` (or from the head when `None`).
    ///
    /// A stream that does not exist yet yields an empty page.
    async fn get_events(&self, name: &StreamName, token: Option<&str>) -> Result<EventPage>;
}
