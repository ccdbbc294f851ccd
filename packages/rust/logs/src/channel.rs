//! Sentinel-terminated log streams over a [`LogTransport`].
//!
//! Writers and readers never share a connection: a build worker writes into a
//! named stream while any number of viewers poll the same stream through the
//! transport. Because the transport has no end-of-stream signal, closing a
//! writer appends [`SENTINEL`] and readers stop when they see it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, trace};

use conveyor_shared::{ConveyorError, Result};

use crate::logger::BuildLogger;
use crate::transport::{LogTransport, StreamName};

/// End-of-stream marker (ASCII EOT). Never appears in ordinary build output.
pub const SENTINEL: u8 = 0x04;

/// Default minimum interval between two transport reads of one stream.
pub const DEFAULT_THROTTLE: Duration = Duration::from_secs(1);

/// Buffer size used by [`copy`].
const COPY_BUF_SIZE: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// LogChannel
// ---------------------------------------------------------------------------

/// Factory for writers and readers of streams within one log group.
#[derive(Clone)]
pub struct LogChannel {
    transport: Arc<dyn LogTransport>,
    group: String,
    throttle: Duration,
}

impl LogChannel {
    pub fn new(transport: Arc<dyn LogTransport>, group: impl Into<String>) -> Self {
        Self {
            transport,
            group: group.into(),
            throttle: DEFAULT_THROTTLE,
        }
    }

    /// Set how often readers opened from this channel may poll the transport.
    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Create the stream `name` and return a writer for it.
    pub async fn create(&self, name: &str) -> Result<LogWriter> {
        let name = StreamName::new(&self.group, name);
        self.transport.create_stream(&name).await?;
        debug!(stream = %name, "created log stream");
        Ok(LogWriter {
            transport: Arc::clone(&self.transport),
            name,
            url: None,
            closed: false,
        })
    }

    /// Open a reader positioned at the head of stream `name`.
    pub fn open(&self, name: &str) -> LogReader {
        LogReader {
            transport: Arc::clone(&self.transport),
            name: StreamName::new(&self.group, name),
            throttle: self.throttle,
            next_poll: None,
            token: None,
            buffer: Vec::new(),
            closed: false,
        }
    }
}

// ---------------------------------------------------------------------------
// LogWriter
// ---------------------------------------------------------------------------

/// Append-only writer for one stream.
pub struct LogWriter {
    transport: Arc<dyn LogTransport>,
    name: StreamName,
    url: Option<String>,
    closed: bool,
}

impl LogWriter {
    /// Attach a human-facing URL where this stream can be viewed.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn name(&self) -> &StreamName {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl BuildLogger for LogWriter {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(ConveyorError::LogTransport(format!(
                "write to closed stream {}",
                self.name
            )));
        }
        if bytes.is_empty() {
            return Ok(());
        }
        self.transport
            .put_events(&self.name, &[bytes.to_vec()])
            .await
    }

    /// Append the sentinel. Closing twice is a no-op.
    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.transport
            .put_events(&self.name, &[vec![SENTINEL]])
            .await?;
        self.closed = true;
        debug!(stream = %self.name, "closed log stream");
        Ok(())
    }

    fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }
}

// ---------------------------------------------------------------------------
// LogReader
// ---------------------------------------------------------------------------

/// Outcome of a single [`LogReader::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Read {
    /// `n` bytes were copied into the buffer; more may follow.
    Data(usize),
    /// Nothing new yet. The stream is still open.
    Empty,
    /// The sentinel was reached. `n` trailing bytes were copied first.
    End(usize),
}

/// Polling reader for one stream.
pub struct LogReader {
    transport: Arc<dyn LogTransport>,
    name: StreamName,
    throttle: Duration,
    next_poll: Option<Instant>,
    token: Option<String>,
    buffer: Vec<u8>,
    closed: bool,
}

impl LogReader {
    pub fn name(&self) -> &StreamName {
        &self.name
    }

    /// Whether the sentinel has been seen.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read buffered bytes into `buf`, polling the transport (at most once
    /// per throttle interval) when the buffer is empty.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<Read> {
        if self.buffer.is_empty() && !self.closed {
            self.fill().await?;
        }

        let n = buf.len().min(self.buffer.len());
        buf[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.drain(..n);

        if self.closed && self.buffer.is_empty() {
            return Ok(Read::End(n));
        }
        if n == 0 {
            Ok(Read::Empty)
        } else {
            Ok(Read::Data(n))
        }
    }

    async fn fill(&mut self) -> Result<()> {
        if let Some(at) = self.next_poll {
            tokio::time::sleep_until(at).await;
        }
        self.next_poll = Some(Instant::now() + self.throttle);

        let page = self
            .transport
            .get_events(&self.name, self.token.as_deref())
            .await?;
        if page.next_token.is_some() {
            self.token = page.next_token;
        }

        // Anything after the sentinel (e.g. the remote's own trailer lines)
        // is dropped.
        let mut batch = page.events.concat();
        if let Some(pos) = batch.iter().position(|b| *b == SENTINEL) {
            batch.truncate(pos);
            self.closed = true;
        }

        trace!(stream = %self.name, bytes = batch.len(), closed = self.closed, "polled log stream");
        self.buffer.extend_from_slice(&batch);
        Ok(())
    }
}

/// Copy everything from `reader` into `logger` until the sentinel.
///
/// Returns the number of bytes copied. Transport and logger errors end the
/// copy and are returned as-is.
pub async fn copy(reader: &mut LogReader, logger: &mut dyn BuildLogger) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        match reader.read(&mut buf).await? {
            Read::Data(n) => {
                logger.write(&buf[..n]).await?;
                total += n as u64;
            }
            Read::Empty => {}
            Read::End(n) => {
                if n > 0 {
                    logger.write(&buf[..n]).await?;
                    total += n as u64;
                }
                return Ok(total);
            }
        }
    }
}
