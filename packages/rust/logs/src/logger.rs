//! Build log sinks.

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use conveyor_shared::{BuildOptions, ConveyorError, Result};

use crate::channel::LogChannel;

/// Destination for one build's output.
#[async_trait]
pub trait BuildLogger: Send {
    /// Append raw bytes.
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Finish the log. Called once on every exit path of a build.
    async fn close(&mut self) -> Result<()>;

    /// Human-facing link to this log, if it has one.
    fn url(&self) -> Option<&str> {
        None
    }

    /// Append `line` followed by a newline.
    async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.write(&bytes).await
    }
}

/// Opens a [`BuildLogger`] for each build.
#[async_trait]
pub trait LoggerFactory: Send + Sync {
    async fn create(&self, opts: &BuildOptions) -> Result<Box<dyn BuildLogger>>;
}

/// Creates one [`LogChannel`] stream per build, named by build ID.
#[derive(Clone)]
pub struct ChannelLoggerFactory {
    channel: LogChannel,
    url_base: Option<String>,
}

impl ChannelLoggerFactory {
    pub fn new(channel: LogChannel) -> Self {
        Self {
            channel,
            url_base: None,
        }
    }

    /// Give each log a URL of the form `<url_base>/<build id>`.
    pub fn with_url_base(mut self, url_base: impl Into<String>) -> Self {
        self.url_base = Some(url_base.into());
        self
    }

    pub fn channel(&self) -> &LogChannel {
        &self.channel
    }
}

#[async_trait]
impl LoggerFactory for ChannelLoggerFactory {
    async fn create(&self, opts: &BuildOptions) -> Result<Box<dyn BuildLogger>> {
        let stream = opts.id.to_string();
        let mut writer = self.channel.create(&stream).await?;
        if let Some(base) = &self.url_base {
            writer = writer.with_url(format!("{}/{stream}", base.trim_end_matches('/')));
        }
        Ok(Box::new(writer))
    }
}

/// Collects output in memory.
#[derive(Debug, Default, Clone)]
pub struct BufferLogger {
    buf: Vec<u8>,
    url: Option<String>,
    closed: bool,
}

impl BufferLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn contents(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl BuildLogger for BufferLogger {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }
}

/// Forwards output to any async writer (e.g. stdout).
pub struct WriterLogger<W> {
    inner: W,
}

impl<W> WriterLogger<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> BuildLogger for WriterLogger<W> {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner
            .write_all(bytes)
            .await
            .map_err(|e| ConveyorError::LogTransport(e.to_string()))?;
        self.inner
            .flush()
            .await
            .map_err(|e| ConveyorError::LogTransport(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.inner
            .flush()
            .await
            .map_err(|e| ConveyorError::LogTransport(e.to_string()))
    }
}
