//! Build lifecycle events for internal consumers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use conveyor_logs::BuildLogger;
use conveyor_shared::{BuildContext, BuildId, BuildOptions, Clock, Image, Result};

use crate::builder::{Builder, Canceler};

/// Something that happened to a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BuildEvent {
    Started {
        id: BuildId,
        repository: String,
        sha: String,
        branch: String,
        at: DateTime<Utc>,
    },
    Completed {
        id: BuildId,
        repository: String,
        sha: String,
        duration_ms: u64,
        image: Option<Image>,
        error: Option<String>,
        log_url: Option<String>,
    },
}

impl BuildEvent {
    pub fn id(&self) -> &BuildId {
        match self {
            Self::Started { id, .. } | Self::Completed { id, .. } => id,
        }
    }
}

/// Receives build events. Must not block.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: BuildEvent);
}

/// Fans events out to any number of subscribers.
///
/// Events published while nobody is subscribed are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastEvents {
    tx: broadcast::Sender<BuildEvent>,
}

impl BroadcastEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEvents {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventSink for BroadcastEvents {
    fn publish(&self, event: BuildEvent) {
        if self.tx.send(event).is_err() {
            trace!("no event subscribers");
        }
    }
}

/// Publishes `started` before a build and `completed` after.
pub struct EventNotifier {
    inner: Arc<dyn Builder>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl EventNotifier {
    pub fn new(inner: Arc<dyn Builder>, events: Arc<dyn EventSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            events,
            clock,
        }
    }
}

#[async_trait]
impl Builder for EventNotifier {
    async fn build(
        &self,
        ctx: &BuildContext,
        logger: &mut dyn BuildLogger,
        opts: &BuildOptions,
    ) -> Result<Image> {
        let started = self.clock.now();
        self.events.publish(BuildEvent::Started {
            id: opts.id.clone(),
            repository: opts.repository.clone(),
            sha: opts.sha.clone(),
            branch: opts.branch.clone(),
            at: started,
        });

        let result = self.inner.build(ctx, logger, opts).await;

        let (image, error) = match &result {
            Ok(image) => (Some(image.clone()), None),
            Err(err) => (None, Some(err.to_string())),
        };
        self.events.publish(BuildEvent::Completed {
            id: opts.id.clone(),
            repository: opts.repository.clone(),
            sha: opts.sha.clone(),
            duration_ms: self.clock.since(started).as_millis() as u64,
            image,
            error,
            log_url: logger.url().map(str::to_string),
        });
        result
    }

    fn canceler(&self) -> Option<&dyn Canceler> {
        self.inner.canceler()
    }
}
