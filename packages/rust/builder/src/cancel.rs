//! Cancel-all-and-drain for in-flight builds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use conveyor_logs::BuildLogger;
use conveyor_shared::{BuildContext, BuildOptions, ConveyorError, Image, Result};

use crate::builder::{Builder, Canceler};

/// Lifecycle of a [`CancelTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    /// New builds are accepted.
    Accepting,
    /// `cancel` was called; waiting for in-flight builds to return.
    Draining,
    /// Every build canceled by `cancel` has returned.
    Stopped,
}

struct Registry {
    state: TrackerState,
    next_id: u64,
    builds: HashMap<u64, BuildContext>,
}

/// Tracks in-flight builds so they can all be canceled together.
///
/// Must wrap the remote executor directly so the derived context reaches it.
pub struct CancelTracker {
    inner: Arc<dyn Builder>,
    registry: Mutex<Registry>,
    active: watch::Sender<usize>,
}

impl CancelTracker {
    pub fn new(inner: Arc<dyn Builder>) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            inner,
            registry: Mutex::new(Registry {
                state: TrackerState::Accepting,
                next_id: 0,
                builds: HashMap::new(),
            }),
            active,
        }
    }

    /// Number of builds currently inside the inner builder.
    pub fn active(&self) -> usize {
        self.lock().builds.len()
    }

    pub fn state(&self) -> TrackerState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, ctx: &BuildContext) -> Result<(u64, BuildContext)> {
        let mut registry = self.lock();
        if registry.state != TrackerState::Accepting {
            return Err(ConveyorError::ShuttingDown);
        }
        let child = ctx.child();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.builds.insert(id, child.clone());
        self.active.send_replace(registry.builds.len());
        Ok((id, child))
    }

    fn release(&self, id: u64) {
        let mut registry = self.lock();
        registry.builds.remove(&id);
        self.active.send_replace(registry.builds.len());
    }
}

/// Removes a registration when the build returns or its future is dropped.
struct Registration<'a> {
    tracker: &'a CancelTracker,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.tracker.release(self.id);
    }
}

#[async_trait]
impl Builder for CancelTracker {
    async fn build(
        &self,
        ctx: &BuildContext,
        logger: &mut dyn BuildLogger,
        opts: &BuildOptions,
    ) -> Result<Image> {
        let (id, child) = self.register(ctx)?;
        let _registration = Registration { tracker: self, id };
        self.inner.build(&child, logger, opts).await
    }

    fn canceler(&self) -> Option<&dyn Canceler> {
        Some(self)
    }
}

#[async_trait]
impl Canceler for CancelTracker {
    /// Cancel every registered build and wait until all of them returned.
    ///
    /// Safe to call more than once; later calls wait for the same drain.
    async fn cancel(&self) -> Result<()> {
        {
            let mut registry = self.lock();
            if registry.state == TrackerState::Accepting {
                registry.state = TrackerState::Draining;
            }
            info!(active = registry.builds.len(), "canceling in-flight builds");
            for ctx in registry.builds.values() {
                ctx.cancel();
            }
        }

        let mut active = self.active.subscribe();
        active
            .wait_for(|n| *n == 0)
            .await
            .map_err(|_| ConveyorError::ShuttingDown)?;

        self.lock().state = TrackerState::Stopped;
        debug!("all canceled builds returned");
        Ok(())
    }
}
