//! The [`Builder`] capability and its optional cancel hook.

use async_trait::async_trait;

use conveyor_logs::BuildLogger;
use conveyor_shared::{BuildContext, BuildOptions, Image, Result};

/// Builds one image.
///
/// Implementations write build output to `logger` and return once the build
/// reached a terminal state. They honor `ctx`: when it is canceled or its
/// deadline passes, the build is stopped and the call fails with
/// [`ConveyorError::Canceled`](conveyor_shared::ConveyorError::Canceled).
///
/// Decorators wrap an inner `Arc<dyn Builder>`, call it exactly once, and
/// return its result unchanged.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(
        &self,
        ctx: &BuildContext,
        logger: &mut dyn BuildLogger,
        opts: &BuildOptions,
    ) -> Result<Image>;

    /// The chain's cancel capability, if any layer has one.
    ///
    /// Decorators forward this from their inner builder.
    fn canceler(&self) -> Option<&dyn Canceler> {
        None
    }
}

/// Cancels every in-flight build and waits for them to stop.
#[async_trait]
pub trait Canceler: Send + Sync {
    async fn cancel(&self) -> Result<()>;
}
