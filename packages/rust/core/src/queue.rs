//! Bounded queue of pending builds.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use conveyor_shared::{BuildContext, BuildOptions, ConveyorError, Result};

/// A build waiting for a worker, with the context for that one attempt.
#[derive(Debug)]
pub struct BuildRequest {
    pub options: BuildOptions,
    pub ctx: BuildContext,
}

/// Bounded FIFO of [`BuildRequest`]s shared by every worker.
#[derive(Clone)]
pub struct BuildQueue {
    tx: mpsc::Sender<BuildRequest>,
    rx: Subscription,
    capacity: usize,
}

/// Receiving side of a [`BuildQueue`]. Clones share one FIFO.
#[derive(Clone)]
pub struct Subscription {
    rx: Arc<Mutex<mpsc::Receiver<BuildRequest>>>,
}

impl BuildQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Subscription {
                rx: Arc::new(Mutex::new(rx)),
            },
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of requests waiting for a worker.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue a build, waiting for room if the queue is full.
    ///
    /// Fails with [`ConveyorError::Canceled`] if `ctx` ends first; the request
    /// is then not enqueued.
    pub async fn push(&self, ctx: &BuildContext, options: BuildOptions) -> Result<()> {
        if let Some(reason) = ctx.err() {
            return Err(ConveyorError::Canceled(reason));
        }
        let request = BuildRequest {
            options,
            ctx: ctx.clone(),
        };
        tokio::select! {
            biased;
            reason = ctx.done() => Err(ConveyorError::Canceled(reason)),
            sent = self.tx.send(request) => sent.map_err(|_| ConveyorError::QueueClosed),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.rx.clone()
    }
}

impl Subscription {
    /// Next request, in push order across all subscribers.
    pub async fn recv(&self) -> Option<BuildRequest> {
        self.rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use conveyor_shared::{BuildId, ContextError};

    fn options(sha: &str) -> BuildOptions {
        BuildOptions {
            id: BuildId::new(),
            repository: "remind101/acme-inc".into(),
            sha: sha.into(),
            branch: "master".into(),
            no_cache: false,
        }
    }

    #[tokio::test]
    async fn pops_in_push_order() {
        let queue = BuildQueue::new(10);
        let ctx = BuildContext::background();
        let shas: Vec<String> = (0..10).map(|i| format!("sha-{i}")).collect();
        for sha in &shas {
            queue.push(&ctx, options(sha)).await.unwrap();
        }
        assert_eq!(queue.len(), 10);

        let a = queue.subscribe();
        let b = queue.subscribe();
        let mut popped = Vec::new();
        for i in 0..10 {
            let sub = if i % 2 == 0 { &a } else { &b };
            popped.push(sub.recv().await.unwrap().options.sha);
        }
        assert_eq!(popped, shas);
        assert!(queue.is_empty());
    }

    fn current_thread() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    proptest! {
        #[test]
        fn any_sequence_pops_in_push_order(
            shas in proptest::collection::vec("[0-9a-f]{1,40}", 0..40),
            capacity in 1usize..8,
            picks in proptest::collection::vec(any::<bool>(), 40),
        ) {
            let popped = current_thread().block_on(async {
                let queue = BuildQueue::new(capacity);
                let ctx = BuildContext::background();
                let (a, b) = (queue.subscribe(), queue.subscribe());

                let produce = async {
                    for sha in &shas {
                        queue.push(&ctx, options(sha)).await.unwrap();
                    }
                };
                let consume = async {
                    let mut popped = Vec::new();
                    for pick in picks.iter().take(shas.len()) {
                        let sub = if *pick { &a } else { &b };
                        popped.push(sub.recv().await.unwrap().options.sha);
                    }
                    popped
                };
                tokio::join!(produce, consume).1
            });
            prop_assert_eq!(popped, shas);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_push_fails_when_context_ends() {
        let queue = BuildQueue::new(1);
        let ctx = BuildContext::background();
        queue.push(&ctx, options("a")).await.unwrap();

        let short = ctx.with_timeout(Duration::from_secs(1));
        let err = queue.push(&short, options("b")).await.unwrap_err();
        assert_eq!(err.cancel_reason(), Some(ContextError::DeadlineExceeded));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn full_queue_push_resumes_when_drained() {
        let queue = BuildQueue::new(1);
        let ctx = BuildContext::background();
        queue.push(&ctx, options("a")).await.unwrap();

        let sub = queue.subscribe();
        let pusher = {
            let queue = queue.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { queue.push(&ctx, options("b")).await })
        };
        assert_eq!(sub.recv().await.unwrap().options.sha, "a");
        pusher.await.unwrap().unwrap();
        assert_eq!(sub.recv().await.unwrap().options.sha, "b");
    }

    #[tokio::test]
    async fn canceled_context_is_rejected() {
        let queue = BuildQueue::new(1);
        let ctx = BuildContext::background();
        ctx.cancel();
        let err = queue.push(&ctx, options("a")).await.unwrap_err();
        assert_eq!(err.cancel_reason(), Some(ContextError::Canceled));
        assert!(queue.is_empty());
    }
}
