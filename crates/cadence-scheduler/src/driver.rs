use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use cadence_core::{CadenceConfig, ObjectKey};
use futures_util::{future::join_all, FutureExt};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    controller::ReconcileController, error::ReconcileError, queue::WorkQueue, store::StoreEvent,
};

/// Schedule whose pass a store change should trigger.
pub fn route(event: &StoreEvent) -> Option<ObjectKey> {
    match event {
        StoreEvent::Schedule { key, .. } => Some(key.clone()),
        StoreEvent::Execution { owner, .. } => owner.clone(),
    }
}

/// Runs reconcile passes on a pool of workers fed by a [`WorkQueue`].
pub struct ReconcileDriver {
    controller: Arc<ReconcileController>,
    queue: Arc<WorkQueue>,
    workers: usize,
    events: Option<broadcast::Receiver<StoreEvent>>,
}

impl ReconcileDriver {
    pub fn new(controller: Arc<ReconcileController>, config: &CadenceConfig) -> Self {
        Self {
            controller,
            queue: WorkQueue::from_config(&config.backoff),
            workers: config.controller.workers.max(1),
            events: None,
        }
    }

    /// Enqueue the owning schedule of every change published on `events`.
    pub fn with_events(mut self, events: broadcast::Receiver<StoreEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn enqueue(&self, key: ObjectKey) {
        self.queue.add(key);
    }

    /// Run until `shutdown` broadcasts `true`, then cancel in-flight passes
    /// and wait for the workers to stop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(workers = self.workers, "reconcile driver started");

        let watcher = self.events.take().map(|events| {
            let queue = Arc::clone(&self.queue);
            tokio::spawn(watch_events(events, queue))
        });

        let cancel = CancellationToken::new();
        let handles: Vec<JoinHandle<()>> = (0..self.workers)
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    Arc::clone(&self.controller),
                    Arc::clone(&self.queue),
                    cancel.child_token(),
                ))
            })
            .collect();

        loop {
            if *shutdown.borrow() {
                break;
            }
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("reconcile driver shutting down");
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.queue.shut_down();
        cancel.cancel();
        for joined in join_all(handles).await {
            if let Err(e) = joined {
                error!("reconcile worker panicked: {e}");
            }
        }
        info!("reconcile driver stopped");
    }
}

async fn watch_events(events: broadcast::Receiver<StoreEvent>, queue: Arc<WorkQueue>) {
    let mut stream = BroadcastStream::new(events);
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                if let Some(key) = route(&event) {
                    queue.add(key);
                }
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "store change feed lagged, some changes were dropped");
            }
        }
    }
    debug!("store change feed closed");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

async fn worker(
    id: usize,
    controller: Arc<ReconcileController>,
    queue: Arc<WorkQueue>,
    cancel: CancellationToken,
) {
    debug!(worker = id, "reconcile worker started");
    while let Some(key) = queue.get().await {
        // a panicking pass must not take the worker, or the key, down with it
        let pass = AssertUnwindSafe(controller.reconcile(&key, &cancel))
            .catch_unwind()
            .await;
        let result = match pass {
            Ok(result) => result,
            Err(panic) => {
                let delay = queue.add_rate_limited(key.clone());
                error!(
                    worker = id,
                    schedule = %key,
                    retry_in = ?delay,
                    "reconcile pass panicked: {}",
                    panic_message(panic.as_ref())
                );
                queue.done(&key);
                continue;
            }
        };
        match result {
            Ok(outcome) => {
                queue.forget(&key);
                debug!(
                    worker = id,
                    schedule = %key,
                    action = ?outcome.action,
                    requeue_after = ?outcome.requeue_after,
                    warnings = outcome.warnings.len(),
                    "reconcile pass finished"
                );
                if let Some(after) = outcome.requeue_after {
                    queue.add_after(key.clone(), after);
                }
            }
            Err(ReconcileError::Cancelled) => {
                debug!(worker = id, schedule = %key, "reconcile pass cancelled");
            }
            Err(e) => {
                let delay = queue.add_rate_limited(key.clone());
                warn!(
                    worker = id,
                    schedule = %key,
                    code = e.code(),
                    retry_in = ?delay,
                    "reconcile pass failed: {e}"
                );
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "reconcile worker stopped");
}
