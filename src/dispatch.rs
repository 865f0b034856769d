//! Fire-and-forget hand-off from request handlers to the processor.
//!
//! [`Dispatcher::dispatch`] pushes a task id onto an unbounded queue and
//! returns at once. A single [`DispatchWorker`] drains the queue and runs
//! at most `workers` extractions concurrently.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::processor::TaskProcessor;

/// Cheap, cloneable handle for scheduling work.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<String>,
}

/// Owns the worker loop. Await [`join`](Self::join) after every
/// [`Dispatcher`] clone is dropped to let in-flight work finish.
pub struct DispatchWorker {
    handle: JoinHandle<()>,
}

impl Dispatcher {
    pub fn start(processor: Arc<TaskProcessor>, workers: usize) -> (Dispatcher, DispatchWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let limit = Arc::new(Semaphore::new(workers.max(1)));
        let handle = tokio::spawn(run(processor, rx, limit));
        (Dispatcher { tx }, DispatchWorker { handle })
    }

    /// Schedule a task. Never blocks. Returns `false` if the worker has
    /// already shut down.
    pub fn dispatch(&self, task_id: String) -> bool {
        match self.tx.send(task_id) {
            Ok(()) => true,
            Err(mpsc::error::SendError(task_id)) => {
                warn!(task_id = %task_id, "dispatch queue closed; task left for startup recovery");
                false
            }
        }
    }
}

impl DispatchWorker {
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!(error = %e, "dispatch worker panicked");
        }
    }
}

async fn run(
    processor: Arc<TaskProcessor>,
    mut rx: mpsc::UnboundedReceiver<String>,
    limit: Arc<Semaphore>,
) {
    let mut in_flight = JoinSet::new();

    while let Some(task_id) = rx.recv().await {
        let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
            break;
        };
        let processor = Arc::clone(&processor);
        in_flight.spawn(async move {
            processor.process(&task_id).await;
            drop(permit);
        });

        while let Some(finished) = in_flight.try_join_next() {
            if let Err(e) = finished {
                error!(error = %e, "processing task panicked");
            }
        }
    }

    if !in_flight.is_empty() {
        info!(remaining = in_flight.len(), "waiting for in-flight extractions");
    }
    while let Some(finished) = in_flight.join_next().await {
        if let Err(e) = finished {
            error!(error = %e, "processing task panicked");
        }
    }
}
