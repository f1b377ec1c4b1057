//! Bounded update queue with one dedicated consumer.
//!
//! REST intake and the shard listener both feed this queue; a single
//! [`UpdateWorker`] task drains it and dispatches updates one at a time.
//!
//! ```text
//! POST /update ──submit()──────┐
//!                              ├──► mpsc (bounded) ──► UpdateWorker ──► Dispatcher
//! POST /route ──try_enqueue()──┘
//! ```
//!
//! Persistence and local delivery happen in queue order on the worker.
//! Forwards to peers are spawned beside it and reply when the peer answers.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{DispatchError, DispatchOutcome, Dispatched, Dispatcher};
use crate::update::UpdateMessage;

type Reply = oneshot::Sender<Result<DispatchOutcome, DispatchError>>;

/// One queued update, optionally with someone waiting for its outcome.
#[derive(Debug)]
pub struct UpdateJob {
    /// The update to dispatch.
    pub update: UpdateMessage,
    reply: Option<Reply>,
}

/// Non-blocking enqueue failure.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// Queue at capacity.
    #[error("update queue full")]
    Full,
    /// Worker stopped.
    #[error("update queue closed")]
    Closed,
}

/// Producer side of the update queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct UpdateQueue {
    tx: mpsc::Sender<UpdateJob>,
}

impl UpdateQueue {
    /// Create a queue holding at most `capacity` pending updates.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<UpdateJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue and wait for the dispatch result.
    ///
    /// Waits for room when the queue is full.
    pub async fn submit(&self, update: UpdateMessage) -> Result<DispatchOutcome, DispatchError> {
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(UpdateJob {
                update,
                reply: Some(reply),
            })
            .await
            .map_err(|_| DispatchError::Unavailable)?;

        outcome.await.unwrap_or(Err(DispatchError::Unavailable))
    }

    /// Enqueue without waiting, dropping the outcome.
    pub fn try_enqueue(&self, update: UpdateMessage) -> Result<(), EnqueueError> {
        self.tx
            .try_send(UpdateJob { update, reply: None })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
                mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
            })
    }

    /// Whether the worker has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The single consumer task of the update queue.
#[derive(Debug)]
pub struct UpdateWorker {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl UpdateWorker {
    /// Start draining `rx` on a new task.
    pub fn spawn(dispatcher: Dispatcher, rx: mpsc::Receiver<UpdateJob>) -> Self {
        let stop = CancellationToken::new();
        let handle = tokio::spawn(Self::worker_loop(dispatcher, rx, stop.clone()));
        Self { stop, handle }
    }

    async fn worker_loop(
        dispatcher: Dispatcher,
        mut rx: mpsc::Receiver<UpdateJob>,
        stop: CancellationToken,
    ) {
        log::info!("[Dispatch] Update worker started");
        // Peer forwards run off the loop; local delivery never waits on a peer
        let forwards = TaskTracker::new();

        loop {
            let job = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                job = rx.recv() => job,
            };
            let Some(UpdateJob { update, reply }) = job else {
                break;
            };

            let result = match dispatcher.dispatch_local(&update).await {
                Ok(Dispatched::Done(outcome)) => Ok(outcome),
                Ok(Dispatched::Forward(pending)) => {
                    let dispatcher = dispatcher.clone();
                    forwards.spawn(async move {
                        let outcome = dispatcher.complete(pending).await;
                        if let Some(reply) = reply {
                            let _ = reply.send(Ok(outcome));
                        }
                    });
                    continue;
                }
                Err(e) => {
                    log::warn!("[Dispatch] {} not dispatched: {}", update, e);
                    Err(e)
                }
            };
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }

        // Whoever is still waiting learns the relay went away
        rx.close();
        let mut abandoned = 0usize;
        while let Ok(job) = rx.try_recv() {
            abandoned += 1;
            if let Some(reply) = job.reply {
                let _ = reply.send(Err(DispatchError::Unavailable));
            }
        }
        if abandoned > 0 {
            log::warn!("[Dispatch] Update worker stopped with {} queued update(s) dropped", abandoned);
        }

        forwards.close();
        if !forwards.is_empty() {
            log::info!("[Dispatch] Waiting for {} forward(s) in flight", forwards.len());
        }
        forwards.wait().await;
        log::info!("[Dispatch] Update worker stopped");
    }

    /// Stop taking updates, finish the one in flight, and wait up to `grace`.
    pub async fn stop(self, grace: Duration) {
        self.stop.cancel();
        let mut handle = self.handle;
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            log::warn!("[Dispatch] Update worker did not stop within {:?}, aborting", grace);
            handle.abort();
        }
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
