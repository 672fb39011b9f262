//! In-order execution of inbound work from one peer
//!
//! Notifies and commands from a single channel must take effect in the order
//! they were sent, so they are queued onto one worker task. Requests are
//! spawned on their own because a request handler may wait on traffic that
//! arrives later on the same channel.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Handle to a worker that runs queued jobs one at a time
///
/// The worker exits once every handle has been dropped and the queue is empty.
#[derive(Clone)]
pub(crate) struct OrderedQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl OrderedQueue {
    /// Start the worker; must be called inside a Tokio runtime
    pub(crate) fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        });
        Self { tx }
    }

    /// Queue `job` behind everything pushed before it
    pub(crate) fn push<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tx.send(Box::pin(job)).is_err() {
            debug!("Ordered worker gone, dropping job");
        }
    }
}
