//! Bounded per-connection worker pool.
//!
//! N worker tasks pull jobs from one shared queue, so jobs submitted in order
//! may finish in any order. Workers stop when the pool's token is cancelled
//! or the pool is dropped.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectionError, Result};

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug)]
pub struct WorkerPool {
    sender: mpsc::Sender<Job>,
    size: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// `size` workers sharing a queue of at most `queue` waiting jobs.
    pub fn new(size: usize, queue: usize, cancel: CancellationToken) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>(queue.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        for id in 0..size {
            tokio::spawn(worker(id, Arc::clone(&receiver), cancel.clone()));
        }

        Self {
            sender,
            size,
            cancel,
        }
    }

    /// Queue a job, waiting for room if the queue is full.
    pub async fn execute<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(ConnectionError::Closed);
        }
        self.sender
            .send(Box::pin(job))
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Queue a job only if there is room right now. A full queue is a
    /// `Transport` error and the job is dropped.
    pub fn try_execute<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(ConnectionError::Closed);
        }
        match self.sender.try_send(Box::pin(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(ConnectionError::Transport("worker queue full".into()))
            }
            Err(TrySendError::Closed(_)) => Err(ConnectionError::Closed),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn worker(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>, cancel: CancellationToken) {
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                job = receiver.recv() => job,
            }
        };
        match job {
            Some(job) => job.await,
            None => break,
        }
    }
    tracing::trace!(worker = id, "pool: worker stopped");
}
