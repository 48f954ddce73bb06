//! Fixed-size worker pool fed by a bounded admission queue.
//!
//! The acceptor is the only producer. When every worker is busy and the
//! queue is full, [`Admission::admit`] waits, which in turn stops the accept
//! loop: that wait is the proxy's only backpressure.
//!
//! Each worker handles one connection at a time, start to finish, before
//! taking the next one from the queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ProxyError;

/// Default number of workers.
pub const DEFAULT_WORKERS: usize = 5;

/// Processes one admitted connection to completion.
#[async_trait]
pub trait ConnectionHandler<C>: Send + Sync + 'static {
    async fn handle(&self, worker_id: usize, conn: C);
}

/// Worker pool configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of long-lived workers.
    pub workers: usize,
    /// Connections that may wait for a free worker.
    pub queue_capacity: usize,
}

impl PoolConfig {
    /// Pool with `workers` workers and an equally sized queue.
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            queue_capacity: workers,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

/// Producer side of the admission queue.
#[derive(Debug)]
pub struct Admission<C> {
    tx: mpsc::Sender<C>,
}

impl<C> Clone for Admission<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C> Admission<C> {
    /// Queue a connection, waiting while the queue is full.
    pub async fn admit(&self, conn: C) -> Result<(), ProxyError> {
        self.tx.send(conn).await.map_err(|_| ProxyError::PoolClosed)
    }

    /// Free slots in the queue right now.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

/// A fixed set of workers draining one bounded queue.
pub struct WorkerPool<C> {
    config: PoolConfig,
    admission: Admission<C>,
    workers: Vec<JoinHandle<()>>,
}

impl<C: Send + 'static> WorkerPool<C> {
    /// Spawn the workers. Must be called inside a tokio runtime.
    pub fn spawn<H: ConnectionHandler<C>>(config: PoolConfig, handler: Arc<H>) -> Self {
        let workers_count = config.workers.max(1);
        let queue_capacity = config.queue_capacity.max(1);

        let (tx, rx) = mpsc::channel(queue_capacity);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers_count)
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let handler = Arc::clone(&handler);
                tokio::spawn(worker_loop(worker_id, rx, handler))
            })
            .collect();

        info!(
            workers = workers_count,
            queue_capacity, "Worker pool started"
        );

        Self {
            config: PoolConfig {
                workers: workers_count,
                queue_capacity,
            },
            admission: Admission { tx },
            workers,
        }
    }

    /// Get a producer handle for the admission queue.
    pub fn admission(&self) -> Admission<C> {
        self.admission.clone()
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    /// Close the queue and give queued and in-flight connections `grace` to
    /// finish. Workers only stop once every [`Admission`] handle is gone.
    ///
    /// Connections still running after `grace` are aborted, which drops
    /// both of their legs. Returns true if every worker finished in time.
    pub async fn drain(self, grace: Duration) -> bool {
        drop(self.admission);
        let aborts: Vec<_> = self.workers.iter().map(|w| w.abort_handle()).collect();

        let join_all = async {
            for worker in self.workers {
                if let Err(e) = worker.await {
                    if !e.is_cancelled() {
                        error!(error = %e, "Worker task failed");
                    }
                }
            }
        };

        let drained = tokio::time::timeout(grace, join_all).await.is_ok();
        if drained {
            info!("Worker pool stopped");
        } else {
            for abort in &aborts {
                abort.abort();
            }
            warn!(
                grace_ms = grace.as_millis() as u64,
                "Worker pool drain timed out, aborting open connections"
            );
        }
        drained
    }
}

/// Aborts the wrapped task when dropped, so cancelling a worker also
/// cancels the connection it is serving.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn worker_loop<C, H>(worker_id: usize, rx: Arc<Mutex<mpsc::Receiver<C>>>, handler: Arc<H>)
where
    C: Send + 'static,
    H: ConnectionHandler<C>,
{
    debug!(worker = worker_id, "Worker started");

    loop {
        let next = rx.lock().await.recv().await;
        let Some(conn) = next else {
            break;
        };

        // Run the connection in its own task so a panic costs one
        // connection, not a worker.
        let handler = Arc::clone(&handler);
        let mut task = AbortOnDrop(tokio::spawn(async move {
            handler.handle(worker_id, conn).await
        }));
        if let Err(e) = (&mut task.0).await {
            error!(worker = worker_id, error = %e, "Connection handler panicked");
        }
    }

    debug!(worker = worker_id, "Worker stopped");
}
