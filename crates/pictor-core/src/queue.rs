//! Serialized compute lanes
//!
//! Each [`WorkerQueue`] owns one OS thread that drains a FIFO of boxed jobs.
//! The compute collaborator is not reentrant, so a queue never runs two jobs
//! at once. [`WorkerLanes`] pairs a primary and a backup queue and routes new
//! work by a runtime flag.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::QueueError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single-threaded FIFO job queue
pub struct WorkerQueue {
    name: String,
    sender: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
}

impl WorkerQueue {
    /// Start a queue with its worker thread
    pub fn new(name: impl Into<String>) -> Result<Self, QueueError> {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        let thread_name = format!("pictor-{}", name);
        let worker_name = name.clone();
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                debug!(queue = %worker_name, "Worker queue started");
                while let Some(job) = receiver.blocking_recv() {
                    job();
                }
                debug!(queue = %worker_name, "Worker queue stopped");
            })
            .map_err(|e| QueueError::Spawn {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            name,
            sender,
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Jobs queued or running
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Whether a job is queued or running
    pub fn is_busy(&self) -> bool {
        self.pending() > 0
    }

    /// Enqueue a job.
    ///
    /// The job is enqueued before this returns, so submission order is run
    /// order. The returned future resolves with the job's result once it has
    /// run; dropping the future does not unqueue the job.
    pub fn submit<F, T>(&self, job: F) -> impl Future<Output = Result<T, QueueError>> + Send
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let pending = Arc::clone(&self.pending);
        let queue = self.name.clone();

        pending.fetch_add(1, Ordering::SeqCst);
        let job_pending = Arc::clone(&pending);
        let job_queue = queue.clone();
        let wrapped: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(job)).map_err(|payload| {
                let message = panic_message(payload.as_ref());
                error!(queue = %job_queue, "Job panicked: {}", message);
                QueueError::JobPanicked {
                    queue: job_queue,
                    message,
                }
            });
            job_pending.fetch_sub(1, Ordering::SeqCst);
            let _ = tx.send(result);
        });

        let enqueued = match self.sender.send(wrapped) {
            Ok(()) => true,
            Err(_) => {
                pending.fetch_sub(1, Ordering::SeqCst);
                false
            }
        };

        async move {
            if !enqueued {
                return Err(QueueError::Closed(queue));
            }
            rx.await.map_err(|_| QueueError::Closed(queue))?
        }
    }
}

impl std::fmt::Debug for WorkerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerQueue")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Primary and backup compute lanes
#[derive(Debug)]
pub struct WorkerLanes {
    primary: WorkerQueue,
    backup: WorkerQueue,
    uses_backup: AtomicBool,
}

impl WorkerLanes {
    /// Start both lanes
    pub fn new() -> Result<Self, QueueError> {
        Ok(Self {
            primary: WorkerQueue::new("primary")?,
            backup: WorkerQueue::new("backup")?,
            uses_backup: AtomicBool::new(false),
        })
    }

    /// Primary lane
    pub fn primary(&self) -> &WorkerQueue {
        &self.primary
    }

    /// Backup lane
    pub fn backup(&self) -> &WorkerQueue {
        &self.backup
    }

    /// Whether new work is routed to the backup lane
    pub fn uses_backup(&self) -> bool {
        self.uses_backup.load(Ordering::SeqCst)
    }

    /// Route new work to the backup lane (or back to primary)
    pub fn set_uses_backup(&self, uses_backup: bool) {
        self.uses_backup.store(uses_backup, Ordering::SeqCst);
    }

    /// Lane that receives new work right now
    pub fn active(&self) -> &WorkerQueue {
        if self.uses_backup() {
            &self.backup
        } else {
            &self.primary
        }
    }
}
