//! # Task Queue
//!
//! Strict FIFO execution of asynchronous work.
//!
//! Each enqueued future starts only after the previous one has completed, so the
//! side effects of the futures (a transport write, an event delivery) happen in
//! submission order even when the work itself has variable latency.
//!
//! ## Usage
//! ```rust,no_run
//! # async fn run() {
//! use relay_protocol::utils::task_queue::TaskQueue;
//!
//! let queue = TaskQueue::new("outgoing");
//! queue.enqueue(async { /* encrypt then write */ });
//! queue.enqueue(async { /* runs after the first task */ });
//! # }
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// A queue that runs futures one at a time on a dedicated task
///
/// Must be created inside a tokio runtime. Dropping the queue aborts the worker
/// together with any tasks that have not run yet.
pub struct TaskQueue {
    name: &'static str,
    sender: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
    worker: JoinHandle<()>,
}

impl TaskQueue {
    pub fn new(name: &'static str) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        let worker = tokio::spawn(async move {
            while let Some(task) = receiver.recv().await {
                task.await;
            }
            trace!(queue = name, "Task queue worker finished");
        });

        Self {
            name,
            sender,
            worker,
        }
    }

    /// Append a future to the queue
    ///
    /// Returns `false` if the worker has already stopped.
    pub fn enqueue<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.sender.send(task.boxed()).is_err() {
            debug!(queue = self.name, "Dropped task for a stopped queue");
            return false;
        }
        true
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn test_tasks_complete_in_submission_order() {
        let queue = TaskQueue::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        // Earlier tasks sleep longer, so unordered execution would reverse them
        for i in 0..5u64 {
            let order = order.clone();
            queue.enqueue(async move {
                tokio::time::sleep(Duration::from_millis(50 - i * 10)).await;
                order.lock().unwrap().push(i);
            });
        }
        queue.enqueue(async move {
            let _ = done_tx.send(());
        });

        done_rx.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_drop_aborts_pending_tasks() {
        let ran = Arc::new(Mutex::new(false));
        {
            let queue = TaskQueue::new("test");
            queue.enqueue(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
            let ran = ran.clone();
            queue.enqueue(async move {
                *ran.lock().unwrap() = true;
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!*ran.lock().unwrap());
    }
}
