//! C2: Ordered task runner.
//!
//! Executes submitted tasks strictly in submission order with concurrency
//! 1, backed by the same bounded-capacity discipline as the height queue
//! (C1). Failures are reported to the task's submitter via a per-task
//! oneshot channel rather than to the runner's owner (§4.2).

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use crate::error::{IndexerError, Result};

/// A unit of work submitted to the runner: an owned, boxed future producing
/// a `Result<()>`.
pub type BoxedTask = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Receiver side of a task's completion signal, handed back to the
/// submitter by [`OrderedTaskRunner::put`].
pub type TaskOutcome = oneshot::Receiver<Result<()>>;

struct QueuedTask {
    task: BoxedTask,
    outcome_tx: oneshot::Sender<Result<()>>,
}

struct State {
    queue: Mutex<VecDeque<QueuedTask>>,
    capacity: usize,
    notify: Notify,
    /// Set by `abort()`: the in-flight task (if any) still runs to
    /// completion, but no further task is popped and no further `put` is
    /// accepted.
    aborted: AtomicBool,
    /// Set once the runner has been told to shut down entirely (no more
    /// tasks will ever arrive); lets the worker loop exit instead of
    /// waiting on `notify` forever.
    shutting_down: AtomicBool,
}

/// Executes queued tasks one at a time, in FIFO submission order.
pub struct OrderedTaskRunner {
    state: Arc<State>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OrderedTaskRunner {
    pub fn new(capacity: usize) -> Arc<Self> {
        let state = Arc::new(State {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            aborted: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        });

        let worker_state = state.clone();
        let handle = tokio::spawn(async move { Self::run_loop(worker_state).await });

        Arc::new(Self {
            state,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.state.capacity
    }

    pub fn size(&self) -> usize {
        self.state.queue.lock().unwrap().len()
    }

    pub fn free_space(&self) -> usize {
        self.state.capacity.saturating_sub(self.size())
    }

    /// Submit one task. Returns a receiver the caller can await to learn
    /// whether the task succeeded or failed - that failure never reaches
    /// the runner itself, only this receiver.
    pub fn put(&self, task: BoxedTask) -> Result<TaskOutcome> {
        let mut receivers = self.put_many(vec![task])?;
        Ok(receivers.pop().expect("put_many(1) returns exactly one receiver"))
    }

    /// Submit many tasks at once, preserving order. Fails entirely (no
    /// partial admission) if `tasks.len() > free_space()`, or if the runner
    /// has been aborted.
    pub fn put_many(&self, tasks: Vec<BoxedTask>) -> Result<Vec<TaskOutcome>> {
        if self.state.aborted.load(Ordering::SeqCst) {
            return Err(IndexerError::programmer(
                "put rejected: task runner has been aborted",
            ));
        }

        let mut guard = self.state.queue.lock().unwrap();
        if tasks.len() > self.state.capacity.saturating_sub(guard.len()) {
            return Err(IndexerError::programmer(format!(
                "put_many({} tasks) exceeds free space {} (capacity {})",
                tasks.len(),
                self.state.capacity.saturating_sub(guard.len()),
                self.state.capacity
            )));
        }

        let mut receivers = Vec::with_capacity(tasks.len());
        for task in tasks {
            let (tx, rx) = oneshot::channel();
            guard.push_back(QueuedTask {
                task,
                outcome_tx: tx,
            });
            receivers.push(rx);
        }
        drop(guard);
        self.state.notify.notify_one();
        Ok(receivers)
    }

    /// Let the in-flight task (if any) complete, discard every queued task,
    /// and reject all future `put`/`put_many` calls.
    pub fn abort(&self) {
        self.state.aborted.store(true, Ordering::SeqCst);
        self.drain_queue();
        self.state.notify.notify_one();
    }

    /// Discard queued-but-not-started tasks. The in-flight task (if any)
    /// still completes. Unlike `abort`, future `put` calls are still
    /// accepted.
    pub fn flush(&self) {
        self.drain_queue();
    }

    /// Tell the worker loop it may exit once the queue drains, instead of
    /// waiting indefinitely on `notify`. Used during graceful shutdown
    /// after `abort()`.
    pub fn shutdown(&self) {
        self.state.shutting_down.store(true, Ordering::SeqCst);
        self.state.notify.notify_one();
    }

    fn drain_queue(&self) {
        let mut guard = self.state.queue.lock().unwrap();
        guard.clear(); // drops each `outcome_tx`, which fails the submitter's receiver
    }

    async fn run_loop(state: Arc<State>) {
        loop {
            let next = state.queue.lock().unwrap().pop_front();
            match next {
                Some(QueuedTask { task, outcome_tx }) => {
                    let result = task.await;
                    let _ = outcome_tx.send(result);

                    if state.aborted.load(Ordering::SeqCst) {
                        // Drop anything submitted between pop and now, then stop.
                        state.queue.lock().unwrap().clear();
                        break;
                    }
                }
                None => {
                    if state.shutting_down.load(Ordering::SeqCst) {
                        break;
                    }
                    state.notify.notified().await;
                }
            }
        }
    }
}

impl Drop for OrderedTaskRunner {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn noop_task() -> BoxedTask {
        Box::pin(async { Ok(()) })
    }

    #[tokio::test]
    async fn tasks_run_in_submission_order() {
        let runner = OrderedTaskRunner::new(10);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut outcomes = Vec::new();
        for i in 0..5u32 {
            let order = order.clone();
            let task: BoxedTask = Box::pin(async move {
                order.lock().unwrap().push(i);
                Ok(())
            });
            outcomes.push(runner.put(task).unwrap());
        }

        for rx in outcomes {
            rx.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failure_surfaces_to_submitter_only() {
        let runner = OrderedTaskRunner::new(10);
        let task: BoxedTask = Box::pin(async { Err(IndexerError::Fetch("boom".into())) });
        let rx = runner.put(task).unwrap();
        let outcome = rx.await.unwrap();
        assert!(outcome.is_err());

        // Runner itself is unaffected: a later task still runs.
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let ok_task: BoxedTask = Box::pin(async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        runner.put(ok_task).unwrap().await.unwrap().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn put_many_rejects_when_over_capacity() {
        let runner = OrderedTaskRunner::new(2);
        let tasks: Vec<BoxedTask> = (0..3).map(|_| noop_task()).collect();
        assert!(runner.put_many(tasks).is_err());
        assert_eq!(runner.size(), 0);
    }

    #[tokio::test]
    async fn abort_discards_queue_and_rejects_future_puts() {
        let runner = OrderedTaskRunner::new(10);
        let ran = Arc::new(AtomicU32::new(0));

        // Block the worker on a long-running in-flight task.
        let (unblock_tx, unblock_rx) = oneshot::channel::<()>();
        let in_flight: BoxedTask = Box::pin(async move {
            let _ = unblock_rx.await;
            Ok(())
        });
        let in_flight_outcome = runner.put(in_flight).unwrap();

        // Give the worker a moment to start awaiting the in-flight task.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let r = ran.clone();
        let queued: BoxedTask = Box::pin(async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let queued_outcome = runner.put(queued).unwrap();

        runner.abort();
        assert!(runner.put(noop_task()).is_err());

        unblock_tx.send(()).unwrap();
        in_flight_outcome.await.unwrap().unwrap();

        // The queued task never ran; its receiver is dropped-without-send.
        assert!(queued_outcome.await.is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn flush_discards_queue_but_allows_future_puts() {
        let runner = OrderedTaskRunner::new(10);
        let (unblock_tx, unblock_rx) = oneshot::channel::<()>();
        let in_flight: BoxedTask = Box::pin(async move {
            let _ = unblock_rx.await;
            Ok(())
        });
        let in_flight_outcome = runner.put(in_flight).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let queued_outcome = runner.put(noop_task()).unwrap();
        runner.flush();
        assert_eq!(runner.size(), 0);

        unblock_tx.send(()).unwrap();
        in_flight_outcome.await.unwrap().unwrap();
        assert!(queued_outcome.await.is_err());

        // Runner still accepts new work after a flush (unlike abort).
        runner.put(noop_task()).unwrap().await.unwrap().unwrap();
    }
}
