use crate::error::EngineError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// Blocking LIFO queue of executable tasks for one device.
///
/// Pushed to from any worker thread (cross-device handoff makes this
/// multi-producer), popped by the single worker thread owning the device.
/// LIFO ordering keeps a worker on the subgraph it just produced for cache
/// locality; no ordering is promised across devices.
///
/// The internal lock is held only for the duration of a push or pop, never
/// while a task runs.
#[must_use]
#[derive(Debug)]
pub struct ReadyQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
}

#[derive(Debug)]
struct Inner<T> {
    tasks: VecDeque<T>,
    shutdown: bool,
}

impl<T> Default for ReadyQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReadyQueue<T> {
    /// Empty queue, accepting pushes.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: VecDeque::new(),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Push a task to the front of the queue and wake the owning worker.
    ///
    /// # Errors
    /// [`EngineError::Shutdown`] after [`ReadyQueue::shutdown`]; the task is
    /// dropped.
    pub fn push(&self, task: T) -> Result<(), EngineError> {
        {
            let mut inner = self.inner.lock();
            if inner.shutdown {
                return Err(EngineError::Shutdown);
            }
            inner.tasks.push_front(task);
        }
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pop the most recently pushed task, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is shut down and drained; the owning
    /// worker thread exits on `None`.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(task) = inner.tasks.pop_front() {
                return Some(task);
            }
            if inner.shutdown {
                return None;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Reject further pushes and unblock the owning worker.
    ///
    /// Already-queued tasks are still handed out before `pop` reports
    /// exhaustion, so an engine being torn down drains naturally.
    pub fn shutdown(&self) {
        self.inner.lock().shutdown = true;
        self.not_empty.notify_all();
    }

    /// Number of queued tasks. Momentary; other producers may race it.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Whether the queue is momentarily empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
