//! Serialization of logically-concurrent requests onto a protocol that
//! permits exactly one in-flight command.
//!
//! A [`RequestTask`] is activated either immediately (queue idle) or when the
//! previously active task releases its slot. The release action is bound to a
//! [`ReleaseHandle`] guard, so it fires exactly once no matter how the task's
//! asynchronous work terminates: success, error, or cancellation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A unit of work waiting for exclusive access to the connection.
pub(crate) struct RequestTask {
    producer: Box<dyn FnOnce(ReleaseHandle) + Send>,
    disposal: Option<Box<dyn FnOnce() + Send>>,
}

impl RequestTask {
    /// Wrap a producer and a disposal hook.
    ///
    /// Exactly one of the two ever runs: the producer on activation, the
    /// disposal hook on rejection before activation.
    pub fn new(
        producer: impl FnOnce(ReleaseHandle) + Send + 'static,
        disposal: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            producer: Box::new(producer),
            disposal: Some(Box::new(disposal)),
        }
    }

    fn activate(self, handle: ReleaseHandle) {
        (self.producer)(handle);
    }

    fn reject(mut self) {
        if let Some(disposal) = self.disposal.take() {
            disposal();
        }
    }
}

impl std::fmt::Debug for RequestTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTask").finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<RequestTask>,
    active: bool,
    closed: bool,
}

/// FIFO queue enforcing the single-active-exchange invariant.
///
/// The only mutation points are [`RequestQueue::submit`] and the release
/// performed by dropping a [`ReleaseHandle`].
#[derive(Debug, Clone, Default)]
pub(crate) struct RequestQueue {
    state: Arc<Mutex<QueueState>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate `task` now if the queue is idle, otherwise append it.
    ///
    /// If the queue is already closed the task is rejected synchronously and
    /// its disposal hook runs before this returns.
    pub fn submit(&self, task: RequestTask) {
        let admitted = {
            let mut state = lock_state(&self.state);
            if state.closed {
                Admission::Reject(task)
            } else if state.active {
                state.pending.push_back(task);
                return;
            } else {
                state.active = true;
                Admission::Run(task)
            }
        };
        // Producer and disposal hooks run outside the lock.
        match admitted {
            Admission::Run(task) => task.activate(ReleaseHandle {
                state: Arc::clone(&self.state),
            }),
            Admission::Reject(task) => task.reject(),
        }
    }

    /// Close the queue, rejecting every pending task.
    ///
    /// The currently active task, if any, keeps its slot until its own
    /// release fires.
    pub fn close(&self) {
        let rejected: Vec<RequestTask> = {
            let mut state = lock_state(&self.state);
            state.closed = true;
            state.pending.drain(..).collect()
        };
        for task in rejected {
            task.reject();
        }
    }
}

/// Outcome of admitting a task while the queue lock is held.
enum Admission {
    Run(RequestTask),
    Reject(RequestTask),
}

fn lock_state(state: &Arc<Mutex<QueueState>>) -> std::sync::MutexGuard<'_, QueueState> {
    match state.lock() {
        Ok(guard) => guard,
        // A panic while holding the lock only happens in tests; the queue
        // state itself is never left mid-mutation.
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Guard owning the active slot; dropping it releases the queue.
pub(crate) struct ReleaseHandle {
    state: Arc<Mutex<QueueState>>,
}

impl Drop for ReleaseHandle {
    fn drop(&mut self) {
        let next = {
            let mut state = lock_state(&self.state);
            if state.closed {
                state.active = false;
                None
            } else {
                match state.pending.pop_front() {
                    Some(task) => Some(task),
                    None => {
                        state.active = false;
                        None
                    }
                }
            }
        };
        if let Some(task) = next {
            task.activate(ReleaseHandle {
                state: Arc::clone(&self.state),
            });
        }
    }
}

impl std::fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn fifo_activation_order() {
        let queue = RequestQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..16 {
            let order = Arc::clone(&order);
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            let (tx, rx) = tokio::sync::oneshot::channel::<()>();
            handles.push(rx);
            queue.submit(RequestTask::new(
                move |release| {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    order.lock().unwrap().push(i);
                    tokio::spawn(async move {
                        let _release = release;
                        tokio::task::yield_now().await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        let _ = tx.send(());
                    });
                },
                || {},
            ));
        }

        for rx in handles {
            rx.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_activates_next() {
        let queue = RequestQueue::new();
        let first_release = Arc::new(Mutex::new(None));
        let second_ran = Arc::new(AtomicUsize::new(0));

        {
            let slot = Arc::clone(&first_release);
            queue.submit(RequestTask::new(
                move |release| {
                    *slot.lock().unwrap() = Some(release);
                },
                || {},
            ));
        }
        {
            let second_ran = Arc::clone(&second_ran);
            queue.submit(RequestTask::new(
                move |release| {
                    drop(release);
                    second_ran.fetch_add(1, Ordering::SeqCst);
                },
                || {},
            ));
        }

        // Second task stays pending while the first holds its slot.
        assert_eq!(second_ran.load(Ordering::SeqCst), 0);
        drop(first_release.lock().unwrap().take());
        assert_eq!(second_ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_rejects_pending_synchronously() {
        let queue = RequestQueue::new();
        let held = Arc::new(Mutex::new(None));
        {
            let slot = Arc::clone(&held);
            queue.submit(RequestTask::new(
                move |release| {
                    *slot.lock().unwrap() = Some(release);
                },
                || {},
            ));
        }

        let disposed = Arc::new(AtomicUsize::new(0));
        {
            let disposed = Arc::clone(&disposed);
            queue.submit(RequestTask::new(
                |_release| panic!("pending task must not activate"),
                move || {
                    disposed.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }

        queue.close();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);

        // Submitting after close rejects synchronously too.
        let disposed_late = Arc::new(AtomicUsize::new(0));
        {
            let disposed_late = Arc::clone(&disposed_late);
            queue.submit(RequestTask::new(
                |_release| panic!("must not activate"),
                move || {
                    disposed_late.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }
        assert_eq!(disposed_late.load(Ordering::SeqCst), 1);

        // Releasing the active slot after close must not activate anything.
        drop(held.lock().unwrap().take());
    }
}
