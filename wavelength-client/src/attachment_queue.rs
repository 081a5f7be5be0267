use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::runtime::Handle;
use tracing::debug;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Task>,
    active: usize,
}

struct QueueInner {
    state: Mutex<QueueState>,
    max_active: usize,
    runtime: Handle,
}

impl QueueInner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// FIFO queue of blocking jobs with at most `max_active` running at once.
///
/// Jobs run on the tokio blocking pool. There is no cancellation: a job that
/// has started always runs to completion.
#[derive(Clone)]
pub struct AttachmentQueueManager {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for AttachmentQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentQueueManager")
            .field("max_active", &self.inner.max_active)
            .field("active", &self.active_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl AttachmentQueueManager {
    /// Half of the available parallelism, never less than one.
    pub fn new(runtime: Handle) -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_max_active(runtime, threads / 2)
    }

    pub fn with_max_active(runtime: Handle, max_active: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                max_active: max_active.max(1),
                runtime,
            }),
        }
    }

    pub fn max_active(&self) -> usize {
        self.inner.max_active
    }

    pub fn active_count(&self) -> usize {
        self.inner.state().active
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state().pending.len()
    }

    pub fn add_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.state().pending.push_back(Box::new(task));
        dispatch(&self.inner);
    }
}

fn dispatch(inner: &Arc<QueueInner>) {
    loop {
        let task = {
            let mut state = inner.state();
            if state.active >= inner.max_active {
                return;
            }
            let Some(task) = state.pending.pop_front() else {
                return;
            };
            state.active += 1;
            task
        };

        let completion = Completion {
            inner: Arc::clone(inner),
        };
        inner.runtime.spawn_blocking(move || {
            let _completion = completion;
            task();
        });
    }
}

/// Frees the slot and pulls the next job, even if the job panicked.
struct Completion {
    inner: Arc<QueueInner>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state();
            state.active = state.active.saturating_sub(1);
        }
        debug!("attachment task finished");
        dispatch(&self.inner);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio::{sync::mpsc, time::timeout};

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn never_exceeds_max_active() {
        let queue = AttachmentQueueManager::with_max_active(Handle::current(), 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for index in 0..10 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done_tx = done_tx.clone();
            queue.add_task(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                let _ = done_tx.send(index);
            });
        }

        for _ in 0..10 {
            timeout(Duration::from_secs(5), done_rx.recv())
                .await
                .expect("task completes in time")
                .expect("completion sender alive");
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.active_count(), 0);
        assert_eq!(queue.pending_count(), 0);
    }

    async fn next_start(started: &mut mpsc::UnboundedReceiver<usize>) -> usize {
        timeout(Duration::from_secs(5), started.recv())
            .await
            .expect("task starts in time")
            .expect("start sender alive")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_slots_start_tasks_in_submission_order() {
        let queue = AttachmentQueueManager::with_max_active(Handle::current(), 2);
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let mut gates = Vec::new();

        for index in 0..10 {
            let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
            gates.push(gate_tx);
            let started_tx = started_tx.clone();
            queue.add_task(move || {
                let _ = started_tx.send(index);
                let _ = gate_rx.recv();
            });
        }

        let mut first_pair = vec![
            next_start(&mut started_rx).await,
            next_start(&mut started_rx).await,
        ];
        first_pair.sort_unstable();
        assert_eq!(first_pair, vec![0, 1]);
        assert!(
            timeout(Duration::from_millis(50), started_rx.recv())
                .await
                .is_err(),
            "a third task started while both slots were busy"
        );

        // Finishing the oldest running task admits exactly the next queued one.
        for (index, gate) in gates.iter().take(8).enumerate() {
            gate.send(()).expect("task waiting on its gate");
            assert_eq!(next_start(&mut started_rx).await, index + 2);
        }
        for gate in &gates[8..] {
            gate.send(()).expect("task waiting on its gate");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_slot_runs_in_submission_order() {
        let queue = AttachmentQueueManager::with_max_active(Handle::current(), 1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for index in 0..10 {
            let order = Arc::clone(&order);
            let done_tx = done_tx.clone();
            queue.add_task(move || {
                order.lock().expect("order lock").push(index);
                let _ = done_tx.send(());
            });
        }

        for _ in 0..10 {
            timeout(Duration::from_secs(5), done_rx.recv())
                .await
                .expect("task completes in time")
                .expect("completion sender alive");
        }
        assert_eq!(*order.lock().expect("order lock"), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn max_active_is_at_least_one() {
        let queue = AttachmentQueueManager::with_max_active(Handle::current(), 0);
        assert_eq!(queue.max_active(), 1);
        assert!(AttachmentQueueManager::new(Handle::current()).max_active() >= 1);
    }
}
