// src/scheduler/rasterize_worker.rs
//! RasterizeWorker - one thread rasterizing the tasks dispatched to it.
//!
//! Simple work queue pattern: the scheduler pushes tasks, the worker pops
//! them in FIFO order, rasterizes with no lock held, and reports back through
//! the completion callback. The thread is spawned on the first task.

use super::{ScheduledTask, TaskId};
use anyhow::{anyhow, Context, Result};
use log::*;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

/// Called on the worker thread after each rasterization with the task and
/// whether its animation continues.
pub type CompletionCallback = Arc<dyn Fn(Arc<dyn ScheduledTask>, bool) + Send + Sync>;

#[derive(Default)]
struct WorkerQueue {
    tasks: VecDeque<Arc<dyn ScheduledTask>>,
    destroy: bool,
}

struct WorkerShared {
    queue: Mutex<WorkerQueue>,
    ready: Condvar,
    on_completed: CompletionCallback,
}

impl WorkerShared {
    fn lock(&self) -> MutexGuard<'_, WorkerQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until a task is queued. `None` once the worker is stopping.
    fn pop(&self) -> Option<Arc<dyn ScheduledTask>> {
        let mut queue = self.lock();
        loop {
            if queue.destroy {
                return None;
            }
            if let Some(task) = queue.tasks.pop_front() {
                return Some(task);
            }
            queue = self.ready.wait(queue).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn execute(&self, index: usize, task: Arc<dyn ScheduledTask>) {
        let id = task.id();
        trace!("RasterizeWorker[{}]: Rasterizing {:?}", index, id);
        let keep_animation = match panic::catch_unwind(AssertUnwindSafe(|| task.rasterize())) {
            Ok(keep_animation) => keep_animation,
            Err(_) => {
                error!("RasterizeWorker[{}]: Rasterizing {:?} panicked", index, id);
                false
            }
        };
        (self.on_completed)(task, keep_animation);
    }
}

/// Pulls items from `next` and runs `execute` on each until `next` is done.
fn run_worker_loop<T>(mut next: impl FnMut() -> Option<T>, mut execute: impl FnMut(T)) {
    while let Some(item) = next() {
        execute(item);
    }
}

/// A rasterize thread with its own task queue.
pub struct RasterizeWorker {
    index: usize,
    thread_name: String,
    shared: Arc<WorkerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RasterizeWorker {
    pub fn new(index: usize, thread_name: String, on_completed: CompletionCallback) -> Self {
        Self {
            index,
            thread_name,
            shared: Arc::new(WorkerShared {
                queue: Mutex::new(WorkerQueue::default()),
                ready: Condvar::new(),
                on_completed,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Queues `task` unless it is already queued, starting the thread if
    /// needed.
    pub fn add_task(&self, task: Arc<dyn ScheduledTask>) -> Result<()> {
        let id = task.id();
        {
            let mut queue = self.shared.lock();
            if queue.destroy {
                return Err(anyhow!("RasterizeWorker[{}] is stopped", self.index));
            }
            if queue.tasks.iter().any(|queued| queued.id() == id) {
                trace!("RasterizeWorker[{}]: {:?} already queued", self.index, id);
                return Ok(());
            }
            queue.tasks.push_back(task);
            self.shared.ready.notify_one();
        }

        if let Err(e) = self.ensure_started() {
            self.shared.lock().tasks.retain(|queued| queued.id() != id);
            return Err(e);
        }
        Ok(())
    }

    /// Tasks waiting in the queue (not counting the one being rasterized).
    pub fn pending_count(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    /// Whether `id` is waiting in the queue.
    pub fn is_queued(&self, id: TaskId) -> bool {
        self.shared.lock().tasks.iter().any(|queued| queued.id() == id)
    }

    pub fn is_started(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stops the thread after its current task and drops queued tasks.
    pub fn stop(&self) {
        // Queued handles may be the last ones; drop them outside the lock.
        let dropped = {
            let mut queue = self.shared.lock();
            queue.destroy = true;
            self.shared.ready.notify_all();
            std::mem::take(&mut queue.tasks)
        };
        drop(dropped);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if let Err(e) = handle.join() {
                error!("RasterizeWorker[{}] thread panicked: {:?}", self.index, e);
            }
        }
    }

    fn ensure_started(&self) -> Result<()> {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return Ok(());
        }
        let shared = self.shared.clone();
        let index = self.index;
        let spawned = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || {
                info!("RasterizeWorker[{}]: Thread started", index);
                run_worker_loop(|| shared.pop(), |task| shared.execute(index, task));
                info!("RasterizeWorker[{}]: Thread stopped", index);
            })
            .with_context(|| format!("Failed to spawn rasterize thread {}", index))?;
        *handle = Some(spawned);
        Ok(())
    }
}

impl Drop for RasterizeWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::{channel, sync_channel, Receiver, SyncSender};
    use std::time::{Duration, Instant};
    use test_log::test;

    /// Blocks inside `rasterize` until the test lets it go.
    struct GatedTask {
        id: TaskId,
        entered: SyncSender<TaskId>,
        gate: Mutex<Receiver<()>>,
        runs: AtomicUsize,
    }

    impl ScheduledTask for GatedTask {
        fn id(&self) -> TaskId {
            self.id
        }

        fn rasterize(&self) -> bool {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let _ = self.entered.send(self.id);
            let _ = self.gate.lock().unwrap().recv_timeout(Duration::from_secs(5));
            true
        }

        fn next_frame_time(&self) -> Instant {
            Instant::now()
        }

        fn calculate_next_frame_time(&self, _first_frame: bool) {}

        fn is_animating(&self) -> bool {
            true
        }
    }

    fn gated(id: u64, entered: &SyncSender<TaskId>) -> (Arc<GatedTask>, SyncSender<()>) {
        let (gate_tx, gate_rx) = sync_channel(8);
        let task = Arc::new(GatedTask {
            id: TaskId(id),
            entered: entered.clone(),
            gate: Mutex::new(gate_rx),
            runs: AtomicUsize::new(0),
        });
        (task, gate_tx)
    }

    #[test]
    fn it_should_start_lazily_on_first_task() {
        let worker = RasterizeWorker::new(0, "test-rasterize-0".to_string(), Arc::new(|_: Arc<dyn ScheduledTask>, _: bool| {}));
        assert!(!worker.is_started());

        let (entered_tx, entered_rx) = sync_channel(8);
        let (task, gate) = gated(1, &entered_tx);
        worker.add_task(task).unwrap();
        assert!(worker.is_started());

        assert_eq!(entered_rx.recv_timeout(Duration::from_secs(2)).unwrap(), TaskId(1));
        gate.send(()).unwrap();
    }

    #[test]
    fn it_should_queue_a_task_only_once() {
        let (done_tx, done_rx) = channel();
        let worker = RasterizeWorker::new(
            0,
            "test-rasterize-0".to_string(),
            Arc::new(move |task: Arc<dyn ScheduledTask>, keep: bool| {
                let _ = done_tx.send((task.id(), keep));
            }),
        );
        let (entered_tx, entered_rx) = sync_channel(8);
        let (busy, busy_gate) = gated(1, &entered_tx);
        let (queued, queued_gate) = gated(2, &entered_tx);

        worker.add_task(busy.clone()).unwrap();
        assert_eq!(entered_rx.recv_timeout(Duration::from_secs(2)).unwrap(), TaskId(1));

        worker.add_task(queued.clone()).unwrap();
        worker.add_task(queued.clone()).unwrap();
        assert_eq!(worker.pending_count(), 1);
        assert!(worker.is_queued(TaskId(2)));

        busy_gate.send(()).unwrap();
        queued_gate.send(()).unwrap();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)).unwrap(), (TaskId(1), true));
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)).unwrap(), (TaskId(2), true));
        assert_eq!(queued.runs.load(Ordering::SeqCst), 1);
    }

    struct PanickingTask;

    impl ScheduledTask for PanickingTask {
        fn id(&self) -> TaskId {
            TaskId(7)
        }

        fn rasterize(&self) -> bool {
            panic!("rasterizer blew up");
        }

        fn next_frame_time(&self) -> Instant {
            Instant::now()
        }

        fn calculate_next_frame_time(&self, _first_frame: bool) {}

        fn is_animating(&self) -> bool {
            true
        }
    }

    #[test]
    fn it_should_complete_a_panicking_task_without_continuing_it() {
        let (done_tx, done_rx) = channel();
        let worker = RasterizeWorker::new(
            3,
            "test-rasterize-3".to_string(),
            Arc::new(move |task: Arc<dyn ScheduledTask>, keep: bool| {
                let _ = done_tx.send((task.id(), keep));
            }),
        );
        worker.add_task(Arc::new(PanickingTask)).unwrap();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)).unwrap(), (TaskId(7), false));
    }

    #[test]
    fn it_should_refuse_tasks_after_stop() {
        let worker = RasterizeWorker::new(0, "test-rasterize-0".to_string(), Arc::new(|_: Arc<dyn ScheduledTask>, _: bool| {}));
        worker.stop();
        assert!(worker.add_task(Arc::new(PanickingTask)).is_err());
        assert_eq!(worker.pending_count(), 0);
    }
}
