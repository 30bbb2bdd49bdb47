// src/scheduler/mod.rs
//! AnimationScheduler - decides which animation produces its next frame when.
//!
//! Architecture:
//! ```text
//! main thread ──add/remove──> [commands] ──> scheduler thread
//!                                              │ dispatch (round-robin)
//!                              ┌───────────────┼───────────────┐
//!                              v               v               v
//!                       RasterizeWorker  RasterizeWorker  RasterizeWorker
//!                              │ completed(task, keep)          │
//!                              └──────> [commands] <────────────┘
//!                                              ^
//!                         SleepThread ──awake──┘
//! ```
//!
//! Everything reaching the scheduler thread goes through one command list
//! under one mutex, so adds, removals and completions are applied in the
//! order they arrived. A task is in at most one of two places: the idle list
//! waiting for its due time, or the working map while a worker has it.
//!
//! The idle list holds weak handles: a task its owner dropped is treated as
//! removed the next time the scheduler looks at it. Only a worker holds a
//! task strongly, and only while rasterizing it.

mod rasterize_worker;
mod sleep_thread;

pub use rasterize_worker::{CompletionCallback, RasterizeWorker};
pub use sleep_thread::SleepThread;

use crate::config::SchedulerConfig;
use anyhow::{anyhow, Context, Result};
use log::*;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Identifies a task across the scheduler and its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl TaskId {
    /// A process-unique id.
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Work the scheduler knows how to time and dispatch.
pub trait ScheduledTask: Send + Sync {
    fn id(&self) -> TaskId;

    /// Produces one frame on a rasterize thread. Returns whether the
    /// animation continues.
    fn rasterize(&self) -> bool;

    /// When the next frame is due.
    fn next_frame_time(&self) -> Instant;

    /// Advances the due time. `first_frame` makes the task due immediately.
    fn calculate_next_frame_time(&self, first_frame: bool);

    /// Whether the task still wants frames.
    fn is_animating(&self) -> bool;
}

/// Counters for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub dispatched: u64,
    pub completed: u64,
    pub stale_completions: u64,
}

enum TaskCommand {
    Add(Arc<dyn ScheduledTask>),
    Remove(TaskId),
    Completed {
        task: Arc<dyn ScheduledTask>,
        keep_animation: bool,
    },
}

/// An idle task. Does not keep the task alive.
struct IdleTask {
    id: TaskId,
    task: Weak<dyn ScheduledTask>,
}

impl IdleTask {
    fn new(task: &Arc<dyn ScheduledTask>) -> Self {
        Self {
            id: task.id(),
            task: Arc::downgrade(task),
        }
    }
}

struct SchedulerState {
    commands: Vec<TaskCommand>,
    /// Tasks waiting for their due time.
    animation_tasks: Vec<IdleTask>,
    /// Tasks handed to a worker, by worker index.
    working: HashMap<TaskId, usize>,
    /// Working tasks removed before their completion arrived.
    cancelled: HashSet<TaskId>,
    /// Working tasks added again before their completion arrived.
    readded: HashSet<TaskId>,
    next_worker: usize,
    need_to_sleep: bool,
    destroy: bool,
    stats: SchedulerStats,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            animation_tasks: Vec::new(),
            working: HashMap::new(),
            cancelled: HashSet::new(),
            readded: HashSet::new(),
            next_worker: 0,
            need_to_sleep: true,
            destroy: false,
            stats: SchedulerStats::default(),
        }
    }
}

struct SchedulerShared {
    thread_name: String,
    state: Mutex<SchedulerState>,
    wake: Condvar,
    workers: Vec<RasterizeWorker>,
    sleep_thread: SleepThread,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerShared {
    fn new(config: &SchedulerConfig) -> Arc<Self> {
        let prefix = &config.thread_name_prefix;
        let worker_count = config.worker_count();
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let workers = (0..worker_count)
                .map(|index| {
                    let weak = weak.clone();
                    let on_completed: CompletionCallback =
                        Arc::new(move |task: Arc<dyn ScheduledTask>, keep_animation: bool| {
                            if let Some(shared) = weak.upgrade() {
                                shared.push_command(TaskCommand::Completed {
                                    task,
                                    keep_animation,
                                });
                            }
                        });
                    RasterizeWorker::new(index, format!("{}-rasterize-{}", prefix, index), on_completed)
                })
                .collect();

            let weak_awake = weak.clone();
            let sleep_thread = SleepThread::new(
                format!("{}-sleep", prefix),
                Box::new(move || {
                    if let Some(shared) = weak_awake.upgrade() {
                        shared.wake_up();
                    }
                }),
            );

            Self {
                thread_name: format!("{}-scheduler", prefix),
                state: Mutex::new(SchedulerState::default()),
                wake: Condvar::new(),
                workers,
                sleep_thread,
                thread: Mutex::new(None),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_command(&self, command: TaskCommand) {
        let mut state = self.lock();
        if state.destroy {
            return;
        }
        state.commands.push(command);
        state.need_to_sleep = false;
        self.wake.notify_one();
    }

    fn wake_up(&self) {
        let mut state = self.lock();
        state.need_to_sleep = false;
        self.wake.notify_one();
    }

    fn ensure_started(self: &Arc<Self>) -> Result<()> {
        let mut handle = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return Ok(());
        }
        let shared = self.clone();
        let spawned = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || shared.run())
            .context("Failed to spawn animation scheduler thread")?;
        *handle = Some(spawned);
        Ok(())
    }

    fn run(&self) {
        info!(
            "AnimationScheduler: Thread started with {} rasterize workers",
            self.workers.len()
        );
        loop {
            // Task handles leave the scheduler outside the lock: dropping the
            // last one may call back into `remove_task`.
            let mut retired = Vec::new();
            let next_deadline = {
                let mut state = self.lock();
                while state.need_to_sleep && !state.destroy {
                    state = self.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                if state.destroy {
                    break;
                }
                state.need_to_sleep = true;
                self.apply_commands(&mut state, &mut retired);
                self.dispatch_due_tasks(&mut state, &mut retired)
            };
            drop(retired);

            match next_deadline {
                Some(deadline) => {
                    if let Err(e) = self.sleep_thread.sleep_until(deadline) {
                        warn!("AnimationScheduler: Cannot sleep until next frame: {:#}", e);
                    }
                }
                None => self.sleep_thread.cancel(),
            }
        }
        info!("AnimationScheduler: Thread stopped");
    }

    fn apply_commands(&self, state: &mut SchedulerState, retired: &mut Vec<Arc<dyn ScheduledTask>>) {
        let commands = std::mem::take(&mut state.commands);
        for command in commands {
            match command {
                TaskCommand::Add(task) => {
                    let id = task.id();
                    state.cancelled.remove(&id);
                    if state.working.contains_key(&id) {
                        trace!("AnimationScheduler: {:?} re-added while working", id);
                        state.readded.insert(id);
                        retired.push(task);
                    } else if state.animation_tasks.iter().any(|idle| idle.id == id) {
                        trace!("AnimationScheduler: {:?} already scheduled", id);
                        retired.push(task);
                    } else {
                        debug!("AnimationScheduler: Added {:?}", id);
                        task.calculate_next_frame_time(true);
                        state.animation_tasks.push(IdleTask::new(&task));
                        retired.push(task);
                    }
                }
                TaskCommand::Remove(id) => {
                    state.animation_tasks.retain(|idle| idle.id != id);
                    state.readded.remove(&id);
                    if state.working.contains_key(&id) {
                        state.cancelled.insert(id);
                    }
                    debug!("AnimationScheduler: Removed {:?}", id);
                }
                TaskCommand::Completed { task, keep_animation } => {
                    let id = task.id();
                    if state.working.remove(&id).is_none() {
                        trace!("AnimationScheduler: Ignoring stale completion of {:?}", id);
                        state.stats.stale_completions += 1;
                        retired.push(task);
                        continue;
                    }
                    state.stats.completed += 1;
                    if state.cancelled.remove(&id) {
                        trace!("AnimationScheduler: {:?} completed after removal", id);
                        retired.push(task);
                        continue;
                    }
                    let readded = state.readded.remove(&id);
                    if readded || (keep_animation && task.is_animating()) {
                        task.calculate_next_frame_time(readded && !keep_animation);
                        state.animation_tasks.push(IdleTask::new(&task));
                        retired.push(task);
                    } else {
                        debug!("AnimationScheduler: {:?} finished", id);
                        retired.push(task);
                    }
                }
            }
        }
    }

    /// Hands every due task to a worker. Returns the earliest deadline of
    /// the tasks left waiting.
    fn dispatch_due_tasks(
        &self,
        state: &mut SchedulerState,
        retired: &mut Vec<Arc<dyn ScheduledTask>>,
    ) -> Option<Instant> {
        if self.workers.is_empty() {
            return None;
        }
        let now = Instant::now();
        let mut next_deadline: Option<Instant> = None;
        let tasks = std::mem::take(&mut state.animation_tasks);
        for idle in tasks {
            let Some(task) = idle.task.upgrade() else {
                debug!("AnimationScheduler: {:?} dropped by its owner", idle.id);
                continue;
            };
            let due = task.next_frame_time();
            if due > now {
                next_deadline = Some(next_deadline.map_or(due, |deadline| deadline.min(due)));
                state.animation_tasks.push(idle);
                retired.push(task);
                continue;
            }

            let index = state.next_worker % self.workers.len();
            state.next_worker = (index + 1) % self.workers.len();
            let id = idle.id;
            state.working.insert(id, index);
            match self.workers[index].add_task(task.clone()) {
                Ok(()) => {
                    state.stats.dispatched += 1;
                    trace!("AnimationScheduler: Dispatched {:?} to worker {}", id, index);
                    retired.push(task);
                }
                Err(e) => {
                    error!("AnimationScheduler: Failed to dispatch {:?}: {:#}", id, e);
                    state.working.remove(&id);
                    retired.push(task);
                }
            }
        }
        next_deadline
    }

    fn shutdown(&self) {
        {
            let mut state = self.lock();
            if state.destroy {
                return;
            }
            state.destroy = true;
            self.wake.notify_all();
        }
        let handle = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                if let Err(e) = handle.join() {
                    error!("AnimationScheduler thread panicked: {:?}", e);
                }
            }
        }
        self.sleep_thread.stop();
        for worker in &self.workers {
            worker.stop();
        }
        // Pending commands may hold the last handle to a task.
        let leftovers = {
            let mut state = self.lock();
            state.working.clear();
            state.animation_tasks.clear();
            std::mem::take(&mut state.commands)
        };
        drop(leftovers);
        debug!("AnimationScheduler: Shut down");
    }
}

/// Owns the scheduler thread, its sleep thread and the rasterize workers.
///
/// Dropping it stops and joins every thread.
pub struct AnimationScheduler {
    shared: Arc<SchedulerShared>,
}

impl AnimationScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        let shared = SchedulerShared::new(config);
        debug!(
            "AnimationScheduler: Created with {} rasterize workers",
            shared.workers.len()
        );
        Self { shared }
    }

    /// Schedules `task`. Adding a task that is already scheduled is a no-op.
    ///
    /// The scheduler does not keep `task` alive between frames; dropping
    /// every other handle unschedules it.
    pub fn add_task(&self, task: Arc<dyn ScheduledTask>) -> Result<()> {
        add_task(&self.shared, task)
    }

    /// Unschedules `id`. A rasterization already in flight finishes, and its
    /// completion is ignored.
    pub fn remove_task(&self, id: TaskId) {
        self.shared.push_command(TaskCommand::Remove(id));
    }

    /// A handle that does not keep the scheduler alive.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.lock().stats
    }

    /// Whether `id` is waiting for its due time or being rasterized.
    pub fn is_task_active(&self, id: TaskId) -> bool {
        let state = self.shared.lock();
        (state.working.contains_key(&id) && !state.cancelled.contains(&id))
            || state
                .animation_tasks
                .iter()
                .any(|idle| idle.id == id && idle.task.strong_count() > 0)
            || state.commands.iter().any(|command| matches!(command, TaskCommand::Add(task) if task.id() == id))
    }

    /// Stops and joins every thread. Later adds fail.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl Drop for AnimationScheduler {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// Weak handle to an [`AnimationScheduler`], held by tasks.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Weak<SchedulerShared>,
}

impl SchedulerHandle {
    pub fn add_task(&self, task: Arc<dyn ScheduledTask>) -> Result<()> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| anyhow!("Animation scheduler is gone"))?;
        add_task(&shared, task)
    }

    /// No-op once the scheduler is gone.
    pub fn remove_task(&self, id: TaskId) {
        if let Some(shared) = self.shared.upgrade() {
            shared.push_command(TaskCommand::Remove(id));
        }
    }
}

fn add_task(shared: &Arc<SchedulerShared>, task: Arc<dyn ScheduledTask>) -> Result<()> {
    if shared.lock().destroy {
        return Err(anyhow!("Animation scheduler is shut down"));
    }
    shared.push_command(TaskCommand::Add(task));
    shared.ensure_started()
}
