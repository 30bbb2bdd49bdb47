// src/scheduler/sleep_thread.rs
//! SleepThread - waits for the scheduler's next deadline on its own thread.
//!
//! The scheduler hands over the earliest due time and goes back to waiting on
//! its own condition variable, so it stays responsive to new tasks and
//! completions. A new deadline replaces the old one and interrupts the
//! current wait.

use anyhow::{anyhow, Context, Result};
use log::*;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Called on the sleep thread when a deadline elapses.
pub type AwakeCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct SleepState {
    target: Option<Instant>,
    destroy: bool,
}

struct SleepShared {
    state: Mutex<SleepState>,
    wake: Condvar,
    on_awake: AwakeCallback,
}

impl SleepShared {
    fn lock(&self) -> MutexGuard<'_, SleepState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self) {
        debug!("SleepThread: Started");
        let mut state = self.lock();
        loop {
            if state.destroy {
                break;
            }
            match state.target {
                None => {
                    state = self.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                Some(target) => {
                    let now = Instant::now();
                    if now >= target {
                        state.target = None;
                        drop(state);
                        trace!("SleepThread: Deadline reached");
                        (self.on_awake)();
                        state = self.lock();
                    } else {
                        state = self
                            .wake
                            .wait_timeout(state, target - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                    }
                }
            }
        }
        debug!("SleepThread: Stopped");
    }
}

pub struct SleepThread {
    thread_name: String,
    shared: Arc<SleepShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SleepThread {
    pub fn new(thread_name: String, on_awake: AwakeCallback) -> Self {
        Self {
            thread_name,
            shared: Arc::new(SleepShared {
                state: Mutex::new(SleepState::default()),
                wake: Condvar::new(),
                on_awake,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Replaces the pending deadline with `target`.
    pub fn sleep_until(&self, target: Instant) -> Result<()> {
        {
            let mut state = self.shared.lock();
            if state.destroy {
                return Err(anyhow!("SleepThread is stopped"));
            }
            state.target = Some(target);
            self.shared.wake.notify_one();
        }
        self.ensure_started()
    }

    /// Drops the pending deadline, if any.
    pub fn cancel(&self) {
        self.shared.lock().target = None;
        self.shared.wake.notify_one();
    }

    /// The pending deadline.
    pub fn target(&self) -> Option<Instant> {
        self.shared.lock().target
    }

    pub fn stop(&self) {
        {
            let mut state = self.shared.lock();
            state.destroy = true;
            state.target = None;
            self.shared.wake.notify_all();
        }
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
                error!("SleepThread panicked: {:?}", e);
            }
        }
    }

    fn ensure_started(&self) -> Result<()> {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return Ok(());
        }
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || shared.run())
            .context("Failed to spawn sleep thread")?;
        *handle = Some(spawned);
        Ok(())
    }
}

impl Drop for SleepThread {
    fn drop(&mut self) {
        self.stop();
    }
}
