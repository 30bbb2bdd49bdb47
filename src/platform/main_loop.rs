//! Headless main loop.
//!
//! A minimal stand-in for the host toolkit's event loop: whichever thread
//! calls [`HeadlessMainLoop::run_once`] is "the main thread". Each tick waits
//! (bounded by the configured interval) for a trigger, runs the fired trigger
//! callbacks, then runs pre-phase and post-phase processors.

use crate::config::MainLoopConfig;
use crate::platform::{EventTrigger, HostEventLoop, Processor, ProcessorId, TriggerCallback};
use anyhow::{anyhow, Result};
use log::*;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

struct ProcessorEntry {
    id: ProcessorId,
    processor: Weak<dyn Processor>,
    post_phase: bool,
}

#[derive(Default)]
struct LoopState {
    processors: Vec<ProcessorEntry>,
    next_processor_id: u64,
    callbacks: HashMap<u64, Arc<dyn Fn() + Send + Sync>>,
    next_trigger_id: u64,
    fired: VecDeque<u64>,
}

struct LoopShared {
    state: Mutex<LoopState>,
    wake: Condvar,
}

impl LoopShared {
    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single-threaded event loop driven by explicit `run_once` calls.
pub struct HeadlessMainLoop {
    shared: Arc<LoopShared>,
    tick_interval: Duration,
}

/// Result of one [`HeadlessMainLoop::run_once`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Trigger callbacks delivered this tick.
    pub triggers: usize,
    /// Processors run this tick (both phases).
    pub processors: usize,
}

impl HeadlessMainLoop {
    pub fn new(config: &MainLoopConfig) -> Self {
        let tick_interval = Duration::from_secs_f64(config.tick_interval_ms.max(0.0) / 1000.0);
        Self {
            shared: Arc::new(LoopShared {
                state: Mutex::new(LoopState::default()),
                wake: Condvar::new(),
            }),
            tick_interval,
        }
    }

    /// Runs a single tick, waiting up to the tick interval for a trigger.
    pub fn run_once(&self) -> TickStats {
        let callbacks: Vec<Arc<dyn Fn() + Send + Sync>> = {
            let mut state = self.shared.lock();
            if state.fired.is_empty() && !self.tick_interval.is_zero() {
                let (guard, _) = self
                    .shared
                    .wake
                    .wait_timeout(state, self.tick_interval)
                    .unwrap_or_else(PoisonError::into_inner);
                state = guard;
            }
            let fired: Vec<u64> = state.fired.drain(..).collect();
            fired
                .into_iter()
                .filter_map(|id| state.callbacks.get(&id).cloned())
                .collect()
        };

        let mut stats = TickStats {
            triggers: callbacks.len(),
            processors: 0,
        };
        for callback in callbacks {
            callback();
        }

        for post_phase in [false, true] {
            for processor in self.live_processors(post_phase) {
                processor.process(post_phase);
                stats.processors += 1;
            }
        }

        trace!("HeadlessMainLoop: Tick done {:?}", stats);
        stats
    }

    /// Ticks until `done` returns true or `timeout` elapses.
    ///
    /// Returns whether `done` was satisfied.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            if Instant::now() >= deadline {
                return done();
            }
            self.run_once();
        }
    }

    /// Number of registered processors whose owner is still alive.
    pub fn processor_count(&self) -> usize {
        self.shared
            .lock()
            .processors
            .iter()
            .filter(|entry| entry.processor.strong_count() > 0)
            .count()
    }

    /// Number of live event triggers.
    pub fn trigger_count(&self) -> usize {
        self.shared.lock().callbacks.len()
    }

    fn live_processors(&self, post_phase: bool) -> Vec<Arc<dyn Processor>> {
        let mut state = self.shared.lock();
        state
            .processors
            .retain(|entry| entry.processor.strong_count() > 0);
        state
            .processors
            .iter()
            .filter(|entry| entry.post_phase == post_phase)
            .filter_map(|entry| entry.processor.upgrade())
            .collect()
    }
}

impl HostEventLoop for HeadlessMainLoop {
    fn register_processor(&self, processor: Weak<dyn Processor>, post_phase: bool) -> ProcessorId {
        let mut state = self.shared.lock();
        let id = ProcessorId(state.next_processor_id);
        state.next_processor_id += 1;
        state.processors.push(ProcessorEntry {
            id,
            processor,
            post_phase,
        });
        debug!("HeadlessMainLoop: Registered processor {:?} (post_phase={})", id, post_phase);
        id
    }

    fn unregister_processor(&self, id: ProcessorId) {
        let mut state = self.shared.lock();
        state.processors.retain(|entry| entry.id != id);
        debug!("HeadlessMainLoop: Unregistered processor {:?}", id);
    }

    fn create_event_trigger(&self, callback: TriggerCallback) -> Box<dyn EventTrigger> {
        let mut state = self.shared.lock();
        let id = state.next_trigger_id;
        state.next_trigger_id += 1;
        state.callbacks.insert(id, Arc::from(callback));
        debug!("HeadlessMainLoop: Created event trigger {}", id);
        Box::new(HeadlessTrigger {
            id,
            shared: Arc::downgrade(&self.shared),
        })
    }
}

struct HeadlessTrigger {
    id: u64,
    shared: Weak<LoopShared>,
}

impl EventTrigger for HeadlessTrigger {
    fn trigger(&self) -> Result<()> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| anyhow!("main loop is gone"))?;
        let mut state = shared.lock();
        if !state.callbacks.contains_key(&self.id) {
            return Err(anyhow!("event trigger {} was released", self.id));
        }
        if !state.fired.contains(&self.id) {
            state.fired.push_back(self.id);
        }
        shared.wake.notify_all();
        Ok(())
    }
}

impl Drop for HeadlessTrigger {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut state = shared.lock();
            state.callbacks.remove(&self.id);
            state.fired.retain(|id| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use test_log::test;

    struct CountingProcessor {
        pre: AtomicUsize,
        post: AtomicUsize,
    }

    impl Processor for CountingProcessor {
        fn process(&self, post_phase: bool) {
            if post_phase {
                self.post.fetch_add(1, Ordering::SeqCst);
            } else {
                self.pre.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn quick_loop() -> HeadlessMainLoop {
        HeadlessMainLoop::new(&MainLoopConfig {
            tick_interval_ms: 1.0,
        })
    }

    #[test]
    fn it_should_run_processors_in_their_registered_phase() {
        let main_loop = quick_loop();
        let processor = Arc::new(CountingProcessor {
            pre: AtomicUsize::new(0),
            post: AtomicUsize::new(0),
        });
        let weak: Weak<dyn Processor> = Arc::downgrade(&processor) as Weak<dyn Processor>;
        main_loop.register_processor(weak, true);

        main_loop.run_once();
        main_loop.run_once();

        assert_eq!(processor.pre.load(Ordering::SeqCst), 0);
        assert_eq!(processor.post.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn it_should_prune_dropped_processors() {
        let main_loop = quick_loop();
        let processor = Arc::new(CountingProcessor {
            pre: AtomicUsize::new(0),
            post: AtomicUsize::new(0),
        });
        main_loop.register_processor(Arc::downgrade(&processor) as Weak<dyn Processor>, false);
        assert_eq!(main_loop.processor_count(), 1);

        drop(processor);
        let stats = main_loop.run_once();
        assert_eq!(stats.processors, 0);
        assert_eq!(main_loop.processor_count(), 0);
    }

    #[test]
    fn it_should_coalesce_repeated_triggers_into_one_callback() {
        let main_loop = quick_loop();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let trigger = main_loop.create_event_trigger(Box::new(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }));

        trigger.trigger().unwrap();
        trigger.trigger().unwrap();
        let stats = main_loop.run_once();

        assert_eq!(stats.triggers, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn it_should_wake_a_waiting_tick_from_another_thread() {
        let main_loop = HeadlessMainLoop::new(&MainLoopConfig {
            tick_interval_ms: 5_000.0,
        });
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let trigger: Arc<dyn EventTrigger> = Arc::from(main_loop.create_event_trigger(Box::new(
            move || {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            },
        )));

        let remote = trigger.clone();
        let firing = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.trigger().unwrap();
        });

        let start = Instant::now();
        main_loop.run_once();
        firing.join().unwrap();

        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn it_should_reject_triggers_after_release() {
        let main_loop = quick_loop();
        let trigger = main_loop.create_event_trigger(Box::new(|| {}));
        let trigger: Arc<dyn EventTrigger> = Arc::from(trigger);
        assert_eq!(main_loop.trigger_count(), 1);

        // Dropping the loop invalidates outstanding triggers.
        drop(main_loop);
        assert!(trigger.trigger().is_err());
    }
}
