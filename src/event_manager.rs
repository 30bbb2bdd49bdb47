//! PluginEventManager - the rendezvous between worker threads and the main thread.
//!
//! Rasterize and scheduler threads call [`PluginEventManager::trigger_event`]
//! when a handler has something to deliver. The manager records the handler
//! (once, in first-trigger order), wakes the main thread through a single
//! [`EventTrigger`], and on the main thread delivers exactly one
//! [`EventHandler::notify_event`] per handler per drain.
//!
//! Threading model:
//! - `trigger_event` may be called from any thread
//! - handler registration and draining happen on the main thread
//! - handlers are held weakly; the manager never keeps one alive

use crate::platform::{EventTrigger, HostEventLoop, Processor, ProcessorId};
use log::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Receives main-thread notifications.
pub trait EventHandler: Send + Sync {
    /// Called on the main thread, at most once per drain.
    fn notify_event(&self);
}

/// Identifies a registered [`EventHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

#[derive(Default)]
struct Registry {
    handlers: HashMap<HandlerId, Weak<dyn EventHandler>>,
    next_id: u64,
    processor: Option<ProcessorId>,
    trigger: Option<Box<dyn EventTrigger>>,
}

#[derive(Default)]
struct TriggerQueue {
    /// Handler -> order of its oldest outstanding trigger.
    pending: HashMap<HandlerId, u64>,
    next_order: u64,
    /// Set once the main thread has been woken for this drain cycle.
    event_triggered: bool,
}

/// Collects cross-thread notifications and delivers them on the main thread.
pub struct PluginEventManager {
    host: Arc<dyn HostEventLoop>,
    weak_self: Weak<PluginEventManager>,
    registry: Mutex<Registry>,
    triggered: Mutex<TriggerQueue>,
}

impl PluginEventManager {
    pub fn new(host: Arc<dyn HostEventLoop>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            host,
            weak_self: weak_self.clone(),
            registry: Mutex::new(Registry::default()),
            triggered: Mutex::new(TriggerQueue::default()),
        })
    }

    /// Registers `handler` for delivery.
    ///
    /// The first registration hooks the manager into the host's per-tick
    /// processing and creates the cross-thread trigger.
    pub fn add_event_handler(&self, handler: Weak<dyn EventHandler>) -> HandlerId {
        let mut registry = self.registry();
        let id = HandlerId(registry.next_id);
        registry.next_id += 1;
        registry.handlers.insert(id, handler);

        if registry.processor.is_none() {
            let processor: Weak<dyn Processor> = self.weak_self.clone();
            registry.processor = Some(self.host.register_processor(processor, false));
        }
        if registry.trigger.is_none() {
            let weak_self = self.weak_self.clone();
            registry.trigger = Some(self.host.create_event_trigger(Box::new(move || {
                if let Some(manager) = weak_self.upgrade() {
                    manager.on_event_triggered();
                }
            })));
            // Nothing pending can belong to a live handler: the set was empty.
            *self.queue() = TriggerQueue::default();
        }

        debug!(
            "PluginEventManager: Added handler {:?} ({} registered)",
            id,
            registry.handlers.len()
        );
        id
    }

    /// Unregisters a handler. A pending trigger for it is never delivered.
    ///
    /// Removing the last handler releases the trigger and the processor
    /// registration and drops everything pending.
    pub fn remove_event_handler(&self, id: HandlerId) {
        let (trigger, processor) = {
            let mut registry = self.registry();
            if registry.handlers.remove(&id).is_none() {
                return;
            }
            debug!(
                "PluginEventManager: Removed handler {:?} ({} left)",
                id,
                registry.handlers.len()
            );
            if !registry.handlers.is_empty() {
                return;
            }
            (registry.trigger.take(), registry.processor.take())
        };

        *self.queue() = TriggerQueue::default();
        if let Some(processor) = processor {
            self.host.unregister_processor(processor);
        }
        drop(trigger);
    }

    /// Requests a `notify_event` for `id` on the main thread. Callable from
    /// any thread; repeated triggers before the next drain coalesce.
    pub fn trigger_event(&self, id: HandlerId) {
        let fire = {
            let mut queue = self.queue();
            if !queue.pending.contains_key(&id) {
                let order = queue.next_order;
                queue.next_order += 1;
                queue.pending.insert(id, order);
            }
            !std::mem::replace(&mut queue.event_triggered, true)
        };

        if fire {
            let registry = self.registry();
            match registry.trigger.as_ref() {
                Some(trigger) => {
                    if let Err(e) = trigger.trigger() {
                        warn!("PluginEventManager: Failed to wake main thread: {:#}", e);
                    }
                }
                None => trace!("PluginEventManager: Trigger for {:?} with no handlers", id),
            }
        }
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.registry().handlers.len()
    }

    /// Number of handlers waiting for the next drain.
    pub fn pending_count(&self) -> usize {
        self.queue().pending.len()
    }

    /// Drains pending triggers and notifies their handlers. Main thread only.
    pub fn on_event_triggered(&self) {
        let pending = {
            let mut queue = self.queue();
            queue.next_order = 0;
            queue.event_triggered = false;
            std::mem::take(&mut queue.pending)
        };
        if pending.is_empty() {
            return;
        }

        let mut ordered: Vec<(u64, HandlerId)> =
            pending.into_iter().map(|(id, order)| (order, id)).collect();
        ordered.sort_unstable();

        trace!("PluginEventManager: Delivering {} notifications", ordered.len());
        for (_, id) in ordered {
            // Re-validated for every delivery: an earlier handler may have
            // removed this one.
            let handler = self.registry().handlers.get(&id).and_then(Weak::upgrade);
            match handler {
                Some(handler) => handler.notify_event(),
                None => trace!("PluginEventManager: Skipping removed handler {:?}", id),
            }
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self) -> MutexGuard<'_, TriggerQueue> {
        self.triggered.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Processor for PluginEventManager {
    fn process(&self, _post_phase: bool) {
        self.on_event_triggered();
    }
}

impl Drop for PluginEventManager {
    fn drop(&mut self) {
        let registry = self.registry.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(processor) = registry.processor.take() {
            self.host.unregister_processor(processor);
        }
    }
}
