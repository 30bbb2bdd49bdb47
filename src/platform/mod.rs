// src/platform/mod.rs
//
// Narrow interfaces to the host toolkit: the per-tick processor registry and
// the cross-thread wakeup primitive. The headless implementations live in
// `main_loop` and `surface`.

use std::sync::Weak;

pub mod main_loop;
pub mod surface;
pub mod trigger;

pub use main_loop::HeadlessMainLoop;
pub use trigger::EventTrigger;

/// Identifies a processor registration on a [`HostEventLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessorId(pub u64);

/// Callback run on the main thread when an [`EventTrigger`] fires.
pub type TriggerCallback = Box<dyn Fn() + Send + Sync>;

/// Something the host runs once per main-loop tick.
pub trait Processor: Send + Sync {
    /// Called on the main thread. `post_phase` is true for processors that
    /// registered for the phase after the frame update.
    fn process(&self, post_phase: bool);
}

/// The host toolkit's single-threaded event loop.
///
/// Registration calls come from the main thread; triggers created here may be
/// fired from any thread.
pub trait HostEventLoop: Send + Sync {
    /// Adds a per-tick processor. The loop holds it weakly; a dropped
    /// processor is skipped and pruned.
    fn register_processor(&self, processor: Weak<dyn Processor>, post_phase: bool) -> ProcessorId;

    /// Removes a processor. Unknown ids are ignored.
    fn unregister_processor(&self, id: ProcessorId);

    /// Creates a trigger whose callback runs on the main thread during the
    /// tick after it fires. Dropping the trigger cancels pending deliveries.
    fn create_event_trigger(&self, callback: TriggerCallback) -> Box<dyn EventTrigger>;
}
