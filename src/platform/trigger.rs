// src/platform/trigger.rs
//! EventTrigger - Cross-thread signaling to run work on the main thread.
//!
//! Rasterize and scheduler threads never touch main-thread state directly.
//! When they have something to report they fire a trigger, and the host
//! delivers the trigger's callback during its next tick.

use anyhow::Result;

/// Wakes the main thread and schedules a callback there.
///
/// Firing the same trigger several times before the main thread runs may be
/// delivered as a single callback.
pub trait EventTrigger: Send + Sync {
    /// Schedule the callback. Callable from any thread.
    fn trigger(&self) -> Result<()>;
}
