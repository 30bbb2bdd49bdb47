// src/lib.rs
//! Threaded playback core for vector animations.
//!
//! Frames are rasterized on a pool of worker threads, handed to the main
//! thread through a triple-buffered render target, and announced on the
//! main thread through a coalescing event manager. The host toolkit is
//! reached only through the traits in [`platform`]; headless
//! implementations of all of them ship with the crate.

pub mod config;
pub mod context;
pub mod error;
pub mod event_manager;
pub mod platform;
pub mod rasterizer;
pub mod renderer;
pub mod scheduler;
pub mod task;

pub use config::Config;
pub use context::AnimationContext;
pub use error::{RasterizeError, SurfaceError};
pub use event_manager::{EventHandler, HandlerId, PluginEventManager};
pub use renderer::VectorAnimationRenderer;
pub use scheduler::{AnimationScheduler, ScheduledTask, TaskId};
pub use task::{AnimationTask, LoopingMode, PlayState, StopBehavior};
