// src/renderer/rendering_data.rs
//! RenderingData - one generation of render target.
//!
//! A renderer holds up to three roles of these: `prepared` (built for a new
//! size, not yet used), `current` (drawn into by the rasterize thread and
//! sampled by the main thread) and `previous` (retired, kept until the main
//! thread can no longer be uploading from them).

use crate::platform::surface::{SurfaceFactory, SurfaceQueue, TextureId};
use crate::error::SurfaceError;
use log::*;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Render target of a fixed size.
pub struct RenderingData {
    width: u32,
    height: u32,
    target: Option<Mutex<Box<dyn SurfaceQueue>>>,
    texture: Option<TextureId>,
}

impl RenderingData {
    /// A buffer holder with no pixel storage yet.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            target: None,
            texture: None,
        }
    }

    /// Allocates the native surface for this size.
    pub fn prepare_target(&mut self, factory: &dyn SurfaceFactory) -> Result<(), SurfaceError> {
        let surface = factory.create_surface(self.width, self.height)?;
        self.texture = Some(surface.texture());
        self.target = Some(Mutex::new(surface));
        debug!(
            "RenderingData: Prepared {}x{} target {:?}",
            self.width, self.height, self.texture
        );
        Ok(())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn texture(&self) -> Option<TextureId> {
        self.texture
    }

    /// Locks the surface for dequeue/enqueue. `None` before `prepare_target`.
    pub fn lock_target(&self) -> Option<MutexGuard<'_, Box<dyn SurfaceQueue>>> {
        self.target
            .as_ref()
            .map(|target| target.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl std::fmt::Debug for RenderingData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderingData")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("texture", &self.texture)
            .finish()
    }
}
