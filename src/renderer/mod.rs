// src/renderer/mod.rs
//! VectorAnimationRenderer - hands rasterized frames from a worker to the main thread.
//!
//! Threading model:
//! - `render`/`render_stopped`/`set_size` run on a rasterize thread
//! - `is_render_ready`/`target_texture`/`notify_event` run on the main thread
//! - nothing here blocks waiting for the other side
//!
//! Locks:
//! - `state` guards the logical renderer state (flags, ready texture)
//! - `rendering_data` guards the prepared/current/previous roles and is
//!   always the innermost lock
//! - `rasterizer` and each target's surface lock are taken only by `render`
//!   and `load`, never while `state` or `rendering_data` is held

mod rendering_data;

pub use rendering_data::RenderingData;

use crate::event_manager::{EventHandler, HandlerId, PluginEventManager};
use crate::platform::surface::{SurfaceFactory, TextureId};
use crate::rasterizer::{Marker, SurfaceDescriptor, VectorRasterizer};
use log::*;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Callback for the upload-completed signal.
pub type UploadCompletedCallback = Arc<dyn Fn() + Send + Sync>;

struct RasterizerSlot {
    rasterizer: Box<dyn VectorRasterizer>,
    size: (u32, u32),
}

#[derive(Default)]
struct RendererState {
    loaded: bool,
    finalized: bool,
    resource_ready: bool,
    resource_ready_triggered: bool,
    texture: Option<TextureId>,
    total_frames: u32,
    frame_rate: f32,
    default_size: (u32, u32),
    markers: Vec<Marker>,
    last_rendered_frame: Option<u32>,
    rendered_frames: u64,
}

#[derive(Default)]
struct RenderingDataSlots {
    prepared: Option<Arc<RenderingData>>,
    current: Option<Arc<RenderingData>>,
    previous: Vec<Arc<RenderingData>>,
}

impl RenderingDataSlots {
    /// Moves `prepared` into `current`, retiring the old `current`.
    fn promote(&mut self) -> bool {
        match self.prepared.take() {
            Some(prepared) => {
                if let Some(old) = self.current.replace(prepared) {
                    self.previous.push(old);
                }
                true
            }
            None => false,
        }
    }
}

/// Renders one animation into a triple-buffered set of native surfaces.
pub struct VectorAnimationRenderer {
    handler_id: HandlerId,
    event_manager: Arc<PluginEventManager>,
    surface_factory: Arc<dyn SurfaceFactory>,
    rasterizer: Mutex<RasterizerSlot>,
    state: Mutex<RendererState>,
    rendering_data: Mutex<RenderingDataSlots>,
    upload_completed: Mutex<Vec<UploadCompletedCallback>>,
}

impl VectorAnimationRenderer {
    pub fn new(
        event_manager: Arc<PluginEventManager>,
        surface_factory: Arc<dyn SurfaceFactory>,
        rasterizer: Box<dyn VectorRasterizer>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let handler_id = event_manager.add_event_handler(weak.clone() as Weak<dyn EventHandler>);
            Self {
                handler_id,
                event_manager,
                surface_factory,
                rasterizer: Mutex::new(RasterizerSlot {
                    rasterizer,
                    size: (0, 0),
                }),
                state: Mutex::new(RendererState::default()),
                rendering_data: Mutex::new(RenderingDataSlots::default()),
                upload_completed: Mutex::new(Vec::new()),
            }
        })
    }

    /// Loads animation data. Returns false if the source cannot be decoded.
    pub fn load(&self, source: &str) -> bool {
        if self.state().finalized {
            return false;
        }

        let (total_frames, frame_rate, default_size, markers) = {
            let mut slot = self.rasterizer();
            if let Err(e) = slot.rasterizer.load(source) {
                warn!("VectorAnimationRenderer: Load failed: {}", e);
                return false;
            }
            let rasterizer = &slot.rasterizer;
            (
                rasterizer.total_frame_count(),
                rasterizer.frame_rate(),
                rasterizer.default_size(),
                rasterizer.markers(),
            )
        };

        let mut state = self.state();
        if state.finalized {
            return false;
        }
        state.loaded = true;
        state.total_frames = total_frames;
        state.frame_rate = frame_rate;
        state.default_size = default_size;
        state.markers = markers;
        info!(
            "VectorAnimationRenderer: Loaded {} frames @ {}fps, default size {:?}",
            total_frames, frame_rate, default_size
        );
        true
    }

    /// Prepares a render target of the given size.
    ///
    /// The new target becomes current at the start of the next `render`;
    /// until then the current target keeps being used.
    pub fn set_size(&self, width: u32, height: u32) {
        if self.state().finalized {
            return;
        }
        if width == 0 || height == 0 {
            warn!("VectorAnimationRenderer: Ignoring empty size {}x{}", width, height);
            return;
        }
        {
            let slots = self.rendering_data();
            let latest = slots.prepared.as_ref().or(slots.current.as_ref());
            if latest.is_some_and(|data| data.size() == (width, height)) {
                trace!("VectorAnimationRenderer: Size {}x{} unchanged", width, height);
                return;
            }
        }

        let mut data = RenderingData::new(width, height);
        if let Err(e) = data.prepare_target(self.surface_factory.as_ref()) {
            warn!("VectorAnimationRenderer: Failed to prepare target: {}", e);
            return;
        }

        let state = self.state();
        if state.finalized {
            return;
        }
        self.rendering_data().prepared = Some(Arc::new(data));
        debug!("VectorAnimationRenderer: Prepared target {}x{}", width, height);
    }

    /// Rasterizes `frame` into the current target.
    ///
    /// Returns false if nothing was produced: finalized, not loaded, no
    /// target yet, the surface has no free buffer, or the rasterizer failed.
    pub fn render(&self, frame: u32) -> bool {
        let (data, promoted) = {
            let mut slots = self.rendering_data();
            let promoted = slots.promote();
            (slots.current.clone(), promoted)
        };

        {
            let mut state = self.state();
            if state.finalized || !state.loaded {
                return false;
            }
            if promoted {
                state.resource_ready = false;
            }
        }

        let Some(data) = data else {
            trace!("VectorAnimationRenderer: No target yet for frame {}", frame);
            return false;
        };
        let Some(mut surface) = data.lock_target() else {
            return false;
        };
        if !surface.can_dequeue() {
            debug!("VectorAnimationRenderer: Surface busy, skipping frame {}", frame);
            return false;
        }
        let Some(mut buffer) = surface.dequeue_writable_buffer() else {
            debug!("VectorAnimationRenderer: Dequeue failed for frame {}", frame);
            return false;
        };

        let result = {
            let mut slot = self.rasterizer();
            if slot.size != data.size() {
                slot.rasterizer.set_size(data.width(), data.height());
                slot.size = data.size();
            }
            slot.rasterizer.render_sync(
                frame,
                SurfaceDescriptor {
                    pixels: &mut buffer.pixels[..],
                    width: buffer.width,
                    height: buffer.height,
                    stride: buffer.stride,
                },
            )
        };
        if let Err(e) = result {
            surface.cancel_buffer(buffer);
            warn!("VectorAnimationRenderer: Frame {} failed: {}", frame, e);
            return false;
        }
        surface.enqueue_buffer(buffer);
        drop(surface);

        let became_ready = {
            let mut state = self.state();
            if state.finalized {
                return false;
            }
            state.last_rendered_frame = Some(frame);
            state.rendered_frames += 1;
            if state.resource_ready {
                false
            } else {
                state.resource_ready = true;
                state.resource_ready_triggered = true;
                state.texture = data.texture();
                true
            }
        };
        if became_ready {
            debug!("VectorAnimationRenderer: Resource ready ({:?})", data.texture());
            self.event_manager.trigger_event(self.handler_id);
        }
        true
    }

    /// Playback stopped: let the surface drop buffers it no longer needs.
    pub fn render_stopped(&self) {
        if self.state().finalized {
            return;
        }
        let Some(current) = self.rendering_data().current.clone() else {
            return;
        };
        let Some(mut surface) = current.lock_target() else {
            return;
        };
        surface.free_released_buffers();
        trace!("VectorAnimationRenderer: Freed released buffers of {:?}", current.texture());
    }

    pub fn total_frame_number(&self) -> u32 {
        self.state().total_frames
    }

    pub fn frame_rate(&self) -> f32 {
        self.state().frame_rate
    }

    pub fn default_size(&self) -> (u32, u32) {
        self.state().default_size
    }

    /// Frame range of the marker `name`, if the clip has one.
    pub fn marker_info(&self, name: &str) -> Option<(u32, u32)> {
        self.state()
            .markers
            .iter()
            .find(|marker| marker.name == name)
            .map(|marker| (marker.start_frame, marker.end_frame))
    }

    pub fn markers(&self) -> Vec<Marker> {
        self.state().markers.clone()
    }

    /// True once a frame has been rasterized into the current target.
    pub fn is_render_ready(&self) -> bool {
        let state = self.state();
        !state.finalized && state.resource_ready
    }

    /// Texture holding the latest ready frame.
    pub fn target_texture(&self) -> Option<TextureId> {
        let state = self.state();
        if state.finalized || !state.resource_ready {
            return None;
        }
        state.texture
    }

    /// Last frame number successfully rendered.
    pub fn last_rendered_frame(&self) -> Option<u32> {
        self.state().last_rendered_frame
    }

    /// Total frames successfully rendered.
    pub fn rendered_frame_count(&self) -> u64 {
        self.state().rendered_frames
    }

    /// Number of retired targets still held.
    pub fn previous_count(&self) -> usize {
        self.rendering_data().previous.len()
    }

    /// Whether a prepared target is waiting for promotion.
    pub fn has_prepared_target(&self) -> bool {
        self.rendering_data().prepared.is_some()
    }

    /// Connects a callback fired on the main thread after a new target
    /// becomes ready.
    pub fn connect_upload_completed(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.upload_completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Drops every retired target and forces the next frame to be reported
    /// as a fresh upload.
    pub fn invalidate_buffer(&self) {
        {
            let mut state = self.state();
            if state.finalized {
                return;
            }
            state.resource_ready = false;
        }
        self.rendering_data().previous.clear();
    }

    /// Stops all rendering. Every later call is a no-op or returns the empty
    /// value. Idempotent.
    pub fn finalize(&self) {
        {
            let mut state = self.state();
            if state.finalized {
                return;
            }
            state.finalized = true;
            state.resource_ready = false;
            state.resource_ready_triggered = false;
            state.texture = None;
        }
        *self.rendering_data() = RenderingDataSlots::default();
        self.upload_completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.event_manager.remove_event_handler(self.handler_id);
        debug!("VectorAnimationRenderer: Finalized");
    }

    pub fn is_finalized(&self) -> bool {
        self.state().finalized
    }

    fn state(&self) -> MutexGuard<'_, RendererState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rendering_data(&self) -> MutexGuard<'_, RenderingDataSlots> {
        self.rendering_data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rasterizer(&self) -> MutexGuard<'_, RasterizerSlot> {
        self.rasterizer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventHandler for VectorAnimationRenderer {
    fn notify_event(&self) {
        let emit = {
            let mut state = self.state();
            if state.finalized {
                return;
            }
            std::mem::take(&mut state.resource_ready_triggered)
        };
        if emit {
            let callbacks: Vec<UploadCompletedCallback> = self
                .upload_completed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for callback in callbacks {
                callback();
            }
        }
        self.rendering_data().previous.clear();
    }
}

impl Drop for VectorAnimationRenderer {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests;
