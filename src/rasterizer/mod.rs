// src/rasterizer/mod.rs

//! Frame rasterization.
//!
//! [`VectorRasterizer`] is the seam to the native vector library. The
//! renderer only ever calls it from one thread at a time; implementations do
//! not need internal locking.

use crate::error::RasterizeError;

pub mod lottie;

pub use lottie::LottieRasterizer;

/// Pixel memory a frame is drawn into (premultiplied RGBA8).
pub struct SurfaceDescriptor<'a> {
    pub pixels: &'a mut [u8],
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes.
    pub stride: usize,
}

/// A named frame range inside a clip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub name: String,
    pub start_frame: u32,
    pub end_frame: u32,
}

/// Native vector animation library.
pub trait VectorRasterizer: Send {
    /// Loads animation data from `source` (inline data or a file path).
    fn load(&mut self, source: &str) -> Result<(), RasterizeError>;

    /// Sets the size subsequent frames are rendered at.
    fn set_size(&mut self, width: u32, height: u32);

    /// Draws `frame` into `surface`, blocking until done.
    fn render_sync(&mut self, frame: u32, surface: SurfaceDescriptor<'_>) -> Result<(), RasterizeError>;

    fn total_frame_count(&self) -> u32;

    fn frame_rate(&self) -> f32;

    /// Natural size of the clip.
    fn default_size(&self) -> (u32, u32);

    fn markers(&self) -> Vec<Marker>;

    /// Frame range of the marker called `name`.
    fn marker_range(&self, name: &str) -> Option<(u32, u32)> {
        self.markers()
            .into_iter()
            .find(|marker| marker.name == name)
            .map(|marker| (marker.start_frame, marker.end_frame))
    }
}
