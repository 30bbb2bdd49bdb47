//! Headless Lottie rasterizer.
//!
//! Reads the composition header of a Lottie file (frame rate, in/out points,
//! size, markers) and draws a deterministic placeholder for each frame: a
//! background whose tint follows the frame's position in the clip and a
//! one-pixel progress bar. Layers are not interpreted.

use crate::error::RasterizeError;
use crate::rasterizer::{Marker, SurfaceDescriptor, VectorRasterizer};
use crate::platform::surface::BYTES_PER_PIXEL;
use log::*;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct LottieHeader {
    #[serde(rename = "fr")]
    frame_rate: f32,
    #[serde(rename = "ip", default)]
    in_point: f32,
    #[serde(rename = "op")]
    out_point: f32,
    #[serde(rename = "w")]
    width: u32,
    #[serde(rename = "h")]
    height: u32,
    #[serde(rename = "nm", default)]
    name: Option<String>,
    #[serde(default)]
    markers: Vec<LottieMarker>,
}

#[derive(Debug, Deserialize)]
struct LottieMarker {
    #[serde(rename = "cm")]
    comment: String,
    #[serde(rename = "tm")]
    time: f32,
    #[serde(rename = "dr", default)]
    duration: f32,
}

#[derive(Debug, Clone)]
struct Clip {
    total_frames: u32,
    frame_rate: f32,
    default_size: (u32, u32),
    markers: Vec<Marker>,
}

impl Clip {
    fn from_header(header: LottieHeader) -> Result<Self, RasterizeError> {
        if !(header.frame_rate > 0.0) {
            return Err(RasterizeError::InvalidClip(format!(
                "frame rate must be positive, got {}",
                header.frame_rate
            )));
        }
        if !(header.out_point > header.in_point) {
            return Err(RasterizeError::InvalidClip(format!(
                "out point {} is not after in point {}",
                header.out_point, header.in_point
            )));
        }
        if header.width == 0 || header.height == 0 {
            return Err(RasterizeError::InvalidClip(format!(
                "empty composition {}x{}",
                header.width, header.height
            )));
        }

        let total_frames = (header.out_point - header.in_point).round().max(1.0) as u32;
        let last_frame = total_frames - 1;
        let markers = header
            .markers
            .into_iter()
            .map(|marker| {
                let start = (marker.time - header.in_point).max(0.0).round() as u32;
                let end = (marker.time + marker.duration - header.in_point).max(0.0).round() as u32;
                Marker {
                    name: marker.comment,
                    start_frame: start.min(last_frame),
                    end_frame: end.min(last_frame),
                }
            })
            .collect();

        debug!(
            "LottieRasterizer: Parsed clip {:?}: {} frames @ {}fps, {}x{}",
            header.name.as_deref().unwrap_or("<unnamed>"),
            total_frames,
            header.frame_rate,
            header.width,
            header.height
        );

        Ok(Clip {
            total_frames,
            frame_rate: header.frame_rate,
            default_size: (header.width, header.height),
            markers,
        })
    }
}

/// Rasterizer for Lottie JSON that only interprets the composition header.
#[derive(Default)]
pub struct LottieRasterizer {
    clip: Option<Clip>,
    size: (u32, u32),
}

impl LottieRasterizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VectorRasterizer for LottieRasterizer {
    fn load(&mut self, source: &str) -> Result<(), RasterizeError> {
        let trimmed = source.trim_start();
        let header: LottieHeader = if trimmed.starts_with('{') {
            serde_json::from_str(trimmed)?
        } else {
            let text = std::fs::read_to_string(source)?;
            serde_json::from_str(&text)?
        };
        let clip = Clip::from_header(header)?;
        if self.size == (0, 0) {
            self.size = clip.default_size;
        }
        self.clip = Some(clip);
        Ok(())
    }

    fn set_size(&mut self, width: u32, height: u32) {
        self.size = (width, height);
    }

    fn render_sync(&mut self, frame: u32, surface: SurfaceDescriptor<'_>) -> Result<(), RasterizeError> {
        let clip = self.clip.as_ref().ok_or(RasterizeError::NotLoaded)?;
        let width = surface.width as usize;
        let height = surface.height as usize;
        let row_bytes = width * BYTES_PER_PIXEL;
        if width == 0 || height == 0 || surface.stride < row_bytes {
            return Err(RasterizeError::Render(format!(
                "bad surface {}x{} stride {}",
                surface.width, surface.height, surface.stride
            )));
        }
        if surface.pixels.len() < surface.stride * (height - 1) + row_bytes {
            return Err(RasterizeError::Render(format!(
                "surface holds {} bytes, needs {}",
                surface.pixels.len(),
                surface.stride * height
            )));
        }

        let frame = frame.min(clip.total_frames - 1);
        let progress = if clip.total_frames > 1 {
            frame as f32 / (clip.total_frames - 1) as f32
        } else {
            1.0
        };
        let red = (progress * 255.0).round() as u8;
        let background = [red, 255 - red, 0x80, 0xFF];
        let bar = [0xFF, 0xFF, 0xFF, 0xFF];
        let bar_x = ((progress * (width - 1) as f32).round() as usize).min(width - 1);

        for row in surface.pixels.chunks_mut(surface.stride).take(height) {
            for (x, pixel) in row[..row_bytes].chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
                pixel.copy_from_slice(if x == bar_x { &bar } else { &background });
            }
        }
        trace!("LottieRasterizer: Rendered frame {} ({}x{})", frame, width, height);
        Ok(())
    }

    fn total_frame_count(&self) -> u32 {
        self.clip.as_ref().map_or(0, |clip| clip.total_frames)
    }

    fn frame_rate(&self) -> f32 {
        self.clip.as_ref().map_or(0.0, |clip| clip.frame_rate)
    }

    fn default_size(&self) -> (u32, u32) {
        self.clip.as_ref().map_or((0, 0), |clip| clip.default_size)
    }

    fn markers(&self) -> Vec<Marker> {
        self.clip
            .as_ref()
            .map(|clip| clip.markers.clone())
            .unwrap_or_default()
    }
}
