//! Error types for the rasterization and surface collaborators.
//!
//! None of these cross a thread boundary: the renderer turns them into
//! boolean results and log lines.

/// Failure reported by a [`VectorRasterizer`](crate::rasterizer::VectorRasterizer).
#[derive(Debug)]
pub enum RasterizeError {
    /// The source could not be read.
    Io(std::io::Error),
    /// The source is not valid animation data.
    Parse(String),
    /// The data parsed but describes an unusable clip.
    InvalidClip(String),
    /// A frame was requested before a successful load.
    NotLoaded,
    /// The frame could not be drawn into the target surface.
    Render(String),
}

impl std::fmt::Display for RasterizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RasterizeError::Io(e) => write!(f, "failed to read animation source: {}", e),
            RasterizeError::Parse(msg) => write!(f, "failed to parse animation data: {}", msg),
            RasterizeError::InvalidClip(msg) => write!(f, "invalid animation clip: {}", msg),
            RasterizeError::NotLoaded => write!(f, "no animation loaded"),
            RasterizeError::Render(msg) => write!(f, "failed to render frame: {}", msg),
        }
    }
}

impl std::error::Error for RasterizeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RasterizeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RasterizeError {
    fn from(e: std::io::Error) -> Self {
        RasterizeError::Io(e)
    }
}

impl From<serde_json::Error> for RasterizeError {
    fn from(e: serde_json::Error) -> Self {
        RasterizeError::Parse(e.to_string())
    }
}

/// Failure reported by a [`SurfaceFactory`](crate::platform::surface::SurfaceFactory).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceError {
    /// Width or height was zero.
    InvalidSize { width: u32, height: u32 },
}

impl std::fmt::Display for SurfaceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SurfaceError::InvalidSize { width, height } => {
                write!(f, "invalid surface size {}x{}", width, height)
            }
        }
    }
}

impl std::error::Error for SurfaceError {}
