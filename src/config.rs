// src/config.rs

//! Defines the configuration structures for the vector animation core.
//!
//! The structs deserialize from a JSON file. Every field has a default, so a
//! partial file (or none at all) is always valid. The defaults aim at a
//! typical device: a handful of rasterize threads, double-buffered surfaces
//! and a ~60Hz main loop.

use anyhow::{Context, Result};
use log::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable naming a JSON config file for `load_or_default`.
pub const CONFIG_PATH_ENV: &str = "VECTOR_ANIM_CONFIG";

/// Environment variable overriding `scheduler.rasterize_threads`.
pub const RASTERIZE_THREADS_ENV: &str = "VECTOR_ANIM_RASTERIZE_THREADS";

// --- Top-Level Configuration Structure ---

/// Root configuration for the animation core.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Scheduler and rasterize thread pool settings.
    pub scheduler: SchedulerConfig,
    /// Renderer surface settings.
    pub renderer: RendererConfig,
    /// Settings for the headless main loop.
    pub main_loop: MainLoopConfig,
}

impl Config {
    /// Reads and parses a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads the file named by `VECTOR_ANIM_CONFIG`, or the defaults.
    ///
    /// A missing or broken file is not fatal: it is logged and the defaults
    /// are used instead.
    pub fn load_or_default() -> Self {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => match Self::load(&path) {
                Ok(config) => {
                    info!("Config: Loaded from {}", path);
                    config
                }
                Err(e) => {
                    warn!("Config: {:#}. Using defaults.", e);
                    let mut config = Config::default();
                    config.apply_env_overrides();
                    config
                }
            },
            Err(_) => {
                let mut config = Config::default();
                config.apply_env_overrides();
                config
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var(RASTERIZE_THREADS_ENV) {
            match value.trim().parse::<usize>() {
                Ok(count) if count > 0 => {
                    debug!("Config: {} overrides rasterize threads to {}", RASTERIZE_THREADS_ENV, count);
                    self.scheduler.rasterize_threads = Some(count);
                }
                _ => warn!("Config: Ignoring invalid {}={:?}", RASTERIZE_THREADS_ENV, value),
            }
        }
    }
}

// --- Scheduler Configuration ---

/// Settings for the animation scheduler and its rasterize workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fixed size of the rasterize worker pool.
    /// `None` derives it from the available hardware parallelism.
    pub rasterize_threads: Option<usize>,
    /// Upper bound for the derived pool size.
    pub max_rasterize_threads: usize,
    /// Advance past frames that were missed when a task fell behind.
    pub skip_dropped_frames: bool,
    /// Prefix for the names of every thread the scheduler spawns.
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            rasterize_threads: None,
            max_rasterize_threads: 4,
            skip_dropped_frames: true,
            thread_name_prefix: "vector-anim".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Number of rasterize workers to create. Always at least one.
    pub fn worker_count(&self) -> usize {
        if let Some(count) = self.rasterize_threads {
            return count.max(1);
        }
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        parallelism.clamp(1, self.max_rasterize_threads.max(1))
    }
}

// --- Renderer Configuration ---

/// Settings for the renderer's native surfaces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RendererConfig {
    /// Number of buffers in each surface queue.
    pub surface_buffer_count: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        RendererConfig {
            surface_buffer_count: 2,
        }
    }
}

// --- Main Loop Configuration ---

/// Settings for the headless main loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MainLoopConfig {
    /// Longest time a tick waits for a trigger before running processors.
    pub tick_interval_ms: f64,
}

impl Default for MainLoopConfig {
    fn default() -> Self {
        MainLoopConfig {
            tick_interval_ms: 16.0,
        }
    }
}
