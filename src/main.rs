// src/main.rs

use anyhow::bail;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vector_anim::config::Config;
use vector_anim::platform::surface::SoftwareSurfaceFactory;
use vector_anim::platform::HeadlessMainLoop;
use vector_anim::rasterizer::LottieRasterizer;
use vector_anim::{AnimationContext, LoopingMode};

/// Two seconds at 30 fps with one marker, used when no clip path is given.
const SAMPLE_CLIP: &str = r#"{
    "nm": "sample",
    "fr": 30,
    "ip": 0,
    "op": 60,
    "w": 160,
    "h": 90,
    "markers": [{ "cm": "bounce", "tm": 10, "dr": 30 }]
}"#;

/// Upper bound on how long the demo waits for playback to finish.
const PLAYBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Plays a clip (path in the first argument, or a built-in sample) on the
/// headless main loop and logs progress until it finishes.
fn main() -> anyhow::Result<()> {
    // Initialize the logger. Default filter is "info" if RUST_LOG is not set.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    info!("Starting vector-anim...");
    let config = Config::load_or_default();
    info!("Configuration: {:?}", config);

    let source = match std::env::args().nth(1) {
        Some(path) => {
            info!("Playing clip from '{}'", path);
            path
        }
        None => {
            info!("No clip given, playing the built-in sample");
            SAMPLE_CLIP.to_string()
        }
    };

    let main_loop = Arc::new(HeadlessMainLoop::new(&config.main_loop));
    let surfaces = Arc::new(SoftwareSurfaceFactory::new(config.renderer.surface_buffer_count));
    let context = AnimationContext::new(config, main_loop.clone(), surfaces.clone());

    let task = context.create_animation(Box::new(LottieRasterizer::new()));
    if !task.load(&source) {
        bail!("Failed to load animation");
    }

    let finished = Arc::new(AtomicBool::new(false));
    let finished_flag = finished.clone();
    task.connect_animation_finished(move || {
        finished_flag.store(true, Ordering::SeqCst);
    });
    task.renderer().connect_upload_completed(|| info!("Render target uploaded"));

    if task.renderer().marker_info("bounce").is_some() {
        task.set_play_range_by_marker("bounce");
    }
    task.set_looping_mode(LoopingMode::AutoReverse);
    task.set_loop_count(2);
    task.play();

    let mut last_logged = None;
    let done = main_loop.run_until(PLAYBACK_TIMEOUT, || {
        let frame = task.renderer().last_rendered_frame();
        if frame != last_logged {
            if let Some(texture) = task.renderer().target_texture() {
                if let Some(pixels) = surfaces.acquire_latest(texture) {
                    info!(
                        "Frame {:?} on {:?}: first pixel {:?}",
                        frame,
                        texture,
                        &pixels.pixels[..4]
                    );
                    surfaces.release(texture, &pixels);
                }
            }
            last_logged = frame;
        }
        finished.load(Ordering::SeqCst)
    });
    if !done {
        warn!("Playback did not finish within {:?}", PLAYBACK_TIMEOUT);
    }

    let stats = context.scheduler_stats();
    info!(
        "Rendered {} frames ({} dispatched, {} dropped)",
        task.renderer().rendered_frame_count(),
        stats.dispatched,
        task.total_dropped_frames()
    );

    task.finalize();
    drop(context);
    info!("vector-anim exited.");
    Ok(())
}
