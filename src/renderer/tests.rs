// src/renderer/tests.rs

use super::*;
use crate::config::MainLoopConfig;
use crate::error::RasterizeError;
use crate::platform::surface::SoftwareSurfaceFactory;
use crate::platform::HeadlessMainLoop;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use test_log::test;

// --- MockRasterizer Definition ---
#[derive(Clone, Default)]
struct MockRasterizer {
    fail_renders: Arc<AtomicBool>,
    renders: Arc<AtomicUsize>,
    sizes: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl VectorRasterizer for MockRasterizer {
    fn load(&mut self, source: &str) -> Result<(), RasterizeError> {
        if source == "bad" {
            return Err(RasterizeError::Parse("bad data".to_string()));
        }
        Ok(())
    }

    fn set_size(&mut self, width: u32, height: u32) {
        self.sizes.lock().unwrap().push((width, height));
    }

    fn render_sync(&mut self, frame: u32, surface: SurfaceDescriptor<'_>) -> Result<(), RasterizeError> {
        if self.fail_renders.load(Ordering::SeqCst) {
            return Err(RasterizeError::Render("forced".to_string()));
        }
        surface.pixels[0] = frame as u8;
        self.renders.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn total_frame_count(&self) -> u32 {
        10
    }

    fn frame_rate(&self) -> f32 {
        30.0
    }

    fn default_size(&self) -> (u32, u32) {
        (64, 64)
    }

    fn markers(&self) -> Vec<Marker> {
        vec![Marker {
            name: "loop".to_string(),
            start_frame: 2,
            end_frame: 5,
        }]
    }
}

struct Fixture {
    main_loop: Arc<HeadlessMainLoop>,
    manager: Arc<PluginEventManager>,
    factory: Arc<SoftwareSurfaceFactory>,
    rasterizer: MockRasterizer,
    renderer: Arc<VectorAnimationRenderer>,
}

fn fixture_with_buffers(buffer_count: usize) -> Fixture {
    let main_loop = Arc::new(HeadlessMainLoop::new(&MainLoopConfig {
        tick_interval_ms: 1.0,
    }));
    let manager = PluginEventManager::new(main_loop.clone());
    let factory = Arc::new(SoftwareSurfaceFactory::new(buffer_count));
    let rasterizer = MockRasterizer::default();
    let renderer = VectorAnimationRenderer::new(
        manager.clone(),
        factory.clone(),
        Box::new(rasterizer.clone()),
    );
    Fixture {
        main_loop,
        manager,
        factory,
        rasterizer,
        renderer,
    }
}

fn fixture() -> Fixture {
    fixture_with_buffers(2)
}

#[test]
fn it_should_not_render_before_a_target_is_prepared() {
    let f = fixture();
    assert!(f.renderer.load("clip"));
    assert!(!f.renderer.render(0));
    assert!(!f.renderer.is_render_ready());

    f.renderer.set_size(100, 100);
    assert!(f.renderer.render(0));
    assert!(f.renderer.is_render_ready());
}

#[test]
fn it_should_report_load_failure_and_never_render() {
    let f = fixture();
    assert!(!f.renderer.load("bad"));
    f.renderer.set_size(10, 10);
    assert!(!f.renderer.render(0));
    assert_eq!(f.rasterizer.renders.load(Ordering::SeqCst), 0);
}

#[test]
fn it_should_expose_clip_information_after_load() {
    let f = fixture();
    assert!(f.renderer.load("clip"));
    assert_eq!(f.renderer.total_frame_number(), 10);
    assert_eq!(f.renderer.frame_rate(), 30.0);
    assert_eq!(f.renderer.default_size(), (64, 64));
    assert_eq!(f.renderer.marker_info("loop"), Some((2, 5)));
    assert_eq!(f.renderer.marker_info("nope"), None);
}

#[test]
fn it_should_promote_the_prepared_target_and_retire_the_old_one() {
    let f = fixture();
    f.renderer.load("clip");
    f.renderer.set_size(100, 100);
    assert!(f.renderer.render(0));
    let first = f.renderer.target_texture().unwrap();

    f.renderer.set_size(50, 50);
    assert!(f.renderer.has_prepared_target());
    // Still showing the old target until the next render promotes.
    assert_eq!(f.renderer.target_texture(), Some(first));

    assert!(f.renderer.render(1));
    let second = f.renderer.target_texture().unwrap();
    assert_ne!(first, second);
    assert_eq!(f.renderer.previous_count(), 1);
    assert!(!f.renderer.has_prepared_target());
    assert_eq!(*f.rasterizer.sizes.lock().unwrap(), vec![(100, 100), (50, 50)]);
}

#[test]
fn it_should_gate_readiness_on_a_successful_render_after_promotion() {
    let f = fixture();
    f.renderer.load("clip");
    f.renderer.set_size(20, 20);
    f.rasterizer.fail_renders.store(true, Ordering::SeqCst);

    assert!(!f.renderer.render(0));
    assert!(!f.renderer.is_render_ready());
    assert_eq!(f.renderer.target_texture(), None);

    f.rasterizer.fail_renders.store(false, Ordering::SeqCst);
    assert!(f.renderer.render(0));
    assert!(f.renderer.is_render_ready());

    f.renderer.set_size(30, 30);
    f.rasterizer.fail_renders.store(true, Ordering::SeqCst);
    assert!(!f.renderer.render(1));
    assert!(!f.renderer.is_render_ready());
}

#[test]
fn it_should_skip_reprepare_for_an_unchanged_size() {
    let f = fixture();
    f.renderer.load("clip");
    f.renderer.set_size(20, 20);
    f.renderer.render(0);
    f.renderer.set_size(20, 20);
    assert!(!f.renderer.has_prepared_target());
    assert_eq!(f.factory.live_surfaces(), 1);
}

#[test]
fn it_should_notify_upload_once_and_clear_retired_targets_on_the_main_thread() {
    let f = fixture();
    let uploads = Arc::new(AtomicUsize::new(0));
    let uploads_clone = uploads.clone();
    f.renderer.connect_upload_completed(move || {
        uploads_clone.fetch_add(1, Ordering::SeqCst);
    });
    f.renderer.load("clip");
    f.renderer.set_size(20, 20);
    f.renderer.render(0);
    f.renderer.set_size(40, 40);
    f.renderer.render(1);
    f.renderer.render(2);
    assert_eq!(f.renderer.previous_count(), 1);

    f.main_loop.run_once();

    assert_eq!(uploads.load(Ordering::SeqCst), 1);
    assert_eq!(f.renderer.previous_count(), 0);
}

#[test]
fn it_should_treat_a_busy_surface_as_a_transient_failure() {
    let f = fixture_with_buffers(1);
    f.renderer.load("clip");
    f.renderer.set_size(8, 8);
    assert!(f.renderer.render(0));

    let texture = f.renderer.target_texture().unwrap();
    let held = f.factory.acquire_latest(texture).unwrap();
    assert!(!f.renderer.render(1));
    assert_eq!(f.renderer.last_rendered_frame(), Some(0));

    f.factory.release(texture, &held);
    assert!(f.renderer.render(1));
    assert_eq!(f.renderer.last_rendered_frame(), Some(1));
}

#[test]
fn it_should_publish_rendered_pixels_to_the_consumer() {
    let f = fixture();
    f.renderer.load("clip");
    f.renderer.set_size(4, 4);
    f.renderer.render(7);
    let frame = f
        .factory
        .acquire_latest(f.renderer.target_texture().unwrap())
        .unwrap();
    assert_eq!(frame.pixels[0], 7);
}

#[test]
fn it_should_drop_retired_targets_and_re_announce_on_invalidate() {
    let f = fixture();
    let uploads = Arc::new(AtomicUsize::new(0));
    let uploads_clone = uploads.clone();
    f.renderer.connect_upload_completed(move || {
        uploads_clone.fetch_add(1, Ordering::SeqCst);
    });
    f.renderer.load("clip");
    f.renderer.set_size(20, 20);
    f.renderer.render(0);
    f.renderer.set_size(30, 30);
    f.renderer.render(1);
    f.main_loop.run_once();
    // Both promotions coalesced into one delivery.
    assert_eq!(uploads.load(Ordering::SeqCst), 1);

    f.renderer.invalidate_buffer();
    assert_eq!(f.renderer.previous_count(), 0);
    assert!(!f.renderer.is_render_ready());

    assert!(f.renderer.render(2));
    f.main_loop.run_once();
    assert_eq!(uploads.load(Ordering::SeqCst), 2);
}

#[test]
fn it_should_free_released_buffers_when_playback_stops() {
    let f = fixture();
    f.renderer.load("clip");
    f.renderer.set_size(4, 4);
    assert!(f.renderer.render(0));
    // The second enqueue hands the first buffer back to the pool.
    assert!(f.renderer.render(1));
    let texture = f.renderer.target_texture().unwrap();
    assert_eq!(f.factory.allocated_buffers(texture), 2);

    f.renderer.render_stopped();

    assert_eq!(f.factory.allocated_buffers(texture), 1);
    assert!(f.renderer.is_render_ready());
    let frame = f.factory.acquire_latest(texture).unwrap();
    assert_eq!(frame.pixels[0], 1);

    // Playback resumes with a freshly allocated buffer.
    assert!(f.renderer.render(2));
    assert_eq!(f.factory.allocated_buffers(texture), 2);
}

#[test]
fn it_should_ignore_every_call_after_finalize() {
    let f = fixture();
    f.renderer.load("clip");
    f.renderer.set_size(20, 20);
    assert!(f.renderer.render(0));
    assert_eq!(f.manager.handler_count(), 1);

    f.renderer.finalize();
    f.renderer.finalize();

    for frame in 0..3 {
        assert!(!f.renderer.render(frame));
        f.renderer.render_stopped();
        assert_eq!(f.renderer.target_texture(), None);
        assert!(!f.renderer.is_render_ready());
    }
    f.renderer.set_size(40, 40);
    assert!(!f.renderer.has_prepared_target());
    assert!(!f.renderer.load("clip"));
    assert_eq!(f.renderer.rendered_frame_count(), 1);
    assert_eq!(f.manager.handler_count(), 0);
    assert_eq!(f.factory.live_surfaces(), 0);
}

#[test]
fn it_should_unregister_from_the_event_manager_on_drop() {
    let f = fixture();
    assert_eq!(f.manager.handler_count(), 1);
    drop(f.renderer);
    assert_eq!(f.manager.handler_count(), 0);
}
