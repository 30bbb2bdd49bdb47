// tests/playback.rs
//! End-to-end playback on the headless main loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use test_log::test;
use vector_anim::config::{Config, MainLoopConfig, SchedulerConfig};
use vector_anim::platform::surface::SoftwareSurfaceFactory;
use vector_anim::platform::HeadlessMainLoop;
use vector_anim::rasterizer::LottieRasterizer;
use vector_anim::{AnimationContext, AnimationTask, LoopingMode, PlayState, StopBehavior};

const CLIP: &str = r#"{"nm": "test", "fr": 100, "ip": 0, "op": 10, "w": 16, "h": 8,
    "markers": [{"cm": "tail", "tm": 6, "dr": 3}]}"#;

struct Harness {
    main_loop: Arc<HeadlessMainLoop>,
    surfaces: Arc<SoftwareSurfaceFactory>,
    context: AnimationContext,
}

impl Harness {
    fn new(threads: usize) -> Self {
        let config = Config {
            scheduler: SchedulerConfig {
                rasterize_threads: Some(threads),
                thread_name_prefix: "playback-test".to_string(),
                ..SchedulerConfig::default()
            },
            main_loop: MainLoopConfig { tick_interval_ms: 2.0 },
            ..Config::default()
        };
        let main_loop = Arc::new(HeadlessMainLoop::new(&config.main_loop));
        let surfaces = Arc::new(SoftwareSurfaceFactory::new(config.renderer.surface_buffer_count));
        let context = AnimationContext::new(config, main_loop.clone(), surfaces.clone());
        Self {
            main_loop,
            surfaces,
            context,
        }
    }

    fn animation(&self) -> (Arc<AnimationTask>, Arc<AtomicUsize>) {
        let task = self.context.create_animation(Box::new(LottieRasterizer::new()));
        assert!(task.load(CLIP));
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        task.connect_animation_finished(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (task, finished)
    }
}

#[test]
fn it_should_play_a_clip_to_the_end_and_notify_once() {
    let harness = Harness::new(2);
    let (task, finished) = harness.animation();
    let uploads = Arc::new(AtomicUsize::new(0));
    let uploads_clone = uploads.clone();
    task.renderer()
        .connect_upload_completed(move || {
            uploads_clone.fetch_add(1, Ordering::SeqCst);
        });
    task.set_loop_count(1);
    task.play();

    assert!(harness
        .main_loop
        .run_until(Duration::from_secs(5), || finished.load(Ordering::SeqCst) > 0));
    harness.main_loop.run_once();

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(uploads.load(Ordering::SeqCst), 1);
    assert_eq!(task.play_state(), PlayState::Stopped);
    assert_eq!(task.renderer().last_rendered_frame(), Some(9));
    assert!(task.renderer().rendered_frame_count() >= 1);

    let texture = task.renderer().target_texture().expect("ready after playback");
    let frame = harness.surfaces.acquire_latest(texture).expect("a published frame");
    assert_eq!((frame.width, frame.height), (16, 8));
}

#[test]
fn it_should_run_several_animations_side_by_side() {
    let harness = Harness::new(3);
    let animations: Vec<_> = (0..4).map(|_| harness.animation()).collect();
    for (task, _) in &animations {
        task.set_loop_count(2);
        task.set_looping_mode(LoopingMode::AutoReverse);
        task.play();
    }

    assert!(harness.main_loop.run_until(Duration::from_secs(10), || animations
        .iter()
        .all(|(_, finished)| finished.load(Ordering::SeqCst) > 0)));

    for (task, finished) in &animations {
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(task.renderer().last_rendered_frame(), Some(0));
    }
    assert!(harness.context.scheduler_stats().dispatched >= 4);
}

#[test]
fn it_should_stop_on_request_with_the_stop_behavior_frame() {
    let harness = Harness::new(1);
    let (task, finished) = harness.animation();
    assert!(task.set_play_range_by_marker("tail"));
    assert_eq!(task.play_range(), (6, 9));
    task.set_stop_behavior(StopBehavior::FirstFrame);
    task.play();

    assert!(harness.main_loop.run_until(Duration::from_secs(5), || task
        .renderer()
        .is_render_ready()));
    task.stop();
    assert!(harness
        .main_loop
        .run_until(Duration::from_secs(5), || finished.load(Ordering::SeqCst) > 0));

    assert_eq!(task.play_state(), PlayState::Stopped);
    assert_eq!(task.renderer().last_rendered_frame(), Some(6));
}

#[test]
fn it_should_stop_rendering_once_finalized_mid_playback() {
    let harness = Harness::new(2);
    let (task, finished) = harness.animation();
    task.play();
    assert!(harness.main_loop.run_until(Duration::from_secs(5), || task
        .renderer()
        .rendered_frame_count()
        > 2));

    task.finalize();
    let rendered = task.renderer().rendered_frame_count();
    thread::sleep(Duration::from_millis(50));
    harness.main_loop.run_once();

    assert_eq!(task.renderer().rendered_frame_count(), rendered);
    assert_eq!(task.renderer().target_texture(), None);
    assert_eq!(finished.load(Ordering::SeqCst), 0);
    assert_eq!(harness.context.event_manager().handler_count(), 0);
}

#[test]
fn it_should_finalize_a_looping_animation_when_its_last_handle_is_dropped() {
    let harness = Harness::new(2);
    let (task, finished) = harness.animation();
    let renderer = task.renderer().clone();
    task.play();
    assert!(harness
        .main_loop
        .run_until(Duration::from_secs(5), || renderer.rendered_frame_count() > 2));

    drop(task);

    assert!(harness
        .main_loop
        .run_until(Duration::from_secs(5), || renderer.is_finalized()));
    let rendered = renderer.rendered_frame_count();
    thread::sleep(Duration::from_millis(100));
    harness.main_loop.run_once();

    assert_eq!(renderer.rendered_frame_count(), rendered);
    assert_eq!(finished.load(Ordering::SeqCst), 0);
    assert_eq!(harness.context.event_manager().handler_count(), 0);
}
