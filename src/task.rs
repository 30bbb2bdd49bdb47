// src/task.rs
//! AnimationTask - one playing animation instance.
//!
//! Main-thread calls (`play`, `stop`, `set_size`, ...) only record what
//! should happen and hand the task to the scheduler. The frame to draw is
//! worked out on the rasterize thread at the start of `rasterize`, so a
//! setting changed mid-frame takes effect on the next frame.

use crate::config::SchedulerConfig;
use crate::event_manager::{EventHandler, HandlerId, PluginEventManager};
use crate::renderer::VectorAnimationRenderer;
use crate::scheduler::{ScheduledTask, SchedulerHandle, TaskId};
use log::*;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

/// Frame duration used when a clip reports no usable frame rate.
const FALLBACK_FRAME_DURATION: Duration = Duration::from_micros(16_667);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stopped,
    Playing,
    Paused,
    /// Stop requested; the next frame renders the stop-behavior frame.
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopingMode {
    /// Jump back to the start frame at the end of each loop.
    #[default]
    Restart,
    /// Play forward, then backward. A loop ends back at the start frame.
    AutoReverse,
}

/// Frame shown once playback stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBehavior {
    #[default]
    CurrentFrame,
    FirstFrame,
    LastFrame,
}

/// Callback for the animation-finished signal.
pub type AnimationFinishedCallback = Arc<dyn Fn() + Send + Sync>;

struct TaskInner {
    play_state: PlayState,
    loaded: bool,
    destroyed: bool,
    total_frames: u32,
    start_frame: u32,
    end_frame: u32,
    current_frame: u32,
    /// False when `current_frame` must be drawn as is on the next frame.
    update_frame_number: bool,
    forward: bool,
    /// Number of plays; negative loops forever.
    loop_count: i32,
    current_loop: i32,
    looping_mode: LoopingMode,
    stop_behavior: StopBehavior,
    pending_size: Option<(u32, u32)>,
    next_frame_time: Instant,
    frame_duration: Duration,
    dropped_frames: u32,
    total_dropped_frames: u64,
    skip_dropped_frames: bool,
    finished_pending: bool,
}

/// Playback position, saved so a failed frame can be drawn again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    play_state: PlayState,
    current_frame: u32,
    update_frame_number: bool,
    forward: bool,
    current_loop: i32,
}

impl TaskInner {
    fn new(skip_dropped_frames: bool) -> Self {
        Self {
            play_state: PlayState::Stopped,
            loaded: false,
            destroyed: false,
            total_frames: 0,
            start_frame: 0,
            end_frame: 0,
            current_frame: 0,
            update_frame_number: false,
            forward: true,
            loop_count: -1,
            current_loop: 0,
            looping_mode: LoopingMode::default(),
            stop_behavior: StopBehavior::default(),
            pending_size: None,
            next_frame_time: Instant::now(),
            frame_duration: FALLBACK_FRAME_DURATION,
            dropped_frames: 0,
            total_dropped_frames: 0,
            skip_dropped_frames,
            finished_pending: false,
        }
    }

    fn cursor(&self) -> Cursor {
        Cursor {
            play_state: self.play_state,
            current_frame: self.current_frame,
            update_frame_number: self.update_frame_number,
            forward: self.forward,
            current_loop: self.current_loop,
        }
    }

    fn restore(&mut self, cursor: Cursor) {
        self.play_state = cursor.play_state;
        self.current_frame = cursor.current_frame;
        self.update_frame_number = cursor.update_frame_number;
        self.forward = cursor.forward;
        self.current_loop = cursor.current_loop;
    }

    fn stopped_frame(&self) -> u32 {
        match self.stop_behavior {
            StopBehavior::CurrentFrame => self.current_frame,
            StopBehavior::FirstFrame => self.start_frame,
            StopBehavior::LastFrame => match self.looping_mode {
                LoopingMode::AutoReverse => self.start_frame,
                LoopingMode::Restart => self.end_frame,
            },
        }
    }

    /// Counts one finished loop. Returns whether another one follows.
    fn next_loop(&mut self) -> bool {
        if self.loop_count < 0 {
            return true;
        }
        self.current_loop += 1;
        self.current_loop < self.loop_count
    }

    /// Picks the frame to draw. Returns it and whether playback stops once
    /// it is drawn.
    fn advance(&mut self) -> (u32, bool) {
        if self.play_state == PlayState::Playing && self.update_frame_number {
            let step = self.dropped_frames + 1;
            self.current_frame = if self.forward {
                self.current_frame.saturating_add(step).min(self.end_frame)
            } else {
                self.current_frame.saturating_sub(step).max(self.start_frame)
            };
        }
        self.update_frame_number = true;
        let frame = self.current_frame;

        match self.play_state {
            PlayState::Stopping => {
                self.current_frame = self.stopped_frame();
                (self.current_frame, true)
            }
            PlayState::Playing => {
                let mut finished = false;
                if self.forward && self.current_frame >= self.end_frame {
                    match self.looping_mode {
                        LoopingMode::AutoReverse if self.start_frame < self.end_frame => {
                            self.forward = false;
                        }
                        _ => {
                            if self.next_loop() {
                                self.current_frame = self.start_frame;
                                self.update_frame_number = false;
                            } else {
                                finished = true;
                            }
                        }
                    }
                } else if !self.forward && self.current_frame <= self.start_frame {
                    if self.next_loop() {
                        self.forward = true;
                    } else {
                        finished = true;
                    }
                }

                if !finished {
                    return (frame, false);
                }
                match self.stop_behavior {
                    StopBehavior::CurrentFrame => (frame, true),
                    _ => {
                        self.play_state = PlayState::Stopping;
                        (frame, false)
                    }
                }
            }
            PlayState::Paused | PlayState::Stopped => (frame, false),
        }
    }
}

/// Drives one [`VectorAnimationRenderer`] through its frames on the
/// scheduler's rasterize threads.
///
/// The scheduler does not keep a task alive: dropping the last handle
/// finalizes it, even mid-playback.
pub struct AnimationTask {
    id: TaskId,
    handler_id: HandlerId,
    weak_self: Weak<AnimationTask>,
    renderer: Arc<VectorAnimationRenderer>,
    scheduler: SchedulerHandle,
    event_manager: Arc<PluginEventManager>,
    inner: Mutex<TaskInner>,
    finished: Mutex<Vec<AnimationFinishedCallback>>,
}

impl AnimationTask {
    pub fn new(
        renderer: Arc<VectorAnimationRenderer>,
        scheduler: SchedulerHandle,
        event_manager: Arc<PluginEventManager>,
        config: &SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let handler_id = event_manager.add_event_handler(weak.clone() as Weak<dyn EventHandler>);
            Self {
                id: TaskId::next(),
                handler_id,
                weak_self: weak.clone(),
                renderer,
                scheduler,
                event_manager,
                inner: Mutex::new(TaskInner::new(config.skip_dropped_frames)),
                finished: Mutex::new(Vec::new()),
            }
        })
    }

    /// Loads animation data into the renderer and resets the play range to
    /// the whole clip.
    pub fn load(&self, source: &str) -> bool {
        if self.inner().destroyed {
            return false;
        }
        if !self.renderer.load(source) {
            return false;
        }
        let total_frames = self.renderer.total_frame_number();
        let frame_rate = self.renderer.frame_rate();
        let default_size = self.renderer.default_size();

        let mut inner = self.inner();
        inner.loaded = total_frames > 0;
        inner.total_frames = total_frames;
        inner.start_frame = 0;
        inner.end_frame = total_frames.saturating_sub(1);
        inner.current_frame = 0;
        inner.update_frame_number = false;
        inner.frame_duration = if frame_rate > 0.0 {
            Duration::from_secs_f64(1.0 / frame_rate as f64)
        } else {
            FALLBACK_FRAME_DURATION
        };
        if inner.pending_size.is_none() {
            inner.pending_size = Some(default_size);
        }
        debug!(
            "AnimationTask {:?}: Loaded {} frames, frame duration {:?}",
            self.id, total_frames, inner.frame_duration
        );
        inner.loaded
    }

    /// Requests a render target size. Applied on the rasterize thread.
    pub fn set_size(&self, width: u32, height: u32) {
        {
            let mut inner = self.inner();
            if inner.destroyed {
                return;
            }
            inner.pending_size = Some((width, height));
        }
        self.schedule();
    }

    pub fn play(&self) {
        {
            let mut inner = self.inner();
            if inner.destroyed {
                return;
            }
            if !inner.loaded {
                warn!("AnimationTask {:?}: Play requested before a successful load", self.id);
                return;
            }
            if inner.play_state == PlayState::Playing {
                return;
            }
            if inner.play_state == PlayState::Stopped
                && (inner.current_frame < inner.start_frame || inner.current_frame >= inner.end_frame)
            {
                inner.current_frame = inner.start_frame;
            }
            inner.play_state = PlayState::Playing;
            inner.update_frame_number = false;
            debug!("AnimationTask {:?}: Play from frame {}", self.id, inner.current_frame);
        }
        self.schedule();
    }

    pub fn pause(&self) {
        let mut inner = self.inner();
        if inner.destroyed {
            return;
        }
        if inner.play_state == PlayState::Playing {
            inner.play_state = PlayState::Paused;
            debug!("AnimationTask {:?}: Paused at frame {}", self.id, inner.current_frame);
        }
    }

    /// Stops playback. The stop-behavior frame is drawn on the next frame.
    pub fn stop(&self) {
        {
            let mut inner = self.inner();
            if inner.destroyed || matches!(inner.play_state, PlayState::Stopped | PlayState::Stopping) {
                return;
            }
            inner.play_state = PlayState::Stopping;
        }
        self.schedule();
    }

    /// Jumps to `frame` within the play range. Returns false if it is
    /// outside the range.
    pub fn set_current_frame(&self, frame: u32) -> bool {
        {
            let mut inner = self.inner();
            if inner.destroyed || !inner.loaded {
                return false;
            }
            if frame < inner.start_frame || frame > inner.end_frame {
                debug!(
                    "AnimationTask {:?}: Frame {} outside range {}..={}",
                    self.id, frame, inner.start_frame, inner.end_frame
                );
                return false;
            }
            inner.current_frame = frame;
            inner.update_frame_number = false;
        }
        self.schedule();
        true
    }

    /// Restricts playback to `start..=end`. Bounds are swapped if reversed
    /// and clamped to the clip.
    pub fn set_play_range(&self, start: u32, end: u32) -> bool {
        let mut inner = self.inner();
        if inner.destroyed || !inner.loaded {
            return false;
        }
        let last = inner.total_frames.saturating_sub(1);
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        inner.start_frame = start.min(last);
        inner.end_frame = end.min(last);
        if inner.current_frame < inner.start_frame || inner.current_frame > inner.end_frame {
            inner.current_frame = if inner.forward { inner.start_frame } else { inner.end_frame };
            inner.update_frame_number = false;
        }
        debug!(
            "AnimationTask {:?}: Play range {}..={}",
            self.id, inner.start_frame, inner.end_frame
        );
        true
    }

    /// Restricts playback to the frames of marker `name`.
    pub fn set_play_range_by_marker(&self, name: &str) -> bool {
        match self.renderer.marker_info(name) {
            Some((start, end)) => self.set_play_range(start, end),
            None => {
                warn!("AnimationTask {:?}: Unknown marker {:?}", self.id, name);
                false
            }
        }
    }

    /// Number of plays; `-1` loops forever.
    pub fn set_loop_count(&self, count: i32) {
        let mut inner = self.inner();
        inner.loop_count = count;
        inner.current_loop = 0;
    }

    pub fn set_looping_mode(&self, mode: LoopingMode) {
        self.inner().looping_mode = mode;
    }

    pub fn set_stop_behavior(&self, behavior: StopBehavior) {
        self.inner().stop_behavior = behavior;
    }

    /// Connects a callback fired on the main thread when playback finishes
    /// or stops.
    pub fn connect_animation_finished(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn renderer(&self) -> &Arc<VectorAnimationRenderer> {
        &self.renderer
    }

    pub fn play_state(&self) -> PlayState {
        self.inner().play_state
    }

    pub fn current_frame(&self) -> u32 {
        self.inner().current_frame
    }

    pub fn play_range(&self) -> (u32, u32) {
        let inner = self.inner();
        (inner.start_frame, inner.end_frame)
    }

    pub fn loop_count(&self) -> i32 {
        self.inner().loop_count
    }

    pub fn looping_mode(&self) -> LoopingMode {
        self.inner().looping_mode
    }

    pub fn stop_behavior(&self) -> StopBehavior {
        self.inner().stop_behavior
    }

    /// Frames skipped by the last due-time calculation.
    pub fn dropped_frames(&self) -> u32 {
        self.inner().dropped_frames
    }

    pub fn total_dropped_frames(&self) -> u64 {
        self.inner().total_dropped_frames
    }

    /// Unschedules the task and finalizes its renderer. Idempotent.
    pub fn finalize(&self) {
        {
            let mut inner = self.inner();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            inner.play_state = PlayState::Stopped;
            inner.finished_pending = false;
        }
        self.scheduler.remove_task(self.id);
        self.event_manager.remove_event_handler(self.handler_id);
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.renderer.finalize();
        debug!("AnimationTask {:?}: Finalized", self.id);
    }

    pub fn is_finalized(&self) -> bool {
        self.inner().destroyed
    }

    fn schedule(&self) {
        let Some(task) = self.weak_self.upgrade() else {
            return;
        };
        if let Err(e) = self.scheduler.add_task(task) {
            warn!("AnimationTask {:?}: Cannot schedule: {:#}", self.id, e);
        }
    }

    fn inner(&self) -> MutexGuard<'_, TaskInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ScheduledTask for AnimationTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn rasterize(&self) -> bool {
        let (frame, stopped, size, before, advanced) = {
            let mut inner = self.inner();
            if inner.destroyed || !inner.loaded {
                return false;
            }
            let size = inner.pending_size.take();
            let before = inner.cursor();
            let (frame, stopped) = inner.advance();
            (frame, stopped, size, before, inner.cursor())
        };

        if let Some((width, height)) = size {
            self.renderer.set_size(width, height);
        }
        let rendered = self.renderer.render(frame);

        let (keep_animation, finished) = {
            let mut inner = self.inner();
            if inner.destroyed {
                return false;
            }
            let mut finished = false;
            if !rendered {
                // Undo the loop wrap and draw the same frame on the retry,
                // unless the main thread moved playback meanwhile.
                if inner.cursor() == advanced {
                    inner.restore(Cursor {
                        current_frame: frame,
                        update_frame_number: false,
                        ..before
                    });
                }
                if let Some(size) = size {
                    inner.pending_size.get_or_insert(size);
                }
            } else if stopped {
                inner.play_state = PlayState::Stopped;
                inner.forward = true;
                inner.current_loop = 0;
                inner.finished_pending = true;
                finished = true;
            }
            let keep_animation = matches!(inner.play_state, PlayState::Playing | PlayState::Stopping);
            (keep_animation, finished)
        };

        if finished {
            debug!("AnimationTask {:?}: Finished at frame {}", self.id, frame);
            self.renderer.render_stopped();
            self.event_manager.trigger_event(self.handler_id);
        } else {
            trace!(
                "AnimationTask {:?}: Frame {} rendered={} keep={}",
                self.id, frame, rendered, keep_animation
            );
        }
        keep_animation
    }

    fn next_frame_time(&self) -> Instant {
        self.inner().next_frame_time
    }

    fn calculate_next_frame_time(&self, first_frame: bool) {
        let now = Instant::now();
        let mut inner = self.inner();
        inner.dropped_frames = 0;
        if first_frame {
            inner.next_frame_time = now;
            return;
        }

        let duration = inner.frame_duration;
        let mut next = inner.next_frame_time + duration;
        if next < now {
            let mut dropped = 0;
            while now > next + duration && dropped < inner.total_frames {
                dropped += 1;
                next += duration;
            }
            next = now;
            if inner.skip_dropped_frames && dropped > 0 {
                trace!("AnimationTask {:?}: Dropped {} frames", self.id, dropped);
                inner.dropped_frames = dropped;
                inner.total_dropped_frames += u64::from(dropped);
            }
        }
        inner.next_frame_time = next;
    }

    fn is_animating(&self) -> bool {
        let inner = self.inner();
        !inner.destroyed && matches!(inner.play_state, PlayState::Playing | PlayState::Stopping)
    }
}

impl EventHandler for AnimationTask {
    fn notify_event(&self) {
        let emit = {
            let mut inner = self.inner();
            !inner.destroyed && std::mem::take(&mut inner.finished_pending)
        };
        if !emit {
            return;
        }
        let callbacks: Vec<AnimationFinishedCallback> = self
            .finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback();
        }
    }
}

impl Drop for AnimationTask {
    fn drop(&mut self) {
        self.finalize();
    }
}
