// src/context.rs
//! AnimationContext - owns the shared pieces every animation needs.
//!
//! One context per host adaptor: it holds the event manager and the
//! scheduler and hands them to the renderers and tasks it creates. Dropping
//! the context stops and joins the scheduler's threads; tasks created from it
//! keep working as plain renderers but can no longer be scheduled.

use crate::config::Config;
use crate::event_manager::PluginEventManager;
use crate::platform::surface::SurfaceFactory;
use crate::platform::HostEventLoop;
use crate::rasterizer::VectorRasterizer;
use crate::renderer::VectorAnimationRenderer;
use crate::scheduler::{AnimationScheduler, SchedulerStats};
use crate::task::AnimationTask;
use log::*;
use std::sync::Arc;

pub struct AnimationContext {
    config: Config,
    event_manager: Arc<PluginEventManager>,
    surface_factory: Arc<dyn SurfaceFactory>,
    scheduler: AnimationScheduler,
}

impl AnimationContext {
    pub fn new(
        config: Config,
        host: Arc<dyn HostEventLoop>,
        surface_factory: Arc<dyn SurfaceFactory>,
    ) -> Self {
        let event_manager = PluginEventManager::new(host);
        let scheduler = AnimationScheduler::new(&config.scheduler);
        info!(
            "AnimationContext: Ready with {} rasterize workers",
            scheduler.worker_count()
        );
        Self {
            config,
            event_manager,
            surface_factory,
            scheduler,
        }
    }

    /// A renderer drawing with `rasterizer` into surfaces from this
    /// context's factory.
    pub fn create_renderer(&self, rasterizer: Box<dyn VectorRasterizer>) -> Arc<VectorAnimationRenderer> {
        VectorAnimationRenderer::new(
            self.event_manager.clone(),
            self.surface_factory.clone(),
            rasterizer,
        )
    }

    /// A playable task around `renderer`, scheduled by this context.
    pub fn create_task(&self, renderer: Arc<VectorAnimationRenderer>) -> Arc<AnimationTask> {
        AnimationTask::new(
            renderer,
            self.scheduler.handle(),
            self.event_manager.clone(),
            &self.config.scheduler,
        )
    }

    /// Shorthand for a task with a fresh renderer.
    pub fn create_animation(&self, rasterizer: Box<dyn VectorRasterizer>) -> Arc<AnimationTask> {
        self.create_task(self.create_renderer(rasterizer))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn event_manager(&self) -> &Arc<PluginEventManager> {
        &self.event_manager
    }

    pub fn scheduler(&self) -> &AnimationScheduler {
        &self.scheduler
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }
}

impl Drop for AnimationContext {
    fn drop(&mut self) {
        debug!("AnimationContext: Shutting down");
        self.scheduler.shutdown();
    }
}
