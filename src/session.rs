use std::time::Duration;

use crate::{
    config::{BackgroundTreatment, PostProcessingConfig, SegmentationConfig},
    error::BackdropResult,
    frame::{FrameSink, FrameSource},
    inference::InferencePrimitive,
    pipeline::select_pipeline,
    scheduler::{FrameScheduler, RunningScheduler, TimingCallback, Visibility},
};

/// The public session object: owns the wired-up configuration, the
/// injected inference primitive, and the lifecycle of at most one active
/// pipeline + scheduler pair.
///
/// Configuration is staged with the setters, then `start` builds the
/// pipeline (backend selection happens there, freshly, every time) and
/// spawns the render loop. The configured source, sink and primitive are
/// consumed by the session they start; stage them again before the next
/// one.
pub struct BackdropSession {
    source: Option<Box<dyn FrameSource>>,
    background: BackgroundTreatment,
    segmentation: Option<SegmentationConfig>,
    post: PostProcessingConfig,
    primitive: Option<InferencePrimitive>,
    refresh_interval: Duration,
    active: Option<RunningScheduler>,
}

impl Default for BackdropSession {
    fn default() -> Self {
        Self::new()
    }
}

impl BackdropSession {
    pub fn new() -> Self {
        Self {
            source: None,
            background: BackgroundTreatment::None,
            segmentation: None,
            post: PostProcessingConfig::default(),
            primitive: None,
            refresh_interval: crate::scheduler::DEFAULT_REFRESH_INTERVAL,
            active: None,
        }
    }

    pub fn set_source(&mut self, source: Box<dyn FrameSource>) {
        self.source = Some(source);
    }

    pub fn set_background(&mut self, treatment: BackgroundTreatment) {
        self.background = treatment;
    }

    pub fn set_segmentation_config(&mut self, cfg: SegmentationConfig) {
        self.segmentation = Some(cfg);
    }

    /// Inject the inference primitive produced by the external model
    /// loader.
    pub fn set_inference_primitive(&mut self, primitive: InferencePrimitive) {
        self.primitive = Some(primitive);
    }

    /// Replace the post-processing configuration. A running session picks
    /// it up on its next frame.
    pub fn set_post_processing_config(&mut self, cfg: PostProcessingConfig) -> BackdropResult<()> {
        cfg.validate()?;
        self.post = cfg;
        if let Some(active) = &self.active {
            active.update_post_processing_config(cfg);
        }
        Ok(())
    }

    /// Override display-refresh pacing for the next session.
    pub fn set_refresh_interval(&mut self, interval: Duration) {
        self.refresh_interval = interval;
    }

    /// Preset: compact two-class model, lowest resolution, GPU preferred.
    pub fn preset_low_latency(&mut self) {
        self.set_segmentation_config(SegmentationConfig::low_latency());
    }

    /// Preset: binary segmenter at high resolution on the raster path.
    pub fn preset_high_detail(&mut self) {
        self.set_segmentation_config(SegmentationConfig::high_detail());
    }

    /// Build the pipeline and start rendering into `sink`, reporting
    /// `(fps, stage durations)` through `callback` once per frame.
    ///
    /// Missing preconditions (no source, no segmentation config, no
    /// primitive) make this a logged no-op rather than an error; an
    /// incompatible configuration fails fast with no session left
    /// running.
    pub fn start(&mut self, sink: Box<dyn FrameSink>, callback: TimingCallback) -> BackdropResult<()> {
        if self.active.is_some() {
            tracing::warn!("session already running; stop it before starting another");
            return Ok(());
        }
        if self.source.is_none() {
            tracing::info!("no frame source attached; start is a no-op");
            return Ok(());
        }
        if self.segmentation.is_none() {
            tracing::info!("no segmentation config set; start is a no-op");
            return Ok(());
        }
        if self.primitive.is_none() {
            tracing::info!("no inference primitive injected; start is a no-op");
            return Ok(());
        }

        let source = self.source.take().expect("checked above");
        let primitive = self.primitive.take().expect("checked above");
        let segmentation = self.segmentation.expect("checked above");
        let background = std::mem::replace(&mut self.background, BackgroundTreatment::None);

        let pipeline = select_pipeline(
            source,
            background,
            segmentation,
            self.post,
            primitive,
            sink,
        )?;

        let scheduler = FrameScheduler::with_refresh_interval(self.refresh_interval);
        self.active = Some(scheduler.start(pipeline, callback));
        tracing::info!(?segmentation, "session started");
        Ok(())
    }

    /// Forward a host visibility change to the running scheduler.
    pub fn set_visibility(&self, visibility: Visibility) {
        if let Some(active) = &self.active {
            active.set_visibility(visibility);
        }
    }

    /// Stop the active session, if any. Idempotent; the pipeline's
    /// resources are released before this returns.
    pub fn stop(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.is_running())
    }
}

impl Drop for BackdropSession {
    fn drop(&mut self) {
        self.stop();
    }
}
