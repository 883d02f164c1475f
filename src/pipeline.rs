use crate::{
    assets::BackgroundImage,
    config::{BackgroundTreatment, PipelineKind, PostProcessingConfig, SegmentationConfig},
    error::BackdropResult,
    frame::{FrameRgba, FrameSink, FrameSource, resize_bilinear_rgba},
    inference::InferencePrimitive,
    mask::{SegmentationMask, decode_binary, decode_logits},
    timing::FrameClock,
};

/// Uniform per-frame contract shared by the CPU-raster and GPU backends.
///
/// The scheduler only ever talks to this trait; which variant sits behind
/// it is decided once, at construction, by [`select_pipeline`].
pub trait RenderPipeline: Send {
    /// Execute exactly one frame: downsample, infer, decode, composite,
    /// deliver to the sink. Stage boundaries are reported through `clock`.
    ///
    /// A missing source frame is a silent no-op; a transient inference
    /// failure surfaces as an error and the next tick retries naturally.
    fn render(&mut self, clock: &mut FrameClock) -> BackdropResult<()>;

    /// Replace the post-processing configuration; takes effect at the next
    /// `render` call, never mid-frame.
    fn update_post_processing_config(&mut self, cfg: PostProcessingConfig);

    /// Release per-pipeline resources. Idempotent; safe without any prior
    /// `render`; any tick arriving afterwards is a no-op.
    fn clean_up(&mut self);
}

/// Smoothing (feather) radius in source pixels for a treatment, when mask
/// smoothing is enabled: a wide feather in front of a blurred background,
/// a tighter one over a static image, none otherwise.
pub(crate) fn smoothing_radius(
    treatment: &BackgroundTreatment,
    post: &PostProcessingConfig,
) -> u32 {
    if !post.smooth_mask {
        return 0;
    }
    match treatment {
        BackgroundTreatment::Blur => 8,
        BackgroundTreatment::StaticImage(_) => 4,
        _ => 0,
    }
}

/// The backend-independent segmentation stage: downsample the source to
/// the model's input resolution, drive the inference primitive, decode
/// logits or indicators into the mask. Both pipeline variants embed one;
/// all buffers are allocated once here and reused every frame.
pub(crate) struct SegmentationStage {
    primitive: InferencePrimitive,
    mask: SegmentationMask,
    model_input: FrameRgba,
    alpha_seg: Vec<u8>,
}

impl SegmentationStage {
    pub(crate) fn new(cfg: &SegmentationConfig, primitive: InferencePrimitive) -> Self {
        let (w, h) = cfg.input_resolution.dims();
        Self {
            primitive,
            mask: SegmentationMask::new(w, h),
            model_input: FrameRgba::new(w, h),
            alpha_seg: vec![0u8; (w as usize) * (h as usize)],
        }
    }

    pub(crate) fn dims(&self) -> (u32, u32) {
        (self.mask.width(), self.mask.height())
    }

    /// Step (a): downsample the source frame into the model input, and for
    /// buffer models write normalized RGB samples into the input arena.
    pub(crate) fn downsample(&mut self, frame: &FrameRgba) -> BackdropResult<()> {
        resize_bilinear_rgba(frame, &mut self.model_input)?;

        if let InferencePrimitive::Buffer(model) = &mut self.primitive {
            let offset = model.input_offset();
            let stride = model.input_channels() as usize;
            let pixels = self.model_input.pixel_count();
            let src = &self.model_input.data;
            let buf = model.buffer_mut();
            for i in 0..pixels {
                for c in 0..3 {
                    buf[offset + i * stride + c] = (src[i * 4 + c] as f32) / 255.0;
                }
            }
        }
        Ok(())
    }

    /// Step (b): run inference and decode the output into the mask's alpha
    /// channel, then lift the alpha plane out for compositing.
    pub(crate) fn infer_and_decode(&mut self) -> BackdropResult<()> {
        match &mut self.primitive {
            InferencePrimitive::Raster(segmenter) => {
                let indicators = pollster::block_on(segmenter.segment(&self.model_input))?;
                decode_binary(&mut self.mask, &indicators)?;
            }
            InferencePrimitive::Buffer(model) => {
                model.run()?;
                let offset = model.output_offset();
                let len = self.mask.pixel_count() * model.output_channels() as usize;
                let logits = &model.buffer()[offset..offset + len];
                decode_logits(&mut self.mask, logits)?;
            }
        }
        self.mask.extract_alpha(&mut self.alpha_seg)
    }

    /// Mask alpha at the model's native resolution, refreshed by the last
    /// [`infer_and_decode`](Self::infer_and_decode).
    pub(crate) fn alpha_seg(&self) -> &[u8] {
        &self.alpha_seg
    }
}

/// Choose and construct the pipeline variant for this session.
///
/// The GPU variant is used iff the configuration requests it, the crate
/// was built with the `gpu` feature, and a device can actually be
/// acquired; every failed probe falls back to the CPU-raster variant with
/// a logged warning. Availability is re-evaluated on every call — nothing
/// is cached between sessions, so a stale probe can never pick a dead
/// backend.
pub fn select_pipeline(
    source: Box<dyn FrameSource>,
    treatment: BackgroundTreatment,
    segmentation: SegmentationConfig,
    post: PostProcessingConfig,
    primitive: InferencePrimitive,
    sink: Box<dyn FrameSink>,
) -> BackdropResult<Box<dyn RenderPipeline>> {
    primitive.validate_for(&segmentation)?;
    post.validate()?;

    if segmentation.pipeline == PipelineKind::Gpu {
        #[cfg(feature = "gpu")]
        match crate::pipeline_gpu::GpuContext::acquire() {
            Ok(ctx) => {
                return Ok(Box::new(crate::pipeline_gpu::GpuPipeline::new(
                    ctx,
                    source,
                    treatment,
                    &segmentation,
                    post,
                    primitive,
                    sink,
                )?));
            }
            Err(e) => {
                tracing::warn!("gpu unavailable, falling back to cpu raster: {e}");
            }
        }
        #[cfg(not(feature = "gpu"))]
        tracing::warn!("gpu pipeline requested but this build has no gpu feature; using cpu raster");
    }

    Ok(Box::new(crate::pipeline_cpu::CpuRasterPipeline::new(
        source,
        treatment,
        &segmentation,
        post,
        primitive,
        sink,
    )?))
}

/// Scale a background asset to the source dimensions once, at pipeline
/// construction.
pub(crate) fn prescale_background(
    image: &BackgroundImage,
    width: u32,
    height: u32,
) -> BackdropResult<FrameRgba> {
    let mut scaled = FrameRgba::new(width, height);
    resize_bilinear_rgba(&image.pixels, &mut scaled)?;
    Ok(scaled)
}
