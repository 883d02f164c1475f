use crate::{
    blur::{blur_plane, blur_rgba_premul, gaussian_kernel_q16},
    composite::{clip_to_mask, light_wrap_in_place, substitute_cutout_in_place, under_in_place},
    config::{BackgroundTreatment, PostProcessingConfig, SegmentationConfig},
    error::{BackdropError, BackdropResult},
    frame::{FrameRgba, FrameSink, FrameSource, resize_bilinear_plane},
    inference::InferencePrimitive,
    mask::apply_coverage,
    pipeline::{RenderPipeline, SegmentationStage, prescale_background, smoothing_radius},
    timing::FrameClock,
};

/// Background blur radius in source pixels.
const BACKGROUND_BLUR_RADIUS: u32 = 8;

/// CPU-raster pipeline: every stage runs as plain raster loops over
/// preallocated buffers, one logical thread, no per-frame allocation.
pub struct CpuRasterPipeline {
    source: Box<dyn FrameSource>,
    sink: Box<dyn FrameSink>,
    treatment: BackgroundTreatment,
    post: PostProcessingConfig,
    stage: SegmentationStage,

    width: u32,
    height: u32,
    canvas: FrameRgba,
    alpha_full: Vec<u8>,
    alpha_feathered: Vec<u8>,
    plane_scratch: Vec<u8>,
    bg_layer: Vec<u8>,
    rgba_scratch: Vec<u8>,
    bg_scaled: Option<FrameRgba>,

    feather_kernel: Vec<u32>,
    bg_blur_kernel: Vec<u32>,

    cleaned: bool,
}

impl CpuRasterPipeline {
    pub fn new(
        source: Box<dyn FrameSource>,
        treatment: BackgroundTreatment,
        segmentation: &SegmentationConfig,
        post: PostProcessingConfig,
        primitive: InferencePrimitive,
        sink: Box<dyn FrameSink>,
    ) -> BackdropResult<Self> {
        let width = source.width();
        let height = source.height();
        if width == 0 || height == 0 {
            return Err(BackdropError::configuration(
                "frame source must report non-zero dimensions",
            ));
        }

        let pixels = (width as usize) * (height as usize);
        let bg_scaled = match &treatment {
            BackgroundTreatment::StaticImage(image) => {
                Some(prescale_background(image, width, height)?)
            }
            _ => None,
        };

        // The feather radius is fixed by the treatment for the lifetime of
        // the pipeline; the smooth_mask flag only switches it on and off.
        let feather_radius = match &treatment {
            BackgroundTreatment::Blur => 8,
            BackgroundTreatment::StaticImage(_) => 4,
            _ => 0,
        };
        let feather_kernel = gaussian_kernel_q16(feather_radius, (feather_radius as f32) / 2.0)?;
        let bg_blur_kernel =
            gaussian_kernel_q16(BACKGROUND_BLUR_RADIUS, (BACKGROUND_BLUR_RADIUS as f32) / 2.0)?;

        Ok(Self {
            source,
            sink,
            stage: SegmentationStage::new(segmentation, primitive),
            treatment,
            post,
            width,
            height,
            canvas: FrameRgba::new(width, height),
            alpha_full: vec![0u8; pixels],
            alpha_feathered: vec![0u8; pixels],
            plane_scratch: vec![0u8; pixels],
            bg_layer: vec![0u8; pixels * 4],
            rgba_scratch: vec![0u8; pixels * 4],
            bg_scaled,
            feather_kernel,
            bg_blur_kernel,
            cleaned: false,
        })
    }
}

impl RenderPipeline for CpuRasterPipeline {
    fn render(&mut self, clock: &mut FrameClock) -> BackdropResult<()> {
        if self.cleaned {
            return Ok(());
        }
        let Some(frame) = self.source.current_frame() else {
            tracing::debug!("no source frame available, skipping tick");
            return Ok(());
        };

        let passthrough = self.treatment.is_none();

        if !passthrough {
            self.stage.downsample(frame)?;
        }
        clock.mark();

        if !passthrough {
            self.stage.infer_and_decode()?;
        }
        clock.mark();

        if passthrough {
            self.canvas.data.copy_from_slice(&frame.data);
        } else {
            let (seg_w, seg_h) = self.stage.dims();
            resize_bilinear_plane(
                self.stage.alpha_seg(),
                seg_w,
                seg_h,
                &mut self.alpha_full,
                self.width,
                self.height,
            )?;
            apply_coverage(&mut self.alpha_full, self.post.coverage);

            let alpha: &[u8] = if smoothing_radius(&self.treatment, &self.post) > 0 {
                blur_plane(
                    &self.alpha_full,
                    &mut self.alpha_feathered,
                    &mut self.plane_scratch,
                    self.width,
                    self.height,
                    &self.feather_kernel,
                )?;
                &self.alpha_feathered
            } else {
                &self.alpha_full
            };

            clip_to_mask(&frame.data, alpha, &mut self.canvas.data)?;

            match &self.treatment {
                BackgroundTreatment::Blur => {
                    blur_rgba_premul(
                        &frame.data,
                        &mut self.bg_layer,
                        &mut self.rgba_scratch,
                        self.width,
                        self.height,
                        &self.bg_blur_kernel,
                    )?;
                    light_wrap_in_place(
                        &mut self.canvas.data,
                        &self.bg_layer,
                        alpha,
                        self.post.light_wrap,
                        self.post.blend_mode,
                    )?;
                    under_in_place(&mut self.canvas.data, &self.bg_layer)?;
                }
                BackgroundTreatment::StaticImage(_) => {
                    let bg = self.bg_scaled.as_ref().ok_or_else(|| {
                        BackdropError::render("static background was not prepared")
                    })?;
                    light_wrap_in_place(
                        &mut self.canvas.data,
                        &bg.data,
                        alpha,
                        self.post.light_wrap,
                        self.post.blend_mode,
                    )?;
                    under_in_place(&mut self.canvas.data, &bg.data)?;
                }
                BackgroundTreatment::ColorSubstitution => {
                    substitute_cutout_in_place(&mut self.canvas.data)?;
                }
                BackgroundTreatment::None => unreachable!("handled by the pass-through path"),
            }
        }

        self.sink.write_frame(&self.canvas)
    }

    fn update_post_processing_config(&mut self, cfg: PostProcessingConfig) {
        self.post = cfg;
    }

    fn clean_up(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        for buf in [
            &mut self.alpha_full,
            &mut self.alpha_feathered,
            &mut self.plane_scratch,
            &mut self.bg_layer,
            &mut self.rgba_scratch,
        ] {
            buf.clear();
            buf.shrink_to_fit();
        }
        self.bg_scaled = None;
    }
}
