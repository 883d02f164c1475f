use std::future::Future;
use std::pin::Pin;

use crate::{
    config::{InferenceBackend, ModelKind, SegmentationConfig},
    error::{BackdropError, BackdropResult},
    frame::FrameRgba,
};

pub type SegmentFuture<'a> = Pin<Box<dyn Future<Output = BackdropResult<Vec<u8>>> + Send + 'a>>;

/// Asynchronous "segment this raster" primitive.
///
/// The input is a frame already downsampled to the model's native input
/// resolution; the output is one byte per pixel, nonzero marking the
/// person. Model loading lives with the caller; the pipeline only drives
/// an already-initialized primitive.
pub trait RasterSegmenter: Send {
    fn segment<'a>(&'a mut self, frame: &'a FrameRgba) -> SegmentFuture<'a>;
}

/// Synchronous buffer-based inference primitive.
///
/// Input and output live in one shared f32 arena addressed by offsets. The
/// pipeline writes normalized (0-1) RGB samples at
/// `input_offset() + i * input_channels() + c` for pixel `i`, calls
/// [`run`](BufferInference::run), then reads (background, person) logit
/// pairs at `output_offset() + i * output_channels()`.
pub trait BufferInference: Send {
    fn input_offset(&self) -> usize;
    fn input_width(&self) -> u32;
    fn input_height(&self) -> u32;
    fn input_channels(&self) -> u32;

    fn output_offset(&self) -> usize;
    fn output_width(&self) -> u32;
    fn output_height(&self) -> u32;
    fn output_channels(&self) -> u32;

    /// Whether the primitive was built with the accelerated (SIMD) numeric
    /// kernels.
    fn accelerated(&self) -> bool;

    fn buffer(&self) -> &[f32];
    fn buffer_mut(&mut self) -> &mut [f32];

    fn run(&mut self) -> BackdropResult<()>;
}

/// The injected inference primitive, in whichever of the two supported
/// forms the external model loader produced.
pub enum InferencePrimitive {
    Raster(Box<dyn RasterSegmenter>),
    Buffer(Box<dyn BufferInference>),
}

impl InferencePrimitive {
    /// Fail-fast compatibility check between the primitive and the
    /// requested segmentation configuration. Called at pipeline
    /// construction; a mismatch never produces a partial pipeline.
    pub fn validate_for(&self, cfg: &SegmentationConfig) -> BackdropResult<()> {
        match (cfg.model, self) {
            (ModelKind::BinaryMask, InferencePrimitive::Raster(_)) => Ok(()),
            (ModelKind::TwoClassLogits, InferencePrimitive::Buffer(model)) => {
                if cfg.backend == InferenceBackend::Simd && !model.accelerated() {
                    return Err(BackdropError::configuration(
                        "simd inference backend requested but the loaded primitive is not accelerated",
                    ));
                }
                let (w, h) = cfg.input_resolution.dims();
                if model.input_width() != w || model.input_height() != h {
                    return Err(BackdropError::configuration(format!(
                        "model input {}x{} does not match configured resolution {w}x{h}",
                        model.input_width(),
                        model.input_height(),
                    )));
                }
                if model.input_channels() != 3 {
                    return Err(BackdropError::configuration(
                        "buffer model must take 3 input channels (rgb)",
                    ));
                }
                if model.output_channels() != 2 {
                    return Err(BackdropError::configuration(
                        "buffer model must produce 2 output channels (background, person)",
                    ));
                }
                Ok(())
            }
            (ModelKind::BinaryMask, InferencePrimitive::Buffer(_)) => {
                Err(BackdropError::configuration(
                    "binary-mask model requires a raster segmenter primitive",
                ))
            }
            (ModelKind::TwoClassLogits, InferencePrimitive::Raster(_)) => {
                Err(BackdropError::configuration(
                    "two-class-logits model requires a buffer inference primitive",
                ))
            }
        }
    }
}
