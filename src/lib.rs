//! Real-time virtual-background compositing.
//!
//! Every frame, a person-segmentation mask is obtained from an injected
//! inference primitive, shaped (coverage stretch + feathering), and the
//! live frame is composited against a background treatment (blur, static
//! image, or green substitution). A visibility-aware scheduler paces the
//! loop against display refresh and keeps frames flowing at ~30 fps while
//! the display is hidden, reporting fps and per-stage timings once per
//! frame.
//!
//! The CPU-raster pipeline is always available; enable the `gpu` feature
//! for the wgpu-accelerated variant (selected per session, with automatic
//! fallback).

#![forbid(unsafe_code)]

pub mod assets;
pub mod blur;
pub mod composite;
pub mod config;
pub mod error;
pub mod frame;
pub mod inference;
pub mod mask;
pub mod pipeline;
pub mod pipeline_cpu;
#[cfg(feature = "gpu")]
pub mod pipeline_gpu;
pub mod scheduler;
pub mod session;
pub mod timing;

pub use assets::{BackgroundImage, background_image_paths, decode_background, load_background};
pub use config::{
    BackgroundTreatment, BilateralFilterConfig, BlendMode, InferenceBackend, InputResolution,
    ModelKind, PipelineKind, PostProcessingConfig, SegmentationConfig,
};
pub use error::{BackdropError, BackdropResult};
pub use frame::{FrameRgba, FrameSink, FrameSource};
pub use inference::{BufferInference, InferencePrimitive, RasterSegmenter, SegmentFuture};
pub use mask::{RawSegmentation, SegmentationMask, decode, decode_binary, decode_logits};
pub use pipeline::{RenderPipeline, select_pipeline};
pub use pipeline_cpu::CpuRasterPipeline;
pub use scheduler::{FrameScheduler, RunningScheduler, TimingCallback, Visibility};
pub use session::BackdropSession;
pub use timing::FrameClock;
