use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU32, Ordering},
};

use backdrop::{
    BackdropResult, BackgroundImage, BackgroundTreatment, BufferInference, FrameRgba, FrameSink,
    FrameSource, InferenceBackend, InferencePrimitive, InputResolution, ModelKind, PipelineKind,
    PostProcessingConfig, RasterSegmenter, RenderPipeline, SegmentFuture, SegmentationConfig,
    select_pipeline,
};

const W: u32 = 160;
const H: u32 = 96;

struct TestSource {
    frame: Option<FrameRgba>,
}

impl TestSource {
    fn solid(rgba: [u8; 4]) -> Self {
        let mut frame = FrameRgba::new(W, H);
        frame.fill(rgba);
        Self { frame: Some(frame) }
    }

    fn empty() -> Self {
        Self { frame: None }
    }
}

impl FrameSource for TestSource {
    fn width(&self) -> u32 {
        W
    }

    fn height(&self) -> u32 {
        H
    }

    fn current_frame(&mut self) -> Option<&FrameRgba> {
        self.frame.as_ref()
    }
}

/// Marks the right half of the frame as the person and counts invocations.
struct HalfSegmenter {
    calls: Arc<AtomicU32>,
}

impl RasterSegmenter for HalfSegmenter {
    fn segment<'a>(&'a mut self, frame: &'a FrameRgba) -> SegmentFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let mut out = vec![0u8; frame.pixel_count()];
            for y in 0..frame.height {
                for x in frame.width / 2..frame.width {
                    out[(y * frame.width + x) as usize] = 1;
                }
            }
            Ok(out)
        })
    }
}

/// Buffer model emitting equal logits everywhere: decoded alpha 128.
struct EqualLogits {
    data: Vec<f32>,
}

impl EqualLogits {
    fn new() -> Self {
        Self {
            data: vec![0.0; (W * H) as usize * 5],
        }
    }
}

impl BufferInference for EqualLogits {
    fn input_offset(&self) -> usize {
        0
    }
    fn input_width(&self) -> u32 {
        W
    }
    fn input_height(&self) -> u32 {
        H
    }
    fn input_channels(&self) -> u32 {
        3
    }
    fn output_offset(&self) -> usize {
        (W * H) as usize * 3
    }
    fn output_width(&self) -> u32 {
        W
    }
    fn output_height(&self) -> u32 {
        H
    }
    fn output_channels(&self) -> u32 {
        2
    }
    fn accelerated(&self) -> bool {
        false
    }
    fn buffer(&self) -> &[f32] {
        &self.data
    }
    fn buffer_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
    fn run(&mut self) -> BackdropResult<()> {
        let offset = self.output_offset();
        for v in &mut self.data[offset..] {
            *v = 0.0;
        }
        Ok(())
    }
}

#[derive(Clone)]
struct VecSink {
    frames: Arc<Mutex<Vec<FrameRgba>>>,
}

impl VecSink {
    fn new() -> Self {
        Self {
            frames: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn last(&self) -> FrameRgba {
        self.frames.lock().unwrap().last().cloned().expect("a frame")
    }

    fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

impl FrameSink for VecSink {
    fn write_frame(&mut self, frame: &FrameRgba) -> BackdropResult<()> {
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }
}

fn raster_cfg() -> SegmentationConfig {
    SegmentationConfig {
        model: ModelKind::BinaryMask,
        backend: InferenceBackend::Baseline,
        input_resolution: InputResolution::R96,
        pipeline: PipelineKind::CpuRaster,
    }
}

fn logits_cfg() -> SegmentationConfig {
    SegmentationConfig {
        model: ModelKind::TwoClassLogits,
        ..raster_cfg()
    }
}

/// Post-processing with every cosmetic stage disabled, so composites are
/// exact.
fn plain_post() -> PostProcessingConfig {
    PostProcessingConfig {
        smooth_mask: false,
        coverage: [0.0, 1.0],
        light_wrap: 0.0,
        ..PostProcessingConfig::default()
    }
}

fn render_once(pipeline: &mut dyn RenderPipeline) {
    let mut clock = backdrop::FrameClock::new();
    clock.begin_frame();
    pipeline.render(&mut clock).unwrap();
    clock.end_frame();
}

#[test]
fn none_treatment_never_invokes_inference() {
    let calls = Arc::new(AtomicU32::new(0));
    let sink = VecSink::new();
    let source_pixels = [9u8, 18, 27, 255];

    let mut pipeline = select_pipeline(
        Box::new(TestSource::solid(source_pixels)),
        BackgroundTreatment::None,
        raster_cfg(),
        plain_post(),
        InferencePrimitive::Raster(Box::new(HalfSegmenter {
            calls: Arc::clone(&calls),
        })),
        Box::new(sink.clone()),
    )
    .unwrap();

    for _ in 0..5 {
        render_once(pipeline.as_mut());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(sink.len(), 5);
    for px in sink.last().data.chunks_exact(4) {
        assert_eq!(px, source_pixels);
    }
}

#[test]
fn inference_runs_once_per_frame_with_a_treatment() {
    let calls = Arc::new(AtomicU32::new(0));
    let sink = VecSink::new();

    let mut pipeline = select_pipeline(
        Box::new(TestSource::solid([10, 20, 30, 255])),
        BackgroundTreatment::ColorSubstitution,
        raster_cfg(),
        plain_post(),
        InferencePrimitive::Raster(Box::new(HalfSegmenter {
            calls: Arc::clone(&calls),
        })),
        Box::new(sink.clone()),
    )
    .unwrap();

    for _ in 0..3 {
        render_once(pipeline.as_mut());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn greenscreen_splits_cutout_from_person() {
    let calls = Arc::new(AtomicU32::new(0));
    let sink = VecSink::new();
    let source_pixels = [10u8, 20, 30, 255];

    let mut pipeline = select_pipeline(
        Box::new(TestSource::solid(source_pixels)),
        BackgroundTreatment::ColorSubstitution,
        raster_cfg(),
        plain_post(),
        InferencePrimitive::Raster(Box::new(HalfSegmenter { calls })),
        Box::new(sink.clone()),
    )
    .unwrap();

    render_once(pipeline.as_mut());
    let out = sink.last();

    // Left half was cut out entirely: sentinel pixels became green.
    assert_eq!(out.pixel(W / 4, H / 2), [0, 255, 0, 255]);
    // Right half is the untouched person.
    assert_eq!(out.pixel(3 * W / 4, H / 2), source_pixels);
}

#[test]
fn static_image_sits_behind_the_person() {
    let calls = Arc::new(AtomicU32::new(0));
    let sink = VecSink::new();
    let person = [200u8, 0, 0, 255];
    let backdrop_px = [0u8, 0, 200, 255];

    let mut bg = FrameRgba::new(W, H);
    bg.fill(backdrop_px);

    let mut pipeline = select_pipeline(
        Box::new(TestSource::solid(person)),
        BackgroundTreatment::StaticImage(BackgroundImage::from_frame(bg)),
        raster_cfg(),
        plain_post(),
        InferencePrimitive::Raster(Box::new(HalfSegmenter { calls })),
        Box::new(sink.clone()),
    )
    .unwrap();

    render_once(pipeline.as_mut());
    let out = sink.last();

    assert_eq!(out.pixel(W / 4, H / 2), backdrop_px);
    assert_eq!(out.pixel(3 * W / 4, H / 2), person);
}

#[test]
fn blur_treatment_replaces_the_cutout_with_blurred_source() {
    let calls = Arc::new(AtomicU32::new(0));
    let sink = VecSink::new();

    // Left half dark, right half bright: blurring smears the boundary.
    let mut frame = FrameRgba::new(W, H);
    for y in 0..H {
        for x in 0..W {
            let i = ((y * W + x) as usize) * 4;
            let v = if x < W / 2 { 0u8 } else { 240u8 };
            frame.data[i..i + 4].copy_from_slice(&[v, v, v, 255]);
        }
    }

    let mut pipeline = select_pipeline(
        Box::new(TestSource { frame: Some(frame) }),
        BackgroundTreatment::Blur,
        raster_cfg(),
        plain_post(),
        InferencePrimitive::Raster(Box::new(HalfSegmenter { calls })),
        Box::new(sink.clone()),
    )
    .unwrap();

    render_once(pipeline.as_mut());
    let out = sink.last();

    // Person region: original pixels.
    assert_eq!(out.pixel(3 * W / 4, H / 2), [240, 240, 240, 255]);
    // Cutout near the luminance boundary: blurred mixture, neither pure
    // value.
    let near_edge = out.pixel(W / 2 - 2, H / 2);
    assert!(near_edge[0] > 0 && near_edge[0] < 240, "got {near_edge:?}");
    assert_eq!(near_edge[3], 255);
}

#[test]
fn post_processing_swap_takes_effect_next_frame() {
    let sink = VecSink::new();

    let mut pipeline = select_pipeline(
        Box::new(TestSource::solid([100, 100, 100, 255])),
        BackgroundTreatment::ColorSubstitution,
        logits_cfg(),
        plain_post(),
        InferencePrimitive::Buffer(Box::new(EqualLogits::new())),
        Box::new(sink.clone()),
    )
    .unwrap();

    // Equal logits decode to alpha 128: the whole frame is half-covered
    // person, nothing is a full sentinel, nothing turns green.
    render_once(pipeline.as_mut());
    let before = sink.last();
    assert_ne!(before.pixel(W / 2, H / 2), [0, 255, 0, 255]);

    // Raise the coverage floor above 0.5: alpha 128 collapses to 0 and
    // the next frame substitutes everything.
    pipeline.update_post_processing_config(PostProcessingConfig {
        coverage: [0.9, 1.0],
        ..plain_post()
    });
    render_once(pipeline.as_mut());
    let after = sink.last();
    for px in after.data.chunks_exact(4) {
        assert_eq!(px, [0, 255, 0, 255]);
    }
}

#[test]
fn missing_source_frame_is_a_silent_noop() {
    let calls = Arc::new(AtomicU32::new(0));
    let sink = VecSink::new();

    let mut pipeline = select_pipeline(
        Box::new(TestSource::empty()),
        BackgroundTreatment::Blur,
        raster_cfg(),
        plain_post(),
        InferencePrimitive::Raster(Box::new(HalfSegmenter {
            calls: Arc::clone(&calls),
        })),
        Box::new(sink.clone()),
    )
    .unwrap();

    render_once(pipeline.as_mut());
    assert_eq!(sink.len(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn clean_up_is_idempotent_and_disables_render() {
    let calls = Arc::new(AtomicU32::new(0));
    let sink = VecSink::new();

    let mut pipeline = select_pipeline(
        Box::new(TestSource::solid([1, 2, 3, 255])),
        BackgroundTreatment::ColorSubstitution,
        raster_cfg(),
        plain_post(),
        InferencePrimitive::Raster(Box::new(HalfSegmenter { calls })),
        Box::new(sink.clone()),
    )
    .unwrap();

    pipeline.clean_up();
    pipeline.clean_up();
    render_once(pipeline.as_mut());
    assert_eq!(sink.len(), 0);
}

#[test]
fn mismatched_primitive_fails_construction() {
    let result = select_pipeline(
        Box::new(TestSource::solid([0, 0, 0, 255])),
        BackgroundTreatment::Blur,
        logits_cfg(),
        plain_post(),
        InferencePrimitive::Raster(Box::new(HalfSegmenter {
            calls: Arc::new(AtomicU32::new(0)),
        })),
        Box::new(VecSink::new()),
    );
    assert!(matches!(
        result,
        Err(backdrop::BackdropError::Configuration(_))
    ));
}
