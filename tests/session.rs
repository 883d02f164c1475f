use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU32, Ordering},
};
use std::time::Duration;

use backdrop::{
    BackdropResult, BackdropSession, BackgroundTreatment, FrameRgba, FrameSink, FrameSource,
    InferenceBackend, InferencePrimitive, InputResolution, ModelKind, PipelineKind,
    PostProcessingConfig, RasterSegmenter, SegmentFuture, SegmentationConfig, Visibility,
};

const W: u32 = 160;
const H: u32 = 96;

struct SolidSource {
    frame: FrameRgba,
}

impl SolidSource {
    fn new() -> Self {
        let mut frame = FrameRgba::new(W, H);
        frame.fill([50, 60, 70, 255]);
        Self { frame }
    }
}

impl FrameSource for SolidSource {
    fn width(&self) -> u32 {
        W
    }

    fn height(&self) -> u32 {
        H
    }

    fn current_frame(&mut self) -> Option<&FrameRgba> {
        Some(&self.frame)
    }
}

struct CountingSegmenter {
    calls: Arc<AtomicU32>,
}

impl RasterSegmenter for CountingSegmenter {
    fn segment<'a>(&'a mut self, frame: &'a FrameRgba) -> SegmentFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(vec![1u8; frame.pixel_count()]) })
    }
}

#[derive(Clone)]
struct CountingSink {
    frames: Arc<AtomicU32>,
}

impl FrameSink for CountingSink {
    fn write_frame(&mut self, _frame: &FrameRgba) -> BackdropResult<()> {
        self.frames.fetch_add(1, Ordering::SeqCst);
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

#[test]
fn start_without_preconditions_is_a_noop() {
    let mut session = BackdropSession::new();
    session
        .start(
            Box::new(CountingSink {
                frames: Arc::new(AtomicU32::new(0)),
            }),
            Box::new(|_, _| {}),
        )
        .unwrap();
    assert!(!session.is_running());
}

#[test]
fn full_lifecycle_produces_frames_and_reports_timings() {
    let calls = Arc::new(AtomicU32::new(0));
    let frames = Arc::new(AtomicU32::new(0));
    let reports = Arc::new(Mutex::new(Vec::<(f64, usize)>::new()));

    let mut session = BackdropSession::new();
    session.set_source(Box::new(SolidSource::new()));
    session.set_background(BackgroundTreatment::ColorSubstitution);
    session.set_segmentation_config(raster_cfg());
    session.set_inference_primitive(InferencePrimitive::Raster(Box::new(CountingSegmenter {
        calls: Arc::clone(&calls),
    })));
    session.set_refresh_interval(Duration::from_millis(5));

    let reports_cb = Arc::clone(&reports);
    session
        .start(
            Box::new(CountingSink {
                frames: Arc::clone(&frames),
            }),
            Box::new(move |fps, durations| {
                reports_cb.lock().unwrap().push((fps, durations.len()));
            }),
        )
        .unwrap();
    assert!(session.is_running());

    std::thread::sleep(Duration::from_millis(100));
    session.set_visibility(Visibility::Hidden);
    std::thread::sleep(Duration::from_millis(100));
    session.stop();
    assert!(!session.is_running());

    let rendered = frames.load(Ordering::SeqCst);
    assert!(rendered >= 2, "expected frames, got {rendered}");
    assert_eq!(calls.load(Ordering::SeqCst), rendered);

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len() as u32, rendered);
    // Two pipeline stage marks plus the closing end-of-frame event.
    for (_, stages) in reports.iter() {
        assert_eq!(*stages, 3);
    }

    let no_new_frames = frames.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(frames.load(Ordering::SeqCst), no_new_frames);

    // Stopping again is safe.
    session.stop();
}

#[test]
fn post_processing_updates_while_running_are_accepted() {
    let mut session = BackdropSession::new();
    session.set_source(Box::new(SolidSource::new()));
    session.set_background(BackgroundTreatment::Blur);
    session.preset_high_detail();
    session.set_segmentation_config(raster_cfg());
    session.set_inference_primitive(InferencePrimitive::Raster(Box::new(CountingSegmenter {
        calls: Arc::new(AtomicU32::new(0)),
    })));
    session.set_refresh_interval(Duration::from_millis(10));

    session
        .start(
            Box::new(CountingSink {
                frames: Arc::new(AtomicU32::new(0)),
            }),
            Box::new(|_, _| {}),
        )
        .unwrap();

    let cfg = PostProcessingConfig {
        smooth_mask: false,
        ..PostProcessingConfig::default()
    };
    session.set_post_processing_config(cfg).unwrap();

    let invalid = PostProcessingConfig {
        coverage: [0.8, 0.2],
        ..PostProcessingConfig::default()
    };
    assert!(session.set_post_processing_config(invalid).is_err());

    session.stop();
}

#[test]
fn presets_select_model_variants() {
    let mut session = BackdropSession::new();
    session.preset_low_latency();
    session.preset_high_detail();
    // Presets only stage configuration; nothing runs until start.
    assert!(!session.is_running());
}
