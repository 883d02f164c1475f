use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use backdrop::{
    BackdropSession, BackgroundTreatment, FrameRgba, FrameSink, FrameSource, InferencePrimitive,
    PostProcessingConfig, RasterSegmenter, SegmentFuture, SegmentationConfig, load_background,
};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "backdrop", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a compositing session against a synthetic or still-image source.
    Run(RunArgs),
    /// List the bundled background image paths.
    Backgrounds,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Background treatment.
    #[arg(long, value_enum, default_value_t = TreatmentChoice::Blur)]
    background: TreatmentChoice,

    /// Background image (required for --background image).
    #[arg(long)]
    image: Option<PathBuf>,

    /// Source: a still image instead of the synthetic test pattern.
    #[arg(long)]
    source: Option<PathBuf>,

    /// Synthetic source width.
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Synthetic source height.
    #[arg(long, default_value_t = 360)]
    height: u32,

    /// How long to run, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    duration_ms: u64,

    /// Request the GPU pipeline (falls back to cpu raster if unavailable).
    #[arg(long)]
    gpu: bool,

    /// Post-processing config JSON file.
    #[arg(long)]
    post_config: Option<PathBuf>,

    /// Write the last composited frame as a PNG.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TreatmentChoice {
    None,
    Blur,
    Image,
    Greenscreen,
}

/// Test pattern: a vertical gradient with a bright disc orbiting the
/// center, so masks and composites are easy to eyeball.
struct SyntheticSource {
    frame: FrameRgba,
    tick: u64,
}

impl SyntheticSource {
    fn new(width: u32, height: u32) -> Self {
        Self {
            frame: FrameRgba::new(width, height),
            tick: 0,
        }
    }
}

impl FrameSource for SyntheticSource {
    fn width(&self) -> u32 {
        self.frame.width
    }

    fn height(&self) -> u32 {
        self.frame.height
    }

    fn current_frame(&mut self) -> Option<&FrameRgba> {
        let (w, h) = (self.frame.width, self.frame.height);
        let phase = (self.tick as f32) * 0.05;
        let cx = (w as f32) * (0.5 + 0.2 * phase.cos());
        let cy = (h as f32) * (0.5 + 0.2 * phase.sin());
        let r = (h as f32) * 0.25;

        for y in 0..h {
            for x in 0..w {
                let i = ((y * w + x) as usize) * 4;
                let dx = x as f32 - cx;
                let dy = y as f32 - cy;
                let inside = dx * dx + dy * dy <= r * r;
                let shade = (255 * y / h.max(1)) as u8;
                let px: [u8; 4] = if inside {
                    [230, 180, 140, 255]
                } else {
                    [shade / 3, shade / 2, shade, 255]
                };
                self.frame.data[i..i + 4].copy_from_slice(&px);
            }
        }
        self.tick += 1;
        Some(&self.frame)
    }
}

struct StillSource {
    frame: FrameRgba,
}

impl FrameSource for StillSource {
    fn width(&self) -> u32 {
        self.frame.width
    }

    fn height(&self) -> u32 {
        self.frame.height
    }

    fn current_frame(&mut self) -> Option<&FrameRgba> {
        Some(&self.frame)
    }
}

/// Stand-in segmenter: marks a centered oval as the person. Lets the demo
/// exercise the full pipeline without shipping a model.
struct OvalSegmenter;

impl RasterSegmenter for OvalSegmenter {
    fn segment<'a>(&'a mut self, frame: &'a FrameRgba) -> SegmentFuture<'a> {
        Box::pin(async move {
            let (w, h) = (frame.width as f32, frame.height as f32);
            let mut out = vec![0u8; frame.pixel_count()];
            for y in 0..frame.height {
                for x in 0..frame.width {
                    let nx = (x as f32 / w) * 2.0 - 1.0;
                    let ny = (y as f32 / h) * 2.0 - 1.0;
                    if nx * nx / 0.45 + ny * ny / 0.8 <= 1.0 {
                        out[(y * frame.width + x) as usize] = 1;
                    }
                }
            }
            Ok(out)
        })
    }
}

struct CaptureSink {
    latest: Arc<Mutex<Option<FrameRgba>>>,
}

impl FrameSink for CaptureSink {
    fn write_frame(&mut self, frame: &FrameRgba) -> backdrop::BackdropResult<()> {
        *self.latest.lock().expect("sink lock") = Some(frame.clone());
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Command::Run(args) => cmd_run(args),
        Command::Backgrounds => {
            for path in backdrop::background_image_paths() {
                println!("{}", path.display());
            }
            Ok(())
        }
    }
}

fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let treatment = match args.background {
        TreatmentChoice::None => BackgroundTreatment::None,
        TreatmentChoice::Blur => BackgroundTreatment::Blur,
        TreatmentChoice::Greenscreen => BackgroundTreatment::ColorSubstitution,
        TreatmentChoice::Image => {
            let path = args
                .image
                .as_ref()
                .context("--background image requires --image <path>")?;
            BackgroundTreatment::StaticImage(load_background(path)?)
        }
    };

    let source: Box<dyn FrameSource> = match &args.source {
        Some(path) => Box::new(StillSource {
            frame: load_background(path)?.pixels,
        }),
        None => Box::new(SyntheticSource::new(args.width, args.height)),
    };

    let mut segmentation = SegmentationConfig::high_detail();
    if args.gpu {
        segmentation.pipeline = backdrop::PipelineKind::Gpu;
    }

    let mut session = BackdropSession::new();
    session.set_source(source);
    session.set_background(treatment);
    session.set_segmentation_config(segmentation);
    session.set_inference_primitive(InferencePrimitive::Raster(Box::new(OvalSegmenter)));

    if let Some(path) = &args.post_config {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read post config '{}'", path.display()))?;
        let cfg: PostProcessingConfig =
            serde_json::from_slice(&bytes).context("parse post config JSON")?;
        session.set_post_processing_config(cfg)?;
    }

    let latest = Arc::new(Mutex::new(None));
    let sink = CaptureSink {
        latest: Arc::clone(&latest),
    };

    let mut reported = 0u64;
    session.start(
        Box::new(sink),
        Box::new(move |fps, durations| {
            reported += 1;
            if reported % 30 == 0 {
                tracing::info!(
                    "frame {}: fps={:.1}, stages={:?}",
                    reported,
                    fps,
                    durations
                        .iter()
                        .map(|d| (d * 10.0).round() / 10.0)
                        .collect::<Vec<_>>()
                );
            }
        }),
    )?;

    std::thread::sleep(Duration::from_millis(args.duration_ms));
    session.stop();

    let last = latest.lock().expect("sink lock").take();
    match last {
        Some(frame) => {
            tracing::info!("session produced {}x{} frames", frame.width, frame.height);
            if let Some(out) = &args.out {
                let img = image::RgbaImage::from_raw(frame.width, frame.height, frame.data)
                    .context("assemble output image")?;
                img.save(out)
                    .with_context(|| format!("write '{}'", out.display()))?;
                tracing::info!("wrote {}", out.display());
            }
        }
        None => tracing::warn!("no frames were produced"),
    }

    Ok(())
}
