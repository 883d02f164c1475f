use crate::{
    assets::BackgroundImage,
    error::{BackdropError, BackdropResult},
};

/// What to put behind the segmented person.
///
/// Immutable during a single `render` call; the caller may swap it between
/// frames by rebuilding the pipeline.
#[derive(Clone, Debug)]
pub enum BackgroundTreatment {
    /// Pass-through: the raw source is drawn directly and no inference runs.
    None,
    /// The original frame, blurred, behind the extracted foreground.
    Blur,
    /// A decoded still image scaled to the source dimensions.
    StaticImage(BackgroundImage),
    /// Replace cutout pixels with solid green (chroma-key style output).
    ColorSubstitution,
}

impl BackgroundTreatment {
    pub fn is_none(&self) -> bool {
        matches!(self, BackgroundTreatment::None)
    }
}

/// Which kind of segmentation model output the pipeline decodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ModelKind {
    /// An asynchronous raster segmenter producing a per-pixel boolean
    /// person indicator.
    BinaryMask,
    /// A synchronous buffer model producing interleaved
    /// (background, person) logits, two floats per pixel.
    TwoClassLogits,
}

/// Requested numeric backend for the inference primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InferenceBackend {
    Baseline,
    /// Requires the loaded primitive to report SIMD acceleration support;
    /// rejected at pipeline construction otherwise.
    Simd,
}

/// Native input resolution of the segmentation model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InputResolution {
    R96,
    R144,
    R360,
}

impl InputResolution {
    pub fn dims(self) -> (u32, u32) {
        match self {
            InputResolution::R96 => (160, 96),
            InputResolution::R144 => (256, 144),
            InputResolution::R360 => (640, 360),
        }
    }
}

/// Requested execution backend for the compositing pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PipelineKind {
    CpuRaster,
    Gpu,
}

/// Fixes the mask's native resolution and which inference primitive form
/// the pipeline drives. Changing any field requires rebuilding the
/// pipeline (a new session).
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SegmentationConfig {
    pub model: ModelKind,
    pub backend: InferenceBackend,
    pub input_resolution: InputResolution,
    pub pipeline: PipelineKind,
}

impl SegmentationConfig {
    /// Compact two-class model at the lowest resolution, GPU-preferred.
    pub fn low_latency() -> Self {
        Self {
            model: ModelKind::TwoClassLogits,
            backend: InferenceBackend::Simd,
            input_resolution: InputResolution::R96,
            pipeline: PipelineKind::Gpu,
        }
    }

    /// Binary segmenter at the highest resolution on the raster path.
    pub fn high_detail() -> Self {
        Self {
            model: ModelKind::BinaryMask,
            backend: InferenceBackend::Baseline,
            input_resolution: InputResolution::R360,
            pipeline: PipelineKind::CpuRaster,
        }
    }
}

/// How the blurred background color is folded into foreground edges by
/// light wrapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BlendMode {
    Screen,
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BilateralFilterConfig {
    pub sigma_space: f32,
    pub sigma_color: f32,
}

/// Cosmetic mask/composite tuning. May be replaced at any time; the active
/// pipeline picks up the new value on the next frame, never mid-frame.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PostProcessingConfig {
    pub smooth_mask: bool,
    pub bilateral_filter: BilateralFilterConfig,
    /// Contrast stretch on mask alpha: [low, high] confidence bounds.
    pub coverage: [f32; 2],
    /// Fraction of background color wrapped into foreground edges, 0..1.
    pub light_wrap: f32,
    pub blend_mode: BlendMode,
}

impl Default for PostProcessingConfig {
    fn default() -> Self {
        Self {
            smooth_mask: true,
            bilateral_filter: BilateralFilterConfig {
                sigma_space: 1.0,
                sigma_color: 0.1,
            },
            coverage: [0.5, 0.75],
            light_wrap: 0.3,
            blend_mode: BlendMode::Screen,
        }
    }
}

impl PostProcessingConfig {
    pub fn validate(&self) -> BackdropResult<()> {
        let [low, high] = self.coverage;
        if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low > high {
            return Err(BackdropError::configuration(
                "coverage must satisfy 0 <= low <= high <= 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.light_wrap) {
            return Err(BackdropError::configuration(
                "light_wrap must be within 0..=1",
            ));
        }
        if !self.bilateral_filter.sigma_space.is_finite()
            || self.bilateral_filter.sigma_space <= 0.0
        {
            return Err(BackdropError::configuration(
                "bilateral sigma_space must be finite and > 0",
            ));
        }
        if !self.bilateral_filter.sigma_color.is_finite()
            || self.bilateral_filter.sigma_color <= 0.0
        {
            return Err(BackdropError::configuration(
                "bilateral sigma_color must be finite and > 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        PostProcessingConfig::default().validate().unwrap();
    }

    #[test]
    fn validate_rejects_inverted_coverage() {
        let cfg = PostProcessingConfig {
            coverage: [0.9, 0.1],
            ..PostProcessingConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_light_wrap() {
        let cfg = PostProcessingConfig {
            light_wrap: 1.5,
            ..PostProcessingConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_json_roundtrip() {
        let cfg = SegmentationConfig::low_latency();
        let s = serde_json::to_string(&cfg).unwrap();
        let de: SegmentationConfig = serde_json::from_str(&s).unwrap();
        assert_eq!(de, cfg);

        let pp = PostProcessingConfig::default();
        let s = serde_json::to_string(&pp).unwrap();
        let de: PostProcessingConfig = serde_json::from_str(&s).unwrap();
        assert_eq!(de, pp);
    }

    #[test]
    fn input_resolutions_are_16_9ish() {
        for r in [
            InputResolution::R96,
            InputResolution::R144,
            InputResolution::R360,
        ] {
            let (w, h) = r.dims();
            assert!(w > h);
            assert!(w % 2 == 0 && h % 2 == 0);
        }
    }
}
