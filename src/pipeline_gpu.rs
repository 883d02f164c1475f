use crate::{
    config::{BackgroundTreatment, BlendMode, PostProcessingConfig, SegmentationConfig},
    error::{BackdropError, BackdropResult},
    frame::{FrameRgba, FrameSink, FrameSource},
    inference::InferencePrimitive,
    pipeline::{RenderPipeline, SegmentationStage, prescale_background, smoothing_radius},
    timing::FrameClock,
};

const BACKGROUND_BLUR_RADIUS: f32 = 8.0;

// Each pass gets its own module; they share the fullscreen-triangle
// vertex stage and the Params uniform layout textually.
macro_rules! pass_prelude {
    () => {
        r#"
struct VsOut {
  @builtin(position) pos: vec4<f32>,
  @location(0) uv: vec2<f32>,
};

@vertex
fn vs(@builtin(vertex_index) vi: u32) -> VsOut {
  var p = array<vec2<f32>, 3>(
    vec2<f32>(-1.0, -1.0),
    vec2<f32>( 3.0, -1.0),
    vec2<f32>(-1.0,  3.0),
  );
  let pos = p[vi];
  var o: VsOut;
  o.pos = vec4<f32>(pos, 0.0, 1.0);
  o.uv = vec2<f32>((pos.x + 1.0) * 0.5, 1.0 - (pos.y + 1.0) * 0.5);
  return o;
}

struct Params {
  mode: u32,
  blend_mode: u32,
  radius: f32,
  sigma_space: f32,
  sigma_color: f32,
  coverage_low: f32,
  coverage_high: f32,
  light_wrap: f32,
};
"#
    };
}

const MASK_SHADER: &str = concat!(
    pass_prelude!(),
    r#"
@group(0) @binding(0) var t_mask: texture_2d<f32>;
@group(0) @binding(1) var t_frame: texture_2d<f32>;
@group(0) @binding(2) var s_linear: sampler;
@group(0) @binding(3) var<uniform> params: Params;

fn shaped(a: f32) -> f32 {
  // Full-range coverage disables the stretch, matching the raster path.
  if (params.coverage_low <= 0.0 && params.coverage_high >= 1.0) {
    return a;
  }
  return smoothstep(params.coverage_low, params.coverage_high, a);
}

// Joint bilateral upsample of the segmentation mask, guided by the full
// resolution frame, with the coverage stretch applied per tap.
@fragment
fn fs_mask(in: VsOut) -> @location(0) vec4<f32> {
  let r = i32(params.radius);
  if (r <= 0) {
    let a = shaped(textureSampleLevel(t_mask, s_linear, in.uv, 0.0).r);
    return vec4<f32>(a, 0.0, 0.0, 1.0);
  }

  let texel = vec2<f32>(1.0, 1.0) / vec2<f32>(textureDimensions(t_frame));
  let center = textureSampleLevel(t_frame, s_linear, in.uv, 0.0).rgb;
  let sigma_px = max(params.sigma_space * params.radius, 0.5);
  let space_denom = 2.0 * sigma_px * sigma_px;
  let color_denom = 2.0 * params.sigma_color * params.sigma_color;

  var acc = 0.0;
  var wsum = 0.0;
  for (var dy = -r; dy <= r; dy = dy + 1) {
    for (var dx = -r; dx <= r; dx = dx + 1) {
      let off = vec2<f32>(f32(dx), f32(dy));
      let uv = in.uv + off * texel;
      let dist2 = f32(dx * dx + dy * dy);
      let dc = textureSampleLevel(t_frame, s_linear, uv, 0.0).rgb - center;
      let w = exp(-dist2 / space_denom) * exp(-dot(dc, dc) / color_denom);
      acc = acc + w * shaped(textureSampleLevel(t_mask, s_linear, uv, 0.0).r);
      wsum = wsum + w;
    }
  }
  return vec4<f32>(acc / max(wsum, 1e-6), 0.0, 0.0, 1.0);
}
"#
);

const BLUR_SHADER: &str = concat!(
    pass_prelude!(),
    r#"
struct BlurParams {
  dir: vec2<f32>,
  radius: f32,
  sigma: f32,
};

@group(0) @binding(0) var t_blur_src: texture_2d<f32>;
@group(0) @binding(1) var s_blur: sampler;
@group(0) @binding(2) var<uniform> blur_params: BlurParams;

@fragment
fn fs_blur(in: VsOut) -> @location(0) vec4<f32> {
  let texel = vec2<f32>(1.0, 1.0) / vec2<f32>(textureDimensions(t_blur_src));
  let r = i32(blur_params.radius);
  let denom = 2.0 * blur_params.sigma * blur_params.sigma;
  var acc = vec4<f32>(0.0);
  var wsum = 0.0;
  for (var i = -r; i <= r; i = i + 1) {
    let w = exp(-f32(i * i) / denom);
    acc = acc + w * textureSampleLevel(t_blur_src, s_blur, in.uv + f32(i) * blur_params.dir * texel, 0.0);
    wsum = wsum + w;
  }
  return acc / wsum;
}
"#
);

const BLEND_SHADER: &str = concat!(
    pass_prelude!(),
    r#"
@group(0) @binding(0) var t_src: texture_2d<f32>;
@group(0) @binding(1) var t_mask_full: texture_2d<f32>;
@group(0) @binding(2) var t_bg: texture_2d<f32>;
@group(0) @binding(3) var s_blend: sampler;
@group(0) @binding(4) var<uniform> params: Params;

// modes: 0 = none, 1 = blur, 2 = static image, 3 = color substitution
@fragment
fn fs_blend(in: VsOut) -> @location(0) vec4<f32> {
  let src = textureSampleLevel(t_src, s_blend, in.uv, 0.0);
  if (params.mode == 0u) {
    return src;
  }

  let a = textureSampleLevel(t_mask_full, s_blend, in.uv, 0.0).r;
  var fg = src * a;

  if (params.mode == 3u) {
    if (fg.r == 0.0 && fg.g == 0.0 && fg.b == 0.0 && fg.a == 0.0) {
      return vec4<f32>(0.0, 1.0, 0.0, 1.0);
    }
    return fg;
  }

  let bg = textureSampleLevel(t_bg, s_blend, in.uv, 0.0);
  if (params.light_wrap > 0.0 && a > 0.0 && a < 1.0) {
    let wrap = params.light_wrap * (1.0 - a);
    var wrapped: vec3<f32>;
    if (params.blend_mode == 0u) {
      wrapped = 1.0 - (1.0 - fg.rgb) * (1.0 - bg.rgb);
    } else {
      wrapped = min(fg.rgb + bg.rgb, vec3<f32>(1.0));
    }
    fg = vec4<f32>(mix(fg.rgb, wrapped, wrap), fg.a);
  }

  return fg + bg * (1.0 - fg.a);
}
"#
);

/// An acquired wgpu device/queue pair. Acquisition is the selector's GPU
/// availability probe: it either fully succeeds or the session falls back
/// to the CPU-raster pipeline.
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl GpuContext {
    pub fn acquire() -> BackdropResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| match e {
            wgpu::RequestAdapterError::NotFound { .. } => {
                BackdropError::render("no gpu adapter available")
            }
            other => BackdropError::render(format!("wgpu request_adapter failed: {other:?}")),
        })?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: None,
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| BackdropError::render(format!("wgpu request_device failed: {e:?}")))?;

        Ok(Self { device, queue })
    }
}

struct GpuResources {
    device: wgpu::Device,
    queue: wgpu::Queue,

    source_tex: wgpu::Texture,
    mask_tex: wgpu::Texture,
    out_tex: wgpu::Texture,

    mask_pipeline: wgpu::RenderPipeline,
    blur_pipeline: wgpu::RenderPipeline,
    blend_pipeline: wgpu::RenderPipeline,

    mask_bind: wgpu::BindGroup,
    blur_h_bind: wgpu::BindGroup,
    blur_v_bind: wgpu::BindGroup,
    blend_bind: wgpu::BindGroup,

    smoothed_view: wgpu::TextureView,
    blur_tmp_view: wgpu::TextureView,
    bg_view: wgpu::TextureView,

    params_buf: wgpu::Buffer,
    _blur_h_buf: wgpu::Buffer,
    _blur_v_buf: wgpu::Buffer,
    readback: wgpu::Buffer,
    bytes_per_row: u32,
}

/// GPU-accelerated pipeline: the mask is smoothed by a joint bilateral
/// pass guided by the frame, the background blur runs as two separable
/// passes, and a final blend pass composites foreground, background,
/// light wrap and color substitution in one shader. The finished frame is
/// read back into the shared `FrameRgba` currency for the sink.
pub struct GpuPipeline {
    source: Box<dyn FrameSource>,
    sink: Box<dyn FrameSink>,
    treatment: BackgroundTreatment,
    post: PostProcessingConfig,
    stage: SegmentationStage,

    width: u32,
    height: u32,
    canvas: FrameRgba,
    res: Option<GpuResources>,
}

impl GpuPipeline {
    pub fn new(
        ctx: GpuContext,
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

        let GpuContext { device, queue } = ctx;
        let stage = SegmentationStage::new(segmentation, primitive);
        let (seg_w, seg_h) = stage.dims();

        let color_tex = |label: &str, w: u32, h: u32, usage: wgpu::TextureUsages| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size: wgpu::Extent3d {
                    width: w,
                    height: h,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage,
                view_formats: &[],
            })
        };
        let plane_tex = |label: &str, w: u32, h: u32, usage: wgpu::TextureUsages| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size: wgpu::Extent3d {
                    width: w,
                    height: h,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::R8Unorm,
                usage,
                view_formats: &[],
            })
        };

        let source_tex = color_tex(
            "backdrop_source",
            width,
            height,
            wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::TEXTURE_BINDING,
        );
        let bg_tex = color_tex(
            "backdrop_background",
            width,
            height,
            wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::RENDER_ATTACHMENT,
        );
        let blur_tmp_tex = color_tex(
            "backdrop_blur_tmp",
            width,
            height,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::RENDER_ATTACHMENT,
        );
        let out_tex = color_tex(
            "backdrop_out",
            width,
            height,
            wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::RENDER_ATTACHMENT,
        );
        let mask_tex = plane_tex(
            "backdrop_mask",
            seg_w,
            seg_h,
            wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::TEXTURE_BINDING,
        );
        let smoothed_tex = plane_tex(
            "backdrop_mask_smoothed",
            width,
            height,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::RENDER_ATTACHMENT,
        );

        let source_view = source_tex.create_view(&wgpu::TextureViewDescriptor::default());
        let mask_view = mask_tex.create_view(&wgpu::TextureViewDescriptor::default());
        let smoothed_view = smoothed_tex.create_view(&wgpu::TextureViewDescriptor::default());
        let bg_view = bg_tex.create_view(&wgpu::TextureViewDescriptor::default());
        let blur_tmp_view = blur_tmp_tex.create_view(&wgpu::TextureViewDescriptor::default());

        // The static background is prescaled on the CPU once and uploaded;
        // the blur treatment rewrites bg_tex every frame instead.
        if let BackgroundTreatment::StaticImage(image) = &treatment {
            let scaled = prescale_background(image, width, height)?;
            queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &bg_tex,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &scaled.data,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(width * 4),
                    rows_per_image: Some(height),
                },
                wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
            );
        }

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("backdrop_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let params_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("backdrop_params"),
            size: 32,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let blur_h_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("backdrop_blur_h"),
            size: 16,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let blur_v_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("backdrop_blur_v"),
            size: 16,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let blur_sigma = BACKGROUND_BLUR_RADIUS / 2.0;
        queue.write_buffer(
            &blur_h_buf,
            0,
            &blur_params_bytes([1.0, 0.0], BACKGROUND_BLUR_RADIUS, blur_sigma),
        );
        queue.write_buffer(
            &blur_v_buf,
            0,
            &blur_params_bytes([0.0, 1.0], BACKGROUND_BLUR_RADIUS, blur_sigma),
        );

        let mask_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("backdrop_mask_shader"),
            source: wgpu::ShaderSource::Wgsl(MASK_SHADER.into()),
        });
        let blur_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("backdrop_blur_shader"),
            source: wgpu::ShaderSource::Wgsl(BLUR_SHADER.into()),
        });
        let blend_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("backdrop_blend_shader"),
            source: wgpu::ShaderSource::Wgsl(BLEND_SHADER.into()),
        });

        let texture_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                multisampled: false,
                view_dimension: wgpu::TextureViewDimension::D2,
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
            },
            count: None,
        };
        let sampler_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        };
        let uniform_entry = |binding: u32, size: u64| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: std::num::NonZeroU64::new(size),
            },
            count: None,
        };

        let mask_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("backdrop_mask_bgl"),
            entries: &[
                texture_entry(0),
                texture_entry(1),
                sampler_entry(2),
                uniform_entry(3, 32),
            ],
        });
        let blur_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("backdrop_blur_bgl"),
            entries: &[texture_entry(0), sampler_entry(1), uniform_entry(2, 16)],
        });
        let blend_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("backdrop_blend_bgl"),
            entries: &[
                texture_entry(0),
                texture_entry(1),
                texture_entry(2),
                sampler_entry(3),
                uniform_entry(4, 32),
            ],
        });

        let make_pipeline = |label: &str,
                             bgl: &wgpu::BindGroupLayout,
                             module: &wgpu::ShaderModule,
                             entry: &str,
                             format: wgpu::TextureFormat| {
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[bgl],
                push_constant_ranges: &[],
            });
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module,
                    entry_point: Some("vs"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &[],
                },
                fragment: Some(wgpu::FragmentState {
                    module,
                    entry_point: Some(entry),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        };

        let mask_pipeline = make_pipeline(
            "backdrop_mask_pipeline",
            &mask_bgl,
            &mask_shader,
            "fs_mask",
            wgpu::TextureFormat::R8Unorm,
        );
        let blur_pipeline = make_pipeline(
            "backdrop_blur_pipeline",
            &blur_bgl,
            &blur_shader,
            "fs_blur",
            wgpu::TextureFormat::Rgba8Unorm,
        );
        let blend_pipeline = make_pipeline(
            "backdrop_blend_pipeline",
            &blend_bgl,
            &blend_shader,
            "fs_blend",
            wgpu::TextureFormat::Rgba8Unorm,
        );

        let mask_bind = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("backdrop_mask_bind"),
            layout: &mask_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&mask_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&source_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: params_buf.as_entire_binding(),
                },
            ],
        });
        let blur_bind = |src: &wgpu::TextureView, buf: &wgpu::Buffer| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("backdrop_blur_bind"),
                layout: &blur_bgl,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(src),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&sampler),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: buf.as_entire_binding(),
                    },
                ],
            })
        };
        let blur_h_bind = blur_bind(&source_view, &blur_h_buf);
        let blur_v_bind = blur_bind(&blur_tmp_view, &blur_v_buf);

        let blend_bind = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("backdrop_blend_bind"),
            layout: &blend_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&source_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&smoothed_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&bg_view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: params_buf.as_entire_binding(),
                },
            ],
        });

        let bytes_per_row_unpadded = width
            .checked_mul(4)
            .ok_or_else(|| BackdropError::render("render target width overflow"))?;
        let bytes_per_row = align_to(bytes_per_row_unpadded, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let buffer_size = (bytes_per_row as u64)
            .checked_mul(height as u64)
            .ok_or_else(|| BackdropError::render("readback buffer size overflow"))?;
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("backdrop_readback"),
            size: buffer_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Ok(Self {
            source,
            sink,
            treatment,
            post,
            stage,
            width,
            height,
            canvas: FrameRgba::new(width, height),
            res: Some(GpuResources {
                device,
                queue,
                source_tex,
                mask_tex,
                out_tex,
                mask_pipeline,
                blur_pipeline,
                blend_pipeline,
                mask_bind,
                blur_h_bind,
                blur_v_bind,
                blend_bind,
                smoothed_view,
                blur_tmp_view,
                bg_view,
                params_buf,
                _blur_h_buf: blur_h_buf,
                _blur_v_buf: blur_v_buf,
                readback,
                bytes_per_row,
            }),
        })
    }

    fn params_bytes(&self) -> [u8; 32] {
        let mode: u32 = match self.treatment {
            BackgroundTreatment::None => 0,
            BackgroundTreatment::Blur => 1,
            BackgroundTreatment::StaticImage(_) => 2,
            BackgroundTreatment::ColorSubstitution => 3,
        };
        let blend_mode: u32 = match self.post.blend_mode {
            BlendMode::Screen => 0,
            BlendMode::Linear => 1,
        };
        let radius = smoothing_radius(&self.treatment, &self.post) as f32;

        let mut out = [0u8; 32];
        out[0..4].copy_from_slice(&mode.to_le_bytes());
        out[4..8].copy_from_slice(&blend_mode.to_le_bytes());
        out[8..12].copy_from_slice(&radius.to_le_bytes());
        out[12..16].copy_from_slice(&self.post.bilateral_filter.sigma_space.to_le_bytes());
        out[16..20].copy_from_slice(&self.post.bilateral_filter.sigma_color.to_le_bytes());
        out[20..24].copy_from_slice(&self.post.coverage[0].to_le_bytes());
        out[24..28].copy_from_slice(&self.post.coverage[1].to_le_bytes());
        out[28..32].copy_from_slice(&self.post.light_wrap.to_le_bytes());
        out
    }
}

impl RenderPipeline for GpuPipeline {
    fn render(&mut self, clock: &mut FrameClock) -> BackdropResult<()> {
        let Some(res) = &self.res else {
            return Ok(());
        };
        let Some(frame) = self.source.current_frame() else {
            tracing::debug!("no source frame available, skipping tick");
            return Ok(());
        };

        if self.treatment.is_none() {
            clock.mark();
            clock.mark();
            return self.sink.write_frame(frame);
        }

        self.stage.downsample(frame)?;
        clock.mark();
        self.stage.infer_and_decode()?;
        clock.mark();

        let (seg_w, seg_h) = self.stage.dims();
        res.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &res.source_tex,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &frame.data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(self.width * 4),
                rows_per_image: Some(self.height),
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        res.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &res.mask_tex,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            self.stage.alpha_seg(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(seg_w),
                rows_per_image: Some(seg_h),
            },
            wgpu::Extent3d {
                width: seg_w,
                height: seg_h,
                depth_or_array_layers: 1,
            },
        );
        res.queue
            .write_buffer(&res.params_buf, 0, &self.params_bytes());

        let mut encoder = res
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("backdrop_frame_encoder"),
            });

        let full_pass = |encoder: &mut wgpu::CommandEncoder,
                         target: &wgpu::TextureView,
                         pipeline: &wgpu::RenderPipeline,
                         bind: &wgpu::BindGroup| {
            let mut rp = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("backdrop_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            rp.set_pipeline(pipeline);
            rp.set_bind_group(0, bind, &[]);
            rp.draw(0..3, 0..1);
        };

        full_pass(
            &mut encoder,
            &res.smoothed_view,
            &res.mask_pipeline,
            &res.mask_bind,
        );
        if matches!(self.treatment, BackgroundTreatment::Blur) {
            full_pass(
                &mut encoder,
                &res.blur_tmp_view,
                &res.blur_pipeline,
                &res.blur_h_bind,
            );
            full_pass(
                &mut encoder,
                &res.bg_view,
                &res.blur_pipeline,
                &res.blur_v_bind,
            );
        }
        let out_view = res.out_tex.create_view(&wgpu::TextureViewDescriptor::default());
        full_pass(&mut encoder, &out_view, &res.blend_pipeline, &res.blend_bind);

        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &res.out_tex,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &res.readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(res.bytes_per_row),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        res.queue.submit(Some(encoder.finish()));

        let buffer_slice = res.readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        res.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| BackdropError::render(format!("wgpu poll failed: {e:?}")))?;
        rx.recv()
            .map_err(|_| BackdropError::render("readback channel closed"))?
            .map_err(|e| BackdropError::render(format!("readback map failed: {e:?}")))?;

        {
            let mapped = buffer_slice.get_mapped_range();
            let row_bytes = (self.width as usize) * 4;
            let padded = res.bytes_per_row as usize;
            for row in 0..self.height as usize {
                let src = &mapped[row * padded..row * padded + row_bytes];
                self.canvas.data[row * row_bytes..(row + 1) * row_bytes].copy_from_slice(src);
            }
        }
        res.readback.unmap();

        self.sink.write_frame(&self.canvas)
    }

    fn update_post_processing_config(&mut self, cfg: PostProcessingConfig) {
        self.post = cfg;
    }

    fn clean_up(&mut self) {
        // Dropping the resource bundle releases all textures, buffers and
        // the device reference; any tick after this is a no-op.
        self.res = None;
    }
}

fn blur_params_bytes(dir: [f32; 2], radius: f32, sigma: f32) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&dir[0].to_le_bytes());
    out[4..8].copy_from_slice(&dir[1].to_le_bytes());
    out[8..12].copy_from_slice(&radius.to_le_bytes());
    out[12..16].copy_from_slice(&sigma.to_le_bytes());
    out
}

fn align_to(value: u32, alignment: u32) -> u32 {
    let mask = alignment - 1;
    (value + mask) & !mask
}
