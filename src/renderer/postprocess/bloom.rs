use bytemuck::{Pod, Zeroable};

use crate::error::Result;
use crate::renderer::buffer::StructuredBuffer;
use crate::renderer::pipeline_builder::{compute_pipeline, dispatch_size, pipeline_layout};
use crate::renderer::postprocess::blur::Blur;
use crate::renderer::shader::{ShaderKey, ShaderLibrary};
use crate::renderer::texture::{GpTextureCache, GpTextureKey, PooledGpTexture};
use crate::renderer::GraphicsContext;
use crate::settings::PostProcessSettings;

const GLOW_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
const BLOOM_BLUR_RADIUS: u32 = 5;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
struct BrightPassParams {
    threshold: f32,
    exposure: f32,
    size: [u32; 2],
}

/// Half resolution glow: bright pass then a separable blur.
pub struct Bloom {
    threshold: f32,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
    sampler: wgpu::Sampler,
    params: StructuredBuffer<BrightPassParams>,
    blur: Blur,
}

impl Bloom {
    pub fn new(
        ctx: &GraphicsContext,
        shaders: &mut ShaderLibrary,
        settings: &PostProcessSettings,
    ) -> Result<Self> {
        let shader = shaders.compute(&ctx.device, &ShaderKey::new("bright_pass.wgsl"))?;

        let layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("BrightPassLayout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Texture {
                            multisampled: false,
                            view_dimension: wgpu::TextureViewDimension::D2,
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 3,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::StorageTexture {
                            access: wgpu::StorageTextureAccess::WriteOnly,
                            format: GLOW_FORMAT,
                            view_dimension: wgpu::TextureViewDimension::D2,
                        },
                        count: None,
                    },
                ],
            });
        let pipeline_layout = pipeline_layout(&ctx.device, "BrightPassPipelineLayout", &[&layout]);
        let pipeline =
            compute_pipeline(&ctx.device, "BrightPassPipeline", &pipeline_layout, &shader)?;

        let sampler = ctx.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("BrightPassSampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        Ok(Self {
            threshold: settings.bloom_threshold,
            layout,
            pipeline,
            sampler,
            params: StructuredBuffer::constant(&ctx.device, "BrightPassParams"),
            blur: Blur::new(
                ctx,
                shaders,
                GLOW_FORMAT,
                settings.bloom_blur_sigma,
                BLOOM_BLUR_RADIUS,
            )?,
        })
    }

    /// Record the glow of `source` (`width` x `height`) exposed by `exposure`.
    /// The returned texture is half the source size.
    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &mut self,
        ctx: &GraphicsContext,
        encoder: &mut wgpu::CommandEncoder,
        textures: &GpTextureCache,
        source: &wgpu::TextureView,
        width: u32,
        height: u32,
        exposure: f32,
    ) -> Result<PooledGpTexture> {
        let key = GpTextureKey::d2((width / 2).max(1), (height / 2).max(1), GLOW_FORMAT);
        let glow = textures.pop(&key)?;
        let temp = textures.pop(&key)?;
        let blurred = textures.pop(&key)?;

        let threshold = self.threshold;
        self.params.write_with(&ctx.queue, |params| {
            params[0] = BrightPassParams {
                threshold,
                exposure,
                size: [key.width, key.height],
            }
        })?;

        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("BrightPassBindGroup"),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.params.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(source),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(glow.view()),
                },
            ],
        });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("BrightPass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(dispatch_size(key.width, 8), dispatch_size(key.height, 8), 1);
        }

        self.blur.record(
            ctx,
            encoder,
            glow.texture(),
            temp.texture(),
            blurred.texture(),
        );
        Ok(blurred)
    }
}
