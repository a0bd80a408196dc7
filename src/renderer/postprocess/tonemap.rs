use bytemuck::{Pod, Zeroable};

use crate::error::Result;
use crate::renderer::buffer::StructuredBuffer;
use crate::renderer::pipeline_builder::{compute_pipeline, dispatch_size, pipeline_layout};
use crate::renderer::shader::{ShaderKey, ShaderLibrary};
use crate::renderer::texture::RenderTarget;
use crate::renderer::GraphicsContext;
use crate::settings::PostProcessSettings;

pub const TONEMAP_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
struct TonemapParams {
    exposure: f32,
    vignette: f32,
    bloom_strength: f32,
    _pad: f32,
    size: [u32; 2],
    _pad1: [u32; 2],
}

/// Exposure key over average luminance, guarded against a black frame.
pub fn exposure(key_value: f32, average_luminance: f32) -> f32 {
    key_value / average_luminance.max(1e-4)
}

/// Reinhard tonemapping with bloom and vignette, HDR to display range.
pub struct Tonemap {
    vignette: f32,
    bloom_strength: f32,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
    sampler: wgpu::Sampler,
    params: StructuredBuffer<TonemapParams>,
}

impl Tonemap {
    pub fn new(
        ctx: &GraphicsContext,
        shaders: &mut ShaderLibrary,
        settings: &PostProcessSettings,
    ) -> Result<Self> {
        let shader = shaders.compute(&ctx.device, &ShaderKey::new("tonemap.wgsl"))?;

        let texture_entry = |binding: u32, filterable: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Texture {
                multisampled: false,
                view_dimension: wgpu::TextureViewDimension::D2,
                sample_type: wgpu::TextureSampleType::Float { filterable },
            },
            count: None,
        };
        let layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("TonemapLayout"),
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
                    texture_entry(1, false),
                    texture_entry(2, true),
                    wgpu::BindGroupLayoutEntry {
                        binding: 3,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 4,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::StorageTexture {
                            access: wgpu::StorageTextureAccess::WriteOnly,
                            format: TONEMAP_FORMAT,
                            view_dimension: wgpu::TextureViewDimension::D2,
                        },
                        count: None,
                    },
                ],
            });
        let pipeline_layout = pipeline_layout(&ctx.device, "TonemapPipelineLayout", &[&layout]);
        let pipeline = compute_pipeline(&ctx.device, "TonemapPipeline", &pipeline_layout, &shader)?;

        let sampler = ctx.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("TonemapBloomSampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        Ok(Self {
            vignette: settings.vignette,
            bloom_strength: settings.bloom_strength,
            layout,
            pipeline,
            sampler,
            params: StructuredBuffer::constant(&ctx.device, "TonemapParams"),
        })
    }

    /// Tonemap `source` plus `bloom` into colour 0 of `target`, which must be
    /// a [`TONEMAP_FORMAT`] surface of the source size.
    pub fn record(
        &mut self,
        ctx: &GraphicsContext,
        encoder: &mut wgpu::CommandEncoder,
        source: &wgpu::TextureView,
        bloom: &wgpu::TextureView,
        target: &RenderTarget,
        exposure: f32,
    ) -> Result<()> {
        let params = TonemapParams {
            exposure,
            vignette: self.vignette,
            bloom_strength: self.bloom_strength,
            _pad: 0.0,
            size: [target.width(), target.height()],
            _pad1: [0; 2],
        };
        self.params
            .write_with(&ctx.queue, |slice| slice[0] = params)?;

        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("TonemapBindGroup"),
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
                    resource: wgpu::BindingResource::TextureView(bloom),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::TextureView(target.color_view(0)),
                },
            ],
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Tonemap"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(
            dispatch_size(target.width(), 8),
            dispatch_size(target.height(), 8),
            1,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposure_scales_inversely_with_luminance() {
        assert!((exposure(0.4, 0.2) - 2.0).abs() < 1e-6);
        assert!(exposure(0.4, 0.0).is_finite());
    }

    #[test]
    fn params_size_matches_wgsl() {
        assert_eq!(std::mem::size_of::<TonemapParams>(), 32);
    }
}
