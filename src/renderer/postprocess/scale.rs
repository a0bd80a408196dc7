use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::renderer::pipeline_builder::{pipeline_layout, PipelineBuilder};
use crate::renderer::shader::{CompiledShader, ShaderKey, ShaderLibrary};
use crate::renderer::GraphicsContext;

/// Bilinear blit of a colour texture onto a target of any size, used for
/// downscaling, upscaling and presenting.
pub struct Scaler {
    shader: Arc<CompiledShader>,
    layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    sampler: wgpu::Sampler,
    pipelines: HashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,
}

impl Scaler {
    pub fn new(ctx: &GraphicsContext, shaders: &mut ShaderLibrary) -> Result<Self> {
        let shader = shaders.graphics(&ctx.device, &ShaderKey::new("scale.wgsl"))?;

        let layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("ScaleLayout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            multisampled: false,
                            view_dimension: wgpu::TextureViewDimension::D2,
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                ],
            });
        let pipeline_layout = pipeline_layout(&ctx.device, "ScalePipelineLayout", &[&layout]);

        let sampler = ctx.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("ScaleSampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        Ok(Self {
            shader,
            layout,
            pipeline_layout,
            sampler,
            pipelines: HashMap::new(),
        })
    }

    fn pipeline(
        &mut self,
        device: &wgpu::Device,
        format: wgpu::TextureFormat,
    ) -> Result<&wgpu::RenderPipeline> {
        if !self.pipelines.contains_key(&format) {
            let pipeline = PipelineBuilder::new(device, &self.pipeline_layout, &self.shader)
                .with_label("ScalePipeline")
                .with_color_target(format, None)
                .with_no_culling()
                .build()?;
            log::debug!("Created scale pipeline for {:?}", format);
            self.pipelines.insert(format, pipeline);
        }
        match self.pipelines.get(&format) {
            Some(pipeline) => Ok(pipeline),
            None => unreachable!("pipeline inserted above"),
        }
    }

    /// Resample `source` over the whole of `target`.
    pub fn blit(
        &mut self,
        ctx: &GraphicsContext,
        encoder: &mut wgpu::CommandEncoder,
        source: &wgpu::TextureView,
        target: &wgpu::TextureView,
        target_format: wgpu::TextureFormat,
    ) -> Result<()> {
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("ScaleBindGroup"),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(source),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });
        let pipeline = self.pipeline(&ctx.device, target_format)?;

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("ScalePass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
                resolve_target: None,
                depth_slice: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.draw(0..3, 0..1);
        Ok(())
    }
}
