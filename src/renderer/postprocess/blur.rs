use bytemuck::{Pod, Zeroable};

use crate::error::Result;
use crate::renderer::buffer::DynamicUniforms;
use crate::renderer::pipeline_builder::{compute_pipeline, dispatch_size, pipeline_layout};
use crate::renderer::postprocess::MAX_BLUR_RADIUS;
use crate::renderer::shader::{ShaderKey, ShaderLibrary};
use crate::renderer::GraphicsContext;

const WORKGROUP: u32 = 8;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
struct BlurParams {
    axis: u32,
    radius: u32,
    size: [u32; 2],
    /// Tap weights 0..=radius, four per vector.
    weights: [[f32; 4]; 4],
}

/// One-sided Gaussian weights for offsets `0..=radius`, normalised so that
/// the full symmetric kernel sums to one.
pub fn gaussian_kernel(sigma: f32, radius: u32) -> Vec<f32> {
    let radius = radius.min(MAX_BLUR_RADIUS);
    let sigma = sigma.max(1e-3);
    let mut weights: Vec<f32> = (0..=radius)
        .map(|offset| {
            let o = offset as f32;
            (-(o * o) / (2.0 * sigma * sigma)).exp()
        })
        .collect();

    let total = weights[0] + 2.0 * weights[1..].iter().sum::<f32>();
    for weight in &mut weights {
        *weight /= total;
    }
    weights
}

fn pack_weights(kernel: &[f32]) -> [[f32; 4]; 4] {
    let mut packed = [[0.0; 4]; 4];
    for (index, weight) in kernel.iter().enumerate().take(16) {
        packed[index / 4][index % 4] = *weight;
    }
    packed
}

/// Separable Gaussian blur over 2D array textures, horizontal into a
/// temporary surface then vertical into the destination.
pub struct Blur {
    kernel: Vec<f32>,
    storage_format: wgpu::TextureFormat,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
    params: DynamicUniforms<BlurParams>,
}

impl Blur {
    /// `storage_format` is the format of the temporary and destination
    /// surfaces; the source may be any float format.
    pub fn new(
        ctx: &GraphicsContext,
        shaders: &mut ShaderLibrary,
        storage_format: wgpu::TextureFormat,
        sigma: f32,
        radius: u32,
    ) -> Result<Self> {
        let format_name = match storage_format {
            wgpu::TextureFormat::Rgba32Float => "rgba32float",
            _ => "rgba16float",
        };
        let shader = shaders.compute(
            &ctx.device,
            &ShaderKey::new("blur.wgsl").with_define("FORMAT", format_name),
        )?;

        let layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("BlurLayout"),
                entries: &[
                    DynamicUniforms::<BlurParams>::layout_entry(0, wgpu::ShaderStages::COMPUTE),
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Texture {
                            multisampled: false,
                            view_dimension: wgpu::TextureViewDimension::D2Array,
                            sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::StorageTexture {
                            access: wgpu::StorageTextureAccess::WriteOnly,
                            format: storage_format,
                            view_dimension: wgpu::TextureViewDimension::D2Array,
                        },
                        count: None,
                    },
                ],
            });
        let pipeline_layout = pipeline_layout(&ctx.device, "BlurPipelineLayout", &[&layout]);
        let pipeline = compute_pipeline(&ctx.device, "BlurPipeline", &pipeline_layout, &shader)?;

        Ok(Self {
            kernel: gaussian_kernel(sigma, radius),
            storage_format,
            layout,
            pipeline,
            params: DynamicUniforms::new(ctx, "BlurParams", 2),
        })
    }

    pub fn kernel(&self) -> &[f32] {
        &self.kernel
    }

    pub fn storage_format(&self) -> wgpu::TextureFormat {
        self.storage_format
    }

    /// Blur every layer of `source` into `dest` through `temp`. All three must
    /// share size and layer count. Records at most once per submission since
    /// the parameters live in one staging buffer.
    pub fn record(
        &mut self,
        ctx: &GraphicsContext,
        encoder: &mut wgpu::CommandEncoder,
        source: &wgpu::Texture,
        temp: &wgpu::Texture,
        dest: &wgpu::Texture,
    ) {
        let size = [dest.width(), dest.height()];
        let layers = dest.depth_or_array_layers();
        let radius = (self.kernel.len() - 1) as u32;
        let weights = pack_weights(&self.kernel);

        self.params.clear();
        let horizontal = self.params.push(BlurParams {
            axis: 0,
            radius,
            size,
            weights,
        });
        let vertical = self.params.push(BlurParams {
            axis: 1,
            radius,
            size,
            weights,
        });
        self.params.flush(ctx);

        let array_view = |texture: &wgpu::Texture| {
            texture.create_view(&wgpu::TextureViewDescriptor {
                label: Some("BlurArrayView"),
                dimension: Some(wgpu::TextureViewDimension::D2Array),
                array_layer_count: Some(layers),
                ..Default::default()
            })
        };
        let source_view = array_view(source);
        let temp_view = array_view(temp);
        let dest_view = array_view(dest);

        let passes = [
            (horizontal, &source_view, &temp_view, "BlurHorizontal"),
            (vertical, &temp_view, &dest_view, "BlurVertical"),
        ];
        for (offset, input, output, label) in passes {
            let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &self.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: self.params.binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(input),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(output),
                    },
                ],
            });

            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[offset]);
            pass.dispatch_workgroups(
                dispatch_size(size[0], WORKGROUP),
                dispatch_size(size[1], WORKGROUP),
                layers,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_is_normalised() {
        let kernel = gaussian_kernel(1.67, 4);
        assert_eq!(kernel.len(), 5);
        let total = kernel[0] + 2.0 * kernel[1..].iter().sum::<f32>();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn kernel_decreases_away_from_centre() {
        let kernel = gaussian_kernel(2.0, 6);
        assert!(kernel.windows(2).all(|pair| pair[0] > pair[1]));
    }

    #[test]
    fn zero_radius_is_identity() {
        assert_eq!(gaussian_kernel(1.0, 0), vec![1.0]);
    }

    #[test]
    fn radius_is_capped() {
        let kernel = gaussian_kernel(8.0, 100);
        assert_eq!(kernel.len() as u32, MAX_BLUR_RADIUS + 1);
        assert_eq!(pack_weights(&kernel)[3][3], kernel[15]);
    }

    #[test]
    fn params_size_matches_wgsl() {
        assert_eq!(std::mem::size_of::<BlurParams>(), 80);
    }
}
