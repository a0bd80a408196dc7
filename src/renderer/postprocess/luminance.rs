use bytemuck::{Pod, Zeroable};

use crate::error::Result;
use crate::renderer::buffer::{ScratchArray, StructuredBuffer};
use crate::renderer::pipeline_builder::{compute_pipeline, dispatch_size, pipeline_layout};
use crate::renderer::postprocess::scale::Scaler;
use crate::renderer::shader::{ShaderKey, ShaderLibrary};
use crate::renderer::texture::{PooledTarget, RenderTarget, RenderTargetCache, RenderTargetKey};
use crate::renderer::GraphicsContext;
use crate::settings::PostProcessSettings;

pub const HISTOGRAM_BINS: usize = 64;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
struct LuminanceParams {
    log_min: f32,
    log_max: f32,
    size: [u32; 2],
}

/// Average of the luminances found at the `low` and `high` sample quantiles
/// of a log2 luminance histogram spanning `[min_luminance, max_luminance]`.
pub fn histogram_average(
    bins: &[u32],
    sample_count: u32,
    low: f32,
    high: f32,
    min_luminance: f32,
    max_luminance: f32,
) -> f32 {
    let log_min = min_luminance.log2();
    let log_max = max_luminance.log2();
    let bin_count = bins.len().max(1) as f32;

    let quantile_bin = |fraction: f32| {
        let mut remaining = (sample_count as f32 * fraction) as i64;
        let mut index = 0;
        while remaining > 0 && index < bins.len() {
            remaining -= i64::from(bins[index]);
            index += 1;
        }
        index.saturating_sub(1)
    };
    let luminance_of =
        |index: usize| (index as f32 / bin_count * (log_max - log_min) + log_min).exp2();

    (luminance_of(quantile_bin(low)) + luminance_of(quantile_bin(high))) * 0.5
}

/// Eye adaptation: move from `last` towards the clamped `current` luminance.
pub fn adapt_luminance(last: f32, current: f32, dt: f32, settings: &PostProcessSettings) -> f32 {
    let target = current.clamp(settings.min_adaptation, settings.max_adaptation);
    last + (target - last) * (1.0 - (-dt * settings.adaptation_rate).exp())
}

/// Sizes visited by the luminance downscale chain.
pub fn downscale_chain(width: u32, height: u32, steps: u32) -> Vec<(u32, u32)> {
    let mut size = (width, height);
    (0..steps)
        .map(|_| {
            size = ((size.0 >> 1).max(2), (size.1 >> 1).max(2));
            size
        })
        .collect()
}

/// Average scene luminance from a histogram of a downscaled copy.
pub struct Luminance {
    settings: PostProcessSettings,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
    params: StructuredBuffer<LuminanceParams>,
    histogram: ScratchArray<u32>,
}

impl Luminance {
    pub fn new(
        ctx: &GraphicsContext,
        shaders: &mut ShaderLibrary,
        settings: &PostProcessSettings,
    ) -> Result<Self> {
        let shader = shaders.compute(&ctx.device, &ShaderKey::new("luminance.wgsl"))?;

        let layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("LuminanceLayout"),
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
                            sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Storage { read_only: false },
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                ],
            });
        let pipeline_layout = pipeline_layout(&ctx.device, "LuminancePipelineLayout", &[&layout]);
        let pipeline =
            compute_pipeline(&ctx.device, "LuminancePipeline", &pipeline_layout, &shader)?;

        Ok(Self {
            settings: settings.clone(),
            layout,
            pipeline,
            params: StructuredBuffer::constant(&ctx.device, "LuminanceParams"),
            histogram: ScratchArray::new(&ctx.device, "LuminanceHistogram", HISTOGRAM_BINS),
        })
    }

    /// Histogram of the last computation.
    pub fn histogram(&self) -> &[u32] {
        self.histogram.as_slice()
    }

    /// Downscale, build the histogram and read it back. Submits and waits.
    pub fn average_luminance(
        &mut self,
        ctx: &GraphicsContext,
        scaler: &mut Scaler,
        targets: &RenderTargetCache,
        source: &RenderTarget,
    ) -> Result<f32> {
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("LuminanceEncoder"),
            });

        let format = source.key().formats[0];
        let mut downscaled: Option<PooledTarget> = None;
        for (width, height) in downscale_chain(
            source.width(),
            source.height(),
            self.settings.luminance_downscale,
        ) {
            let target = targets.pop(&RenderTargetKey::new(width, height, &[format], false))?;
            let input = downscaled
                .as_ref()
                .map_or(source.color_view(0), |previous| previous.color_view(0));
            scaler.blit(ctx, &mut encoder, input, target.color_view(0), format)?;
            downscaled = Some(target);
        }

        let surface = downscaled.as_deref().unwrap_or(source);
        let (width, height) = (surface.width(), surface.height());

        let log_min = self.settings.min_luminance.log2();
        let log_max = self.settings.max_luminance.log2();
        self.params.write_with(&ctx.queue, |params| {
            params[0] = LuminanceParams {
                log_min,
                log_max,
                size: [width, height],
            }
        })?;

        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("LuminanceBindGroup"),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.params.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(surface.color_view(0)),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.histogram.binding(),
                },
            ],
        });

        self.histogram.clear(&mut encoder);
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("LuminanceHistogram"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(dispatch_size(width, 8), dispatch_size(height, 8), 1);
        }

        self.histogram.refresh(ctx, encoder)?;

        Ok(histogram_average(
            self.histogram.as_slice(),
            width * height,
            self.settings.low_percentage,
            self.settings.high_percentage,
            self.settings.min_luminance,
            self.settings.max_luminance,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_histogram_bottom_bin_gives_minimum() {
        let mut bins = vec![0u32; HISTOGRAM_BINS];
        bins[0] = 100;
        let average = histogram_average(&bins, 100, 0.85, 0.95, 0.0156, 64.0);
        assert!((average - 0.0156).abs() < 1e-5);
    }

    #[test]
    fn quantiles_pick_their_bins() {
        let mut bins = vec![0u32; HISTOGRAM_BINS];
        bins[10] = 50;
        bins[20] = 50;
        let (min, max) = (1.0f32 / 64.0, 64.0f32);
        let range = max.log2() - min.log2();
        let expected_low = (10.0 / 64.0 * range + min.log2()).exp2();
        let expected_high = (20.0 / 64.0 * range + min.log2()).exp2();

        let average = histogram_average(&bins, 100, 0.25, 0.75, min, max);
        assert!((average - (expected_low + expected_high) * 0.5).abs() < 1e-4);
    }

    #[test]
    fn empty_histogram_does_not_underflow() {
        let bins = vec![0u32; HISTOGRAM_BINS];
        let average = histogram_average(&bins, 0, 0.85, 0.95, 0.5, 8.0);
        assert!((average - 0.5).abs() < 1e-6);
    }

    #[test]
    fn adaptation_converges_to_clamped_target() {
        let settings = PostProcessSettings::default();
        let mut luminance = 0.5;
        for _ in 0..200 {
            luminance = adapt_luminance(luminance, 10.0, 0.1, &settings);
        }
        assert!((luminance - settings.max_adaptation).abs() < 1e-3);
    }

    #[test]
    fn zero_time_step_keeps_last_value() {
        let settings = PostProcessSettings::default();
        assert_eq!(adapt_luminance(0.3, 0.9, 0.0, &settings), 0.3);
    }

    #[test]
    fn downscale_halves_and_stops_at_two() {
        assert_eq!(downscale_chain(16, 6, 3), vec![(8, 3), (4, 2), (2, 2)]);
        assert!(downscale_chain(16, 16, 0).is_empty());
    }
}
