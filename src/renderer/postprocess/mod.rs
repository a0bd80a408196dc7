pub mod bloom;
pub mod blur;
pub mod luminance;
pub mod scale;
pub mod tonemap;

pub use bloom::Bloom;
pub use blur::{gaussian_kernel, Blur};
pub use luminance::{adapt_luminance, histogram_average, Luminance, HISTOGRAM_BINS};
pub use scale::Scaler;
pub use tonemap::{exposure, Tonemap, TONEMAP_FORMAT};

use crate::error::Result;
use crate::renderer::shader::ShaderLibrary;
use crate::renderer::texture::{
    GpTextureAllocator, GpTextureCache, PooledTarget, RenderTarget, RenderTargetAllocator,
    RenderTargetCache, RenderTargetKey,
};
use crate::renderer::GraphicsContext;
use crate::settings::PostProcessSettings;

/// Largest blur radius the blur parameter block can hold.
pub const MAX_BLUR_RADIUS: u32 = 15;

/// HDR image to display range: luminance, eye adaptation, bloom, tonemap.
pub struct PostProcess {
    settings: PostProcessSettings,
    scaler: Scaler,
    luminance: Luminance,
    bloom: Bloom,
    tonemap: Tonemap,
    targets: RenderTargetCache,
    textures: GpTextureCache,
    adapted_luminance: f32,
}

impl PostProcess {
    pub fn new(
        ctx: &GraphicsContext,
        shaders: &mut ShaderLibrary,
        settings: &PostProcessSettings,
    ) -> Result<Self> {
        log::info!("Creating post-process chain");
        Ok(Self {
            settings: settings.clone(),
            scaler: Scaler::new(ctx, shaders)?,
            luminance: Luminance::new(ctx, shaders, settings)?,
            bloom: Bloom::new(ctx, shaders, settings)?,
            tonemap: Tonemap::new(ctx, shaders, settings)?,
            targets: RenderTargetCache::new(RenderTargetAllocator::new(&ctx.device)),
            textures: GpTextureCache::new(GpTextureAllocator::new(&ctx.device)),
            adapted_luminance: settings.max_adaptation,
        })
    }

    /// Adapted luminance after the last [`PostProcess::execute`].
    pub fn adapted_luminance(&self) -> f32 {
        self.adapted_luminance
    }

    pub fn scaler_mut(&mut self) -> &mut Scaler {
        &mut self.scaler
    }

    /// Tonemap `hdr` (colour 0) into a pooled [`TONEMAP_FORMAT`] target.
    /// Blocks on the luminance read-back.
    pub fn execute(&mut self, ctx: &GraphicsContext, hdr: &RenderTarget, dt: f32) -> Result<PooledTarget> {
        let average = self
            .luminance
            .average_luminance(ctx, &mut self.scaler, &self.targets, hdr)?;
        self.adapted_luminance =
            adapt_luminance(self.adapted_luminance, average, dt, &self.settings);
        let exposure = exposure(self.settings.key_value, self.adapted_luminance);
        log::trace!(
            "Average luminance {:.4}, adapted {:.4}",
            average,
            self.adapted_luminance
        );

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("PostProcessEncoder"),
            });

        let bloom = self.bloom.process(
            ctx,
            &mut encoder,
            &self.textures,
            hdr.color_view(0),
            hdr.width(),
            hdr.height(),
            exposure,
        )?;

        let output = self.targets.pop(&RenderTargetKey::new(
            hdr.width(),
            hdr.height(),
            &[TONEMAP_FORMAT],
            false,
        ))?;
        self.tonemap.record(
            ctx,
            &mut encoder,
            hdr.color_view(0),
            bloom.view(),
            &output,
            exposure,
        )?;

        ctx.queue.submit(Some(encoder.finish()));
        Ok(output)
    }

    /// Scale `image` (colour 0) onto a presentation surface.
    pub fn present(
        &mut self,
        ctx: &GraphicsContext,
        image: &RenderTarget,
        surface: &wgpu::TextureView,
        surface_format: wgpu::TextureFormat,
    ) -> Result<()> {
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("PresentEncoder"),
            });
        self.scaler
            .blit(ctx, &mut encoder, image.color_view(0), surface, surface_format)?;
        ctx.queue.submit(Some(encoder.finish()));
        Ok(())
    }
}
