use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};

use crate::error::Result;
use crate::renderer::draw::{collect_draws, record_draws, PassUniforms};
use crate::renderer::lights::{PackedDirectionalLight, PackedPointLight, ShadowRaw};
use crate::renderer::material::MaterialTemplate;
use crate::renderer::pipeline_builder::{pipeline_layout, PipelineBuilder};
use crate::renderer::postprocess::Blur;
use crate::renderer::shader::{ShaderKey, ShaderLibrary};
use crate::renderer::texture::{
    GpTexture, GpTextureCache, GpTextureKey, PooledTarget, RenderTarget, RenderTargetCache,
    RenderTargetKey, DEPTH_FORMAT,
};
use crate::renderer::{GraphicsContext, Vertex};
use crate::scene::{Aabb, Frustum, Scene, VolumeHierarchy};
use crate::settings::ShadowSettings;

/// Point light slots per atlas page (a 2x2 grid).
pub const POINT_SLOTS_PER_PAGE: u32 = 4;

/// Colour layout of a per-light shadow target: moments, flux, normal and
/// position relative to the light origin.
pub const RSM_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;

const MOMENTS_CLEAR: wgpu::Color = wgpu::Color {
    r: 1.0,
    g: 1.0,
    b: 0.0,
    a: 0.0,
};

/// Sub-rectangle of one atlas page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AtlasRegion {
    pub page: u32,
    pub min_uv: Vec2,
    pub size_uv: Vec2,
}

impl AtlasRegion {
    pub fn max_uv(&self) -> Vec2 {
        self.min_uv + self.size_uv
    }

    /// Texel origin and size inside a page of `map_size` texels.
    pub fn texels(&self, map_size: u32) -> ([u32; 2], [u32; 2]) {
        let size = map_size as f32;
        (
            [
                (self.min_uv.x * size) as u32,
                (self.min_uv.y * size) as u32,
            ],
            [
                (self.size_uv.x * size) as u32,
                (self.size_uv.y * size) as u32,
            ],
        )
    }

    pub fn overlaps(&self, other: &AtlasRegion) -> bool {
        if self.page != other.page {
            return false;
        }
        let (a_min, a_max) = (self.min_uv, self.max_uv());
        let (b_min, b_max) = (other.min_uv, other.max_uv());
        a_min.x < b_max.x && b_min.x < a_max.x && a_min.y < b_max.y && b_min.y < a_max.y
    }
}

/// Bump allocator over atlas slots, reset every frame.
///
/// Point lights take one quarter page each; directional lights take a whole
/// page aligned to the next free page. Exhaustion returns `None` and leaves
/// the counter untouched.
#[derive(Debug, Clone)]
pub struct AtlasAllocator {
    pages: u32,
    next: u32,
}

impl AtlasAllocator {
    pub fn new(pages: u32) -> Self {
        Self {
            pages: pages.max(1),
            next: 0,
        }
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }

    pub fn pages(&self) -> u32 {
        self.pages
    }

    /// Quarter-page slots consumed so far.
    pub fn slots_used(&self) -> u32 {
        self.next
    }

    pub fn pages_used(&self) -> u32 {
        self.next.div_ceil(POINT_SLOTS_PER_PAGE)
    }

    pub fn allocate_point(&mut self) -> Option<AtlasRegion> {
        let slot = self.next;
        let page = slot / POINT_SLOTS_PER_PAGE;
        if page >= self.pages {
            return None;
        }
        let quadrant = slot % POINT_SLOTS_PER_PAGE;
        self.next += 1;
        Some(AtlasRegion {
            page,
            min_uv: Vec2::new(0.5 * (quadrant % 2) as f32, 0.5 * (quadrant / 2) as f32),
            size_uv: Vec2::splat(0.5),
        })
    }

    pub fn allocate_directional(&mut self) -> Option<AtlasRegion> {
        let aligned = self.next.next_multiple_of(POINT_SLOTS_PER_PAGE);
        let page = aligned / POINT_SLOTS_PER_PAGE;
        if page >= self.pages {
            return None;
        }
        self.next = aligned + POINT_SLOTS_PER_PAGE;
        Some(AtlasRegion {
            page,
            min_uv: Vec2::ZERO,
            size_uv: Vec2::ONE,
        })
    }
}

/// View matrix of a point light; paraboloid hemispheres face -Z and +Z.
pub fn point_light_view(position: Vec3) -> Mat4 {
    Mat4::look_at_rh(position, position - Vec3::Z, Vec3::Y)
}

/// Orthographic view-projection of a directional light covering the sphere
/// around `focus`. Returns the matrix and its far plane.
pub fn directional_light_view_proj(direction: Vec3, focus: &Aabb) -> (Mat4, f32) {
    let direction = direction.normalize_or(Vec3::NEG_Y);
    let center = focus.center();
    let radius = focus.half_extents().length().max(1e-3);
    let up = if direction.abs().dot(Vec3::Y) > 0.95 {
        Vec3::Z
    } else {
        Vec3::Y
    };
    let view = Mat4::look_at_rh(center - direction * radius, center, up);
    let proj = Mat4::orthographic_rh(-radius, radius, -radius, radius, 0.0, 2.0 * radius);
    (proj * view, 2.0 * radius)
}

/// Dual paraboloid projection of a light-view-space position: texture
/// coordinates in `[0, 1]` inside the hemisphere half, or `None` when the
/// point lies in the other hemisphere. `front` covers -Z.
pub fn paraboloid_uv(view_position: Vec3, front: bool) -> Option<Vec2> {
    let hemisphere = if front { 1.0 } else { -1.0 };
    if view_position.z * hemisphere > 0.0 {
        return None;
    }
    let d = view_position.normalize_or_zero();
    let p = d.truncate() / (1.0 - hemisphere * d.z);
    Some(Vec2::new(p.x * 0.5 + 0.5, 0.5 - p.y * 0.5))
}

/// Descriptor of a point light shadowed into `region`. Near is clamped to
/// zero and far to the light's cutoff.
pub fn point_shadow_descriptor(
    light: &PackedPointLight,
    region: &AtlasRegion,
    near: f32,
    far: f32,
) -> ShadowRaw {
    let near = near.max(0.0);
    let far = far.min(light.light.cutoff).max(near + 1e-3);
    ShadowRaw {
        light_view: point_light_view(light.position).to_cols_array_2d(),
        min_uv: region.min_uv.to_array(),
        max_uv: region.max_uv().to_array(),
        near,
        far,
        atlas_page: region.page,
        enabled: 1,
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct ShadowPassUniform {
    /// Light view for point lights, view-projection for directional lights.
    pub view_proj: [[f32; 4]; 4],
    pub origin: [f32; 4],
    pub direction: [f32; 4],
    pub color: [f32; 4],
    /// constant, linear, quadratic, cutoff
    pub attenuation: [f32; 4],
    /// near, far, hemisphere (+1 front / -1 back), kind (0 point / 1 directional)
    pub params: [f32; 4],
}

/// Descriptor for one light plus the shadow target it was rendered into,
/// which light injection samples.
pub struct ShadowOutcome {
    pub descriptor: ShadowRaw,
    pub target: Option<PooledTarget>,
    /// World point the stored positions are relative to.
    pub origin: Vec3,
}

impl ShadowOutcome {
    fn disabled() -> Self {
        Self {
            descriptor: ShadowRaw::DISABLED,
            target: None,
            origin: Vec3::ZERO,
        }
    }
}

/// Moment pages, one render-target view per page.
struct MomentsArray {
    texture: wgpu::Texture,
    layer_views: Vec<wgpu::TextureView>,
}

impl MomentsArray {
    fn new(device: &wgpu::Device, format: wgpu::TextureFormat, size: u32, pages: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("ShadowAtlas"),
            size: wgpu::Extent3d {
                width: size,
                height: size,
                depth_or_array_layers: pages,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });

        let layer_views = (0..pages)
            .map(|layer| {
                texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some(&format!("ShadowAtlasLayer{layer}")),
                    dimension: Some(wgpu::TextureViewDimension::D2),
                    base_array_layer: layer,
                    array_layer_count: Some(1),
                    ..Default::default()
                })
            })
            .collect();

        Self {
            texture,
            layer_views,
        }
    }
}

/// Variance shadow atlas with reflective shadow map output.
///
/// `begin` clears every page and resets the allocator, each
/// `compute_*_shadow` renders one light and copies its moments into its
/// atlas region, `commit` blurs the atlas into the copy that is sampled.
pub struct ShadowAtlas {
    map_size: u32,
    moments_format: wgpu::TextureFormat,
    moments: MomentsArray,
    blurred: GpTexture,
    sampler: wgpu::Sampler,
    allocator: AtlasAllocator,
    uniforms: PassUniforms<ShadowPassUniform>,
    pipeline: wgpu::RenderPipeline,
    blur: Blur,
}

impl ShadowAtlas {
    pub fn new(
        ctx: &GraphicsContext,
        shaders: &mut ShaderLibrary,
        template: &MaterialTemplate,
        settings: &ShadowSettings,
    ) -> Result<Self> {
        let full_precision = settings.full_precision && ctx.capabilities.float32_filterable;
        if settings.full_precision && !full_precision {
            log::warn!("Full precision shadows need FLOAT32_FILTERABLE; using half precision");
        }
        let (moments_format, blurred_format) = if full_precision {
            (
                wgpu::TextureFormat::Rg32Float,
                wgpu::TextureFormat::Rgba32Float,
            )
        } else {
            (
                wgpu::TextureFormat::Rg16Float,
                wgpu::TextureFormat::Rgba16Float,
            )
        };
        log::info!(
            "Shadow atlas: {} pages of {}x{} ({:?})",
            settings.atlas_pages,
            settings.map_size,
            settings.map_size,
            moments_format
        );

        let moments = MomentsArray::new(
            &ctx.device,
            moments_format,
            settings.map_size,
            settings.atlas_pages,
        );
        let blurred = GpTexture::new(
            &ctx.device,
            &GpTextureKey::d2_array(
                settings.map_size,
                settings.map_size,
                settings.atlas_pages,
                blurred_format,
            ),
            "ShadowAtlasBlurred",
        );

        let sampler = ctx.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("ShadowAtlasSampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let uniforms = PassUniforms::new(ctx, "ShadowUniforms", wgpu::ShaderStages::VERTEX_FRAGMENT);
        let shader = shaders.graphics(&ctx.device, &ShaderKey::new("shadow.wgsl"))?;
        let layout = pipeline_layout(
            &ctx.device,
            "ShadowPipelineLayout",
            &[uniforms.layout(), template.layout()],
        );
        let pipeline = PipelineBuilder::new(&ctx.device, &layout, &shader)
            .with_label("ShadowPipeline")
            .with_vertex_buffer(Vertex::layout())
            .with_color_target(moments_format, None)
            .with_color_target(RSM_FORMAT, None)
            .with_color_target(RSM_FORMAT, None)
            .with_color_target(RSM_FORMAT, None)
            .with_depth_stencil(DEPTH_FORMAT, true, wgpu::CompareFunction::Less)
            .with_no_culling()
            .build()?;

        Ok(Self {
            map_size: settings.map_size,
            moments_format,
            moments,
            blurred,
            sampler,
            allocator: AtlasAllocator::new(settings.atlas_pages),
            uniforms,
            pipeline,
            blur: Blur::new(
                ctx,
                shaders,
                blurred_format,
                settings.blur_sigma,
                settings.blur_radius,
            )?,
        })
    }

    pub fn map_size(&self) -> u32 {
        self.map_size
    }

    pub fn allocator(&self) -> &AtlasAllocator {
        &self.allocator
    }

    /// Blurred moments, sampled by the lighting shaders.
    pub fn blurred_view(&self) -> &wgpu::TextureView {
        self.blurred.view()
    }

    pub fn sampler(&self) -> &wgpu::Sampler {
        &self.sampler
    }

    fn target_key(&self, size: u32) -> RenderTargetKey {
        RenderTargetKey::new(
            size,
            size,
            &[self.moments_format, RSM_FORMAT, RSM_FORMAT, RSM_FORMAT],
            true,
        )
    }

    /// Clear every page and reset the page allocator.
    pub fn begin(&mut self, encoder: &mut wgpu::CommandEncoder) {
        self.allocator.reset();
        self.uniforms.clear();

        for view in &self.moments.layer_views {
            let _ = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("ShadowAtlasClear"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(MOMENTS_CLEAR),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
    }

    /// Render a point light into a quarter page, front hemisphere on the left
    /// half and back hemisphere on the right half.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_point_shadow(
        &mut self,
        ctx: &GraphicsContext,
        encoder: &mut wgpu::CommandEncoder,
        targets: &RenderTargetCache,
        scene: &Scene,
        meshes: &VolumeHierarchy,
        light: &PackedPointLight,
        near: f32,
        far: f32,
    ) -> Result<ShadowOutcome> {
        if !light.light.shadow_enabled {
            log::debug!("Point light {:?} casts no shadow", light.entity);
            return Ok(ShadowOutcome::disabled());
        }
        let Some(region) = self.allocator.allocate_point() else {
            log::warn!(
                "Shadow atlas full ({} pages); point light {:?} is unshadowed",
                self.allocator.pages(),
                light.entity
            );
            return Ok(ShadowOutcome::disabled());
        };

        let descriptor = point_shadow_descriptor(light, &region, near, far);
        let (near, far) = (descriptor.near, descriptor.far);
        let view = descriptor.light_view();

        let base = ShadowPassUniform {
            view_proj: view.to_cols_array_2d(),
            origin: light.position.extend(1.0).to_array(),
            direction: [0.0, 0.0, -1.0, 0.0],
            color: light.light.color.extend(1.0).to_array(),
            attenuation: [
                light.light.constant,
                light.light.linear,
                light.light.quadratic,
                light.light.cutoff,
            ],
            params: [near, far, 1.0, 0.0],
        };
        let front = self.uniforms.push_pass(base);
        let back = self.uniforms.push_pass(ShadowPassUniform {
            params: [near, far, -1.0, 0.0],
            ..base
        });

        let casters = meshes.intersections_sphere(&light.light.bounding_sphere(light.position));
        let items = collect_draws(scene, &casters, view, self.uniforms.objects_mut());
        self.uniforms.flush(ctx);

        let (origin, size) = region.texels(self.map_size);
        let target = targets.pop(&self.target_key(size[0]))?;
        let half_width = target.width() as f32 * 0.5;
        let height = target.height() as f32;

        if let Some(uniforms) = self.uniforms.bind_group() {
            let mut pass = begin_shadow_pass(encoder, &target, "PointShadowPass");
            pass.set_pipeline(&self.pipeline);
            pass.set_viewport(0.0, 0.0, half_width, height, 0.0, 1.0);
            record_draws(&mut pass, scene, &items, uniforms, front, 1, 1);
            pass.set_viewport(half_width, 0.0, half_width, height, 0.0, 1.0);
            record_draws(&mut pass, scene, &items, uniforms, back, 1, 1);
        }

        self.copy_to_atlas(encoder, &target, region.page, origin);

        Ok(ShadowOutcome {
            descriptor,
            target: Some(target),
            origin: light.position,
        })
    }

    /// Render a directional light over a whole page, covering `focus`.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_directional_shadow(
        &mut self,
        ctx: &GraphicsContext,
        encoder: &mut wgpu::CommandEncoder,
        targets: &RenderTargetCache,
        scene: &Scene,
        meshes: &VolumeHierarchy,
        light: &PackedDirectionalLight,
        focus: &Aabb,
    ) -> Result<ShadowOutcome> {
        if !light.light.shadow_enabled {
            log::debug!("Directional light {:?} casts no shadow", light.entity);
            return Ok(ShadowOutcome::disabled());
        }
        let Some(region) = self.allocator.allocate_directional() else {
            log::warn!(
                "Shadow atlas full ({} pages); directional light {:?} is unshadowed",
                self.allocator.pages(),
                light.entity
            );
            return Ok(ShadowOutcome::disabled());
        };

        let (view_proj, far) = directional_light_view_proj(light.direction, focus);
        let pass_offset = self.uniforms.push_pass(ShadowPassUniform {
            view_proj: view_proj.to_cols_array_2d(),
            origin: focus.center().extend(1.0).to_array(),
            direction: light.direction.extend(0.0).to_array(),
            color: light.light.color.extend(1.0).to_array(),
            attenuation: [1.0, 0.0, 0.0, far],
            params: [0.0, far, 1.0, 1.0],
        });

        let casters = meshes.intersections_frustum(&Frustum::from_view_proj(&view_proj));
        let items = collect_draws(scene, &casters, view_proj, self.uniforms.objects_mut());
        self.uniforms.flush(ctx);

        let (origin, size) = region.texels(self.map_size);
        let target = targets.pop(&self.target_key(size[0]))?;
        if let Some(uniforms) = self.uniforms.bind_group() {
            let mut pass = begin_shadow_pass(encoder, &target, "DirectionalShadowPass");
            pass.set_pipeline(&self.pipeline);
            record_draws(&mut pass, scene, &items, uniforms, pass_offset, 1, 1);
        }

        self.copy_to_atlas(encoder, &target, region.page, origin);

        Ok(ShadowOutcome {
            descriptor: ShadowRaw {
                light_view: view_proj.to_cols_array_2d(),
                min_uv: region.min_uv.to_array(),
                max_uv: region.max_uv().to_array(),
                near: 0.0,
                far,
                atlas_page: region.page,
                enabled: 1,
            },
            target: Some(target),
            origin: focus.center(),
        })
    }

    fn copy_to_atlas(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        target: &RenderTarget,
        page: u32,
        origin: [u32; 2],
    ) {
        encoder.copy_texture_to_texture(
            wgpu::TexelCopyTextureInfo {
                texture: target.color_texture(0),
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyTextureInfo {
                texture: &self.moments.texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: origin[0],
                    y: origin[1],
                    z: page,
                },
                aspect: wgpu::TextureAspect::All,
            },
            target.extent(),
        );
    }

    /// Blur the populated atlas into the sampled copy.
    pub fn commit(
        &mut self,
        ctx: &GraphicsContext,
        encoder: &mut wgpu::CommandEncoder,
        textures: &GpTextureCache,
    ) -> Result<()> {
        let temp = textures.pop(self.blurred.key())?;
        self.blur.record(
            ctx,
            encoder,
            &self.moments.texture,
            temp.texture(),
            self.blurred.texture(),
        );
        log::trace!(
            "Shadow atlas committed with {} of {} pages in use",
            self.allocator.pages_used(),
            self.allocator.pages()
        );
        Ok(())
    }
}

fn begin_shadow_pass<'a>(
    encoder: &'a mut wgpu::CommandEncoder,
    target: &'a RenderTarget,
    label: &'a str,
) -> wgpu::RenderPass<'a> {
    let mut attachments = target.color_attachments(wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT));
    if let Some(Some(moments)) = attachments.first_mut() {
        moments.ops.load = wgpu::LoadOp::Clear(MOMENTS_CLEAR);
    }
    encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some(label),
        color_attachments: &attachments,
        depth_stencil_attachment: target.depth_attachment(),
        timestamp_writes: None,
        occlusion_query_set: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_size_matches_wgsl() {
        assert_eq!(std::mem::size_of::<ShadowPassUniform>(), 144);
    }

    #[test]
    fn point_slots_fill_a_page_in_quadrants() {
        let mut allocator = AtlasAllocator::new(2);
        let regions: Vec<_> = (0..4).filter_map(|_| allocator.allocate_point()).collect();
        assert_eq!(regions.len(), 4);
        assert!(regions.iter().all(|r| r.page == 0));
        assert_eq!(regions[1].min_uv, Vec2::new(0.5, 0.0));
        assert_eq!(regions[2].min_uv, Vec2::new(0.0, 0.5));
        assert_eq!(regions[3].max_uv(), Vec2::ONE);
        assert_eq!(allocator.allocate_point().map(|r| r.page), Some(1));
    }

    #[test]
    fn directional_aligns_to_next_page() {
        let mut allocator = AtlasAllocator::new(3);
        allocator.allocate_point();
        let sun = allocator.allocate_directional().expect("page available");
        assert_eq!(sun.page, 1);
        assert_eq!(sun.size_uv, Vec2::ONE);
        assert_eq!(allocator.allocate_point().map(|r| r.page), Some(2));
    }

    #[test]
    fn exhaustion_consumes_nothing() {
        let mut allocator = AtlasAllocator::new(1);
        assert!(allocator.allocate_directional().is_some());
        let used = allocator.slots_used();
        assert!(allocator.allocate_point().is_none());
        assert!(allocator.allocate_directional().is_none());
        assert_eq!(allocator.slots_used(), used);
    }

    #[test]
    fn texels_cover_quadrant() {
        let region = AtlasRegion {
            page: 0,
            min_uv: Vec2::new(0.5, 0.5),
            size_uv: Vec2::splat(0.5),
        };
        assert_eq!(region.texels(1024), ([512, 512], [512, 512]));
    }

    #[test]
    fn paraboloid_centre_and_rim() {
        let centre = paraboloid_uv(Vec3::new(0.0, 0.0, -2.0), true).expect("front");
        assert!(centre.abs_diff_eq(Vec2::splat(0.5), 1e-6));

        let rim = paraboloid_uv(Vec3::new(1.0, 0.0, 0.0), true).expect("front rim");
        assert!(rim.abs_diff_eq(Vec2::new(1.0, 0.5), 1e-6));

        assert!(paraboloid_uv(Vec3::new(0.0, 0.0, 1.0), true).is_none());
        assert!(paraboloid_uv(Vec3::new(0.0, 0.0, 1.0), false).is_some());
    }

    #[test]
    fn directional_projection_contains_focus() {
        let focus = Aabb::from_center_half_extents(Vec3::new(3.0, 1.0, -2.0), Vec3::splat(4.0));
        let (view_proj, far) = directional_light_view_proj(Vec3::new(0.2, -1.0, 0.1), &focus);
        assert!(far > 0.0);
        for corner in [focus.min, focus.max, focus.center()] {
            let clip = view_proj.project_point3(corner);
            assert!(clip.x.abs() <= 1.0 + 1e-4 && clip.y.abs() <= 1.0 + 1e-4);
            assert!((-1e-4..=1.0 + 1e-4).contains(&clip.z));
        }
    }
}
