use std::sync::Arc;

use glam::{Mat4, Vec3};

use crate::error::Result;
use crate::renderer::draw::{collect_draws, record_draws, PassUniforms};
use crate::renderer::lighting::{LightAccumulator, LightingReport};
use crate::renderer::material::MaterialTemplate;
use crate::renderer::pipeline_builder::{pipeline_layout, PipelineBuilder};
use crate::renderer::shader::ShaderLibrary;
use crate::renderer::texture::{
    PooledTarget, RenderTargetAllocator, RenderTargetCache, RenderTargetKey, DEPTH_FORMAT,
};
use crate::renderer::uniforms::FrameUniform;
use crate::renderer::voxel::{VoxelLayout, Voxelization};
use crate::renderer::{GraphicsContext, Vertex};
use crate::scene::{Aabb, Camera, Frustum, Scene, VolumeHierarchy};
use crate::settings::RenderSettings;

/// GBuffer layout: albedo + emissivity, normal + shininess, depth.
pub const GBUFFER_FORMATS: [wgpu::TextureFormat; 2] = [
    wgpu::TextureFormat::Rgba16Float,
    wgpu::TextureFormat::Rgba16Float,
];

/// Box the directional shadows are fitted to. The clipmap only follows the
/// camera on frames that run global illumination; otherwise `fallback`,
/// snapped to the camera every frame, is used.
pub fn shadow_focus_domain(
    global_illumination: bool,
    clipmap: Option<&VoxelLayout>,
    fallback: &VoxelLayout,
) -> Aabb {
    match clipmap {
        Some(layout) if global_illumination => layout.domain(),
        _ => fallback.domain(),
    }
}

pub fn gbuffer_key(width: u32, height: u32) -> RenderTargetKey {
    RenderTargetKey::new(width.max(1), height.max(1), &GBUFFER_FORMATS, true)
}

/// Everything a pass needs to know about the frame being drawn.
pub struct FrameInfo<'a> {
    pub scene: &'a Scene,
    pub meshes: VolumeHierarchy,
    pub camera: Camera,
    pub camera_position: Vec3,
    pub view: Mat4,
    pub view_proj: Mat4,
    pub frustum: Frustum,
    pub width: u32,
    pub height: u32,
    pub aspect: f32,
    pub dt: f32,
    pub enable_global_illumination: bool,
}

impl<'a> FrameInfo<'a> {
    /// `None` without a main camera.
    pub fn new(
        scene: &'a Scene,
        width: u32,
        height: u32,
        dt: f32,
        enable_global_illumination: bool,
    ) -> Result<Option<Self>> {
        let Some((camera, world)) = scene.main_camera() else {
            return Ok(None);
        };
        let width = width.max(1);
        let height = height.max(1);
        let aspect = width as f32 / height as f32;
        let view_proj = camera.view_proj(&world, aspect)?;

        Ok(Some(Self {
            scene,
            meshes: scene.mesh_hierarchy(),
            camera,
            camera_position: Camera::position(&world),
            view: Camera::view(&world),
            view_proj,
            frustum: Frustum::from_view_proj(&view_proj),
            width,
            height,
            aspect,
            dt,
            enable_global_illumination,
        }))
    }
}

/// Result of one drawn frame. Both targets go back to their pools when
/// dropped.
pub struct FrameOutput {
    pub hdr: PooledTarget,
    pub gbuffer: PooledTarget,
    pub lighting: LightingReport,
}

/// Draws the scene into a GBuffer, optionally voxelizes it, and accumulates
/// direct and indirect light into an HDR image.
pub struct DeferredRenderer {
    template: Arc<MaterialTemplate>,
    targets: RenderTargetCache,
    uniforms: PassUniforms<FrameUniform>,
    gbuffer_pipeline: wgpu::RenderPipeline,
    voxelization: Option<Voxelization>,
    shadow_focus: VoxelLayout,
    lighting: LightAccumulator,
    enable_global_illumination: bool,
}

impl DeferredRenderer {
    pub fn new(
        ctx: &GraphicsContext,
        shaders: &mut ShaderLibrary,
        settings: &RenderSettings,
    ) -> Result<Self> {
        let template = MaterialTemplate::deferred(ctx, shaders)?;

        let uniforms = PassUniforms::new(ctx, "GBufferUniforms", wgpu::ShaderStages::VERTEX_FRAGMENT);
        let layout = pipeline_layout(
            &ctx.device,
            "GBufferPipelineLayout",
            &[uniforms.layout(), template.layout()],
        );
        let mut builder = PipelineBuilder::new(&ctx.device, &layout, template.shader())
            .with_label("GBufferPipeline")
            .with_vertex_buffer(Vertex::layout());
        for format in GBUFFER_FORMATS {
            builder = builder.with_color_target(format, None);
        }
        let gbuffer_pipeline = builder
            .with_depth_stencil(DEPTH_FORMAT, true, wgpu::CompareFunction::Less)
            .build()?;

        let voxelization = if settings.enable_global_illumination {
            Some(Voxelization::new(ctx, shaders, &template, &settings.voxel)?)
        } else {
            log::info!("Global illumination disabled; skipping voxelization");
            None
        };
        let shadow_focus = VoxelLayout::from_settings(&settings.voxel)?;
        let lighting = LightAccumulator::new(ctx, shaders, &template, settings, voxelization.as_ref())?;

        Ok(Self {
            template,
            targets: RenderTargetCache::new(RenderTargetAllocator::new(&ctx.device)),
            uniforms,
            gbuffer_pipeline,
            voxelization,
            shadow_focus,
            lighting,
            enable_global_illumination: settings.enable_global_illumination,
        })
    }

    /// Template every scene material must be instantiated from.
    pub fn material_template(&self) -> &Arc<MaterialTemplate> {
        &self.template
    }

    pub fn voxelization(&self) -> Option<&Voxelization> {
        self.voxelization.as_ref()
    }

    pub fn voxelization_mut(&mut self) -> Option<&mut Voxelization> {
        self.voxelization.as_mut()
    }

    pub fn lighting(&self) -> &LightAccumulator {
        &self.lighting
    }

    pub fn lighting_mut(&mut self) -> &mut LightAccumulator {
        &mut self.lighting
    }

    /// Global illumination runs only when it is enabled and the clipmap was
    /// built at construction.
    pub fn global_illumination(&self) -> bool {
        self.enable_global_illumination && self.voxelization.is_some()
    }

    pub fn set_global_illumination(&mut self, enabled: bool) {
        if enabled && self.voxelization.is_none() {
            log::warn!("Renderer was built without a voxel clipmap; global illumination stays off");
        }
        self.enable_global_illumination = enabled;
    }

    /// Directional shadow focus for the current global illumination state,
    /// as of the last drawn frame.
    pub fn shadow_focus(&self) -> Aabb {
        shadow_focus_domain(
            self.global_illumination(),
            self.voxelization.as_ref().map(Voxelization::layout),
            &self.shadow_focus,
        )
    }

    /// Draw one frame. `Ok(None)` when the scene has no main camera.
    pub fn draw(
        &mut self,
        ctx: &GraphicsContext,
        scene: &mut Scene,
        dt: f32,
        width: u32,
        height: u32,
    ) -> Result<Option<FrameOutput>> {
        for material in scene.assets.materials.iter_mut() {
            material.commit(ctx)?;
        }

        let scene: &Scene = scene;
        let global_illumination = self.global_illumination();
        let Some(frame) = FrameInfo::new(scene, width, height, dt, global_illumination)? else {
            log::debug!("No main camera; nothing to draw");
            return Ok(None);
        };

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("DeferredEncoder"),
            });

        let gbuffer = self.draw_gbuffer(ctx, &mut encoder, &frame)?;

        if let (true, Some(voxels)) = (frame.enable_global_illumination, self.voxelization.as_mut()) {
            voxels.update(ctx, &mut encoder, &frame)?;
        }

        self.shadow_focus.update(frame.camera_position);
        let focus = self.shadow_focus();
        let output = self.lighting.accumulate(
            ctx,
            &mut encoder,
            &frame,
            &gbuffer,
            self.voxelization.as_ref(),
            &focus,
        )?;

        ctx.queue.submit(Some(encoder.finish()));

        Ok(Some(FrameOutput {
            hdr: output.buffer,
            gbuffer,
            lighting: output.report,
        }))
    }

    fn draw_gbuffer(
        &mut self,
        ctx: &GraphicsContext,
        encoder: &mut wgpu::CommandEncoder,
        frame: &FrameInfo<'_>,
    ) -> Result<PooledTarget> {
        let gbuffer = self.targets.pop(&gbuffer_key(frame.width, frame.height))?;

        self.uniforms.clear();
        let pass_offset = self.uniforms.push_pass(FrameUniform::new(
            frame.view_proj,
            frame.camera_position,
            frame.width,
            frame.height,
        ));
        let visible = frame.meshes.intersections_frustum(&frame.frustum);
        let items = collect_draws(frame.scene, &visible, frame.view_proj, self.uniforms.objects_mut());
        self.uniforms.flush(ctx);
        log::trace!("GBuffer: {} visible meshes, {} draws", visible.len(), items.len());

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("GBufferPass"),
            color_attachments: &gbuffer.color_attachments(wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT)),
            depth_stencil_attachment: gbuffer.depth_attachment(),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        if let Some(uniforms) = self.uniforms.bind_group() {
            pass.set_pipeline(&self.gbuffer_pipeline);
            record_draws(&mut pass, frame.scene, &items, uniforms, pass_offset, 1, 1);
        }
        drop(pass);

        Ok(gbuffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Transform;

    #[test]
    fn gbuffer_fits_one_sample() {
        let bytes: u32 = GBUFFER_FORMATS
            .iter()
            .filter_map(|f| f.target_pixel_byte_cost())
            .sum();
        assert!(bytes <= 32);
    }

    #[test]
    fn gbuffer_key_never_collapses_to_zero() {
        let key = gbuffer_key(0, 0);
        assert_eq!(key, RenderTargetKey::new(1, 1, &GBUFFER_FORMATS, true));
    }

    #[test]
    fn shadow_focus_leaves_a_stale_clipmap_behind() {
        let mut clipmap = VoxelLayout::new(0.5, 16, 2).expect("valid layout");
        let mut fallback = clipmap.clone();
        clipmap.update(Vec3::ZERO);

        // Global illumination switched off: only the fallback keeps moving.
        let camera = Vec3::new(200.0, 5.0, -150.0);
        fallback.update(camera);

        let focus = shadow_focus_domain(false, Some(&clipmap), &fallback);
        assert!(focus.contains_point(camera));
        assert!(!clipmap.domain().contains_point(camera));

        let focus = shadow_focus_domain(true, Some(&clipmap), &fallback);
        assert_eq!(focus, clipmap.domain());
        let focus = shadow_focus_domain(true, None, &fallback);
        assert!(focus.contains_point(camera));
    }

    #[test]
    fn frame_info_needs_a_camera() {
        let scene = Scene::new();
        let frame = FrameInfo::new(&scene, 640, 480, 0.016, true).expect("valid frame");
        assert!(frame.is_none());
    }

    #[test]
    fn frame_info_follows_the_main_camera() {
        let mut scene = Scene::new();
        let eye = Vec3::new(1.0, 2.0, 5.0);
        scene.spawn_camera(
            Camera::default(),
            Transform::looking_at(eye, Vec3::ZERO, Vec3::Y),
        );
        let frame = FrameInfo::new(&scene, 800, 400, 0.016, false)
            .expect("valid frame")
            .expect("camera present");
        assert!(frame.camera_position.abs_diff_eq(eye, 1e-5));
        assert!((frame.aspect - 2.0).abs() < 1e-6);
        assert!(!frame.enable_global_illumination);
        let centre = frame.view_proj.project_point3(Vec3::ZERO);
        assert!(centre.x.abs() < 1e-4 && centre.y.abs() < 1e-4);
    }

    #[test]
    fn orthographic_cameras_are_supported() {
        let mut scene = Scene::new();
        scene.spawn_camera(
            Camera::orthographic(10.0, 0.1, 50.0),
            Transform::from_translation(Vec3::new(0.0, 0.0, 10.0)),
        );
        let frame = FrameInfo::new(&scene, 100, 100, 0.0, false)
            .expect("valid frame")
            .expect("camera present");
        let edge = frame.view_proj.project_point3(Vec3::new(5.0, 0.0, 0.0));
        assert!((edge.x - 1.0).abs() < 1e-4);
    }
}
