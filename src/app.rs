// app.rs
use std::sync::Arc;

use glam::{Quat, Vec3};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::*,
    event_loop::ActiveEventLoop,
    keyboard::{Key, NamedKey},
    window::{Window, WindowId},
};

use crate::asset::{primitives, Mesh};
use crate::error::{RenderError, Result};
use crate::renderer::texture::RenderTargetKey;
use crate::renderer::{
    DeferredRenderer, GraphicsContext, Material, MaterialInput, MaterialTemplate, PostProcess,
    RenderTarget, ShaderLibrary,
};
use crate::scene::{Camera, DirectionalLight, PointLight, Scene, Transform, TransformComponent};
use crate::settings::RenderSettings;
use crate::time::FrameClock;

const OVERLAY_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;

/// Clipmap overlay drawn over the lit image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugView {
    Off,
    Voxels(i32),
    Radiance(i32),
}

impl DebugView {
    fn next(self) -> Self {
        match self {
            DebugView::Off => DebugView::Voxels(0),
            DebugView::Voxels(level) => DebugView::Radiance(level),
            DebugView::Radiance(_) => DebugView::Off,
        }
    }

    fn with_level(self, level: i32) -> Self {
        match self {
            DebugView::Off => DebugView::Off,
            DebugView::Voxels(_) => DebugView::Voxels(level),
            DebugView::Radiance(_) => DebugView::Radiance(level),
        }
    }

    fn level(self) -> Option<i32> {
        match self {
            DebugView::Off => None,
            DebugView::Voxels(level) | DebugView::Radiance(level) => Some(level),
        }
    }
}

struct Viewer {
    window: Arc<Window>,
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    ctx: GraphicsContext,
    renderer: DeferredRenderer,
    post: PostProcess,
    scene: Scene,
    orbiting: Option<hecs::Entity>,
    overlay: Option<RenderTarget>,
    debug: DebugView,
}

impl Viewer {
    fn new(window: Arc<Window>, settings: &RenderSettings) -> Result<Self> {
        let instance = GraphicsContext::create_instance();
        let surface = instance
            .create_surface(Arc::clone(&window))
            .map_err(|err| RenderError::DeviceRequest(err.to_string()))?;
        let ctx = pollster::block_on(GraphicsContext::for_surface(instance, &surface))?;

        let caps = surface.get_capabilities(&ctx.adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or(RenderError::AdapterUnavailable)?;
        let size = window.inner_size();
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: settings.present_mode(&caps.present_modes),
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&ctx.device, &config);

        let mut shaders = ShaderLibrary::embedded();
        let renderer = DeferredRenderer::new(&ctx, &mut shaders, settings)?;
        let post = PostProcess::new(&ctx, &mut shaders, &settings.postprocess)?;
        log::info!("Compiled {} shaders", shaders.len());

        let mut scene = Scene::new();
        let orbiting = populate_demo_scene(&ctx, &mut scene, renderer.material_template());

        Ok(Self {
            window,
            surface,
            config,
            ctx,
            renderer,
            post,
            scene,
            orbiting,
            overlay: None,
            debug: DebugView::Off,
        })
    }

    fn resize(&mut self, size: PhysicalSize<u32>) {
        if size.width == 0 || size.height == 0 {
            return;
        }
        self.config.width = size.width;
        self.config.height = size.height;
        self.surface.configure(&self.ctx.device, &self.config);
        self.overlay = None;
    }

    fn animate(&mut self, elapsed: f32) {
        let Some(entity) = self.orbiting else {
            return;
        };
        if let Ok(mut transform) = self.scene.world.get::<&mut TransformComponent>(entity) {
            let angle = elapsed * 0.6;
            transform.0.translation = Vec3::new(angle.cos() * 4.0, 2.5, angle.sin() * 4.0);
        }
    }

    fn frame(&mut self, dt: f32) -> Result<()> {
        let (width, height) = (self.config.width, self.config.height);
        let Some(output) = self
            .renderer
            .draw(&self.ctx, &mut self.scene, dt, width, height)?
        else {
            return Ok(());
        };

        let image = match self.debug.level() {
            Some(level) if self.renderer.global_illumination() => {
                self.draw_overlay(&output.hdr, level)?;
                match self.overlay.as_ref() {
                    Some(overlay) => self.post.execute(&self.ctx, overlay, dt)?,
                    None => self.post.execute(&self.ctx, &output.hdr, dt)?,
                }
            }
            _ => self.post.execute(&self.ctx, &output.hdr, dt)?,
        };

        let frame = self.surface.get_current_texture()?;
        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        self.post
            .present(&self.ctx, &image, &view, self.config.format)?;
        self.window.pre_present_notify();
        frame.present();
        Ok(())
    }

    /// Copy of `hdr` with the voxel overlay drawn on top.
    fn draw_overlay(&mut self, hdr: &RenderTarget, level: i32) -> Result<()> {
        let key = RenderTargetKey::new(hdr.width(), hdr.height(), &[OVERLAY_FORMAT], true);
        if self.overlay.as_ref().map(RenderTarget::key) != Some(&key) {
            self.overlay = Some(RenderTarget::new(&self.ctx.device, &key, "VoxelOverlay"));
        }
        let (Some(overlay), Some((camera, world))) = (self.overlay.as_ref(), self.scene.main_camera()) else {
            return Ok(());
        };
        let view_proj = camera.view_proj(&world, hdr.width() as f32 / hdr.height() as f32)?;

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("VoxelOverlayEncoder"),
            });
        encoder.copy_texture_to_texture(
            hdr.color_texture(0).as_image_copy(),
            overlay.color_texture(0).as_image_copy(),
            hdr.extent(),
        );
        if let Some(voxels) = self.renderer.voxelization() {
            let position = Camera::position(&world);
            match self.debug {
                DebugView::Voxels(_) => {
                    voxels.draw_voxels(&self.ctx, &mut encoder, overlay, view_proj, position, level)
                }
                DebugView::Radiance(_) => {
                    voxels.draw_sh(&self.ctx, &mut encoder, overlay, view_proj, position, level)
                }
                DebugView::Off => {}
            }
        }
        self.ctx.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn handle_key(&mut self, key: &Key) {
        match key {
            Key::Character(c) if c.eq_ignore_ascii_case("g") => {
                let enabled = !self.renderer.global_illumination();
                self.renderer.set_global_illumination(enabled);
                log::info!("Global illumination {}", if enabled { "on" } else { "off" });
            }
            Key::Character(c) if c.eq_ignore_ascii_case("v") => {
                self.debug = self.debug.next();
                log::info!("Debug view: {:?}", self.debug);
            }
            Key::Character(c) if c.as_str() == "[" || c.as_str() == "]" => {
                let Some(level) = self.debug.level() else {
                    return;
                };
                let Some(voxels) = self.renderer.voxelization() else {
                    return;
                };
                let layout = voxels.layout();
                let lowest = -(layout.cascades() as i32);
                let highest = layout.mip_count() as i32 - 1;
                let step = if c.as_str() == "[" { -1 } else { 1 };
                self.debug = self.debug.with_level((level + step).clamp(lowest, highest));
                log::info!("Debug view: {:?}", self.debug);
            }
            _ => {}
        }
    }
}

/// A floor, a ring of boxes and spheres, one orbiting point light and a sun.
/// Returns the orbiting light.
fn populate_demo_scene(
    ctx: &GraphicsContext,
    scene: &mut Scene,
    template: &Arc<MaterialTemplate>,
) -> Option<hecs::Entity> {
    let mut rng = SmallRng::seed_from_u64(0x6111);

    let plane = scene
        .assets
        .meshes
        .insert(Mesh::from_data(&ctx.device, &primitives::plane(20.0), "Floor"));
    let cube = scene
        .assets
        .meshes
        .insert(Mesh::from_data(&ctx.device, &primitives::cube(), "Cube"));
    let sphere = scene
        .assets
        .meshes
        .insert(Mesh::from_data(&ctx.device, &primitives::sphere(32, 16), "Sphere"));

    let floor = scene
        .assets
        .materials
        .insert(Material::colored(template, Vec3::splat(0.8), 0.0));
    scene.spawn_mesh("Floor", plane, vec![floor], Transform::default());

    for index in 0..10 {
        let angle = index as f32 / 10.0 * std::f32::consts::TAU;
        let albedo = Vec3::new(rng.gen_range(0.2..1.0), rng.gen_range(0.2..1.0), rng.gen_range(0.2..1.0));
        let mut material = Material::colored(template, albedo, 0.0);
        material.set_input(MaterialTemplate::SPECULAR, MaterialInput::Scalar(0.3));
        material.set_input(MaterialTemplate::SHININESS, MaterialInput::Scalar(32.0));
        let material = scene.assets.materials.insert(material);

        let radius = rng.gen_range(2.5..6.0);
        let scale = rng.gen_range(0.5..1.2);
        let position = Vec3::new(angle.cos() * radius, scale * 0.5, angle.sin() * radius);
        let (mesh, name) = if index % 2 == 0 { (cube, "Box") } else { (sphere, "Ball") };
        let rotation = Quat::from_rotation_y(rng.gen_range(0.0..std::f32::consts::PI));
        scene.spawn_mesh(
            name,
            mesh,
            vec![material],
            Transform::from_trs(position, rotation, Vec3::splat(scale)),
        );
    }

    let glow = scene
        .assets
        .materials
        .insert(Material::colored(template, Vec3::new(1.0, 0.6, 0.2), 4.0));
    scene.spawn_mesh(
        "Lamp",
        sphere,
        vec![glow],
        Transform::from_trs(Vec3::new(0.0, 0.4, 0.0), Quat::IDENTITY, Vec3::splat(0.4)),
    );

    let orbiting = scene.spawn_point_light(
        Vec3::new(4.0, 2.5, 0.0),
        PointLight::new(Vec3::new(6.0, 5.0, 4.0), 12.0),
    );
    scene.spawn_point_light(
        Vec3::new(-3.0, 1.0, -3.0),
        PointLight::new(Vec3::new(0.5, 1.0, 3.0), 6.0).without_shadows(),
    );
    scene.spawn_directional_light(
        Vec3::new(-0.4, -1.0, -0.3),
        DirectionalLight::new(Vec3::splat(1.5)),
    );

    scene.spawn_camera(
        Camera::default(),
        Transform::looking_at(Vec3::new(0.0, 5.0, 11.0), Vec3::ZERO, Vec3::Y),
    );
    Some(orbiting)
}

/// winit application: one window, one renderer, one demo scene.
pub struct App {
    settings: RenderSettings,
    viewer: Option<Viewer>,
    clock: FrameClock,
}

impl App {
    pub fn new(settings: RenderSettings) -> Self {
        Self {
            settings,
            viewer: None,
            clock: FrameClock::new(),
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.viewer.is_some() {
            return;
        }
        let attributes = Window::default_attributes()
            .with_title("GILib")
            .with_inner_size(PhysicalSize::new(
                self.settings.resolution.width,
                self.settings.resolution.height,
            ));
        let window = match event_loop.create_window(attributes) {
            Ok(window) => Arc::new(window),
            Err(err) => {
                log::error!("Failed to create window: {}", err);
                event_loop.exit();
                return;
            }
        };

        match Viewer::new(Arc::clone(&window), &self.settings) {
            Ok(viewer) => {
                self.viewer = Some(viewer);
                window.request_redraw();
            }
            Err(err) => {
                log::error!("Failed to initialise renderer: {}", err);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, id: WindowId, event: WindowEvent) {
        let Some(viewer) = self.viewer.as_mut() else {
            return;
        };
        if viewer.window.id() != id {
            return;
        }

        match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                viewer.resize(size);
            }
            WindowEvent::ScaleFactorChanged { .. } => {
                let size = viewer.window.inner_size();
                viewer.resize(size);
            }
            WindowEvent::RedrawRequested => {
                let dt = self.clock.tick();
                viewer.animate(self.clock.elapsed() as f32);
                match viewer.frame(dt) {
                    Ok(()) => {}
                    Err(RenderError::Surface(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated)) => {
                        let size = viewer.window.inner_size();
                        viewer.resize(size);
                    }
                    Err(RenderError::Surface(wgpu::SurfaceError::Timeout)) => {
                        log::warn!("Surface timeout; skipping frame");
                    }
                    Err(err) => {
                        log::error!("Frame failed: {}", err);
                        event_loop.exit();
                        return;
                    }
                }
                viewer.window.request_redraw();
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key: Key::Named(NamedKey::Escape),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => {
                event_loop.exit();
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key,
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => {
                viewer.handle_key(&logical_key);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_view_cycles_back_to_off() {
        let view = DebugView::Off.next();
        assert_eq!(view, DebugView::Voxels(0));
        assert_eq!(view.next(), DebugView::Radiance(0));
        assert_eq!(view.next().next(), DebugView::Off);
    }

    #[test]
    fn level_changes_keep_the_view_kind() {
        assert_eq!(DebugView::Radiance(0).with_level(-2), DebugView::Radiance(-2));
        assert_eq!(DebugView::Off.with_level(3), DebugView::Off);
        assert_eq!(DebugView::Off.level(), None);
    }
}
