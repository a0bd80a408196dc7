//! Whole-frame tests against a real device. They need a GPU adapter, so they
//! are ignored by default: `cargo test -- --ignored`.

use std::sync::Arc;

use gilib::asset::{primitives, Mesh};
use gilib::renderer::lighting::{LightingPass, LightingResult};
use gilib::renderer::{
    DeferredRenderer, GraphicsContext, Material, MaterialInput, MaterialTemplate, ShaderLibrary,
};
use gilib::scene::{Camera, DirectionalLight, PointLight, Scene, Transform, TransformComponent};
use gilib::settings::RenderSettings;
use glam::Vec3;

const WIDTH: u32 = 160;
const HEIGHT: u32 = 96;

fn small_settings(global_illumination: bool) -> RenderSettings {
    let mut settings = RenderSettings::default();
    settings.enable_global_illumination = global_illumination;
    settings.voxel.resolution = 16;
    settings.voxel.cascades = 2;
    settings.voxel.voxel_size = 0.5;
    settings.shadows.map_size = 256;
    settings
}

fn setup(settings: &RenderSettings) -> (GraphicsContext, DeferredRenderer) {
    let ctx = pollster::block_on(GraphicsContext::new_headless()).expect("headless device");
    let mut shaders = ShaderLibrary::embedded();
    let renderer = DeferredRenderer::new(&ctx, &mut shaders, settings).expect("renderer");
    (ctx, renderer)
}

fn spawn_camera(scene: &mut Scene) {
    scene.spawn_camera(
        Camera::perspective(60f32.to_radians(), 0.1, 100.0),
        Transform::looking_at(Vec3::new(0.0, 3.0, 6.0), Vec3::ZERO, Vec3::Y),
    );
}

fn spawn_room(ctx: &GraphicsContext, scene: &mut Scene, template: &Arc<MaterialTemplate>) {
    let floor_mesh = scene
        .assets
        .meshes
        .insert(Mesh::from_data(&ctx.device, &primitives::plane(10.0), "Floor"));
    let cube_mesh = scene
        .assets
        .meshes
        .insert(Mesh::from_data(&ctx.device, &primitives::cube(), "Cube"));
    let white = scene
        .assets
        .materials
        .insert(Material::colored(template, Vec3::splat(0.8), 0.0));
    let red = scene
        .assets
        .materials
        .insert(Material::colored(template, Vec3::new(0.9, 0.1, 0.1), 0.0));

    scene.spawn_mesh("Floor", floor_mesh, vec![white], Transform::default());
    scene.spawn_mesh(
        "Cube",
        cube_mesh,
        vec![red],
        Transform::from_translation(Vec3::new(0.0, 0.5, 0.0)),
    );
}

#[test]
#[ignore = "requires a GPU adapter"]
fn empty_scene_produces_a_frame_of_the_requested_size() {
    let settings = small_settings(true);
    let (ctx, mut renderer) = setup(&settings);
    let mut scene = Scene::new();
    spawn_camera(&mut scene);

    let output = renderer
        .draw(&ctx, &mut scene, 0.016, WIDTH, HEIGHT)
        .expect("draw")
        .expect("camera present");
    assert_eq!(output.hdr.key().width, WIDTH);
    assert_eq!(output.hdr.key().height, HEIGHT);
    assert!(output.lighting.point_lights.is_empty());
    assert!(!output
        .lighting
        .executed
        .iter()
        .any(|pass| matches!(pass, LightingPass::Shadow(..))));

    let pixels = output.hdr.read_color(&ctx, 0).expect("read back");
    assert_eq!(pixels.len(), (WIDTH * HEIGHT) as usize);
    assert!(pixels.iter().all(|p| p.iter().all(|c| c.is_finite())));
}

#[test]
#[ignore = "requires a GPU adapter"]
fn no_camera_draws_nothing() {
    let settings = small_settings(false);
    let (ctx, mut renderer) = setup(&settings);
    let mut scene = Scene::new();
    let output = renderer.draw(&ctx, &mut scene, 0.016, WIDTH, HEIGHT).expect("draw");
    assert!(output.is_none());
}

#[test]
#[ignore = "requires a GPU adapter"]
fn unshadowed_light_takes_no_atlas_space() {
    let settings = small_settings(false);
    let (ctx, mut renderer) = setup(&settings);
    let template = renderer.material_template().clone();
    let mut scene = Scene::new();
    spawn_room(&ctx, &mut scene, &template);
    spawn_camera(&mut scene);
    let lamp = scene.spawn_point_light(
        Vec3::new(0.0, 2.0, 0.0),
        PointLight::new(Vec3::ONE, 20.0).without_shadows(),
    );

    let output = renderer
        .draw(&ctx, &mut scene, 0.016, WIDTH, HEIGHT)
        .expect("draw")
        .expect("camera present");
    let report = &output.lighting;
    assert_eq!(report.point_lights, vec![lamp]);
    assert_eq!(report.point_shadows.len(), 1);
    assert!(!report.point_shadows[0].is_enabled());
    assert_eq!(renderer.lighting().shadow_atlas().allocator().slots_used(), 0);
}

#[test]
#[ignore = "requires a GPU adapter"]
fn shadowed_lights_share_the_atlas() {
    let settings = small_settings(false);
    let (ctx, mut renderer) = setup(&settings);
    let template = renderer.material_template().clone();
    let mut scene = Scene::new();
    spawn_room(&ctx, &mut scene, &template);
    spawn_camera(&mut scene);
    scene.spawn_point_light(Vec3::new(1.0, 2.0, 0.0), PointLight::new(Vec3::ONE, 20.0));
    scene.spawn_point_light(Vec3::new(-1.0, 2.0, 0.0), PointLight::new(Vec3::ONE, 20.0));
    scene.spawn_directional_light(Vec3::new(0.3, -1.0, 0.2), DirectionalLight::new(Vec3::ONE));

    let output = renderer
        .draw(&ctx, &mut scene, 0.016, WIDTH, HEIGHT)
        .expect("draw")
        .expect("camera present");
    let report = &output.lighting;
    assert!(report.point_shadows.iter().all(|s| s.is_enabled()));
    assert!(report.directional_shadows.iter().all(|s| s.is_enabled()));
    assert_ne!(report.point_shadows[0].min_uv, report.point_shadows[1].min_uv);
    assert!(report.directional_shadows[0].atlas_page > report.point_shadows[1].atlas_page);
}

#[test]
#[ignore = "requires a GPU adapter"]
fn disabled_global_illumination_runs_direct_light_only() {
    let settings = small_settings(false);
    let (ctx, mut renderer) = setup(&settings);
    let template = renderer.material_template().clone();
    let mut scene = Scene::new();
    spawn_room(&ctx, &mut scene, &template);
    spawn_camera(&mut scene);
    scene.spawn_directional_light(Vec3::new(0.3, -1.0, 0.2), DirectionalLight::new(Vec3::ONE));

    let output = renderer
        .draw(&ctx, &mut scene, 0.016, WIDTH, HEIGHT)
        .expect("draw")
        .expect("camera present");
    assert!(renderer.voxelization().is_none());
    assert_eq!(output.lighting.result, LightingResult::Direct);
    assert!(output.lighting.executed.contains(&LightingPass::DirectLight));
    assert!(!output.lighting.executed.iter().any(LightingPass::is_indirect));
}

#[test]
#[ignore = "requires a GPU adapter"]
fn switching_global_illumination_off_falls_back_to_direct_light() {
    let settings = small_settings(true);
    let (ctx, mut renderer) = setup(&settings);
    let template = renderer.material_template().clone();
    let mut scene = Scene::new();
    spawn_room(&ctx, &mut scene, &template);
    let camera = scene.spawn_camera(
        Camera::perspective(60f32.to_radians(), 0.1, 100.0),
        Transform::looking_at(Vec3::new(0.0, 3.0, 6.0), Vec3::ZERO, Vec3::Y),
    );
    scene.spawn_directional_light(Vec3::new(0.3, -1.0, 0.2), DirectionalLight::new(Vec3::ONE));

    let first = renderer
        .draw(&ctx, &mut scene, 0.016, WIDTH, HEIGHT)
        .expect("draw")
        .expect("camera present");
    assert_eq!(first.lighting.result, LightingResult::Combined);
    drop(first);

    renderer.set_global_illumination(false);
    let far_away = Vec3::new(300.0, 3.0, -250.0);
    {
        let mut transform = scene
            .world
            .get::<&mut TransformComponent>(camera)
            .expect("camera transform");
        transform.0 = Transform::looking_at(far_away, far_away - Vec3::Z, Vec3::Y);
    }

    let second = renderer
        .draw(&ctx, &mut scene, 0.016, WIDTH, HEIGHT)
        .expect("draw")
        .expect("camera present");
    assert!(renderer.voxelization().is_some());
    assert_eq!(second.lighting.result, LightingResult::Direct);
    assert!(!second.lighting.executed.iter().any(LightingPass::is_indirect));
    assert!(second.lighting.directional_shadows[0].is_enabled());
    assert!(renderer.shadow_focus().contains_point(far_away));
}

#[test]
#[ignore = "requires a GPU adapter"]
fn global_illumination_voxelizes_visible_geometry() {
    let settings = small_settings(true);
    let (ctx, mut renderer) = setup(&settings);
    let template = renderer.material_template().clone();
    let mut scene = Scene::new();
    spawn_room(&ctx, &mut scene, &template);
    spawn_camera(&mut scene);
    scene.spawn_directional_light(Vec3::new(0.3, -1.0, 0.2), DirectionalLight::new(Vec3::ONE));

    let output = renderer
        .draw(&ctx, &mut scene, 0.016, WIDTH, HEIGHT)
        .expect("draw")
        .expect("camera present");
    assert_eq!(output.lighting.result, LightingResult::Combined);
    assert!(output.lighting.executed.contains(&LightingPass::ConeTrace));

    let voxels = renderer.voxelization_mut().expect("clipmap built");
    let count = voxels.read_voxel_count(&ctx).expect("counter read back");
    let capacity = voxels.layout().capacity();
    assert!(count > 0);
    assert!(count <= capacity);
}

#[test]
#[ignore = "requires a GPU adapter"]
fn material_inputs_reject_unknown_tags() {
    let settings = small_settings(false);
    let (ctx, renderer) = setup(&settings);
    let mut material = Material::new(renderer.material_template());
    assert!(!material.set_input("no_such_input", MaterialInput::Scalar(1.0)));
    assert!(!material.set_input(MaterialTemplate::ALBEDO, MaterialInput::Scalar(1.0)));
    assert!(material.set_input(MaterialTemplate::ALBEDO, MaterialInput::Color(Vec3::X)));
    assert_eq!(material.values().albedo_emissivity[..3], [1.0, 0.0, 0.0]);
    material.commit(&ctx).expect("commit");
    assert!(material.bind_group().is_some());
    assert!(!material.is_dirty());
}
