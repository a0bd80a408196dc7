use glam::{Mat4, Vec3};
use hecs::{Entity, World};

use crate::asset::{Assets, Handle, Mesh};
use crate::renderer::Material;
use crate::scene::components::{
    DirectionalLight, MeshComponent, Name, PointLight, TransformComponent,
};
use crate::scene::hierarchy::VolumeHierarchy;
use crate::scene::{Camera, Transform};

/// ECS world plus the assets it references and the active camera.
pub struct Scene {
    pub world: World,
    pub assets: Assets,
    main_camera: Option<Entity>,
}

impl Scene {
    pub fn new() -> Self {
        Self {
            world: World::new(),
            assets: Assets::default(),
            main_camera: None,
        }
    }

    pub fn spawn_mesh(
        &mut self,
        name: &str,
        mesh: Handle<Mesh>,
        materials: Vec<Handle<Material>>,
        transform: Transform,
    ) -> Entity {
        self.world.spawn((
            Name::new(name),
            MeshComponent { mesh, materials },
            TransformComponent(transform),
        ))
    }

    pub fn spawn_point_light(&mut self, position: Vec3, light: PointLight) -> Entity {
        self.world.spawn((
            Name::new("PointLight"),
            light,
            TransformComponent(Transform::from_translation(position)),
        ))
    }

    pub fn spawn_directional_light(&mut self, direction: Vec3, light: DirectionalLight) -> Entity {
        let up = if direction.normalize_or_zero().abs().dot(Vec3::Y) > 0.95 {
            Vec3::Z
        } else {
            Vec3::Y
        };
        let transform = Transform::looking_at(Vec3::ZERO, direction, up);
        self.world.spawn((
            Name::new("DirectionalLight"),
            light,
            TransformComponent(transform),
        ))
    }

    /// Spawn a camera entity. The first camera becomes the main camera.
    pub fn spawn_camera(&mut self, camera: Camera, transform: Transform) -> Entity {
        let entity = self
            .world
            .spawn((Name::new("Camera"), camera, TransformComponent(transform)));
        if self.main_camera.is_none() {
            self.main_camera = Some(entity);
        }
        entity
    }

    pub fn set_main_camera(&mut self, camera: Option<Entity>) {
        self.main_camera = camera;
    }

    /// The main camera and its world matrix, if one is set and still alive.
    pub fn main_camera(&self) -> Option<(Camera, Mat4)> {
        let entity = self.main_camera?;
        let camera = *self.world.get::<&Camera>(entity).ok()?;
        let world = self.world_matrix(entity);
        Some((camera, world))
    }

    pub fn world_matrix(&self, entity: Entity) -> Mat4 {
        self.world
            .get::<&TransformComponent>(entity)
            .map(|t| t.0.matrix())
            .unwrap_or(Mat4::IDENTITY)
    }

    pub fn mesh_hierarchy(&self) -> VolumeHierarchy {
        VolumeHierarchy::meshes(&self.world, &self.assets)
    }

    pub fn light_hierarchy(&self) -> VolumeHierarchy {
        VolumeHierarchy::lights(&self.world)
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_camera_becomes_main() {
        let mut scene = Scene::new();
        assert!(scene.main_camera().is_none());

        let first = scene.spawn_camera(Camera::default(), Transform::from_translation(Vec3::Z));
        scene.spawn_camera(Camera::default(), Transform::default());
        let (_, world) = scene.main_camera().expect("main camera");
        assert!(Camera::position(&world).abs_diff_eq(Vec3::Z, 1e-6));

        scene.world.despawn(first).expect("camera exists");
        assert!(scene.main_camera().is_none());
    }

    #[test]
    fn light_hierarchy_culls_point_lights_by_cutoff() {
        let mut scene = Scene::new();
        let lit = scene.spawn_point_light(Vec3::ZERO, PointLight::new(Vec3::ONE, 2.0));
        scene.spawn_point_light(Vec3::new(50.0, 0.0, 0.0), PointLight::new(Vec3::ONE, 2.0));
        let sun = scene.spawn_directional_light(Vec3::NEG_Y, DirectionalLight::new(Vec3::ONE));

        let hits = scene
            .light_hierarchy()
            .intersections_sphere(&crate::scene::bounds::Sphere::new(Vec3::X, 0.5));
        assert_eq!(hits.len(), 2);
        assert!(hits.contains(&lit));
        assert!(hits.contains(&sun));
    }

    #[test]
    fn directional_light_faces_direction() {
        let mut scene = Scene::new();
        let dir = Vec3::new(0.3, -1.0, 0.2).normalize();
        let sun = scene.spawn_directional_light(dir, DirectionalLight::new(Vec3::ONE));
        let transform = scene.world.get::<&TransformComponent>(sun).expect("transform").0;
        assert!(transform.forward().abs_diff_eq(dir, 1e-5));
    }
}
