use glam::Mat4;
use hecs::{Entity, World};
use rayon::prelude::*;

use crate::asset::Assets;
use crate::scene::bounds::{Aabb, Frustum, Sphere};
use crate::scene::components::{DirectionalLight, MeshComponent, PointLight, TransformComponent};

#[derive(Debug, Clone, Copy)]
pub enum Volume {
    Bounded(Aabb),
    /// Directional lights affect everything.
    Unbounded,
}

#[derive(Debug, Clone, Copy)]
pub struct VolumeEntry {
    pub entity: Entity,
    pub volume: Volume,
}

/// Snapshot of world space volumes answering intersection queries.
///
/// Queries are a linear scan split across the rayon pool; results keep the
/// order of the snapshot so frame output is deterministic.
#[derive(Debug, Default)]
pub struct VolumeHierarchy {
    entries: Vec<VolumeEntry>,
}

impl VolumeHierarchy {
    pub fn from_entries(entries: Vec<VolumeEntry>) -> Self {
        Self { entries }
    }

    pub(crate) fn meshes(world: &World, assets: &Assets) -> Self {
        let entries = world
            .query::<(&MeshComponent, Option<&TransformComponent>)>()
            .iter()
            .filter_map(|(entity, (mesh, transform))| {
                let bounds = assets.meshes.get(mesh.mesh)?.bounds();
                let matrix = transform.map(|t| t.0.matrix()).unwrap_or(Mat4::IDENTITY);
                Some(VolumeEntry {
                    entity,
                    volume: Volume::Bounded(bounds.transformed(&matrix)),
                })
            })
            .collect();
        Self { entries }
    }

    pub(crate) fn lights(world: &World) -> Self {
        let mut entries: Vec<VolumeEntry> = world
            .query::<(&PointLight, Option<&TransformComponent>)>()
            .iter()
            .map(|(entity, (light, transform))| {
                let position = transform.map(|t| t.0.translation).unwrap_or_default();
                let sphere = light.bounding_sphere(position);
                VolumeEntry {
                    entity,
                    volume: Volume::Bounded(Aabb::from_center_half_extents(
                        sphere.center,
                        glam::Vec3::splat(sphere.radius),
                    )),
                }
            })
            .collect();

        entries.extend(
            world
                .query::<&DirectionalLight>()
                .iter()
                .map(|(entity, _)| VolumeEntry {
                    entity,
                    volume: Volume::Unbounded,
                }),
        );

        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn intersections_frustum(&self, frustum: &Frustum) -> Vec<Entity> {
        self.filter(|aabb| frustum.intersects_aabb(aabb))
    }

    pub fn intersections_sphere(&self, sphere: &Sphere) -> Vec<Entity> {
        self.filter(|aabb| aabb.intersects_sphere(sphere))
    }

    pub fn intersections_aabb(&self, bounds: &Aabb) -> Vec<Entity> {
        self.filter(|aabb| aabb.intersects_aabb(bounds))
    }

    fn filter(&self, test: impl Fn(&Aabb) -> bool + Sync) -> Vec<Entity> {
        self.entries
            .par_iter()
            .filter(|entry| match &entry.volume {
                Volume::Bounded(aabb) => test(aabb),
                Volume::Unbounded => true,
            })
            .map(|entry| entry.entity)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn hierarchy(world: &mut World) -> (VolumeHierarchy, Entity, Entity, Entity) {
        let near = world.spawn(());
        let far = world.spawn(());
        let sun = world.spawn(());
        let entries = vec![
            VolumeEntry {
                entity: near,
                volume: Volume::Bounded(Aabb::from_center_half_extents(Vec3::ZERO, Vec3::ONE)),
            },
            VolumeEntry {
                entity: far,
                volume: Volume::Bounded(Aabb::from_center_half_extents(
                    Vec3::new(100.0, 0.0, 0.0),
                    Vec3::ONE,
                )),
            },
            VolumeEntry {
                entity: sun,
                volume: Volume::Unbounded,
            },
        ];
        (VolumeHierarchy::from_entries(entries), near, far, sun)
    }

    #[test]
    fn sphere_query_returns_overlaps_in_order() {
        let mut world = World::new();
        let (hierarchy, near, _far, sun) = hierarchy(&mut world);
        let hits = hierarchy.intersections_sphere(&Sphere::new(Vec3::new(1.5, 0.0, 0.0), 1.0));
        assert_eq!(hits, vec![near, sun]);
    }

    #[test]
    fn aabb_query_finds_distant_volume() {
        let mut world = World::new();
        let (hierarchy, _near, far, sun) = hierarchy(&mut world);
        let hits = hierarchy.intersections_aabb(&Aabb::from_center_half_extents(
            Vec3::new(99.0, 0.0, 0.0),
            Vec3::splat(0.5),
        ));
        assert_eq!(hits, vec![far, sun]);
    }
}
