use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use hecs::Entity;

use crate::scene::{DirectionalLight, PointLight, Scene};
use crate::settings::LightOverflowPolicy;

pub const MAX_POINT_LIGHTS: usize = 32;
pub const MAX_DIRECTIONAL_LIGHTS: usize = 32;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct PointLightRaw {
    pub position: [f32; 3],
    pub cutoff: f32,
    pub color: [f32; 3],
    pub constant: f32,
    pub linear: f32,
    pub quadratic: f32,
    pub _pad: [f32; 2],
}

impl PointLightRaw {
    pub fn new(position: Vec3, light: &PointLight) -> Self {
        Self {
            position: position.to_array(),
            cutoff: light.cutoff,
            color: light.color.to_array(),
            constant: light.constant,
            linear: light.linear,
            quadratic: light.quadratic,
            _pad: [0.0; 2],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct DirectionalLightRaw {
    /// Direction the light travels in.
    pub direction: [f32; 3],
    pub _pad0: f32,
    pub color: [f32; 3],
    pub _pad1: f32,
}

impl DirectionalLightRaw {
    pub fn new(direction: Vec3, light: &DirectionalLight) -> Self {
        Self {
            direction: direction.normalize_or_zero().to_array(),
            _pad0: 0.0,
            color: light.color.to_array(),
            _pad1: 0.0,
        }
    }
}

/// Where a light's shadow lives in the atlas and how to project into it.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct ShadowRaw {
    /// View matrix for point lights, view-projection for directional lights.
    pub light_view: [[f32; 4]; 4],
    pub min_uv: [f32; 2],
    pub max_uv: [f32; 2],
    pub near: f32,
    pub far: f32,
    pub atlas_page: u32,
    pub enabled: u32,
}

pub type PointShadowRaw = ShadowRaw;
pub type DirectionalShadowRaw = ShadowRaw;

impl ShadowRaw {
    pub const DISABLED: ShadowRaw = ShadowRaw {
        light_view: [[0.0; 4]; 4],
        min_uv: [0.0; 2],
        max_uv: [0.0; 2],
        near: 0.0,
        far: 0.0,
        atlas_page: 0,
        enabled: 0,
    };

    pub fn is_enabled(&self) -> bool {
        self.enabled != 0
    }

    pub fn light_view(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.light_view)
    }
}

/// Counts shared by every lighting shader.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct LightParamsRaw {
    pub point_count: u32,
    pub directional_count: u32,
    pub atlas_size: f32,
    pub _pad: f32,
    pub ambient: [f32; 4],
}

#[derive(Debug, Clone, Copy)]
pub struct PackedPointLight {
    pub entity: Entity,
    pub position: Vec3,
    pub light: PointLight,
}

#[derive(Debug, Clone, Copy)]
pub struct PackedDirectionalLight {
    pub entity: Entity,
    pub direction: Vec3,
    pub light: DirectionalLight,
}

/// Lights selected for one frame, in slot order.
#[derive(Debug, Default)]
pub struct PackedLights {
    pub point: Vec<PackedPointLight>,
    pub directional: Vec<PackedDirectionalLight>,
    pub dropped_point: usize,
    pub dropped_directional: usize,
}

impl PackedLights {
    pub fn point_raw(&self) -> Vec<PointLightRaw> {
        self.point
            .iter()
            .map(|p| PointLightRaw::new(p.position, &p.light))
            .collect()
    }

    pub fn directional_raw(&self) -> Vec<DirectionalLightRaw> {
        self.directional
            .iter()
            .map(|d| DirectionalLightRaw::new(d.direction, &d.light))
            .collect()
    }
}

/// Fills the fixed-capacity light arrays from the visible light entities.
#[derive(Debug, Clone, Copy)]
pub struct LightPacker {
    policy: LightOverflowPolicy,
}

impl LightPacker {
    pub fn new(policy: LightOverflowPolicy) -> Self {
        Self { policy }
    }

    pub fn pack(&self, scene: &Scene, visible: &[Entity], camera_position: Vec3) -> PackedLights {
        let mut point = Vec::new();
        let mut directional = Vec::new();

        for &entity in visible {
            let world = scene.world_matrix(entity);
            if let Ok(light) = scene.world.get::<&PointLight>(entity) {
                point.push(PackedPointLight {
                    entity,
                    position: world.w_axis.truncate(),
                    light: *light,
                });
            } else if let Ok(light) = scene.world.get::<&DirectionalLight>(entity) {
                directional.push(PackedDirectionalLight {
                    entity,
                    direction: (-world.z_axis.truncate()).normalize_or_zero(),
                    light: *light,
                });
            }
        }

        let (point, dropped_point) = select_within_capacity(
            point,
            MAX_POINT_LIGHTS,
            self.policy,
            |p| p.position.distance_squared(camera_position),
        );
        // Directional lights have no position; only arrival order counts.
        let (directional, dropped_directional) = select_within_capacity(
            directional,
            MAX_DIRECTIONAL_LIGHTS,
            LightOverflowPolicy::DropNewest,
            |_| 0.0,
        );

        if dropped_point > 0 {
            log::warn!(
                "{} point lights over capacity {} dropped ({:?})",
                dropped_point,
                MAX_POINT_LIGHTS,
                self.policy
            );
        }
        if dropped_directional > 0 {
            log::warn!(
                "{} directional lights over capacity {} dropped",
                dropped_directional,
                MAX_DIRECTIONAL_LIGHTS
            );
        }

        PackedLights {
            point,
            directional,
            dropped_point,
            dropped_directional,
        }
    }
}

/// Keep at most `capacity` items according to `policy`. Returns the kept
/// items and how many were dropped.
pub fn select_within_capacity<T>(
    mut items: Vec<T>,
    capacity: usize,
    policy: LightOverflowPolicy,
    distance: impl Fn(&T) -> f32,
) -> (Vec<T>, usize) {
    if items.len() <= capacity {
        return (items, 0);
    }
    let dropped = items.len() - capacity;
    if policy == LightOverflowPolicy::DropFarthest {
        items.sort_by(|a, b| distance(a).total_cmp(&distance(b)));
    }
    items.truncate(capacity);
    (items, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Transform;

    #[test]
    fn raw_sizes_match_wgsl() {
        assert_eq!(std::mem::size_of::<PointLightRaw>(), 48);
        assert_eq!(std::mem::size_of::<DirectionalLightRaw>(), 32);
        assert_eq!(std::mem::size_of::<ShadowRaw>(), 96);
        assert_eq!(std::mem::size_of::<LightParamsRaw>(), 32);
    }

    #[test]
    fn under_capacity_keeps_everything_in_order() {
        let (kept, dropped) =
            select_within_capacity(vec![3.0, 1.0, 2.0], 4, LightOverflowPolicy::DropFarthest, |d| *d);
        assert_eq!(kept, vec![3.0, 1.0, 2.0]);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn drop_farthest_keeps_nearest() {
        let distances: Vec<f32> = (0..40).rev().map(|d| d as f32).collect();
        let (kept, dropped) =
            select_within_capacity(distances, 32, LightOverflowPolicy::DropFarthest, |d| *d);
        assert_eq!(dropped, 8);
        assert_eq!(kept.len(), 32);
        assert!(kept.iter().all(|d| *d < 32.0));
    }

    #[test]
    fn drop_newest_keeps_first() {
        let (kept, dropped) =
            select_within_capacity((0..40).collect(), 32, LightOverflowPolicy::DropNewest, |_| 0.0);
        assert_eq!(dropped, 8);
        assert_eq!(kept, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn packer_splits_kinds_and_caps_point_lights() {
        let mut scene = Scene::new();
        let mut visible = Vec::new();
        for i in 0..(MAX_POINT_LIGHTS + 3) {
            visible.push(scene.spawn_point_light(
                Vec3::new(i as f32, 0.0, 0.0),
                PointLight::new(Vec3::ONE, 5.0),
            ));
        }
        visible.push(scene.spawn_directional_light(
            Vec3::new(0.0, -1.0, 0.0),
            DirectionalLight::new(Vec3::ONE),
        ));
        let camera = scene.spawn_camera(
            crate::scene::Camera::perspective(1.0, 0.1, 100.0),
            Transform::from_translation(Vec3::ZERO),
        );
        visible.push(camera);

        let packed = LightPacker::new(LightOverflowPolicy::DropFarthest).pack(&scene, &visible, Vec3::ZERO);
        assert_eq!(packed.point.len(), MAX_POINT_LIGHTS);
        assert_eq!(packed.dropped_point, 3);
        assert!(packed.point.iter().all(|p| p.position.x < MAX_POINT_LIGHTS as f32));
        assert_eq!(packed.directional.len(), 1);
        assert!((packed.directional[0].direction - Vec3::new(0.0, -1.0, 0.0)).length() < 1e-5);

        let raw = packed.point_raw();
        for (slot, light) in raw.iter().zip(&packed.point) {
            assert_eq!(slot.position, light.position.to_array());
        }
    }
}
