// scene/components.rs
// Plain hecs components consumed by the renderer.

use glam::Vec3;

use crate::asset::{Handle, Mesh};
use crate::renderer::Material;
use crate::scene::bounds::Sphere;
use crate::scene::Transform;

// ============================================================================
// Core Rendering Components
// ============================================================================

/// Transform component (position, rotation, scale)
#[derive(Debug, Clone, Copy)]
pub struct TransformComponent(pub Transform);

/// Mesh with one material per subset. Subsets past the end of `materials`
/// reuse the last entry.
#[derive(Debug, Clone)]
pub struct MeshComponent {
    pub mesh: Handle<Mesh>,
    pub materials: Vec<Handle<Material>>,
}

impl MeshComponent {
    pub fn new(mesh: Handle<Mesh>, material: Handle<Material>) -> Self {
        Self {
            mesh,
            materials: vec![material],
        }
    }

    pub fn material_for_subset(&self, subset: usize) -> Option<Handle<Material>> {
        self.materials
            .get(subset)
            .or_else(|| self.materials.last())
            .copied()
    }
}

// ============================================================================
// Lighting Components
// ============================================================================

/// Point light with constant/linear/quadratic attenuation. Light is cut off
/// entirely past `cutoff`, which is also the bounding sphere radius.
#[derive(Debug, Clone, Copy)]
pub struct PointLight {
    pub color: Vec3,
    pub constant: f32,
    pub linear: f32,
    pub quadratic: f32,
    pub cutoff: f32,
    pub shadow_enabled: bool,
}

impl PointLight {
    pub fn new(color: Vec3, cutoff: f32) -> Self {
        Self {
            color,
            constant: 1.0,
            linear: 0.0,
            quadratic: 1.0,
            cutoff,
            shadow_enabled: true,
        }
    }

    pub fn without_shadows(mut self) -> Self {
        self.shadow_enabled = false;
        self
    }

    pub fn bounding_sphere(&self, position: Vec3) -> Sphere {
        Sphere::new(position, self.cutoff.max(0.0))
    }
}

/// Directional light. The direction is the owning transform's forward (-Z).
#[derive(Debug, Clone, Copy)]
pub struct DirectionalLight {
    pub color: Vec3,
    pub shadow_enabled: bool,
}

impl DirectionalLight {
    pub fn new(color: Vec3) -> Self {
        Self {
            color,
            shadow_enabled: true,
        }
    }
}

// ============================================================================
// Utility Components
// ============================================================================

/// Name component for debugging
#[derive(Debug, Clone)]
pub struct Name(pub String);

impl Name {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}
