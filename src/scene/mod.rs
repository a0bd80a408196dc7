// scene/mod.rs

pub mod bounds;
pub mod camera;
pub mod components;
pub mod hierarchy;
pub mod scene;
pub mod transform;

pub use bounds::{Aabb, Frustum, Sphere};
pub use camera::{Camera, Projection};
pub use components::{DirectionalLight, MeshComponent, Name, PointLight, TransformComponent};
pub use hierarchy::VolumeHierarchy;
pub use scene::Scene;
pub use transform::Transform;
