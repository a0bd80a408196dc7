// renderer/uniforms.rs
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Per-pass camera data shared by geometry passes.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct FrameUniform {
    pub view_proj: [[f32; 4]; 4],
    pub inverse_view_proj: [[f32; 4]; 4],
    pub camera_position: [f32; 4],
    /// width, height, 1/width, 1/height
    pub resolution: [f32; 4],
}

impl FrameUniform {
    pub fn new(view_proj: Mat4, camera_position: Vec3, width: u32, height: u32) -> Self {
        let w = width.max(1) as f32;
        let h = height.max(1) as f32;
        Self {
            view_proj: view_proj.to_cols_array_2d(),
            inverse_view_proj: view_proj.inverse().to_cols_array_2d(),
            camera_position: camera_position.extend(1.0).to_array(),
            resolution: [w, h, 1.0 / w, 1.0 / h],
        }
    }
}

/// Per-object matrices, written once per subset draw.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct ObjectUniform {
    pub world: [[f32; 4]; 4],
    pub world_view_proj: [[f32; 4]; 4],
    pub normal_matrix: [[f32; 4]; 4],
}

impl ObjectUniform {
    pub fn new(world: Mat4, view_proj: Mat4) -> Self {
        Self {
            world: world.to_cols_array_2d(),
            world_view_proj: (view_proj * world).to_cols_array_2d(),
            normal_matrix: world.inverse().transpose().to_cols_array_2d(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_sizes_match_wgsl_layout() {
        // 2 * mat4x4<f32> + 2 * vec4<f32>
        assert_eq!(std::mem::size_of::<FrameUniform>(), 160);
        // 3 * mat4x4<f32>
        assert_eq!(std::mem::size_of::<ObjectUniform>(), 192);
    }

    #[test]
    fn normal_matrix_undoes_non_uniform_scale() {
        let world = Mat4::from_scale(Vec3::new(2.0, 1.0, 1.0));
        let object = ObjectUniform::new(world, Mat4::IDENTITY);
        let normal = Mat4::from_cols_array_2d(&object.normal_matrix)
            .transform_vector3(Vec3::new(1.0, 1.0, 0.0));
        assert!((normal.x - 0.5).abs() < 1e-6);
        assert!((normal.y - 1.0).abs() < 1e-6);
    }
}
