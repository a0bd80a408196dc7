use std::f32::consts::PI;

use glam::Vec3;

use super::MeshData;
use crate::renderer::vertex::{v, Vertex};

pub fn sphere(segments: u32, rings: u32) -> MeshData {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();

    for ring in 0..=rings {
        let phi = PI * ring as f32 / rings as f32;
        let y = phi.cos();
        let ring_radius = phi.sin();

        for segment in 0..=segments {
            let theta = 2.0 * PI * segment as f32 / segments as f32;
            let x = ring_radius * theta.cos();
            let z = ring_radius * theta.sin();

            // Unit sphere: position doubles as normal.
            vertices.push(v(
                [x, y, z],
                [x, y, z],
                [segment as f32 / segments as f32, ring as f32 / rings as f32],
            ));
        }
    }

    for ring in 0..rings {
        for segment in 0..segments {
            let current = ring * (segments + 1) + segment;
            let next = current + segments + 1;

            indices.extend_from_slice(&[current, current + 1, next]);
            indices.extend_from_slice(&[current + 1, next + 1, next]);
        }
    }

    MeshData::new(vertices, indices)
}

/// Unit cube centred on the origin, one quad per face.
pub fn cube() -> MeshData {
    const FACES: [(Vec3, Vec3); 6] = [
        (Vec3::X, Vec3::Y),
        (Vec3::NEG_X, Vec3::Y),
        (Vec3::Y, Vec3::NEG_Z),
        (Vec3::NEG_Y, Vec3::Z),
        (Vec3::Z, Vec3::Y),
        (Vec3::NEG_Z, Vec3::Y),
    ];

    let mut vertices: Vec<Vertex> = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);

    for (normal, up) in FACES {
        let right = up.cross(normal);
        let base = vertices.len() as u32;
        let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
        for (u, w) in corners {
            let pos = normal * 0.5 + right * (0.5 * u) + up * (0.5 * w);
            vertices.push(v(
                pos.to_array(),
                normal.to_array(),
                [(u + 1.0) * 0.5, 1.0 - (w + 1.0) * 0.5],
            ));
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    MeshData::new(vertices, indices)
}

/// Square in the XZ plane facing +Y.
pub fn plane(size: f32) -> MeshData {
    let h = size * 0.5;
    let n = [0.0, 1.0, 0.0];
    let vertices = vec![
        v([-h, 0.0, h], n, [0.0, 1.0]),
        v([h, 0.0, h], n, [1.0, 1.0]),
        v([h, 0.0, -h], n, [1.0, 0.0]),
        v([-h, 0.0, -h], n, [0.0, 0.0]),
    ];
    MeshData::new(vertices, vec![0, 1, 2, 0, 2, 3])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn winding_matches_normals(data: &MeshData) -> bool {
        data.indices.chunks(3).all(|tri| {
            let a = Vec3::from(data.vertices[tri[0] as usize].pos);
            let b = Vec3::from(data.vertices[tri[1] as usize].pos);
            let c = Vec3::from(data.vertices[tri[2] as usize].pos);
            let face = (b - a).cross(c - a);
            let normal = Vec3::from(data.vertices[tri[0] as usize].normal);
            face.length_squared() < 1e-12 || face.dot(normal) > 0.0
        })
    }

    #[test]
    fn cube_counts_look_right() {
        let cube = cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        assert_eq!(cube.subsets[0].index_count, 36);
        let bounds = cube.bounds();
        assert!(bounds.min.abs_diff_eq(Vec3::splat(-0.5), 1e-6));
        assert!(bounds.max.abs_diff_eq(Vec3::splat(0.5), 1e-6));
    }

    #[test]
    fn primitives_are_counter_clockwise() {
        assert!(winding_matches_normals(&cube()));
        assert!(winding_matches_normals(&plane(2.0)));
        assert!(winding_matches_normals(&sphere(12, 8)));
    }
}
