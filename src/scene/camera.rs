use glam::{Mat4, Vec3};

use crate::error::{RenderError, Result};
use crate::scene::bounds::Frustum;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Projection {
    Perspective { fov_y_radians: f32 },
    /// `height` is the vertical extent of the view volume in world units.
    Orthographic { height: f32 },
}

/// Camera component. The view matrix is the inverse of the owning entity's
/// world transform; cameras look down their local -Z axis.
#[derive(Clone, Copy, Debug)]
pub struct Camera {
    pub projection: Projection,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    pub fn perspective(fov_y_radians: f32, near: f32, far: f32) -> Self {
        Self {
            projection: Projection::Perspective { fov_y_radians },
            near,
            far,
        }
    }

    pub fn orthographic(height: f32, near: f32, far: f32) -> Self {
        Self {
            projection: Projection::Orthographic { height },
            near,
            far,
        }
    }

    pub fn view(world: &Mat4) -> Mat4 {
        world.inverse()
    }

    pub fn proj(&self, aspect: f32) -> Result<Mat4> {
        if !(self.near >= 0.0 && self.far > self.near && aspect > 0.0) {
            return Err(RenderError::UnsupportedProjection(format!(
                "near {} / far {} / aspect {}",
                self.near, self.far, aspect
            )));
        }

        match self.projection {
            Projection::Perspective { fov_y_radians } => {
                if !(fov_y_radians > 0.0 && fov_y_radians < std::f32::consts::PI) {
                    return Err(RenderError::UnsupportedProjection(format!(
                        "perspective fov {fov_y_radians}"
                    )));
                }
                Ok(Mat4::perspective_rh(
                    fov_y_radians,
                    aspect,
                    self.near.max(f32::EPSILON),
                    self.far,
                ))
            }
            Projection::Orthographic { height } => {
                if height <= 0.0 {
                    return Err(RenderError::UnsupportedProjection(format!(
                        "orthographic height {height}"
                    )));
                }
                let half_h = height * 0.5;
                let half_w = half_h * aspect;
                Ok(Mat4::orthographic_rh(
                    -half_w, half_w, -half_h, half_h, self.near, self.far,
                ))
            }
        }
    }

    pub fn view_proj(&self, world: &Mat4, aspect: f32) -> Result<Mat4> {
        Ok(self.proj(aspect)? * Self::view(world))
    }

    pub fn view_frustum(&self, world: &Mat4, aspect: f32) -> Result<Frustum> {
        Ok(Frustum::from_view_proj(&self.view_proj(world, aspect)?))
    }

    pub fn position(world: &Mat4) -> Vec3 {
        world.w_axis.truncate()
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::perspective(60f32.to_radians(), 0.1, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_proj_is_reasonable() {
        let cam = Camera::default();
        let world = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 3.0), Vec3::ZERO, Vec3::Y).inverse();
        let vp = cam.view_proj(&world, 16.0 / 9.0).expect("valid projection");
        let id = vp * vp.inverse();
        assert!(id.abs_diff_eq(Mat4::IDENTITY, 1e-4));
        assert!(Camera::position(&world).abs_diff_eq(Vec3::new(0.0, 0.0, 3.0), 1e-5));
    }

    #[test]
    fn orthographic_maps_extent_to_ndc() {
        let cam = Camera::orthographic(4.0, 0.0, 10.0);
        let proj = cam.proj(2.0).expect("valid projection");
        let corner = proj.project_point3(Vec3::new(4.0, 2.0, -10.0));
        assert!(corner.abs_diff_eq(Vec3::new(1.0, 1.0, 1.0), 1e-5));
    }

    #[test]
    fn degenerate_projection_is_rejected() {
        let cam = Camera::perspective(0.0, 0.1, 10.0);
        assert!(matches!(
            cam.proj(1.0),
            Err(RenderError::UnsupportedProjection(_))
        ));
        let inverted = Camera::orthographic(1.0, 5.0, 1.0);
        assert!(inverted.proj(1.0).is_err());
    }
}
