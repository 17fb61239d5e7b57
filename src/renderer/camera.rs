use glam::{Mat4, Vec3, Vec4};
use crate::renderer::shader_data::CameraUniform;

/// Perspective camera with a reversed depth range: the far plane maps to depth 0
/// and the near plane to depth 1, paired with a GREATER depth test.
#[derive(Debug, Clone)]
pub struct Camera {
    pub width: u32,
    pub height: u32,
    pub world_position: Vec3,
    pub look_direction: Vec3,
    pub view_up: Vec3,
    pub fov_y_deg: f32,
    pub znear: f32,
    pub zfar: f32,

    view: Mat4,
    projection: Mat4,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new()
    }
}

impl Camera {
    const DEFAULT_FOV_Y_DEG: f32 = 70.0;

    pub fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            world_position: Vec3::ZERO,
            look_direction: Vec3::Y,
            view_up: Vec3::Z,
            fov_y_deg: Self::DEFAULT_FOV_Y_DEG,
            // 1 mm
            znear: 0.001,
            // About a light-year
            zfar: 1.0e16,

            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
        }
    }

    pub fn look_at(&mut self, target: Vec3) {
        let direction = target - self.world_position;
        if direction.length_squared() > 0.0 {
            self.look_direction = direction.normalize();
        }
    }

    pub fn refresh_view_matrix(&mut self) {
        self.view = Mat4::look_to_rh(self.world_position, self.look_direction, self.view_up);
    }

    pub fn refresh_projection_matrix(&mut self) {
        let aspect_ratio = if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        };
        // Near and far swapped for reverse depth
        let mut projection = Mat4::perspective_rh(
            self.fov_y_deg.to_radians(),
            aspect_ratio,
            self.zfar,
            self.znear,
        );
        // Vulkan clip space has y pointing down
        projection.y_axis.y *= -1.0;
        self.projection = projection;
    }

    pub fn view_matrix(&self) -> Mat4 {
        self.view
    }

    pub fn projection_matrix(&self) -> Mat4 {
        self.projection
    }

    pub fn uniform(&self) -> CameraUniform {
        CameraUniform {
            view: self.view,
            projection: self.projection,
            position_fov: Vec4::new(
                self.world_position.x,
                self.world_position.y,
                self.world_position.z,
                self.fov_y_deg,
            ),
            width: self.width,
            height: self.height,
            znear: self.znear,
            zfar: self.zfar,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> Camera {
        let mut camera = Camera::new();
        camera.width = 1280;
        camera.height = 720;
        camera.world_position = Vec3::new(0.0, -10.0, 0.0);
        camera.look_at(Vec3::ZERO);
        camera.refresh_view_matrix();
        camera.refresh_projection_matrix();
        camera
    }

    fn depth_of(camera: &Camera, point: Vec3) -> f32 {
        let clip = camera.projection_matrix() * camera.view_matrix() * point.extend(1.0);
        clip.z / clip.w
    }

    #[test]
    fn nearer_points_get_greater_depth() {
        let camera = camera();
        let near = depth_of(&camera, Vec3::new(0.0, -9.0, 0.0));
        let far = depth_of(&camera, Vec3::new(0.0, 100.0, 0.0));
        assert!(near > far);
        assert!((0.0..=1.0).contains(&near));
        assert!((0.0..=1.0).contains(&far));
    }

    #[test]
    fn projection_flips_y() {
        let camera = camera();
        assert!(camera.projection_matrix().y_axis.y < 0.0);
    }

    #[test]
    fn zero_height_does_not_divide_by_zero() {
        let mut camera = Camera::new();
        camera.refresh_projection_matrix();
        assert!(camera.projection_matrix().is_finite());
    }

    #[test]
    fn uniform_carries_the_matrices() {
        let camera = camera();
        let uniform = camera.uniform();
        assert_eq!(uniform.view, camera.view_matrix());
        assert_eq!(uniform.width, 1280);
        assert_eq!(uniform.position_fov.w, 70.0);
    }
}
