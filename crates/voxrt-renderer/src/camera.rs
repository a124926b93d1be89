//! First-person camera and the uniform block it feeds to the raygen shader.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Vertical field of view in degrees.
pub const FOV_Y_DEGREES: f32 = 45.0;
pub const Z_NEAR: f32 = 0.1;
pub const Z_FAR: f32 = 100.0;

/// Degrees of rotation per unit of mouse motion.
pub const MOUSE_SENSITIVITY: f32 = 0.1;
/// World units travelled per second while a movement key is held.
pub const MOVE_SPEED: f32 = 10.0;
/// Pitch limit in degrees, short of straight up/down to keep `look_at` stable.
pub const PITCH_LIMIT: f32 = 89.5;

/// Camera block bound at binding 2: two column-major 4x4 matrices.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraUniform {
    pub inverse_view: Mat4,
    pub inverse_projection: Mat4,
}

impl CameraUniform {
    /// Build the uniform block from forward view and projection matrices.
    pub fn from_matrices(view: Mat4, projection: Mat4) -> Self {
        Self {
            inverse_view: view.inverse(),
            inverse_projection: projection.inverse(),
        }
    }

    /// Size of the block in bytes.
    pub const fn size() -> u64 {
        std::mem::size_of::<Self>() as u64
    }
}

/// Projection used for every frame: 45° vertical fov, near 0.1, far 100.
pub fn projection(aspect: f32) -> Mat4 {
    Mat4::perspective_rh_gl(FOV_Y_DEGREES.to_radians(), aspect, Z_NEAR, Z_FAR)
}

/// Movement keys currently held.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveInput {
    pub forward: bool,
    pub backward: bool,
    pub left: bool,
    pub right: bool,
}

/// Yaw/pitch camera driven by relative mouse motion and WASD.
#[derive(Debug, Clone)]
pub struct Camera {
    position: Vec3,
    front: Vec3,
    up: Vec3,
    yaw: f32,
    pitch: f32,
    pub input: MoveInput,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Vec3::new(0.0, 0.0, 3.0))
    }
}

impl Camera {
    /// Camera at `position` looking down -Z.
    pub fn new(position: Vec3) -> Self {
        let mut camera = Self {
            position,
            front: Vec3::NEG_Z,
            up: Vec3::Y,
            yaw: -90.0,
            pitch: 0.0,
            input: MoveInput::default(),
        };
        camera.front = camera.direction();
        camera
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn front(&self) -> Vec3 {
        self.front
    }

    pub fn yaw(&self) -> f32 {
        self.yaw
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    fn direction(&self) -> Vec3 {
        let (yaw, pitch) = (self.yaw.to_radians(), self.pitch.to_radians());
        Vec3::new(yaw.cos() * pitch.cos(), pitch.sin(), yaw.sin() * pitch.cos()).normalize()
    }

    /// Apply relative mouse motion.
    pub fn rotate(&mut self, dx: f64, dy: f64) {
        self.yaw += MOUSE_SENSITIVITY * dx as f32;
        self.pitch = (self.pitch + MOUSE_SENSITIVITY * dy as f32).clamp(-PITCH_LIMIT, PITCH_LIMIT);
        self.front = self.direction();
    }

    /// Advance the position by the held movement keys over `delta_time` seconds.
    pub fn update(&mut self, delta_time: f32) {
        let speed = MOVE_SPEED * delta_time;
        let right = self.front.cross(self.up).normalize();

        if self.input.forward {
            self.position += speed * self.front;
        }
        if self.input.backward {
            self.position -= speed * self.front;
        }
        if self.input.right {
            self.position += speed * right;
        }
        if self.input.left {
            self.position -= speed * right;
        }
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.front, self.up)
    }

    /// Uniform block for an output image of `width` x `height` pixels.
    pub fn uniform(&self, width: u32, height: u32) -> CameraUniform {
        let aspect = width as f32 / height.max(1) as f32;
        CameraUniform::from_matrices(self.view(), projection(aspect))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_vec(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-5
    }

    // ============================================================
    // Construction
    // ============================================================

    #[test]
    fn test_default_camera_looks_down_negative_z() {
        let camera = Camera::default();
        assert_eq!(camera.position(), Vec3::new(0.0, 0.0, 3.0));
        assert!(approx_vec(camera.front(), Vec3::NEG_Z));
        assert_eq!(camera.yaw(), -90.0);
        assert_eq!(camera.pitch(), 0.0);
    }

    #[test]
    fn test_uniform_block_is_two_matrices() {
        assert_eq!(CameraUniform::size(), 128);
    }

    // ============================================================
    // rotate
    // ============================================================

    #[test]
    fn test_rotate_scales_by_sensitivity() {
        let mut camera = Camera::default();
        camera.rotate(100.0, 50.0);
        assert!((camera.yaw() - (-80.0)).abs() < 1e-4);
        assert!((camera.pitch() - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_pitch_is_clamped() {
        let mut camera = Camera::default();
        camera.rotate(0.0, 10_000.0);
        assert_eq!(camera.pitch(), PITCH_LIMIT);
        camera.rotate(0.0, -100_000.0);
        assert_eq!(camera.pitch(), -PITCH_LIMIT);
    }

    #[test]
    fn test_front_stays_normalized() {
        let mut camera = Camera::default();
        camera.rotate(123.0, -321.0);
        assert!((camera.front().length() - 1.0).abs() < 1e-5);
    }

    // ============================================================
    // update
    // ============================================================

    #[test]
    fn test_forward_moves_along_front() {
        let mut camera = Camera::default();
        camera.input.forward = true;
        camera.update(0.5);
        assert!(approx_vec(camera.position(), Vec3::new(0.0, 0.0, -2.0)));
    }

    #[test]
    fn test_strafe_right_moves_along_positive_x() {
        let mut camera = Camera::default();
        camera.input.right = true;
        camera.update(0.1);
        assert!(approx_vec(camera.position(), Vec3::new(1.0, 0.0, 3.0)));
    }

    #[test]
    fn test_opposite_keys_cancel() {
        let mut camera = Camera::default();
        camera.input = MoveInput { forward: true, backward: true, left: true, right: true };
        camera.update(1.0);
        assert!(approx_vec(camera.position(), Vec3::new(0.0, 0.0, 3.0)));
    }

    #[test]
    fn test_no_input_no_motion() {
        let mut camera = Camera::default();
        camera.update(10.0);
        assert_eq!(camera.position(), Vec3::new(0.0, 0.0, 3.0));
    }

    // ============================================================
    // Matrices
    // ============================================================

    #[test]
    fn test_inverse_view_maps_origin_to_camera_position() {
        let camera = Camera::default();
        let uniform = camera.uniform(800, 600);
        let origin = uniform.inverse_view.transform_point3(Vec3::ZERO);
        assert!(approx_vec(origin, camera.position()));
    }

    #[test]
    fn test_inverse_matrices_undo_forward_matrices() {
        let camera = Camera::default();
        let uniform = camera.uniform(1920, 1080);
        let view_roundtrip = uniform.inverse_view * camera.view();
        let proj_roundtrip = uniform.inverse_projection * projection(1920.0 / 1080.0);
        assert!(view_roundtrip.abs_diff_eq(Mat4::IDENTITY, 1e-5));
        assert!(proj_roundtrip.abs_diff_eq(Mat4::IDENTITY, 1e-4));
    }

    #[test]
    fn test_identity_view_uniform() {
        let uniform = CameraUniform::from_matrices(Mat4::IDENTITY, projection(1.0));
        assert_eq!(uniform.inverse_view, Mat4::IDENTITY);
    }

    #[test]
    fn test_zero_height_does_not_divide_by_zero() {
        let uniform = Camera::default().uniform(640, 0);
        assert!(uniform.inverse_projection.is_finite());
    }
}
