use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Camera state read by every graphics stage through the uniform buffer of set 0
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct CameraUniform {
    pub view: Mat4,
    pub projection: Mat4,
    /// xyz world position, w vertical field of view in degrees
    pub position_fov: Vec4,
    pub width: u32,
    pub height: u32,
    pub znear: f32,
    pub zfar: f32,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightKind {
    Point = 0,
    Spot = 1,
}

/// Pushed once per light to the lighting pass, so it must stay within 128 bytes.
/// The lighting shader moves it into view space with the camera uniform.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct LightSource {
    pub world_position: Vec3,
    pub intensity: f32,
    pub color: Vec3,
    pub kind: u32,
    pub world_direction: Vec3,
    pub inner_angle: f32,
    pub outer_angle: f32,
    _padding: [f32; 3],
}

impl LightSource {
    pub fn point(world_position: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            world_position,
            color,
            intensity,
            kind: LightKind::Point as u32,
            world_direction: Vec3::ONE,
            ..Default::default()
        }
    }

    pub fn spot(world_position: Vec3, world_direction: Vec3, color: Vec3, intensity: f32, inner_angle: f32, outer_angle: f32) -> Self {
        Self {
            world_position,
            color,
            intensity,
            kind: LightKind::Spot as u32,
            world_direction,
            inner_angle,
            outer_angle: outer_angle.max(inner_angle),
            ..Default::default()
        }
    }
}
