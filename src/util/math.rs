//! Camera and luminance math shared by the render kernels and the invoker.

pub use glam::{Vec2, Vec3};

use bytemuck::{Pod, Zeroable};

/// Rec.709-ish weights used for scene luminance statistics.
pub const LUMINANCE_WEIGHTS: Vec3 = Vec3::new(0.27, 0.67, 0.06);

/// Distance of the orbit camera from its target.
pub const ORBIT_DISTANCE: f32 = 4.0;

/// Vertical field of view in radians.
pub const FOV_Y: f32 = std::f32::consts::FRAC_PI_4;

/// Luminance of a linear RGB color.
#[inline]
pub fn luminance(rgb: Vec3) -> f32 {
    LUMINANCE_WEIGHTS.dot(rgb)
}

/// Scene luminance statistics feeding the tone-mapping pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LuminanceStats {
    /// Log-average (geometric mean) luminance.
    pub average: f32,
    /// Maximum luminance.
    pub max: f32,
}

impl LuminanceStats {
    /// Compute statistics over an RGBA float buffer.
    ///
    /// A floor of `f32::MIN_POSITIVE` keeps black pixels out of `ln(0)`.
    pub fn from_rgba(pixels: &[f32]) -> Self {
        let count = pixels.len() / 4;
        if count == 0 {
            return Self { average: f32::MIN_POSITIVE, max: 0.0 };
        }

        let mut log_sum = 0.0f64;
        let mut max = 0.0f32;
        for px in pixels.chunks_exact(4) {
            let lum = luminance(Vec3::new(px[0], px[1], px[2]));
            log_sum += f64::from((f32::MIN_POSITIVE + lum.max(0.0)).ln());
            max = max.max(lum);
        }

        Self {
            average: (log_sum / count as f64).exp() as f32,
            max,
        }
    }
}

/// Orbit camera basis derived from yaw/pitch and pan offsets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraBasis {
    pub origin: Vec3,
    pub forward: Vec3,
    pub right: Vec3,
    pub up: Vec3,
}

impl CameraBasis {
    /// Build the camera looking at the (panned) origin.
    ///
    /// `theta` rotates around the world Y axis, `phi` tilts toward the poles
    /// (clamped short of them), and the pan offsets slide the target along the
    /// camera's right/up axes.
    pub fn orbit(theta: f32, phi: f32, move_x: f32, move_y: f32) -> Self {
        let limit = std::f32::consts::FRAC_PI_2 - 1e-3;
        let phi = phi.clamp(-limit, limit);

        let offset = Vec3::new(
            phi.cos() * theta.sin(),
            phi.sin(),
            phi.cos() * theta.cos(),
        ) * ORBIT_DISTANCE;

        let forward = (-offset).normalize();
        let right = forward.cross(Vec3::Y).normalize();
        let up = right.cross(forward);

        let target = right * move_x + up * move_y;
        Self {
            origin: target + offset,
            forward,
            right,
            up,
        }
    }

    /// Primary ray direction for normalized device coordinates in [-1, 1].
    pub fn ray_dir(&self, ndc: Vec2, aspect: f32) -> Vec3 {
        let half = (FOV_Y * 0.5).tan();
        (self.forward + self.right * ndc.x * half * aspect + self.up * ndc.y * half).normalize()
    }
}
