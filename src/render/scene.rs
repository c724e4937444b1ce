//! Fixed demo scene traced by the software kernel.
//!
//! Mirrors the constants in `kernels/path_trace.wgsl`; keep both in sync.

use crate::util::Vec3;

/// Bounce limit per camera path.
pub const MAX_BOUNCES: u32 = 4;

/// Ground plane height.
pub const GROUND_Y: f32 = -1.0;
pub const GROUND_ALBEDO: Vec3 = Vec3::new(0.55, 0.55, 0.55);

const RAY_EPSILON: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Material {
    Diffuse,
    /// Mirror with a fuzz radius.
    Metal(f32),
}

#[derive(Debug, Clone, Copy)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
    pub albedo: Vec3,
    pub material: Material,
}

pub const SPHERES: [Sphere; 3] = [
    Sphere {
        center: Vec3::new(0.0, 0.0, 0.0),
        radius: 1.0,
        albedo: Vec3::new(0.8, 0.3, 0.3),
        material: Material::Diffuse,
    },
    Sphere {
        center: Vec3::new(2.2, -0.3, 0.5),
        radius: 0.7,
        albedo: Vec3::new(0.9, 0.9, 0.9),
        material: Material::Metal(0.05),
    },
    Sphere {
        center: Vec3::new(-2.0, -0.4, -0.6),
        radius: 0.6,
        albedo: Vec3::new(0.3, 0.5, 0.8),
        material: Material::Diffuse,
    },
];

/// Surface hit record.
#[derive(Debug, Clone, Copy)]
pub struct Hit {
    pub t: f32,
    pub point: Vec3,
    pub normal: Vec3,
    pub albedo: Vec3,
    pub material: Material,
}

fn hit_sphere(sphere: &Sphere, origin: Vec3, dir: Vec3, t_max: f32) -> Option<f32> {
    let oc = origin - sphere.center;
    let b = oc.dot(dir);
    let c = oc.length_squared() - sphere.radius * sphere.radius;
    let disc = b * b - c;
    if disc < 0.0 {
        return None;
    }
    let sq = disc.sqrt();
    [-b - sq, -b + sq]
        .into_iter()
        .find(|&t| t > RAY_EPSILON && t < t_max)
}

/// Closest intersection along a normalized ray.
pub fn intersect(origin: Vec3, dir: Vec3) -> Option<Hit> {
    let mut best: Option<Hit> = None;
    let mut t_max = f32::INFINITY;

    if dir.y.abs() > 1e-6 {
        let t = (GROUND_Y - origin.y) / dir.y;
        if t > RAY_EPSILON {
            t_max = t;
            best = Some(Hit {
                t,
                point: origin + dir * t,
                normal: Vec3::Y,
                albedo: GROUND_ALBEDO,
                material: Material::Diffuse,
            });
        }
    }

    for sphere in &SPHERES {
        if let Some(t) = hit_sphere(sphere, origin, dir, t_max) {
            t_max = t;
            let point = origin + dir * t;
            best = Some(Hit {
                t,
                point,
                normal: (point - sphere.center) / sphere.radius,
                albedo: sphere.albedo,
                material: sphere.material,
            });
        }
    }

    best
}

/// Offset a secondary ray origin off the surface.
#[inline]
pub fn offset_origin(hit: &Hit) -> Vec3 {
    hit.point + hit.normal * RAY_EPSILON
}
