//! Software implementation of the path-trace and tone-map kernels.
//!
//! Bit-for-bit deterministic for a given seed state, which makes it the
//! backend of choice for tests and for hosts without a usable GPU adapter.

use std::collections::HashMap;

use rayon::prelude::*;

use super::backend::{
    KernelSources, PathTraceBinding, PathTraceUniforms, PostProcessBinding, PostProcessUniforms,
    RenderBackend, TextureDesc, TextureFormat, TextureId, TextureInit,
};
use super::scene::{self, Material, MAX_BOUNCES};
use crate::util::{luminance, CameraBasis, Error, Result, Vec2, Vec3};

/// Display gamma applied after tone mapping.
const GAMMA: f32 = 2.2;

enum Texels {
    Float(Vec<f32>),
    Uint(Vec<u32>),
}

struct CpuTexture {
    desc: TextureDesc,
    texels: Texels,
}

/// Rayon-parallel software backend.
pub struct CpuBackend {
    textures: HashMap<TextureId, CpuTexture>,
    next_id: u32,
    compiled: bool,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            textures: HashMap::new(),
            next_id: 1,
            compiled: false,
        }
    }

    /// Number of live textures.
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Seed texels of a `Rgba32Uint` texture.
    pub fn seed_texels(&self, id: TextureId) -> Option<&[u32]> {
        match &self.textures.get(&id)?.texels {
            Texels::Uint(v) => Some(v.as_slice()),
            Texels::Float(_) => None,
        }
    }

    fn texture(&self, id: TextureId) -> Result<&CpuTexture> {
        self.textures
            .get(&id)
            .ok_or(Error::ResourceReleased("texture"))
    }

    fn float(&self, id: TextureId) -> Result<(&TextureDesc, &[f32])> {
        let tex = self.texture(id)?;
        match &tex.texels {
            Texels::Float(v) => Ok((&tex.desc, v.as_slice())),
            Texels::Uint(_) => Err(Error::gpu(format!("{} is not a float texture", tex.desc.label))),
        }
    }

    fn uint(&self, id: TextureId) -> Result<(&TextureDesc, &[u32])> {
        let tex = self.texture(id)?;
        match &tex.texels {
            Texels::Uint(v) => Ok((&tex.desc, v.as_slice())),
            Texels::Float(_) => Err(Error::gpu(format!("{} is not a seed texture", tex.desc.label))),
        }
    }

    fn ensure_compiled(&self) -> Result<()> {
        if self.compiled {
            Ok(())
        } else {
            Err(Error::SetupIncomplete("kernel programs"))
        }
    }
}

impl RenderBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn create_texture(&mut self, desc: &TextureDesc, init: TextureInit<'_>) -> Result<TextureId> {
        let len = desc.value_count()?;
        let texels = match (desc.format, init) {
            (TextureFormat::Rgba32Float, TextureInit::Zeroed) => Texels::Float(vec![0.0; len]),
            (TextureFormat::Rgba32Uint, TextureInit::Zeroed) => Texels::Uint(vec![0; len]),
            (TextureFormat::Rgba32Float, TextureInit::Float(data)) if data.len() == len => {
                Texels::Float(data.to_vec())
            }
            (TextureFormat::Rgba32Uint, TextureInit::Uint(data)) if data.len() == len => {
                Texels::Uint(data.to_vec())
            }
            _ => {
                return Err(Error::gpu(format!(
                    "initial data does not match {} ({}x{} {:?})",
                    desc.label, desc.width, desc.height, desc.format
                )))
            }
        };

        let id = TextureId(self.next_id);
        self.next_id += 1;
        self.textures.insert(id, CpuTexture { desc: *desc, texels });
        Ok(id)
    }

    fn release_texture(&mut self, id: TextureId) {
        self.textures.remove(&id);
    }

    fn compile(&mut self, _sources: &KernelSources) -> Result<()> {
        self.compiled = true;
        Ok(())
    }

    fn is_compiled(&self) -> bool {
        self.compiled
    }

    fn path_trace(&mut self, binding: &PathTraceBinding, uniforms: &PathTraceUniforms) -> Result<()> {
        self.ensure_compiled()?;

        let (desc, prev_color) = self.float(binding.source_color)?;
        let (_, prev_seed) = self.uint(binding.source_seed)?;
        let (env_desc, env) = self.float(binding.environment)?;
        for id in [binding.dest_color, binding.dest_seed, binding.output] {
            let d = &self.texture(id)?.desc;
            if (d.width, d.height) != (desc.width, desc.height) {
                return Err(Error::gpu(format!("{} size mismatch", d.label)));
            }
        }

        let width = desc.width as usize;
        let height = desc.height as usize;
        let mut color = vec![0.0f32; width * height * 4];
        let mut seeds = vec![0u32; width * height * 4];
        let environment = EnvLookup {
            width: env_desc.width as usize,
            height: env_desc.height as usize,
            texels: env,
        };
        let camera = CameraBasis::orbit(uniforms.theta, uniforms.phi, uniforms.move_x, uniforms.move_y);
        let aspect = width as f32 / height as f32;
        let done = uniforms.current_sample.saturating_sub(1) as f32;
        let total = done + uniforms.sample_max as f32;

        color
            .par_chunks_mut(width * 4)
            .zip(seeds.par_chunks_mut(width * 4))
            .enumerate()
            .for_each(|(y, (color_row, seed_row))| {
                for x in 0..width {
                    let i = (y * width + x) * 4;
                    let mut rng = XorShift128([
                        prev_seed[i],
                        prev_seed[i + 1],
                        prev_seed[i + 2],
                        prev_seed[i + 3],
                    ]);

                    let mut sum = Vec3::ZERO;
                    for _ in 0..uniforms.sample_max {
                        let jitter = Vec2::new(rng.next_f32(), rng.next_f32());
                        let ndc = (Vec2::new(x as f32, y as f32) + jitter)
                            / Vec2::new(width as f32, height as f32)
                            * 2.0
                            - 1.0;
                        let dir = camera.ray_dir(ndc, aspect);
                        sum += radiance(camera.origin, dir, &mut rng, &environment);
                    }

                    let prev = Vec3::new(prev_color[i], prev_color[i + 1], prev_color[i + 2]);
                    let avg = if total > 0.0 { (prev * done + sum) / total } else { prev };

                    let o = x * 4;
                    color_row[o..o + 4].copy_from_slice(&[avg.x, avg.y, avg.z, 1.0]);
                    seed_row[o..o + 4].copy_from_slice(&rng.0);
                }
            });

        let output = color.clone();
        store(&mut self.textures, binding.dest_color, Texels::Float(color))?;
        store(&mut self.textures, binding.dest_seed, Texels::Uint(seeds))?;
        store(&mut self.textures, binding.output, Texels::Float(output))
    }

    fn post_process(&mut self, binding: &PostProcessBinding, uniforms: &PostProcessUniforms) -> Result<()> {
        self.ensure_compiled()?;

        let (desc, raw) = self.float(binding.raw_color)?;
        let out_desc = &self.texture(binding.output)?.desc;
        if (out_desc.width, out_desc.height) != (desc.width, desc.height) {
            return Err(Error::gpu("output size mismatch"));
        }

        let mut mapped = vec![0.0f32; raw.len()];
        mapped
            .par_chunks_mut(4)
            .zip(raw.par_chunks(4))
            .for_each(|(dst, src)| {
                let c = tone_map(Vec3::new(src[0], src[1], src[2]), uniforms);
                dst.copy_from_slice(&[c.x, c.y, c.z, 1.0]);
            });

        store(&mut self.textures, binding.output, Texels::Float(mapped))
    }

    fn read_texture(&mut self, id: TextureId) -> Result<Vec<f32>> {
        self.float(id).map(|(_, v)| v.to_vec())
    }
}

fn store(textures: &mut HashMap<TextureId, CpuTexture>, id: TextureId, texels: Texels) -> Result<()> {
    let tex = textures
        .get_mut(&id)
        .ok_or(Error::ResourceReleased("render target"))?;
    tex.texels = texels;
    Ok(())
}

/// xorshift128 continued from the per-pixel seed texels.
struct XorShift128([u32; 4]);

impl XorShift128 {
    fn next_u32(&mut self) -> u32 {
        let s = &mut self.0;
        let mut t = s[3];
        let first = s[0];
        s[3] = s[2];
        s[2] = s[1];
        s[1] = first;
        t ^= t << 11;
        t ^= t >> 8;
        s[0] = t ^ first ^ (first >> 19);
        s[0]
    }

    fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / 16_777_216.0
    }
}

/// Nearest-texel equirectangular lookup, top row first.
struct EnvLookup<'a> {
    width: usize,
    height: usize,
    texels: &'a [f32],
}

impl EnvLookup<'_> {
    fn sample(&self, dir: Vec3) -> Vec3 {
        let u = 0.5 + dir.x.atan2(-dir.z) / std::f32::consts::TAU;
        let v = dir.y.clamp(-1.0, 1.0).acos() / std::f32::consts::PI;
        let px = ((u * self.width as f32) as usize).min(self.width - 1);
        let py = ((v * self.height as f32) as usize).min(self.height - 1);
        let i = (py * self.width + px) * 4;
        Vec3::new(self.texels[i], self.texels[i + 1], self.texels[i + 2])
    }
}

fn cosine_hemisphere(normal: Vec3, rng: &mut XorShift128) -> Vec3 {
    let r1 = std::f32::consts::TAU * rng.next_f32();
    let r2 = rng.next_f32();
    let r = r2.sqrt();
    let helper = if normal.x.abs() > 0.9 { Vec3::Y } else { Vec3::X };
    let tangent = helper.cross(normal).normalize();
    let bitangent = normal.cross(tangent);
    (tangent * (r1.cos() * r) + bitangent * (r1.sin() * r) + normal * (1.0 - r2).sqrt()).normalize()
}

fn random_in_sphere(rng: &mut XorShift128) -> Vec3 {
    let z = rng.next_f32() * 2.0 - 1.0;
    let a = std::f32::consts::TAU * rng.next_f32();
    let r = (1.0 - z * z).max(0.0).sqrt();
    Vec3::new(r * a.cos(), r * a.sin(), z) * rng.next_f32().cbrt()
}

fn radiance(mut origin: Vec3, mut dir: Vec3, rng: &mut XorShift128, env: &EnvLookup<'_>) -> Vec3 {
    let mut throughput = Vec3::ONE;
    for _ in 0..MAX_BOUNCES {
        let Some(hit) = scene::intersect(origin, dir) else {
            return throughput * env.sample(dir);
        };
        throughput *= hit.albedo;
        origin = scene::offset_origin(&hit);
        dir = match hit.material {
            Material::Diffuse => cosine_hemisphere(hit.normal, rng),
            Material::Metal(fuzz) => {
                let reflected = dir - hit.normal * 2.0 * dir.dot(hit.normal);
                let d = (reflected + random_in_sphere(rng) * fuzz).normalize();
                if d.dot(hit.normal) <= 0.0 {
                    return Vec3::ZERO;
                }
                d
            }
        };
    }
    Vec3::ZERO
}

/// Extended Reinhard operator on luminance, then display gamma.
fn tone_map(color: Vec3, u: &PostProcessUniforms) -> Vec3 {
    let lum = luminance(color);
    if lum <= 0.0 || u.luminance_average <= 0.0 {
        return Vec3::ZERO;
    }
    let scale = u.key_value / u.luminance_average;
    let scaled = lum * scale;
    let white = (u.luminance_max * scale).max(1e-4);
    let display = scaled * (1.0 + scaled / (white * white)) / (1.0 + scaled);
    let mapped = (color * (display / lum)).clamp(Vec3::ZERO, Vec3::ONE);
    mapped.powf(1.0 / GAMMA)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(format: TextureFormat) -> TextureDesc {
        TextureDesc { label: "test", width: 4, height: 2, format }
    }

    #[test]
    fn test_kernels_require_compile() {
        let mut backend = CpuBackend::new();
        let raw = backend.create_texture(&desc(TextureFormat::Rgba32Float), TextureInit::Zeroed).unwrap();
        let out = backend.create_texture(&desc(TextureFormat::Rgba32Float), TextureInit::Zeroed).unwrap();
        let binding = PostProcessBinding { raw_color: raw, output: out };
        let uniforms = PostProcessUniforms { luminance_average: 1.0, luminance_max: 1.0, key_value: 0.18, _pad: 0.0 };
        assert!(matches!(
            backend.post_process(&binding, &uniforms),
            Err(Error::SetupIncomplete(_))
        ));

        backend.compile(&KernelSources::builtin()).unwrap();
        backend.post_process(&binding, &uniforms).unwrap();
    }

    #[test]
    fn test_released_texture() {
        let mut backend = CpuBackend::new();
        let id = backend.create_texture(&desc(TextureFormat::Rgba32Float), TextureInit::Zeroed).unwrap();
        backend.release_texture(id);
        assert_eq!(backend.texture_count(), 0);
        assert!(matches!(backend.read_texture(id), Err(Error::ResourceReleased(_))));
    }

    #[test]
    fn test_init_length_checked() {
        let mut backend = CpuBackend::new();
        let short = [0.0f32; 3];
        assert!(backend
            .create_texture(&desc(TextureFormat::Rgba32Float), TextureInit::Float(&short))
            .is_err());
    }

    #[test]
    fn test_tone_map_range() {
        let u = PostProcessUniforms { luminance_average: 0.5, luminance_max: 8.0, key_value: 0.18, _pad: 0.0 };
        for v in [0.0f32, 0.01, 0.5, 4.0, 100.0] {
            let c = tone_map(Vec3::splat(v), &u);
            assert!(c.min_element() >= 0.0 && c.max_element() <= 1.0);
        }
        assert_eq!(tone_map(Vec3::ZERO, &u), Vec3::ZERO);
    }

    #[test]
    fn test_xorshift_continues() {
        let mut a = XorShift128([1, 2, 3, 4]);
        let mut b = XorShift128([1, 2, 3, 4]);
        let seq_a: Vec<u32> = (0..8).map(|_| a.next_u32()).collect();
        let seq_b: Vec<u32> = (0..8).map(|_| b.next_u32()).collect();
        assert_eq!(seq_a, seq_b);
        assert!(a.next_f32() < 1.0);
    }
}
