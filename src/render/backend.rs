//! Kernel interface between the render invoker and a device.
//!
//! A backend owns textures behind opaque [`TextureId`] handles, compiles the
//! two kernel programs once, and dispatches them with explicit bindings. The
//! invoker never sees device objects, which keeps the ping-pong bookkeeping
//! identical for the wgpu and software implementations.

use bytemuck::{Pod, Zeroable};

use crate::util::{Error, Result};

/// Largest texture edge the renderer allocates.
pub const MAX_TEXTURE_DIMENSION: u32 = 8192;

/// Reject frame sizes that are empty or exceed [`MAX_TEXTURE_DIMENSION`].
pub fn check_frame_size(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 || width > MAX_TEXTURE_DIMENSION || height > MAX_TEXTURE_DIMENSION {
        return Err(Error::InvalidDimensions { width, height });
    }
    Ok(())
}

/// Opaque handle to a backend-owned 2D texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

/// Texel formats used by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    /// Linear float color, 4 channels.
    Rgba32Float,
    /// Per-pixel RNG state, 4 channels.
    Rgba32Uint,
}

impl TextureFormat {
    pub const fn bytes_per_texel(self) -> u32 {
        match self {
            Self::Rgba32Float | Self::Rgba32Uint => 16,
        }
    }
}

/// Texture size and format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl TextureDesc {
    pub fn texel_count(&self) -> Result<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .ok_or(Error::InvalidDimensions { width: self.width, height: self.height })
    }

    /// Number of 32-bit channel values (4 per texel).
    pub fn value_count(&self) -> Result<usize> {
        self.texel_count()?
            .checked_mul(4)
            .ok_or(Error::InvalidDimensions { width: self.width, height: self.height })
    }
}

/// Initial texture contents, row-major in texture row order.
#[derive(Debug, Clone, Copy)]
pub enum TextureInit<'a> {
    Zeroed,
    Float(&'a [f32]),
    Uint(&'a [u32]),
}

/// Program sources handed to [`RenderBackend::compile`].
#[derive(Debug, Clone, Copy)]
pub struct KernelSources {
    pub path_trace: &'static str,
    pub post_process: &'static str,
}

impl KernelSources {
    /// Built-in WGSL kernels.
    pub const fn builtin() -> Self {
        Self {
            path_trace: include_str!("kernels/path_trace.wgsl"),
            post_process: include_str!("kernels/post_process.wgsl"),
        }
    }
}

/// Uniforms for the path-trace kernel (matches the WGSL `PathTraceParams`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PathTraceUniforms {
    /// 1-based index of the first sample produced by this call.
    pub current_sample: u32,
    /// Samples accumulated by this call.
    pub sample_max: u32,
    pub width: u32,
    pub height: u32,
    pub theta: f32,
    pub phi: f32,
    pub move_x: f32,
    pub move_y: f32,
}

/// Uniforms for the post-process (tone-map) kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PostProcessUniforms {
    pub luminance_average: f32,
    pub luminance_max: f32,
    pub key_value: f32,
    pub _pad: f32,
}

/// Texture bindings for one path-trace dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathTraceBinding {
    /// Feedback inputs: previous running average and RNG state.
    pub source_color: TextureId,
    pub source_seed: TextureId,
    /// Render targets for this iteration.
    pub dest_color: TextureId,
    pub dest_seed: TextureId,
    /// Pre-tonemap slot of the output buffer.
    pub output: TextureId,
    pub environment: TextureId,
}

/// Texture bindings for one post-process dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostProcessBinding {
    pub raw_color: TextureId,
    pub output: TextureId,
}

/// Device-side kernel interface.
pub trait RenderBackend: Send {
    /// Short human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Create a texture with the given initial contents.
    fn create_texture(&mut self, desc: &TextureDesc, init: TextureInit<'_>) -> Result<TextureId>;

    /// Drop a texture. Unknown ids are ignored.
    fn release_texture(&mut self, id: TextureId);

    /// Compile both kernel programs. Idempotent.
    fn compile(&mut self, sources: &KernelSources) -> Result<()>;

    /// Whether [`compile`](Self::compile) has succeeded.
    fn is_compiled(&self) -> bool;

    /// Run one path-trace iteration.
    fn path_trace(&mut self, binding: &PathTraceBinding, uniforms: &PathTraceUniforms) -> Result<()>;

    /// Tone-map `binding.raw_color` into `binding.output`.
    fn post_process(&mut self, binding: &PostProcessBinding, uniforms: &PostProcessUniforms) -> Result<()>;

    /// Read a float texture back as RGBA f32, bottom row first.
    fn read_texture(&mut self, id: TextureId) -> Result<Vec<f32>>;
}
