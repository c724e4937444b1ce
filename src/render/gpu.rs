//! wgpu compute backend.
//!
//! Creates and manages the two compute pipelines, the storage textures behind
//! [`TextureId`] handles, and padded-row read-back through a staging buffer.
//! Device work runs inside validation and out-of-memory error scopes, so a
//! rejected call surfaces as [`Error::Gpu`] instead of a panic.
//!
//! ## Usage
//! ```ignore
//! let mut gpu = WgpuBackend::new().await?;
//! gpu.compile(&KernelSources::builtin())?;
//! let id = gpu.create_texture(&desc, TextureInit::Zeroed)?;
//! gpu.path_trace(&binding, &uniforms)?; // one progressive iteration
//! let texels = gpu.read_texture(output)?;
//! ```

use std::collections::HashMap;

use wgpu::util::DeviceExt;

use super::backend::{
    KernelSources, PathTraceBinding, PathTraceUniforms, PostProcessBinding, PostProcessUniforms,
    RenderBackend, TextureDesc, TextureFormat, TextureId, TextureInit,
};
use crate::util::{Error, Result};

/// Workgroup size (must match @workgroup_size in WGSL).
const WG_SIZE: u32 = 8;

struct GpuTexture {
    desc: TextureDesc,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

struct Pipelines {
    path_trace: wgpu::ComputePipeline,
    path_trace_layout: wgpu::BindGroupLayout,
    post_process: wgpu::ComputePipeline,
    post_process_layout: wgpu::BindGroupLayout,
}

/// Path trace compute backend on a headless wgpu device.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    textures: HashMap<TextureId, GpuTexture>,
    next_id: u32,
    pipelines: Option<Pipelines>,
    path_trace_uniforms: wgpu::Buffer,
    post_process_uniforms: wgpu::Buffer,
}

fn map_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::Rgba32Uint => wgpu::TextureFormat::Rgba32Uint,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn sampled_entry(binding: u32, sample_type: wgpu::TextureSampleType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            multisampled: false,
            view_dimension: wgpu::TextureViewDimension::D2,
            sample_type,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, format: wgpu::TextureFormat) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        count: None,
    }
}

/// Reject textures the device cannot hold.
fn check_texture_limit(desc: &TextureDesc, max_dimension: u32) -> Result<()> {
    if desc.width > max_dimension || desc.height > max_dimension {
        return Err(Error::InvalidDimensions { width: desc.width, height: desc.height });
    }
    Ok(())
}

const FLOAT_UNFILTERED: wgpu::TextureSampleType = wgpu::TextureSampleType::Float { filterable: false };

impl WgpuBackend {
    /// Request a high-performance adapter and a device with default limits.
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| Error::gpu(format!("no suitable GPU adapter: {e}")))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("pathstream device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                ..Default::default()
            })
            .await
            .map_err(|e| Error::gpu(format!("device request failed: {e}")))?;

        let adapter_name = adapter.get_info().name;
        tracing::info!(adapter = %adapter_name, "GPU device ready");

        let path_trace_uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pt_params"),
            size: std::mem::size_of::<PathTraceUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let post_process_uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("post_params"),
            size: std::mem::size_of::<PostProcessUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Ok(Self {
            device,
            queue,
            adapter_name,
            textures: HashMap::new(),
            next_id: 1,
            pipelines: None,
            path_trace_uniforms,
            post_process_uniforms,
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// Run `f` inside error scopes and turn any captured device error into
    /// [`Error::Gpu`].
    fn scoped<T>(&self, what: &str, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let out = f(self);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        match validation.or(oom) {
            Some(e) => {
                tracing::error!(what, error = %e, "device rejected call");
                Err(Error::gpu(format!("{what}: {e}")))
            }
            None => out,
        }
    }

    fn texture(&self, id: TextureId) -> Result<&GpuTexture> {
        self.textures
            .get(&id)
            .ok_or(Error::ResourceReleased("texture"))
    }

    fn view(&self, id: TextureId) -> Result<&wgpu::TextureView> {
        self.texture(id).map(|t| &t.view)
    }

    fn pipelines(&self) -> Result<&Pipelines> {
        self.pipelines
            .as_ref()
            .ok_or(Error::SetupIncomplete("kernel programs"))
    }

    fn create_pipeline(
        &self,
        label: &str,
        source: &str,
        entries: &[wgpu::BindGroupLayoutEntry],
    ) -> (wgpu::ComputePipeline, wgpu::BindGroupLayout) {
        let shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries,
        });

        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        (pipeline, layout)
    }

    fn dispatch(&self, label: &str, pipeline: &wgpu::ComputePipeline, bind_group: &wgpu::BindGroup, width: u32, height: u32) {
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(label),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(width.div_ceil(WG_SIZE), height.div_ceil(WG_SIZE), 1);
        }
        self.queue.submit(Some(encoder.finish()));
    }
}

impl RenderBackend for WgpuBackend {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn create_texture(&mut self, desc: &TextureDesc, init: TextureInit<'_>) -> Result<TextureId> {
        check_texture_limit(desc, self.device.limits().max_texture_dimension_2d)?;
        let len = desc.value_count()?;
        let zero_f;
        let zero_u;
        let bytes: &[u8] = match (desc.format, init) {
            (TextureFormat::Rgba32Float, TextureInit::Zeroed) => {
                zero_f = vec![0.0f32; len];
                bytemuck::cast_slice(&zero_f)
            }
            (TextureFormat::Rgba32Uint, TextureInit::Zeroed) => {
                zero_u = vec![0u32; len];
                bytemuck::cast_slice(&zero_u)
            }
            (TextureFormat::Rgba32Float, TextureInit::Float(data)) if data.len() == len => {
                bytemuck::cast_slice(data)
            }
            (TextureFormat::Rgba32Uint, TextureInit::Uint(data)) if data.len() == len => {
                bytemuck::cast_slice(data)
            }
            _ => {
                return Err(Error::gpu(format!(
                    "initial data does not match {} ({}x{} {:?})",
                    desc.label, desc.width, desc.height, desc.format
                )))
            }
        };

        let (texture, view) = self.scoped("create texture", |gpu| {
            let texture = gpu.device.create_texture_with_data(
                &gpu.queue,
                &wgpu::TextureDescriptor {
                    label: Some(desc.label),
                    size: wgpu::Extent3d {
                        width: desc.width,
                        height: desc.height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: map_format(desc.format),
                    usage: wgpu::TextureUsages::STORAGE_BINDING
                        | wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_SRC
                        | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                },
                wgpu::util::TextureDataOrder::LayerMajor,
                bytes,
            );
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            Ok((texture, view))
        })?;

        let id = TextureId(self.next_id);
        self.next_id += 1;
        self.textures.insert(id, GpuTexture { desc: *desc, texture, view });
        Ok(id)
    }

    fn release_texture(&mut self, id: TextureId) {
        if let Some(tex) = self.textures.remove(&id) {
            tex.texture.destroy();
        }
    }

    fn compile(&mut self, sources: &KernelSources) -> Result<()> {
        if self.pipelines.is_some() {
            return Ok(());
        }

        let pipelines = self.scoped("compile kernels", |gpu| {
            let (path_trace, path_trace_layout) = gpu.create_pipeline(
                "pt_compute",
                sources.path_trace,
                &[
                    uniform_entry(0),
                    sampled_entry(1, FLOAT_UNFILTERED),
                    sampled_entry(2, wgpu::TextureSampleType::Uint),
                    storage_entry(3, wgpu::TextureFormat::Rgba32Float),
                    storage_entry(4, wgpu::TextureFormat::Rgba32Uint),
                    storage_entry(5, wgpu::TextureFormat::Rgba32Float),
                    sampled_entry(6, FLOAT_UNFILTERED),
                ],
            );
            let (post_process, post_process_layout) = gpu.create_pipeline(
                "post_compute",
                sources.post_process,
                &[
                    uniform_entry(0),
                    sampled_entry(1, FLOAT_UNFILTERED),
                    storage_entry(2, wgpu::TextureFormat::Rgba32Float),
                ],
            );
            Ok(Pipelines {
                path_trace,
                path_trace_layout,
                post_process,
                post_process_layout,
            })
        })?;
        self.pipelines = Some(pipelines);
        tracing::debug!("compiled path trace and post process kernels");
        Ok(())
    }

    fn is_compiled(&self) -> bool {
        self.pipelines.is_some()
    }

    fn path_trace(&mut self, binding: &PathTraceBinding, uniforms: &PathTraceUniforms) -> Result<()> {
        self.scoped("path trace", |gpu| gpu.path_trace_pass(binding, uniforms))
    }

    fn post_process(&mut self, binding: &PostProcessBinding, uniforms: &PostProcessUniforms) -> Result<()> {
        self.scoped("post process", |gpu| gpu.post_process_pass(binding, uniforms))
    }

    fn read_texture(&mut self, id: TextureId) -> Result<Vec<f32>> {
        self.scoped("read back", |gpu| gpu.read_back(id))
    }
}

impl WgpuBackend {
    fn path_trace_pass(&self, binding: &PathTraceBinding, uniforms: &PathTraceUniforms) -> Result<()> {
        let pipelines = self.pipelines()?;

        self.queue
            .write_buffer(&self.path_trace_uniforms, 0, bytemuck::bytes_of(uniforms));

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("pt_bind_group"),
            layout: &pipelines.path_trace_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.path_trace_uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(self.view(binding.source_color)?),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(self.view(binding.source_seed)?),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(self.view(binding.dest_color)?),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::TextureView(self.view(binding.dest_seed)?),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: wgpu::BindingResource::TextureView(self.view(binding.output)?),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: wgpu::BindingResource::TextureView(self.view(binding.environment)?),
                },
            ],
        });

        self.dispatch("pt_compute_pass", &pipelines.path_trace, &bind_group, uniforms.width, uniforms.height);
        Ok(())
    }

    fn post_process_pass(&self, binding: &PostProcessBinding, uniforms: &PostProcessUniforms) -> Result<()> {
        let pipelines = self.pipelines()?;
        let raw = self.texture(binding.raw_color)?;
        let output = self.texture(binding.output)?;

        self.queue
            .write_buffer(&self.post_process_uniforms, 0, bytemuck::bytes_of(uniforms));

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("post_bind_group"),
            layout: &pipelines.post_process_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.post_process_uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&raw.view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&output.view),
                },
            ],
        });

        self.dispatch("post_compute_pass", &pipelines.post_process, &bind_group, raw.desc.width, raw.desc.height);
        Ok(())
    }

    fn read_back(&self, id: TextureId) -> Result<Vec<f32>> {
        let tex = self.texture(id)?;
        if tex.desc.format != TextureFormat::Rgba32Float {
            return Err(Error::gpu(format!("{} is not a float texture", tex.desc.label)));
        }
        let (width, height) = (tex.desc.width, tex.desc.height);

        // bytes_per_row must be aligned to 256 (COPY_BYTES_PER_ROW_ALIGNMENT)
        let unpadded = width * tex.desc.format.bytes_per_texel();
        let padded = unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback_staging"),
            size: u64::from(padded) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &tex.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| Error::gpu(format!("device poll failed: {e}")))?;
        rx.recv()
            .map_err(|_| Error::gpu("read-back callback dropped"))?
            .map_err(|e| Error::gpu(format!("read-back map failed: {e}")))?;

        let texels = {
            let data = slice.get_mapped_range();
            let mut out = Vec::with_capacity(tex.desc.value_count()?);
            for row in data.chunks_exact(padded as usize) {
                out.extend(
                    row[..unpadded as usize]
                        .chunks_exact(4)
                        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
                );
            }
            out
        };
        staging.unmap();

        Ok(texels)
    }
}
