//! Software backend that refuses texture allocations on request.

use std::sync::Arc;

use parking_lot::Mutex;

use super::backend::{
    KernelSources, PathTraceBinding, PathTraceUniforms, PostProcessBinding, PostProcessUniforms,
    RenderBackend, TextureDesc, TextureId, TextureInit,
};
use super::cpu::CpuBackend;
use crate::util::{Error, Result};

#[derive(Debug, Default)]
pub(crate) struct Faults {
    /// Allocations that still succeed; `None` never fails.
    pub creates_left: Option<usize>,
    pub live_textures: usize,
}

pub(crate) struct FailingBackend {
    inner: CpuBackend,
    faults: Arc<Mutex<Faults>>,
}

impl FailingBackend {
    pub fn new() -> (Self, Arc<Mutex<Faults>>) {
        let faults = Arc::new(Mutex::new(Faults::default()));
        let backend = Self { inner: CpuBackend::new(), faults: Arc::clone(&faults) };
        (backend, faults)
    }
}

impl RenderBackend for FailingBackend {
    fn name(&self) -> &str {
        "failing"
    }

    fn create_texture(&mut self, desc: &TextureDesc, init: TextureInit<'_>) -> Result<TextureId> {
        let mut faults = self.faults.lock();
        match faults.creates_left {
            Some(0) => return Err(Error::gpu(format!("out of memory for {}", desc.label))),
            Some(ref mut n) => *n -= 1,
            None => {}
        }
        let id = self.inner.create_texture(desc, init)?;
        faults.live_textures = self.inner.texture_count();
        Ok(id)
    }

    fn release_texture(&mut self, id: TextureId) {
        self.inner.release_texture(id);
        self.faults.lock().live_textures = self.inner.texture_count();
    }

    fn compile(&mut self, sources: &KernelSources) -> Result<()> {
        self.inner.compile(sources)
    }

    fn is_compiled(&self) -> bool {
        self.inner.is_compiled()
    }

    fn path_trace(&mut self, binding: &PathTraceBinding, uniforms: &PathTraceUniforms) -> Result<()> {
        self.inner.path_trace(binding, uniforms)
    }

    fn post_process(&mut self, binding: &PostProcessBinding, uniforms: &PostProcessUniforms) -> Result<()> {
        self.inner.post_process(binding, uniforms)
    }

    fn read_texture(&mut self, id: TextureId) -> Result<Vec<f32>> {
        self.inner.read_texture(id)
    }
}
