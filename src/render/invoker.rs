//! Drives the two kernel phases over the ping-pong store.
//!
//! One [`RenderInvoker::render`] call is one path-trace iteration followed by
//! one tone-map iteration. Luminance statistics for the tone-map pass are
//! always taken from the buffer the path-trace pass just wrote.

use super::accumulation::AccumulationStore;
use super::backend::{
    check_frame_size, KernelSources, PathTraceBinding, PathTraceUniforms, PostProcessBinding,
    PostProcessUniforms, RenderBackend, TextureDesc, TextureFormat, TextureId, TextureInit,
};
use super::encode::{FrameBuffer, FrameEncoder};
use super::environment::EnvironmentImage;
use super::params::RenderParameters;
use crate::util::{Error, LuminanceStats, Result};

/// Resource lifecycle of the invoker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokerState {
    /// No GPU resources yet (or the last setup failed).
    Uninitialized,
    /// Buffers allocated and kernels compiled.
    Ready,
    /// Torn down with its session; [`RenderInvoker::setup`] starts over.
    Released,
}

struct Resources {
    store: AccumulationStore,
    output: TextureId,
    environment: TextureId,
}

/// Owner of the render context for one session at a time.
pub struct RenderInvoker {
    backend: Box<dyn RenderBackend>,
    sources: KernelSources,
    environment: EnvironmentImage,
    seed: u64,
    width: u32,
    height: u32,
    resources: Option<Resources>,
    state: InvokerState,
}

impl RenderInvoker {
    /// Wrap a backend. Nothing is allocated until [`setup`](Self::setup).
    pub fn new(
        backend: Box<dyn RenderBackend>,
        environment: EnvironmentImage,
        width: u32,
        height: u32,
        seed: u64,
    ) -> Self {
        Self {
            backend,
            sources: KernelSources::builtin(),
            environment,
            seed,
            width,
            height,
            resources: None,
            state: InvokerState::Uninitialized,
        }
    }

    pub fn state(&self) -> InvokerState {
        self.state
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Allocate buffers, upload the environment and compile both kernels.
    ///
    /// Idempotent once ready. Partially created resources are released on
    /// failure so a later call starts clean.
    pub fn setup(&mut self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        check_frame_size(self.width, self.height)?;

        let env = &self.environment;
        let environment = self.backend.create_texture(
            &TextureDesc {
                label: "environment",
                width: env.width,
                height: env.height,
                format: TextureFormat::Rgba32Float,
            },
            TextureInit::Float(&env.texels),
        )?;

        let (store, output) = match self.allocate_frame(self.width, self.height) {
            Ok(v) => v,
            Err(e) => {
                self.backend.release_texture(environment);
                return Err(e);
            }
        };

        if let Err(e) = self.backend.compile(&self.sources) {
            store.release(self.backend.as_mut());
            self.backend.release_texture(output);
            self.backend.release_texture(environment);
            return Err(e);
        }

        self.resources = Some(Resources { store, output, environment });
        self.state = InvokerState::Ready;
        tracing::info!(
            backend = self.backend.name(),
            width = self.width,
            height = self.height,
            "render context ready"
        );
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.state == InvokerState::Ready && self.resources.is_some()
    }

    fn allocate_frame(&mut self, width: u32, height: u32) -> Result<(AccumulationStore, TextureId)> {
        let store = AccumulationStore::allocate(self.backend.as_mut(), width, height, self.seed)?;
        let output = self.backend.create_texture(
            &TextureDesc {
                label: "output",
                width,
                height,
                format: TextureFormat::Rgba32Float,
            },
            TextureInit::Zeroed,
        );
        match output {
            Ok(output) => Ok((store, output)),
            Err(e) => {
                store.release(self.backend.as_mut());
                Err(e)
            }
        }
    }

    /// Change the frame size, reallocating the store and output buffer.
    ///
    /// The recorded size only changes once the new buffers exist. If
    /// reallocation fails the invoker drops back to `Uninitialized` and the
    /// next [`prepare`](Self::prepare) runs a full setup.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        check_frame_size(width, height)?;
        let Some(res) = self.resources.take() else {
            self.width = width;
            self.height = height;
            return Ok(());
        };
        if (width, height) == (self.width, self.height) {
            self.resources = Some(res);
            return Ok(());
        }

        self.state = InvokerState::Uninitialized;
        let environment = res.environment;
        res.store.release(self.backend.as_mut());
        self.backend.release_texture(res.output);
        match self.allocate_frame(width, height) {
            Ok((store, output)) => {
                self.resources = Some(Resources { store, output, environment });
                self.state = InvokerState::Ready;
                self.width = width;
                self.height = height;
                tracing::debug!(width, height, "resized render buffers");
                Ok(())
            }
            Err(e) => {
                self.backend.release_texture(environment);
                tracing::warn!(width, height, error = %e, "resize failed, render context dropped");
                Err(e)
            }
        }
    }

    /// Set up if needed and match the requested frame size.
    pub fn prepare(&mut self, width: u32, height: u32) -> Result<()> {
        if self.is_ready() {
            self.resize(width, height)
        } else {
            check_frame_size(width, height)?;
            self.width = width;
            self.height = height;
            self.setup()
        }
    }

    fn resources(&self) -> Result<&Resources> {
        match (self.state, &self.resources) {
            (InvokerState::Ready, Some(res)) => Ok(res),
            (InvokerState::Released, _) => Err(Error::ResourceReleased("accumulation buffers")),
            _ => Err(Error::SetupIncomplete("accumulation buffers")),
        }
    }

    /// One path-trace pass: read the source pair, write the destination pair
    /// and the pre-tonemap output, then swap roles.
    pub fn path_trace_iteration(
        &mut self,
        sample_index: u32,
        sample_budget: u32,
        params: &RenderParameters,
    ) -> Result<()> {
        let res = self.resources()?;
        if !self.backend.is_compiled() {
            return Err(Error::SetupIncomplete("kernel programs"));
        }

        let src = res.store.current_source();
        let dst = res.store.current_destination();
        let binding = PathTraceBinding {
            source_color: src.color,
            source_seed: src.seed,
            dest_color: dst.color,
            dest_seed: dst.seed,
            output: res.output,
            environment: res.environment,
        };
        let uniforms = PathTraceUniforms {
            current_sample: sample_index.max(1),
            sample_max: sample_budget,
            width: self.width,
            height: self.height,
            theta: params.theta,
            phi: params.phi,
            move_x: params.move_x,
            move_y: params.move_y,
        };

        self.backend.path_trace(&binding, &uniforms)?;
        if let Some(res) = self.resources.as_mut() {
            res.store.swap();
        }
        Ok(())
    }

    /// Log-average and maximum luminance of the freshest raw buffer.
    pub fn luminance_stats(&mut self) -> Result<LuminanceStats> {
        let raw = self.resources()?.store.current_source().color;
        let texels = self.backend.read_texture(raw)?;
        Ok(LuminanceStats::from_rgba(&texels))
    }

    /// One tone-map pass from the freshest raw buffer into the output buffer.
    pub fn post_process_iteration(&mut self, stats: LuminanceStats, key_value: f32) -> Result<()> {
        let res = self.resources()?;
        let binding = PostProcessBinding {
            raw_color: res.store.current_source().color,
            output: res.output,
        };
        let uniforms = PostProcessUniforms {
            luminance_average: stats.average,
            luminance_max: stats.max,
            key_value,
            _pad: 0.0,
        };
        self.backend.post_process(&binding, &uniforms)
    }

    /// Path trace, gather statistics from its output, then tone map.
    #[tracing::instrument(level = "trace", skip(self, params))]
    pub fn render(
        &mut self,
        sample_index: u32,
        sample_budget: u32,
        params: &RenderParameters,
    ) -> Result<LuminanceStats> {
        self.path_trace_iteration(sample_index, sample_budget, params)?;
        let stats = self.luminance_stats()?;
        self.post_process_iteration(stats, params.key_value)?;
        Ok(stats)
    }

    /// Tone-mapped output, top row first.
    pub fn read_output(&mut self) -> Result<FrameBuffer> {
        let output = self.resources()?.output;
        let texels = self.backend.read_texture(output)?;
        FrameBuffer::from_bottom_up(self.width, self.height, &texels)
    }

    /// Raw linear accumulation buffer, top row first.
    pub fn read_raw(&mut self) -> Result<FrameBuffer> {
        let raw = self.resources()?.store.current_source().color;
        let texels = self.backend.read_texture(raw)?;
        FrameBuffer::from_bottom_up(self.width, self.height, &texels)
    }

    /// Read back and compress the current output.
    pub fn encoded_frame(&mut self, encoder: &FrameEncoder) -> Result<Vec<u8>> {
        let frame = self.read_output()?;
        encoder.encode(&frame)
    }

    /// Free every texture. Later calls fail until the next setup.
    pub fn release(&mut self) {
        if let Some(res) = self.resources.take() {
            res.store.release(self.backend.as_mut());
            self.backend.release_texture(res.output);
            self.backend.release_texture(res.environment);
        }
        if self.state != InvokerState::Uninitialized {
            self.state = InvokerState::Released;
            tracing::debug!("render context released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::cpu::CpuBackend;
    use crate::render::testing::FailingBackend;

    fn invoker(seed: u64) -> RenderInvoker {
        RenderInvoker::new(
            Box::new(CpuBackend::new()),
            EnvironmentImage::default_sky(),
            24,
            16,
            seed,
        )
    }

    #[test]
    fn test_render_before_setup() {
        let mut inv = invoker(0);
        let params = RenderParameters::new(24, 16);
        assert!(matches!(
            inv.render(1, 1, &params),
            Err(Error::SetupIncomplete(_))
        ));
        assert!(matches!(inv.read_output(), Err(Error::SetupIncomplete(_))));
    }

    #[test]
    fn test_render_after_release() {
        let mut inv = invoker(0);
        inv.setup().unwrap();
        inv.release();
        assert_eq!(inv.state(), InvokerState::Released);
        let params = RenderParameters::new(24, 16);
        assert!(matches!(
            inv.render(1, 1, &params),
            Err(Error::ResourceReleased(_))
        ));

        inv.setup().unwrap();
        inv.render(1, 1, &params).unwrap();
    }

    #[test]
    fn test_deterministic_output() {
        let params = RenderParameters::new(24, 16);
        let run = |seed| {
            let mut inv = invoker(seed);
            inv.setup().unwrap();
            for i in 0..3 {
                inv.render(i * 2 + 1, 2, &params).unwrap();
            }
            inv.read_output().unwrap()
        };
        assert_eq!(run(9), run(9));
        assert_ne!(run(9).pixels, run(10).pixels);
    }

    #[test]
    fn test_stats_follow_fresh_buffer() {
        let mut inv = invoker(1);
        inv.setup().unwrap();
        let params = RenderParameters::new(24, 16);
        let stats = inv.render(1, 2, &params).unwrap();
        assert!(stats.max > 0.0);
        assert_eq!(stats, inv.luminance_stats().unwrap());

        let frame = inv.read_output().unwrap();
        assert!(frame.pixels.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_raw_buffer_is_linear() {
        let mut inv = invoker(5);
        inv.setup().unwrap();
        let params = RenderParameters::new(24, 16);
        inv.render(1, 4, &params).unwrap();
        let raw = inv.read_raw().unwrap();
        assert_eq!(raw.pixels.len(), 24 * 16 * 4);
        assert!(raw.pixels.iter().all(|v| v.is_finite() && *v >= 0.0));
        assert!(raw.pixels.chunks_exact(4).any(|px| px[0] > 1.0 || px[2] > 1.0));
    }

    #[test]
    fn test_resize() {
        let mut inv = invoker(0);
        inv.prepare(24, 16).unwrap();
        inv.prepare(8, 4).unwrap();
        assert_eq!(inv.dimensions(), (8, 4));
        let params = RenderParameters::new(8, 4);
        inv.render(1, 1, &params).unwrap();
        let frame = inv.read_output().unwrap();
        assert_eq!(frame.pixels.len(), 8 * 4 * 4);

        assert!(matches!(
            inv.resize(0, 4),
            Err(Error::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn test_failed_resize_recovers() {
        let (backend, faults) = FailingBackend::new();
        let mut inv = RenderInvoker::new(
            Box::new(backend),
            EnvironmentImage::default_sky(),
            24,
            16,
            0,
        );
        inv.prepare(24, 16).unwrap();
        let baseline = faults.lock().live_textures;
        assert_eq!(baseline, 6);

        faults.lock().creates_left = Some(2);
        assert!(inv.resize(8, 4).is_err());
        assert_eq!(inv.state(), InvokerState::Uninitialized);
        assert_eq!(inv.dimensions(), (24, 16));
        assert_eq!(faults.lock().live_textures, 0);

        // same size as before the failure must still rebuild
        faults.lock().creates_left = None;
        inv.prepare(24, 16).unwrap();
        assert_eq!(inv.state(), InvokerState::Ready);
        assert_eq!(faults.lock().live_textures, baseline);
        inv.render(1, 1, &RenderParameters::new(24, 16)).unwrap();
    }

    #[test]
    fn test_failed_setup_leaves_nothing() {
        for fail_at in 0..6 {
            let (backend, faults) = FailingBackend::new();
            let mut inv = RenderInvoker::new(
                Box::new(backend),
                EnvironmentImage::default_sky(),
                8,
                8,
                0,
            );
            faults.lock().creates_left = Some(fail_at);
            assert!(inv.setup().is_err());
            assert_eq!(inv.state(), InvokerState::Uninitialized);
            assert_eq!(faults.lock().live_textures, 0, "leak when create #{fail_at} fails");
        }
    }

    #[test]
    fn test_oversized_prepare_rejected() {
        let mut inv = invoker(0);
        inv.prepare(24, 16).unwrap();
        assert!(matches!(
            inv.prepare(60000, 60000),
            Err(Error::InvalidDimensions { .. })
        ));
        assert_eq!(inv.state(), InvokerState::Ready);
        assert_eq!(inv.dimensions(), (24, 16));
    }

    #[test]
    fn test_encoded_frame_is_jpeg() {
        let mut inv = invoker(3);
        inv.setup().unwrap();
        inv.render(1, 1, &RenderParameters::new(24, 16)).unwrap();
        let bytes = inv.encoded_frame(&FrameEncoder::new(75)).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
