//! Progressive path tracing: kernels, ping-pong buffers and the invoker.
//!
//! ## Architecture
//! ```text
//! RenderParameters → RenderInvoker ─┬─ path trace (source pair → destination pair) → swap
//!                                   ├─ luminance stats (fresh raw buffer)
//!                                   └─ tone map (raw → output) → read-back → JPEG
//! ```
//!
//! Kernels run on a [`RenderBackend`]: [`gpu::WgpuBackend`] on a real device,
//! [`cpu::CpuBackend`] in software.

pub mod accumulation;
pub mod backend;
pub mod cpu;
pub mod encode;
pub mod environment;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod invoker;
pub mod params;
pub mod scene;
#[cfg(test)]
pub(crate) mod testing;

pub use accumulation::{AccumulationStore, BufferPair};
pub use backend::{RenderBackend, TextureId};
pub use cpu::CpuBackend;
pub use encode::{FrameBuffer, FrameEncoder};
pub use environment::EnvironmentImage;
#[cfg(feature = "gpu")]
pub use gpu::WgpuBackend;
pub use invoker::{InvokerState, RenderInvoker};
pub use params::{ParameterUpdate, RenderParameters};
