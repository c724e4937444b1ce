//! # pathstream
//!
//! Progressive path-traced renders streamed to a browser over WebSocket.
//!
//! A client sends sparse JSON parameter updates (camera orbit, pan, exposure
//! key, sample target). Each update starts a new render generation: samples
//! accumulate in ping-pong buffers on the GPU, every tick is tone mapped,
//! JPEG encoded and pushed back together with the cumulative sample count.
//!
//! ## Modules
//!
//! - [`util`] - Errors and shared math
//! - [`render`] - Kernels, backends, accumulation buffers and the invoker
//! - [`stream`] - Sessions, the streaming loop, wire framing and the server
//! - [`settings`] - Persistent server configuration
//! - [`logging`] - Tracing setup
//!
//! ## Example
//!
//! ```ignore
//! use pathstream::prelude::*;
//!
//! let settings = Settings::load(None);
//! let invoker = RenderInvoker::new(
//!     Box::new(CpuBackend::new()),
//!     EnvironmentImage::default_sky(),
//!     settings.width,
//!     settings.height,
//!     settings.seed,
//! );
//! Server::bind(&settings, invoker).await?.run().await?;
//! ```

pub mod logging;
pub mod render;
pub mod settings;
pub mod stream;
pub mod util;

pub use util::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::render::{
        CpuBackend, EnvironmentImage, FrameEncoder, ParameterUpdate, RenderBackend,
        RenderInvoker, RenderParameters,
    };
    #[cfg(feature = "gpu")]
    pub use crate::render::WgpuBackend;
    pub use crate::settings::{BackendKind, Settings};
    pub use crate::stream::{LoopOptions, LoopOutcome, Server, ServerMessage, Session, SessionState};
    pub use crate::util::{Error, Result};
}
