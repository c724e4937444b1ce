//! Error types for the streaming renderer.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for render and streaming operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A GPU resource required by the call has not been created yet
    #[error("Render setup incomplete: {0} has not been created")]
    SetupIncomplete(&'static str),

    /// The resource was torn down together with its session
    #[error("Render resource released: {0}")]
    ResourceReleased(&'static str),

    /// Client message could not be decoded
    #[error("Malformed client message: {0}")]
    MalformedMessage(String),

    /// A newer parameter generation superseded the running loop
    #[error("Stale render generation {captured} (live: {live})")]
    StaleGeneration { captured: u64, live: u64 },

    /// Frame dimensions must be non-zero
    #[error("Invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// Invalid settings value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// GPU device, pipeline or read-back failure
    #[error("GPU error: {0}")]
    Gpu(String),

    /// Image encoding failed
    #[error("Frame encoding failed: {0}")]
    Encode(String),

    /// Environment map could not be loaded
    #[error("Failed to load environment map {path}: {reason}")]
    EnvironmentMap { path: PathBuf, reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an "other" error from a string.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create a GPU error.
    pub fn gpu(msg: impl Into<String>) -> Self {
        Self::Gpu(msg.into())
    }

    /// Whether this error ends the streaming loop that hit it.
    ///
    /// Malformed input and stale generations are routine control flow;
    /// everything else terminates the loop (never the listening service).
    pub fn is_fatal_to_loop(&self) -> bool {
        !matches!(self, Self::MalformedMessage(_) | Self::StaleGeneration { .. })
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Self::Encode(e.to_string())
    }
}

/// Result type alias for render and streaming operations.
pub type Result<T> = std::result::Result<T, Error>;
