//! Utility types shared across the crate.
//!
//! - [`Error`] / [`Result`] - Error handling
//! - Camera and luminance math on top of glam

mod error;
mod math;

pub use error::*;
pub use math::*;
