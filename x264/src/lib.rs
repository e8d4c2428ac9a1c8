//! A streaming control layer for H.264 encoding engines such as libx264: configuration for
//! low-latency delivery, per-frame encoding with forced key frames, and live bitrate changes.
//!
//! The engine is a capability ([`engine::Engine`]). With the `x264` feature, [`X264Engine`]
//! provides it using libx264.

mod config;
pub use config::*;

pub mod engine;

mod error;
pub use error::*;

mod nal;
pub use nal::*;

mod session;
pub use session::*;

mod encoder;
pub use encoder::*;

#[cfg(feature = "x264")]
mod native;
#[cfg(feature = "x264")]
pub use native::*;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
