#![no_std]

extern crate alloc;

mod video_encoder;
pub use video_encoder::*;

mod stream_control;
pub use stream_control::*;
