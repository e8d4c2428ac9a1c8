//! The capabilities this crate needs from an H.264 compression engine. The engine does all of the
//! actual compression; everything in this crate is session management around it.

use super::{EncoderConfig, PixelFormat};

/// A failure reported by the engine, with its native return code where it has one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EngineFailure {
    pub code: i32,
}

impl EngineFailure {
    /// For failures the engine signals without a code, e.g. by returning a null handle.
    pub const UNSPECIFIED: Self = Self { code: -1 };
}

pub type EngineResult<T> = core::result::Result<T, EngineFailure>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FrameType {
    /// The engine picks the frame type.
    #[default]
    Auto,
    /// Instantaneous decoder refresh.
    Idr,
}

/// The memory layout the engine expects for a frame. Only the metadata is kept: no pixel storage
/// is associated with it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PictureLayout {
    pub pixel_format: PixelFormat,
    pub width: u16,
    pub height: u16,
    /// Bytes per row of the Y, Cb and Cr planes.
    pub strides: [usize; 3],
}

impl PictureLayout {
    /// The minimum number of bytes a plane needs to hold.
    pub fn plane_len(&self, plane: usize) -> usize {
        self.strides[plane] * self.pixel_format.plane_height(plane, self.height)
    }
}

/// A frame descriptor. The planes are borrowed from the caller for the duration of one encode
/// call.
pub struct Picture<'a> {
    pub layout: &'a PictureLayout,
    pub planes: [&'a [u8]; 3],
    pub frame_type: FrameType,
}

/// What the engine produced for one encode call.
pub struct EngineOutput<'a> {
    /// The engine's return value: the number of bytes emitted, or a negative value on failure.
    pub frame_size: i32,
    /// The emitted NAL units, contiguous in the engine's output buffer. Empty unless `frame_size`
    /// is positive.
    pub payload: &'a [u8],
}

impl EngineOutput<'_> {
    pub fn empty(frame_size: i32) -> Self {
        Self { frame_size, payload: &[] }
    }
}

/// An engine used to create sessions.
pub trait Engine {
    type Session: EngineSession;

    /// Creates a configuration from a named preset and tuning. Fails if either name is unknown.
    fn default_preset(&self, preset: &str, tune: &str) -> EngineResult<EncoderConfig>;

    /// Constrains the configuration to a named profile. Fails if the configuration isn't
    /// representable under it.
    fn apply_profile(&self, config: &mut EncoderConfig, profile: &str) -> EngineResult<()>;

    /// Computes the engine's frame layout for the given geometry. Any storage allocated to do so
    /// must be released before returning.
    fn picture_layout(&self, pixel_format: PixelFormat, width: u16, height: u16) -> EngineResult<PictureLayout>;

    /// Opens a session. The engine may reject configurations here that passed profile validation.
    fn open(&self, config: &EncoderConfig) -> EngineResult<Self::Session>;
}

/// An opened engine session. Dropping it releases the engine's resources.
pub trait EngineSession {
    /// Submits a frame. The engine may buffer frames, in which case nothing is emitted yet.
    ///
    /// The returned payload lives in the engine's output buffer and is overwritten by the next
    /// call.
    fn encode(&mut self, picture: &Picture<'_>) -> EngineOutput<'_>;

    /// Emits one delayed frame, if there is one.
    fn flush(&mut self) -> EngineOutput<'_>;

    /// The number of frames the engine is holding back.
    fn delayed_frames(&self) -> usize;

    /// Applies a configuration to the live session.
    fn reconfigure(&mut self, config: &EncoderConfig) -> EngineResult<()>;
}
