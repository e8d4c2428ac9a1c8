use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum X264EncoderError {
    #[snafu(display("invalid stream parameters: {reason}"))]
    InvalidParameters { reason: &'static str },
    #[snafu(display("preset {preset:?} is not recognized by the engine"))]
    InvalidPreset { preset: String },
    #[snafu(display("configuration can't be represented under the {profile} profile"))]
    ProfileRejected { profile: &'static str },
    #[snafu(display("unable to allocate picture (code = {code})"))]
    PictureAllocFailed { code: i32 },
    #[snafu(display("engine rejected the configuration on open (code = {code})"))]
    EngineOpenFailed { code: i32 },
    #[snafu(display("encode failed (frame size = {frame_size})"))]
    EncodeFailed { frame_size: i32 },
    #[snafu(display("engine rejected the reconfiguration to {bitrate_kbps} kbit/s (code = {code})"))]
    BitrateReconfigFailed { code: i32, bitrate_kbps: u32 },
    #[snafu(display("plane {plane} has {actual} bytes, but at least {expected} are required"))]
    UnexpectedPlaneLayout { plane: usize, expected: usize, actual: usize },
}

/// When a failure happened relative to the session's lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureStage {
    /// Before any engine resources were allocated.
    Configuration,
    /// While opening the session. Anything allocated so far has been released.
    SessionOpen,
    /// While streaming. The session remains usable.
    Streaming,
}

impl X264EncoderError {
    pub fn stage(&self) -> FailureStage {
        match self {
            Self::InvalidParameters { .. } | Self::InvalidPreset { .. } | Self::ProfileRejected { .. } => FailureStage::Configuration,
            Self::PictureAllocFailed { .. } | Self::EngineOpenFailed { .. } => FailureStage::SessionOpen,
            Self::EncodeFailed { .. } | Self::BitrateReconfigFailed { .. } | Self::UnexpectedPlaneLayout { .. } => FailureStage::Streaming,
        }
    }

    /// Whether the session that produced the error can keep being used. A failed frame should be
    /// dropped and the stream continued with the next one.
    pub fn is_recoverable(&self) -> bool {
        self.stage() == FailureStage::Streaming
    }

    /// A stable, negative reason code for C-style callers.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidPreset { .. } => -1,
            Self::ProfileRejected { .. } => -2,
            Self::PictureAllocFailed { .. } => -3,
            Self::EngineOpenFailed { .. } => -4,
            Self::EncodeFailed { .. } => -5,
            Self::BitrateReconfigFailed { .. } => -6,
            Self::InvalidParameters { .. } => -7,
            Self::UnexpectedPlaneLayout { .. } => -8,
        }
    }
}

pub(crate) type Result<T> = core::result::Result<T, X264EncoderError>;
