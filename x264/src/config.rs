use super::{engine::Engine, error::Result, X264EncoderError};
use std::{fmt, str::FromStr};

#[cfg(feature = "serde")]
use serde_derive::{Deserialize, Serialize};

/// Every session is tuned for latency. Look-ahead and B-frames are disabled by it.
pub const TUNE: &str = "zerolatency";

/// Every session is constrained to the high profile.
pub const PROFILE: &str = "high";

/// Headroom added on top of the target bitrate when the VBV is recomputed on a bitrate change.
/// Half of it is applied.
pub const RATE_CONTROL_MARGIN_KBPS: u32 = 10;

/// Rate tolerance applied on a bitrate change so the engine can absorb the jump smoothly.
pub const RECONFIG_RATE_TOLERANCE: f32 = 0.1;

/// VBV initial fullness applied on a bitrate change.
pub const RECONFIG_VBV_BUFFER_INIT: f32 = 0.6;

/// Bitrate changes to this many kbit/s or fewer are ignored.
pub const MIN_BITRATE_KBPS: u32 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "lowercase"))]
pub enum PixelFormat {
    /// 8-bit planar YUV 4:2:0.
    I420,
    /// 8-bit planar YUV 4:2:2.
    I422,
    /// 8-bit planar YUV 4:4:4.
    I444,
}

impl PixelFormat {
    pub fn chroma_width(&self, width: u16) -> usize {
        match self {
            Self::I420 | Self::I422 => (width as usize + 1) / 2,
            Self::I444 => width as usize,
        }
    }

    pub fn chroma_height(&self, height: u16) -> usize {
        match self {
            Self::I420 => (height as usize + 1) / 2,
            Self::I422 | Self::I444 => height as usize,
        }
    }

    /// The height of the given plane in rows.
    pub fn plane_height(&self, plane: usize, height: u16) -> usize {
        if plane == 0 {
            height as usize
        } else {
            self.chroma_height(height)
        }
    }
}

/// The engine's named speed/quality tradeoffs, fastest first.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "lowercase"))]
pub enum Preset {
    UltraFast,
    SuperFast,
    VeryFast,
    Faster,
    Fast,
    Medium,
    Slow,
    Slower,
    VerySlow,
    Placebo,
}

impl Preset {
    pub const ALL: [Preset; 10] = [
        Self::UltraFast,
        Self::SuperFast,
        Self::VeryFast,
        Self::Faster,
        Self::Fast,
        Self::Medium,
        Self::Slow,
        Self::Slower,
        Self::VerySlow,
        Self::Placebo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UltraFast => "ultrafast",
            Self::SuperFast => "superfast",
            Self::VeryFast => "veryfast",
            Self::Faster => "faster",
            Self::Fast => "fast",
            Self::Medium => "medium",
            Self::Slow => "slow",
            Self::Slower => "slower",
            Self::VerySlow => "veryslow",
            Self::Placebo => "placebo",
        }
    }
}

impl AsRef<str> for Preset {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = X264EncoderError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| X264EncoderError::InvalidPreset { preset: s.to_owned() })
    }
}

/// What the caller wants out of a stream. Resolution and pixel format are fixed for the lifetime
/// of a session; the bitrate can be changed afterwards.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StreamParameters {
    pub pixel_format: PixelFormat,
    pub width: u16,
    pub height: u16,
    /// Frames per second. The frame rate denominator is always 1.
    pub fps: u32,
    /// The maximum distance between key frames, in frames.
    pub keyframe_interval: u32,
    /// The initial target bitrate in bits/second.
    pub bitrate: u32,
    /// The VBV max bitrate in bits/second.
    pub vbv_max_bitrate: u32,
    /// The VBV buffer size in bits.
    pub vbv_buffer_size: u32,
}

impl StreamParameters {
    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(X264EncoderError::InvalidParameters {
                reason: "width and height must be non-zero",
            });
        }
        if self.fps == 0 {
            return Err(X264EncoderError::InvalidParameters {
                reason: "frame rate must be non-zero",
            });
        }
        // the engine keeps these as C ints
        if self.fps > i32::MAX as u32 {
            return Err(X264EncoderError::InvalidParameters {
                reason: "frame rate is too large",
            });
        }
        if self.keyframe_interval > i32::MAX as u32 {
            return Err(X264EncoderError::InvalidParameters {
                reason: "key frame interval is too large",
            });
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RateControlMethod {
    ConstantQp,
    ConstantRateFactor,
    AverageBitrate,
}

/// Rate control settings in the engine's units.
#[derive(Clone, Debug, PartialEq)]
pub struct RateControl {
    pub method: RateControlMethod,
    pub bitrate_kbps: u32,
    pub rate_tolerance: f32,
    pub vbv_max_bitrate_kbps: u32,
    pub vbv_buffer_size_kbit: u32,
    /// Initial VBV buffer occupancy. Values up to 1 are a fraction of the buffer size.
    pub vbv_buffer_init: f32,
}

/// The engine configuration fields that this crate controls. Engines seed it from a preset and
/// may keep additional native state of their own alongside it.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderConfig {
    pub preset: String,
    pub tune: String,
    /// Set once a profile has been successfully applied.
    pub profile: Option<String>,
    pub pixel_format: PixelFormat,
    pub width: u16,
    pub height: u16,
    pub fps_num: u32,
    pub fps_den: u32,
    pub keyint_max: u32,
    pub rc: RateControl,
    /// Emit SPS/PPS before every key frame rather than only once at the start of the stream.
    pub repeat_headers: bool,
    /// Delimit NAL units with start codes rather than length prefixes.
    pub annexb: bool,
}

impl EncoderConfig {
    /// Derives a validated configuration for a stream. No engine session is opened.
    pub fn translate<E: Engine + ?Sized>(engine: &E, params: &StreamParameters, preset: &str) -> Result<Self> {
        params.validate()?;

        let mut config = engine
            .default_preset(preset, TUNE)
            .map_err(|_| X264EncoderError::InvalidPreset { preset: preset.to_owned() })?;

        config.pixel_format = params.pixel_format;
        config.width = params.width;
        config.height = params.height;
        config.fps_num = params.fps;
        config.fps_den = 1;
        config.keyint_max = params.keyframe_interval;

        config.rc.method = RateControlMethod::AverageBitrate;
        config.rc.bitrate_kbps = params.bitrate / 1000;
        config.rc.vbv_max_bitrate_kbps = params.vbv_max_bitrate / 1000;
        config.rc.vbv_buffer_size_kbit = params.vbv_buffer_size / 1000;

        // Needed for streaming: receivers can join at any key frame, and the transport depends on
        // start codes.
        config.repeat_headers = true;
        config.annexb = true;

        engine
            .apply_profile(&mut config, PROFILE)
            .map_err(|_| X264EncoderError::ProfileRejected { profile: PROFILE })?;

        Ok(config)
    }
}
