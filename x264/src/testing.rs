//! An in-memory engine that behaves like libx264 closely enough to exercise session management
//! without linking the library. Its output is well-formed Annex B framing around meaningless
//! slice data.

use super::{
    engine::{Engine, EngineFailure, EngineOutput, EngineResult, EngineSession, FrameType, Picture, PictureLayout},
    EncoderConfig, PixelFormat, Preset, RateControl, RateControlMethod,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

const TUNES: &[&str] = &["film", "animation", "grain", "stillimage", "psnr", "ssim", "fastdecode", "zerolatency"];

const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x1f, 0xac, 0xd9, 0x40];
const PPS: &[u8] = &[0x68, 0xeb, 0xe3, 0xcb];

#[derive(Default)]
struct State {
    pictures_allocated: usize,
    open_sessions: usize,
    lookahead: usize,
    fail_picture_layout: bool,
    fail_open: bool,
    encode_result: Option<i32>,
    fail_reconfigure: bool,
    frame_types: Vec<FrameType>,
    reconfigurations: Vec<EncoderConfig>,
}

/// Cloning an engine shares its state, so a test can keep a handle to inspect what sessions did.
#[derive(Clone, Default)]
pub struct FakeEngine {
    state: Arc<Mutex<State>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the engine hold back this many frames before emitting output, like a look-ahead
    /// encoder would. Applies to sessions opened afterwards.
    pub fn set_lookahead(&self, frames: usize) {
        self.state().lookahead = frames;
    }

    pub fn fail_picture_layout(&self, fail: bool) {
        self.state().fail_picture_layout = fail;
    }

    pub fn fail_open(&self, fail: bool) {
        self.state().fail_open = fail;
    }

    /// Makes every encode call return the given frame size instead of output. Pass `None` to
    /// encode normally again.
    pub fn fail_encode_with(&self, frame_size: Option<i32>) {
        self.state().encode_result = frame_size;
    }

    pub fn fail_reconfigure(&self, fail: bool) {
        self.state().fail_reconfigure = fail;
    }

    /// The number of picture layouts computed so far.
    pub fn pictures_allocated(&self) -> usize {
        self.state().pictures_allocated
    }

    pub fn open_sessions(&self) -> usize {
        self.state().open_sessions
    }

    /// The frame type requested by every encode call so far, across all sessions.
    pub fn requested_frame_types(&self) -> Vec<FrameType> {
        self.state().frame_types.clone()
    }

    /// Every configuration successfully applied to a live session so far.
    pub fn reconfigurations(&self) -> Vec<EncoderConfig> {
        self.state().reconfigurations.clone()
    }
}

impl Engine for FakeEngine {
    type Session = FakeSession;

    fn default_preset(&self, preset: &str, tune: &str) -> EngineResult<EncoderConfig> {
        if preset.parse::<Preset>().is_err() || !TUNES.contains(&tune) {
            return Err(EngineFailure::UNSPECIFIED);
        }
        Ok(EncoderConfig {
            preset: preset.to_owned(),
            tune: tune.to_owned(),
            profile: None,
            pixel_format: PixelFormat::I420,
            width: 0,
            height: 0,
            fps_num: 25,
            fps_den: 1,
            keyint_max: 250,
            rc: RateControl {
                method: RateControlMethod::ConstantRateFactor,
                bitrate_kbps: 0,
                rate_tolerance: 1.0,
                vbv_max_bitrate_kbps: 0,
                vbv_buffer_size_kbit: 0,
                vbv_buffer_init: 0.9,
            },
            repeat_headers: false,
            annexb: false,
        })
    }

    fn apply_profile(&self, config: &mut EncoderConfig, profile: &str) -> EngineResult<()> {
        let supports_format = match profile {
            "baseline" | "main" | "high" | "high10" => config.pixel_format == PixelFormat::I420,
            "high422" => config.pixel_format != PixelFormat::I444,
            "high444" => true,
            _ => return Err(EngineFailure::UNSPECIFIED),
        };
        if !supports_format {
            return Err(EngineFailure::UNSPECIFIED);
        }
        config.profile = Some(profile.to_owned());
        Ok(())
    }

    fn picture_layout(&self, pixel_format: PixelFormat, width: u16, height: u16) -> EngineResult<PictureLayout> {
        let mut state = self.state();
        if state.fail_picture_layout {
            return Err(EngineFailure::UNSPECIFIED);
        }
        state.pictures_allocated += 1;
        let chroma_stride = pixel_format.chroma_width(width);
        let layout = PictureLayout {
            pixel_format,
            width,
            height,
            strides: [width as usize, chroma_stride, chroma_stride],
        };
        Ok(layout)
    }

    fn open(&self, config: &EncoderConfig) -> EngineResult<FakeSession> {
        let mut state = self.state();
        if state.fail_open {
            return Err(EngineFailure::UNSPECIFIED);
        }
        // checks that only happen once the whole configuration is known
        if config.pixel_format == PixelFormat::I420 && (config.width % 2 != 0 || config.height % 2 != 0) {
            return Err(EngineFailure::UNSPECIFIED);
        }
        if config.rc.method == RateControlMethod::AverageBitrate && config.rc.bitrate_kbps == 0 {
            return Err(EngineFailure::UNSPECIFIED);
        }
        state.open_sessions += 1;
        Ok(FakeSession {
            state: self.state.clone(),
            config: config.clone(),
            lookahead: state.lookahead,
            frames_since_key: None,
            delayed: VecDeque::new(),
            output: Vec::new(),
        })
    }
}

struct DelayedFrame {
    frame_type: FrameType,
    checksum: u8,
}

pub struct FakeSession {
    state: Arc<Mutex<State>>,
    config: EncoderConfig,
    lookahead: usize,
    frames_since_key: Option<u32>,
    delayed: VecDeque<DelayedFrame>,
    output: Vec<u8>,
}

impl FakeSession {
    fn emit(&mut self, frame: DelayedFrame) -> EngineOutput<'_> {
        let is_key = match (frame.frame_type, self.frames_since_key) {
            (FrameType::Idr, _) | (_, None) => true,
            (FrameType::Auto, Some(n)) => self.config.keyint_max > 0 && n + 1 >= self.config.keyint_max,
        };
        self.frames_since_key = Some(if is_key { 0 } else { self.frames_since_key.unwrap_or(0) + 1 });

        let mut nalus: Vec<Vec<u8>> = vec![];
        if is_key && (self.config.repeat_headers || self.output.is_empty()) {
            nalus.push(SPS.to_vec());
            nalus.push(PPS.to_vec());
        }
        let mut slice = if is_key { vec![0x65, 0x88, 0x84] } else { vec![0x41, 0x9a, 0x02] };
        // something that depends on the input and the rate control target
        slice.extend_from_slice(&[frame.checksum | 0x80, (self.config.rc.bitrate_kbps % 255) as u8 | 0x01]);
        nalus.push(slice);

        self.output.clear();
        for nalu in &nalus {
            if self.config.annexb {
                self.output.extend_from_slice(&[0, 0, 0, 1]);
            } else {
                self.output.extend_from_slice(&(nalu.len() as u32).to_be_bytes());
            }
            self.output.extend_from_slice(nalu);
        }
        EngineOutput {
            frame_size: self.output.len() as i32,
            payload: &self.output,
        }
    }
}

impl EngineSession for FakeSession {
    fn encode(&mut self, picture: &Picture<'_>) -> EngineOutput<'_> {
        let forced_result = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.frame_types.push(picture.frame_type);
            state.encode_result
        };
        if let Some(frame_size) = forced_result {
            return EngineOutput::empty(frame_size);
        }

        let checksum = picture.planes.iter().flat_map(|p| p.iter()).fold(0u8, |acc, b| acc ^ b);
        self.delayed.push_back(DelayedFrame {
            frame_type: picture.frame_type,
            checksum,
        });
        if self.delayed.len() <= self.lookahead {
            return EngineOutput::empty(0);
        }
        match self.delayed.pop_front() {
            Some(frame) => self.emit(frame),
            None => EngineOutput::empty(0),
        }
    }

    fn flush(&mut self) -> EngineOutput<'_> {
        match self.delayed.pop_front() {
            Some(frame) => self.emit(frame),
            None => EngineOutput::empty(0),
        }
    }

    fn delayed_frames(&self) -> usize {
        self.delayed.len()
    }

    fn reconfigure(&mut self, config: &EncoderConfig) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.fail_reconfigure {
            return Err(EngineFailure::UNSPECIFIED);
        }
        state.reconfigurations.push(config.clone());
        self.config = config.clone();
        Ok(())
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.open_sessions -= 1;
        }
    }
}
