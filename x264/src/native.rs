use super::{
    engine::{Engine, EngineFailure, EngineOutput, EngineResult, EngineSession, FrameType, Picture, PictureLayout},
    EncoderConfig, PixelFormat, RateControl, RateControlMethod,
};
use std::{ffi::CString, mem, ptr, slice};
use x264_sys as sys;

impl PixelFormat {
    fn csp(&self) -> i32 {
        (match self {
            Self::I420 => sys::X264_CSP_I420,
            Self::I422 => sys::X264_CSP_I422,
            Self::I444 => sys::X264_CSP_I444,
        }) as _
    }

    fn from_csp(csp: i32) -> Option<Self> {
        let csp = (csp & sys::X264_CSP_MASK as i32) as u32;
        if csp == sys::X264_CSP_I420 {
            Some(Self::I420)
        } else if csp == sys::X264_CSP_I422 {
            Some(Self::I422)
        } else if csp == sys::X264_CSP_I444 {
            Some(Self::I444)
        } else {
            None
        }
    }
}

impl RateControlMethod {
    fn to_x264(self) -> i32 {
        (match self {
            Self::ConstantQp => sys::X264_RC_CQP,
            Self::ConstantRateFactor => sys::X264_RC_CRF,
            Self::AverageBitrate => sys::X264_RC_ABR,
        }) as _
    }

    fn from_x264(method: i32) -> Self {
        if method == sys::X264_RC_CQP as i32 {
            Self::ConstantQp
        } else if method == sys::X264_RC_ABR as i32 {
            Self::AverageBitrate
        } else {
            Self::ConstantRateFactor
        }
    }
}

fn c_string(s: &str) -> EngineResult<CString> {
    CString::new(s).map_err(|_| EngineFailure::UNSPECIFIED)
}

fn default_params(preset: &str, tune: &str) -> EngineResult<sys::x264_param_t> {
    let preset = c_string(preset)?;
    let tune = c_string(tune)?;
    unsafe {
        let mut params: mem::MaybeUninit<sys::x264_param_t> = mem::MaybeUninit::uninit();
        let code = sys::x264_param_default_preset(params.as_mut_ptr(), preset.as_ptr(), tune.as_ptr());
        if code < 0 {
            return Err(EngineFailure { code });
        }
        let mut params = params.assume_init();
        sys::x264_param_enable_rust_logging(&mut params as _);
        Ok(params)
    }
}

fn apply_rate_control(params: &mut sys::x264_param_t, rc: &RateControl) {
    params.rc.i_rc_method = rc.method.to_x264();
    params.rc.i_bitrate = rc.bitrate_kbps as _;
    params.rc.f_rate_tolerance = rc.rate_tolerance;
    params.rc.i_vbv_max_bitrate = rc.vbv_max_bitrate_kbps as _;
    params.rc.i_vbv_buffer_size = rc.vbv_buffer_size_kbit as _;
    params.rc.f_vbv_buffer_init = rc.vbv_buffer_init;
}

fn c_int<T: TryInto<i32>>(value: T) -> EngineResult<i32> {
    value.try_into().map_err(|_| EngineFailure::UNSPECIFIED)
}

fn apply_config(params: &mut sys::x264_param_t, config: &EncoderConfig) -> EngineResult<()> {
    params.i_csp = config.pixel_format.csp();
    params.i_width = config.width as _;
    params.i_height = config.height as _;
    params.i_fps_num = c_int(config.fps_num)? as _;
    params.i_fps_den = c_int(config.fps_den)? as _;
    params.i_keyint_max = c_int(config.keyint_max)?;
    apply_rate_control(params, &config.rc);
    params.b_repeat_headers = config.repeat_headers as _;
    params.b_annexb = config.annexb as _;
    Ok(())
}

fn read_config(params: &sys::x264_param_t, config: &mut EncoderConfig) {
    if let Some(pixel_format) = PixelFormat::from_csp(params.i_csp) {
        config.pixel_format = pixel_format;
    }
    config.width = params.i_width.clamp(0, u16::MAX as _) as _;
    config.height = params.i_height.clamp(0, u16::MAX as _) as _;
    config.fps_num = params.i_fps_num.max(0) as _;
    config.fps_den = params.i_fps_den.max(0) as _;
    config.keyint_max = params.i_keyint_max.max(0) as _;
    config.rc = RateControl {
        method: RateControlMethod::from_x264(params.rc.i_rc_method),
        bitrate_kbps: params.rc.i_bitrate.max(0) as _,
        rate_tolerance: params.rc.f_rate_tolerance,
        vbv_max_bitrate_kbps: params.rc.i_vbv_max_bitrate.max(0) as _,
        vbv_buffer_size_kbit: params.rc.i_vbv_buffer_size.max(0) as _,
        vbv_buffer_init: params.rc.f_vbv_buffer_init,
    };
    config.repeat_headers = params.b_repeat_headers != 0;
    config.annexb = params.b_annexb != 0;
}

fn apply_profile(params: &mut sys::x264_param_t, profile: &str) -> EngineResult<()> {
    let profile = c_string(profile)?;
    let code = unsafe { sys::x264_param_apply_profile(params as _, profile.as_ptr()) };
    if code < 0 {
        return Err(EngineFailure { code });
    }
    Ok(())
}

/// Builds the native parameters for a configuration the same way they were derived: preset and
/// tuning first, then the configured fields, then the profile.
fn native_params(config: &EncoderConfig) -> EngineResult<sys::x264_param_t> {
    let mut params = default_params(&config.preset, &config.tune)?;
    apply_config(&mut params, config)?;
    if let Some(profile) = &config.profile {
        apply_profile(&mut params, profile)?;
    }
    Ok(params)
}

/// libx264. Log output from the library goes to the `log` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct X264Engine;

impl Engine for X264Engine {
    type Session = X264Session;

    fn default_preset(&self, preset: &str, tune: &str) -> EngineResult<EncoderConfig> {
        let params = default_params(preset, tune)?;
        let mut config = EncoderConfig {
            preset: preset.to_owned(),
            tune: tune.to_owned(),
            profile: None,
            pixel_format: PixelFormat::I420,
            width: 0,
            height: 0,
            fps_num: 0,
            fps_den: 0,
            keyint_max: 0,
            rc: RateControl {
                method: RateControlMethod::ConstantRateFactor,
                bitrate_kbps: 0,
                rate_tolerance: 0.0,
                vbv_max_bitrate_kbps: 0,
                vbv_buffer_size_kbit: 0,
                vbv_buffer_init: 0.0,
            },
            repeat_headers: false,
            annexb: false,
        };
        read_config(&params, &mut config);
        Ok(config)
    }

    fn apply_profile(&self, config: &mut EncoderConfig, profile: &str) -> EngineResult<()> {
        let mut params = native_params(config)?;
        apply_profile(&mut params, profile)?;
        read_config(&params, config);
        config.profile = Some(profile.to_owned());
        Ok(())
    }

    fn picture_layout(&self, pixel_format: PixelFormat, width: u16, height: u16) -> EngineResult<PictureLayout> {
        unsafe {
            let mut pic: mem::MaybeUninit<sys::x264_picture_t> = mem::MaybeUninit::uninit();
            let code = sys::x264_picture_alloc(pic.as_mut_ptr(), pixel_format.csp(), width as _, height as _);
            if code < 0 {
                return Err(EngineFailure { code });
            }
            let mut pic = pic.assume_init();
            let strides = [pic.img.i_stride[0] as usize, pic.img.i_stride[1] as usize, pic.img.i_stride[2] as usize];
            // only the strides are needed, the planes are bound to caller memory on every encode
            sys::x264_picture_clean(&mut pic as _);
            Ok(PictureLayout {
                pixel_format,
                width,
                height,
                strides,
            })
        }
    }

    fn open(&self, config: &EncoderConfig) -> EngineResult<X264Session> {
        let mut params = native_params(config)?;
        let encoder = unsafe { sys::x264_encoder_open(&mut params as _) };
        if encoder.is_null() {
            return Err(EngineFailure::UNSPECIFIED);
        }
        Ok(X264Session {
            encoder,
            params,
            next_pts: 0,
        })
    }
}

pub struct X264Session {
    encoder: *mut sys::x264_t,
    params: sys::x264_param_t,
    next_pts: i64,
}

// The encoder handle isn't tied to the thread that opened it. Access is serialized by `&mut self`.
unsafe impl Send for X264Session {}

impl Drop for X264Session {
    fn drop(&mut self) {
        unsafe {
            sys::x264_encoder_close(self.encoder);
        }
    }
}

impl X264Session {
    fn do_encode(&mut self, pic: Option<&mut sys::x264_picture_t>) -> EngineOutput<'_> {
        let mut nals: *mut sys::x264_nal_t = ptr::null_mut();
        let mut nal_count = 0;
        unsafe {
            let mut pic_out = {
                let mut pic: mem::MaybeUninit<sys::x264_picture_t> = mem::MaybeUninit::uninit();
                sys::x264_picture_init(pic.as_mut_ptr());
                pic.assume_init()
            };
            let frame_size = sys::x264_encoder_encode(
                self.encoder,
                &mut nals as _,
                &mut nal_count as _,
                match pic {
                    Some(pic) => pic as _,
                    None => ptr::null_mut(),
                },
                &mut pic_out as _,
            );
            if frame_size <= 0 || nals.is_null() || nal_count <= 0 {
                return EngineOutput::empty(frame_size.min(0));
            }
            // the payloads of all of the NALs are sequential in memory
            EngineOutput {
                frame_size,
                payload: slice::from_raw_parts((*nals).p_payload, frame_size as _),
            }
        }
    }
}

impl EngineSession for X264Session {
    fn encode(&mut self, picture: &Picture<'_>) -> EngineOutput<'_> {
        let mut pic = unsafe {
            let mut pic: mem::MaybeUninit<sys::x264_picture_t> = mem::MaybeUninit::uninit();
            sys::x264_picture_init(pic.as_mut_ptr());
            pic.assume_init()
        };
        pic.img.i_csp = picture.layout.pixel_format.csp();
        pic.img.i_plane = picture.planes.len() as _;
        for (i, plane) in picture.planes.iter().enumerate() {
            pic.img.plane[i] = plane.as_ptr() as _;
            pic.img.i_stride[i] = picture.layout.strides[i] as _;
        }
        pic.i_type = (match picture.frame_type {
            FrameType::Auto => sys::X264_TYPE_AUTO,
            FrameType::Idr => sys::X264_TYPE_IDR,
        }) as _;
        pic.i_pts = self.next_pts;
        self.next_pts += 1;
        self.do_encode(Some(&mut pic))
    }

    fn flush(&mut self) -> EngineOutput<'_> {
        self.do_encode(None)
    }

    fn delayed_frames(&self) -> usize {
        unsafe { sys::x264_encoder_delayed_frames(self.encoder).max(0) as _ }
    }

    fn reconfigure(&mut self, config: &EncoderConfig) -> EngineResult<()> {
        apply_rate_control(&mut self.params, &config.rc);
        let code = unsafe { sys::x264_encoder_reconfig(self.encoder, &mut self.params as _) };
        if code < 0 {
            return Err(EngineFailure { code });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{EncoderSession, Preset, StreamParameters, X264EncoderError, PROFILE, TUNE};

    fn params() -> StreamParameters {
        StreamParameters {
            pixel_format: PixelFormat::I420,
            width: 1280,
            height: 720,
            fps: 30,
            keyframe_interval: 60,
            bitrate: 2_000_000,
            vbv_max_bitrate: 2_500_000,
            vbv_buffer_size: 2_500_000,
        }
    }

    /// A gradient with a line that moves from top to bottom.
    fn luma(frame: usize, width: usize, height: usize) -> Vec<u8> {
        let mut y = Vec::with_capacity(width * height);
        for line in 0..height {
            let sample = if line / 8 == frame % (height / 8) {
                16
            } else {
                (16.0 + (line as f64 / height as f64) * 219.0).round() as u8
            };
            y.resize(y.len() + width, sample);
        }
        y
    }

    #[test]
    fn test_default_preset() {
        let config = X264Engine.default_preset("veryfast", TUNE).unwrap();
        assert_eq!(config.preset, "veryfast");
        assert!(config.annexb);
        assert!(matches!(X264Engine.default_preset("turbo-ultra", TUNE), Err(EngineFailure { .. })));
    }

    #[test]
    fn test_keyframe_interval_survives_profile() {
        let params = StreamParameters {
            keyframe_interval: i32::MAX as u32,
            ..params()
        };
        let config = EncoderConfig::translate(&X264Engine, &params, "veryfast").unwrap();
        assert_eq!(config.keyint_max, i32::MAX as u32);

        let mut config = config;
        config.keyint_max = 3_000_000_000;
        assert!(X264Engine.apply_profile(&mut config, PROFILE).is_err());
        assert_eq!(config.keyint_max, 3_000_000_000);
    }

    #[test]
    fn test_unknown_csp_keeps_pixel_format() {
        let mut config = X264Engine.default_preset("veryfast", TUNE).unwrap();
        config.pixel_format = PixelFormat::I444;
        let mut params = default_params("veryfast", TUNE).unwrap();
        params.i_csp = sys::X264_CSP_NV12 as _;
        read_config(&params, &mut config);
        assert_eq!(config.pixel_format, PixelFormat::I444);

        params.i_csp = sys::X264_CSP_I422 as _;
        read_config(&params, &mut config);
        assert_eq!(config.pixel_format, PixelFormat::I422);
    }

    #[test]
    fn test_picture_layout() {
        let layout = X264Engine.picture_layout(PixelFormat::I420, 1280, 720).unwrap();
        assert!(layout.strides[0] >= 1280);
        assert!(layout.strides[1] >= 640);
        assert!(layout.strides[2] >= 640);
    }

    #[test]
    fn test_session() {
        let mut session = EncoderSession::open(&X264Engine, &params(), Preset::VeryFast).unwrap();
        assert_eq!((session.width(), session.height(), session.pixel_format()), (1280, 720, PixelFormat::I420));
        assert_eq!(session.config().profile.as_deref(), Some(PROFILE));

        let u = vec![128u8; 640 * 360];
        let v = vec![128u8; 640 * 360];

        let mut encoded = vec![];
        let mut encoded_keyframes = 0;
        for i in 0..90 {
            if i == 45 {
                session.set_bitrate(1_000_000).unwrap();
                assert_eq!(session.bitrate_kbps(), 1000);
            }
            if i % 30 == 0 {
                session.force_key_frame();
            }
            let y = luma(i, 1280, 720);
            let unit = session.encode(&y, &u, &v).unwrap();
            assert!(!unit.is_empty());
            if unit.is_keyframe() {
                encoded_keyframes += 1;
                if !unit.has_parameter_sets() {
                    panic!("keyframe {} does not contain sps and pps", encoded_keyframes);
                }
            }
            encoded.extend_from_slice(&unit);
        }
        assert!(session.flush().unwrap().is_none());

        assert_eq!(encoded_keyframes, 3);
        assert!(encoded.len() > 1000);

        // To inspect the output, uncomment these lines:
        //use std::io::Write;
        //std::fs::File::create("tmp.h264").unwrap().write_all(&encoded).unwrap();
    }

    #[test]
    fn test_invalid_preset() {
        assert!(matches!(
            EncoderSession::open(&X264Engine, &params(), "turbo-ultra"),
            Err(X264EncoderError::InvalidPreset { .. })
        ));
    }

    #[test]
    fn test_profile_rejected() {
        let params = StreamParameters {
            pixel_format: PixelFormat::I444,
            ..params()
        };
        assert!(matches!(
            EncoderSession::open(&X264Engine, &params, "veryfast"),
            Err(X264EncoderError::ProfileRejected { .. })
        ));
    }
}
