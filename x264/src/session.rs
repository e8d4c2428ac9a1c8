use super::{
    config::{MIN_BITRATE_KBPS, RATE_CONTROL_MARGIN_KBPS, RECONFIG_RATE_TOLERANCE, RECONFIG_VBV_BUFFER_INIT},
    engine::{Engine, EngineSession, FrameType, Picture, PictureLayout},
    error::Result,
    nal::{iterate_annex_b, AnnexBIter, NalUnitType},
    EncoderConfig, PixelFormat, StreamParameters, X264EncoderError,
};
use std::ops::Deref;

/// The output of one encode call: zero or more NAL units making up at most one access unit, in
/// Annex B framing.
///
/// The bytes live in the engine's output buffer, which the next encode call on the same session
/// overwrites. The borrow on the session prevents that call while the unit is alive. Use
/// [`EncodedUnit::to_vec`] to keep the data around longer.
#[derive(Clone, Copy, Debug)]
pub struct EncodedUnit<'a> {
    data: &'a [u8],
}

impl<'a> EncodedUnit<'a> {
    pub fn as_slice(&self) -> &'a [u8] {
        self.data
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn nal_units(&self) -> AnnexBIter<'a> {
        iterate_annex_b(self.data)
    }

    /// Whether the unit contains an IDR slice.
    pub fn is_keyframe(&self) -> bool {
        self.nal_units().any(|nalu| NalUnitType::of(nalu) == Some(NalUnitType::IdrSlice))
    }

    /// Whether the unit carries its own SPS and PPS, so a decoder can start from it.
    pub fn has_parameter_sets(&self) -> bool {
        let mut sps = false;
        let mut pps = false;
        for nalu in self.nal_units() {
            match NalUnitType::of(nalu) {
                Some(NalUnitType::SequenceParameterSet) => sps = true,
                Some(NalUnitType::PictureParameterSet) => pps = true,
                _ => {}
            }
        }
        sps && pps
    }
}

impl Deref for EncodedUnit<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

impl AsRef<[u8]> for EncodedUnit<'_> {
    fn as_ref(&self) -> &[u8] {
        self.data
    }
}

/// A live encoder. All operations take `&mut self`, so calls on one session are serialized;
/// independent sessions share nothing and can run on separate threads.
///
/// Dropping the session (or calling [`EncoderSession::close`]) releases the engine session.
pub struct EncoderSession<E: Engine> {
    session: E::Session,
    config: EncoderConfig,
    layout: PictureLayout,
    force_key_frame: bool,
    frames_submitted: u64,
}

impl<E: Engine> EncoderSession<E> {
    /// Translates the parameters into a configuration and opens a session with it.
    pub fn open<P: AsRef<str>>(engine: &E, params: &StreamParameters, preset: P) -> Result<Self> {
        let config = EncoderConfig::translate(engine, params, preset.as_ref())?;
        Self::from_config(engine, config)
    }

    /// Opens a session with an already validated configuration. Nothing is retained on failure.
    pub fn from_config(engine: &E, config: EncoderConfig) -> Result<Self> {
        // The engine computes plane strides for us. Planes themselves come from the caller on
        // every encode call, so no pixel storage is kept.
        let layout = engine
            .picture_layout(config.pixel_format, config.width, config.height)
            .map_err(|e| X264EncoderError::PictureAllocFailed { code: e.code })?;

        let session = engine.open(&config).map_err(|e| X264EncoderError::EngineOpenFailed { code: e.code })?;

        log::debug!(
            "opened {}x{} {:?} session: preset={} tune={} fps={}/{} keyint={} bitrate={}kbps vbv={}kbps/{}kbit",
            config.width,
            config.height,
            config.pixel_format,
            config.preset,
            config.tune,
            config.fps_num,
            config.fps_den,
            config.keyint_max,
            config.rc.bitrate_kbps,
            config.rc.vbv_max_bitrate_kbps,
            config.rc.vbv_buffer_size_kbit,
        );

        Ok(Self {
            session,
            config,
            layout,
            force_key_frame: false,
            frames_submitted: 0,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn layout(&self) -> &PictureLayout {
        &self.layout
    }

    pub fn width(&self) -> u16 {
        self.config.width
    }

    pub fn height(&self) -> u16 {
        self.config.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.config.pixel_format
    }

    /// The configured target bitrate. After a failed bitrate change this reflects the rejected
    /// value rather than what the engine is using.
    pub fn bitrate_kbps(&self) -> u32 {
        self.config.rc.bitrate_kbps
    }

    /// The number of encode calls made, including failed ones.
    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }

    /// The number of frames the engine is holding back.
    pub fn delayed_frames(&self) -> usize {
        self.session.delayed_frames()
    }

    /// Makes the next encoded frame an IDR frame. The request applies to the next encode call
    /// only, whether or not it succeeds.
    pub fn force_key_frame(&mut self) {
        self.force_key_frame = true;
    }

    pub fn is_key_frame_forced(&self) -> bool {
        self.force_key_frame
    }

    /// Encodes one frame from the given Y, Cb and Cr planes, which must match the session's
    /// layout.
    ///
    /// Any non-positive result from the engine is reported as [`X264EncoderError::EncodeFailed`],
    /// including a frame the engine merely buffered (`frame_size == 0`). Callers that care about
    /// the difference can inspect the frame size. In either case the session stays usable and the
    /// stream should continue with the next frame.
    pub fn encode(&mut self, y: &[u8], cb: &[u8], cr: &[u8]) -> Result<EncodedUnit<'_>> {
        let frame_type = if self.force_key_frame { FrameType::Idr } else { FrameType::Auto };
        self.force_key_frame = false;
        self.frames_submitted += 1;

        let planes = [y, cb, cr];
        for (i, plane) in planes.iter().enumerate() {
            let expected = self.layout.plane_len(i);
            if plane.len() < expected {
                return Err(X264EncoderError::UnexpectedPlaneLayout {
                    plane: i,
                    expected,
                    actual: plane.len(),
                });
            }
        }

        let picture = Picture {
            layout: &self.layout,
            planes,
            frame_type,
        };
        let frame = self.frames_submitted;
        let output = self.session.encode(&picture);
        if output.frame_size <= 0 {
            if output.frame_size == 0 {
                log::debug!("no output for frame {}", frame);
            } else {
                log::warn!("encode of frame {} failed (frame size = {})", frame, output.frame_size);
            }
            return Err(X264EncoderError::EncodeFailed {
                frame_size: output.frame_size,
            });
        }

        let data = &output.payload[..(output.frame_size as usize).min(output.payload.len())];
        log::trace!("encoded frame {} ({:?}): {} bytes", frame, frame_type, data.len());
        Ok(EncodedUnit { data })
    }

    /// Emits one frame the engine held back, or `None` once there are none left.
    pub fn flush(&mut self) -> Result<Option<EncodedUnit<'_>>> {
        if self.session.delayed_frames() == 0 {
            return Ok(None);
        }
        let output = self.session.flush();
        if output.frame_size < 0 {
            log::warn!("flush failed (frame size = {})", output.frame_size);
            return Err(X264EncoderError::EncodeFailed {
                frame_size: output.frame_size,
            });
        }
        if output.frame_size == 0 {
            return Ok(None);
        }
        let data = &output.payload[..(output.frame_size as usize).min(output.payload.len())];
        Ok(Some(EncodedUnit { data }))
    }

    /// Retargets the live encoder to the given bitrate in bits/second.
    ///
    /// Requests that round to the current bitrate in kbit/s, or to 1 kbit/s or less, succeed
    /// without doing anything. If the engine rejects the change, the session's configuration
    /// has already been updated to the rejected values and isn't rolled back.
    pub fn set_bitrate(&mut self, bits_per_second: u32) -> Result<()> {
        let bitrate_kbps = bits_per_second / 1000;
        if bitrate_kbps == self.config.rc.bitrate_kbps || bitrate_kbps <= MIN_BITRATE_KBPS {
            log::debug!(
                "ignoring bitrate change to {} bps (configured: {} kbps)",
                bits_per_second,
                self.config.rc.bitrate_kbps
            );
            return Ok(());
        }

        let rc = &mut self.config.rc;
        rc.bitrate_kbps = bitrate_kbps;
        rc.rate_tolerance = RECONFIG_RATE_TOLERANCE;
        rc.vbv_max_bitrate_kbps = bitrate_kbps + RATE_CONTROL_MARGIN_KBPS / 2;
        rc.vbv_buffer_size_kbit = rc.vbv_max_bitrate_kbps;
        rc.vbv_buffer_init = RECONFIG_VBV_BUFFER_INIT;

        match self.session.reconfigure(&self.config) {
            Ok(()) => {
                log::info!("bitrate changed to {} kbps", bitrate_kbps);
                Ok(())
            }
            Err(e) => {
                log::warn!("engine rejected bitrate change to {} kbps (code = {})", bitrate_kbps, e.code);
                Err(X264EncoderError::BitrateReconfigFailed { code: e.code, bitrate_kbps })
            }
        }
    }

    /// Releases the engine session.
    pub fn close(self) {}
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{testing::FakeEngine, Preset};

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

    fn planes(session: &EncoderSession<FakeEngine>, luma: u8) -> [Vec<u8>; 3] {
        let layout = session.layout();
        [vec![luma; layout.plane_len(0)], vec![128; layout.plane_len(1)], vec![128; layout.plane_len(2)]]
    }

    #[test]
    fn test_open() {
        let engine = FakeEngine::new();
        let session = EncoderSession::open(&engine, &params(), Preset::VeryFast).unwrap();
        assert_eq!(session.width(), 1280);
        assert_eq!(session.height(), 720);
        assert_eq!(session.pixel_format(), PixelFormat::I420);
        assert_eq!(session.bitrate_kbps(), 2000);
        assert!(!session.is_key_frame_forced());
        assert_eq!(session.layout().strides, [1280, 640, 640]);
        assert_eq!(engine.open_sessions(), 1);
        assert_eq!(engine.pictures_allocated(), 1);

        session.close();
        assert_eq!(engine.open_sessions(), 0);
    }

    #[test]
    fn test_open_reports_geometry() {
        let engine = FakeEngine::new();
        for (pixel_format, width, height) in [(PixelFormat::I420, 640, 480), (PixelFormat::I420, 1920, 1080), (PixelFormat::I420, 2, 2)] {
            let params = StreamParameters {
                pixel_format,
                width,
                height,
                ..params()
            };
            let session = EncoderSession::open(&engine, &params, "ultrafast").unwrap();
            assert_eq!((session.pixel_format(), session.width(), session.height()), (pixel_format, width, height));
        }
        assert_eq!(engine.open_sessions(), 0);
    }

    #[test]
    fn test_open_invalid_preset() {
        let engine = FakeEngine::new();
        match EncoderSession::open(&engine, &params(), "turbo-ultra") {
            Err(X264EncoderError::InvalidPreset { preset }) => assert_eq!(preset, "turbo-ultra"),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("session should not open"),
        }
        assert_eq!(engine.pictures_allocated(), 0);
        assert_eq!(engine.open_sessions(), 0);
    }

    #[test]
    fn test_open_picture_alloc_failed() {
        let engine = FakeEngine::new();
        engine.fail_picture_layout(true);
        assert!(matches!(
            EncoderSession::open(&engine, &params(), "veryfast"),
            Err(X264EncoderError::PictureAllocFailed { .. })
        ));
        assert_eq!(engine.open_sessions(), 0);
    }

    #[test]
    fn test_open_engine_rejects() {
        let engine = FakeEngine::new();
        engine.fail_open(true);
        let err = EncoderSession::open(&engine, &params(), "veryfast").err().expect("open should fail");
        assert!(matches!(err, X264EncoderError::EngineOpenFailed { .. }));
        assert!(!err.is_recoverable());
        // the layout is computed before the engine gets to reject the configuration
        assert_eq!(engine.pictures_allocated(), 1);
        assert_eq!(engine.open_sessions(), 0);

        // odd 4:2:0 geometry passes profile validation but not the engine's own checks
        let engine = FakeEngine::new();
        let params = StreamParameters { width: 641, ..params() };
        assert!(EncoderConfig::translate(&engine, &params, "veryfast").is_ok());
        assert!(matches!(
            EncoderSession::open(&engine, &params, "veryfast"),
            Err(X264EncoderError::EngineOpenFailed { .. })
        ));
        assert_eq!(engine.open_sessions(), 0);
    }

    #[test]
    fn test_first_frame_forced_key_frame() {
        let engine = FakeEngine::new();
        let mut session = EncoderSession::open(&engine, &params(), "veryfast").unwrap();
        let [y, cb, cr] = planes(&session, 16);

        session.force_key_frame();
        assert!(session.is_key_frame_forced());
        let unit = session.encode(&y, &cb, &cr).unwrap();
        assert!(!unit.is_empty());
        assert!(unit.is_keyframe());
        assert!(unit.has_parameter_sets());
        assert!(unit.starts_with(&[0, 0, 0, 1]));
        assert!(!session.is_key_frame_forced());
        assert_eq!(engine.requested_frame_types(), vec![FrameType::Idr]);
    }

    #[test]
    fn test_force_key_frame_is_one_shot() {
        let engine = FakeEngine::new();
        let mut session = EncoderSession::open(&engine, &params(), "veryfast").unwrap();
        let [y, cb, cr] = planes(&session, 16);

        session.encode(&y, &cb, &cr).unwrap();
        session.force_key_frame();
        let unit = session.encode(&y, &cb, &cr).unwrap();
        assert!(unit.is_keyframe());
        let unit = session.encode(&y, &cb, &cr).unwrap();
        assert!(!unit.is_keyframe());
        assert!(!unit.has_parameter_sets());

        assert_eq!(engine.requested_frame_types(), vec![FrameType::Auto, FrameType::Idr, FrameType::Auto]);
    }

    #[test]
    fn test_force_key_frame_cleared_on_failure() {
        let engine = FakeEngine::new();
        let mut session = EncoderSession::open(&engine, &params(), "veryfast").unwrap();
        let [y, cb, cr] = planes(&session, 16);

        engine.fail_encode_with(Some(-1));
        session.force_key_frame();
        let err = session.encode(&y, &cb, &cr).err().expect("encode should fail");
        assert!(matches!(err, X264EncoderError::EncodeFailed { frame_size: -1 }));
        assert!(err.is_recoverable());
        assert!(!session.is_key_frame_forced());
        assert_eq!(engine.requested_frame_types(), vec![FrameType::Idr]);

        // the session is still usable
        engine.fail_encode_with(None);
        assert!(!session.encode(&y, &cb, &cr).unwrap().is_empty());
        assert_eq!(session.frames_submitted(), 2);
    }

    #[test]
    fn test_force_key_frame_cleared_on_bad_planes() {
        let engine = FakeEngine::new();
        let mut session = EncoderSession::open(&engine, &params(), "veryfast").unwrap();
        let [y, cb, _] = planes(&session, 16);

        session.force_key_frame();
        match session.encode(&y, &cb, &[0; 16]) {
            Err(X264EncoderError::UnexpectedPlaneLayout { plane, expected, actual }) => {
                assert_eq!(plane, 2);
                assert_eq!(expected, 640 * 360);
                assert_eq!(actual, 16);
            }
            r => panic!("unexpected result: {:?}", r.map(|u| u.len())),
        }
        assert!(!session.is_key_frame_forced());
        // nothing reached the engine
        assert!(engine.requested_frame_types().is_empty());
    }

    #[test]
    fn test_buffered_frame_is_reported_as_failure() {
        let engine = FakeEngine::new();
        engine.set_lookahead(1);
        let mut session = EncoderSession::open(&engine, &params(), "veryfast").unwrap();
        let [y, cb, cr] = planes(&session, 16);

        assert!(matches!(session.encode(&y, &cb, &cr), Err(X264EncoderError::EncodeFailed { frame_size: 0 })));
        assert_eq!(session.delayed_frames(), 1);
        assert!(session.encode(&y, &cb, &cr).unwrap().is_keyframe());
        assert!(!session.flush().unwrap().expect("one frame should be delayed").is_keyframe());
        assert!(session.flush().unwrap().is_none());
    }

    #[test]
    fn test_repeated_encodes() {
        let engine = FakeEngine::new();
        let mut session = EncoderSession::open(&engine, &params(), "veryfast").unwrap();
        let [y, cb, cr] = planes(&session, 100);

        let mut keyframes = 0;
        for _ in 0..180 {
            let unit = session.encode(&y, &cb, &cr).unwrap();
            assert!(!unit.is_empty());
            if unit.is_keyframe() {
                keyframes += 1;
                assert!(unit.has_parameter_sets(), "key frames must repeat headers");
            }
        }
        assert_eq!(keyframes, 3);
        assert_eq!(session.frames_submitted(), 180);
    }

    #[test]
    fn test_copied_units_outlive_the_next_encode() {
        let engine = FakeEngine::new();
        let mut session = EncoderSession::open(&engine, &params(), "veryfast").unwrap();
        let [y, cb, cr] = planes(&session, 16);

        session.force_key_frame();
        let first = session.encode(&y, &cb, &cr).unwrap().to_vec();
        let second = session.encode(&y, &cb, &cr).unwrap().to_vec();
        assert_ne!(first, second);
        assert!(crate::iterate_annex_b(&first).count() >= 3);
    }

    #[test]
    fn test_set_bitrate() {
        let engine = FakeEngine::new();
        let mut session = EncoderSession::open(&engine, &params(), "veryfast").unwrap();

        session.set_bitrate(1_000_000).unwrap();
        assert_eq!(session.bitrate_kbps(), 1000);
        let rc = &session.config().rc;
        assert_eq!(rc.rate_tolerance, RECONFIG_RATE_TOLERANCE);
        assert_eq!(rc.vbv_max_bitrate_kbps, 1005);
        assert_eq!(rc.vbv_buffer_size_kbit, 1005);
        assert_eq!(rc.vbv_buffer_init, RECONFIG_VBV_BUFFER_INIT);

        let reconfigurations = engine.reconfigurations();
        assert_eq!(reconfigurations.len(), 1);
        assert_eq!(&reconfigurations[0], session.config());
    }

    #[test]
    fn test_set_bitrate_no_op() {
        let engine = FakeEngine::new();
        let mut session = EncoderSession::open(&engine, &params(), "veryfast").unwrap();
        let before = session.config().clone();

        // the same bitrate after rounding down to kbit/s
        session.set_bitrate(2_000_000).unwrap();
        session.set_bitrate(2_000_999).unwrap();
        // too small to mean anything
        session.set_bitrate(0).unwrap();
        session.set_bitrate(1_999).unwrap();

        assert_eq!(session.config(), &before);
        assert!(engine.reconfigurations().is_empty());

        // 2 kbit/s is above the threshold
        session.set_bitrate(2_000).unwrap();
        assert_eq!(session.bitrate_kbps(), 2);
    }

    #[test]
    fn test_set_bitrate_rejected() {
        let engine = FakeEngine::new();
        let mut session = EncoderSession::open(&engine, &params(), "veryfast").unwrap();

        engine.fail_reconfigure(true);
        let err = session.set_bitrate(500_000).err().expect("reconfiguration should fail");
        assert!(matches!(err, X264EncoderError::BitrateReconfigFailed { bitrate_kbps: 500, .. }));
        assert!(err.is_recoverable());

        // the attempted values stick
        assert_eq!(session.bitrate_kbps(), 500);
        assert_eq!(session.config().rc.vbv_max_bitrate_kbps, 505);

        // so retrying the same bitrate is now a no-op
        engine.fail_reconfigure(false);
        session.set_bitrate(500_000).unwrap();
        assert!(engine.reconfigurations().is_empty());
    }

    #[test]
    fn test_independent_sessions_in_parallel() {
        let engine = FakeEngine::new();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    let mut session = EncoderSession::open(&engine, &params(), "veryfast").unwrap();
                    let [y, cb, cr] = planes(&session, i);
                    for _ in 0..30 {
                        session.encode(&y, &cb, &cr).unwrap();
                    }
                    session.set_bitrate(1_000_000 + i as u32 * 100_000).unwrap();
                    session.frames_submitted()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 30);
        }
        assert_eq!(engine.open_sessions(), 0);
        assert_eq!(engine.reconfigurations().len(), 4);
    }
}
