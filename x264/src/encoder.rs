use super::{engine::Engine, error::Result, EncoderSession, StreamParameters, X264EncoderError};
use av_traits::{BitrateControl, EncodedFrameType, EncodedVideoFrame, KeyFrameControl, RawVideoFrame, VideoEncoder, VideoEncoderOutput};
use std::collections::VecDeque;

/// Adapts an [`EncoderSession`] to [`VideoEncoder`] for use in pipelines. Output is copied out of
/// the engine's buffer, and frames the engine holds back are reported as `None` rather than as
/// errors.
pub struct X264Encoder<E: Engine, F> {
    session: EncoderSession<E>,
    pending_frames: VecDeque<F>,
}

impl<E: Engine, F> X264Encoder<E, F> {
    pub fn new<P: AsRef<str>>(engine: &E, params: &StreamParameters, preset: P) -> Result<Self> {
        Ok(Self {
            session: EncoderSession::open(engine, params, preset)?,
            pending_frames: VecDeque::new(),
        })
    }

    pub fn session(&self) -> &EncoderSession<E> {
        &self.session
    }

    fn output(&mut self, encoded_frame: EncodedVideoFrame) -> Option<VideoEncoderOutput<F>> {
        self.pending_frames
            .pop_front()
            .map(|raw_frame| VideoEncoderOutput { raw_frame, encoded_frame })
    }
}

impl<E: Engine, F: RawVideoFrame<u8>> VideoEncoder for X264Encoder<E, F> {
    type Error = X264EncoderError;
    type RawVideoFrame = F;

    fn encode(&mut self, input: F, frame_type: EncodedFrameType) -> Result<Option<VideoEncoderOutput<F>>> {
        if frame_type == EncodedFrameType::Key {
            self.session.force_key_frame();
        }

        let encoded_frame = match self.session.encode(input.samples(0), input.samples(1), input.samples(2)) {
            Ok(unit) => Some(EncodedVideoFrame {
                data: unit.to_vec(),
                is_keyframe: unit.is_keyframe(),
            }),
            // the engine is holding the frame back, it'll come out of a later call
            Err(X264EncoderError::EncodeFailed { frame_size: 0 }) => None,
            Err(e) => return Err(e),
        };
        self.pending_frames.push_back(input);

        Ok(match encoded_frame {
            Some(encoded_frame) => self.output(encoded_frame),
            None => None,
        })
    }

    fn flush(&mut self) -> Result<Option<VideoEncoderOutput<F>>> {
        let encoded_frame = match self.session.flush()? {
            Some(unit) => EncodedVideoFrame {
                data: unit.to_vec(),
                is_keyframe: unit.is_keyframe(),
            },
            None => return Ok(None),
        };
        Ok(self.output(encoded_frame))
    }
}

impl<E: Engine, F> BitrateControl for X264Encoder<E, F> {
    type Error = X264EncoderError;

    fn set_bitrate(&mut self, bits_per_second: u32) -> Result<()> {
        self.session.set_bitrate(bits_per_second)
    }
}

impl<E: Engine, F> KeyFrameControl for X264Encoder<E, F> {
    fn force_key_frame(&mut self) {
        self.session.force_key_frame();
    }
}
