use alloc::vec::Vec;

pub trait RawVideoFrame<S> {
    /// The samples that make up one plane of the frame's image. Typically this consists of 3 Y/U/V
    /// planes of `u8`s, but any format that the encoder supports can be used.
    fn samples(&self, plane: usize) -> &[S];
}

/// The frame type requested for an input frame.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EncodedFrameType {
    /// The encoder decides.
    #[default]
    Auto,
    /// The frame must be encoded as a key frame that a decoder can start from.
    Key,
}

#[derive(Clone, Debug)]
pub struct EncodedVideoFrame {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
}

pub struct VideoEncoderOutput<F> {
    pub raw_frame: F,
    pub encoded_frame: EncodedVideoFrame,
}

/// Implements basic video encoding behavior. The raw frame is handed back with its encoded
/// counterpart so that arbitrary context can travel with it.
///
/// Typical usage should look like this:
///
/// ```
/// # use av_traits::{EncodedFrameType, RawVideoFrame, VideoEncoder};
/// fn encode<S, E>(mut source: S, mut encoder: E) -> Result<(), E::Error>
///     where S: Iterator<Item = E::RawVideoFrame>,
///     E: VideoEncoder,
/// {
///     let mut frame_type = EncodedFrameType::Key;
///     while let Some(frame) = source.next() {
///         if let Some(output) = encoder.encode(frame, frame_type)? {
///             // do something with output.encoded_frame
///         }
///         frame_type = EncodedFrameType::Auto;
///     }
///
///     while let Some(output) = encoder.flush()? {
///         // do something with output.encoded_frame
///     }
///
///     Ok(())
/// }
/// ```
pub trait VideoEncoder {
    type Error;
    type RawVideoFrame;

    /// Sends a frame to the encoder. This may block while the encoder performs encoding.
    ///
    /// `None` may be returned at the start of a session to allow for delayed encoder output (e.g.
    /// for B-frames or lookahead RC).
    ///
    /// Because output may be delayed, the returned frame is not necessarily the same as the input
    /// frame.
    fn encode(&mut self, frame: Self::RawVideoFrame, frame_type: EncodedFrameType) -> Result<Option<VideoEncoderOutput<Self::RawVideoFrame>>, Self::Error>;

    /// Indicates to the encoder that no more input will be provided and it should emit any delayed
    /// frames. This should be invoked until no more frames are returned.
    fn flush(&mut self) -> Result<Option<VideoEncoderOutput<Self::RawVideoFrame>>, Self::Error>;
}
