/// Live rate control for encoders feeding a network stream. Typically driven by a congestion
/// controller's bandwidth estimate.
pub trait BitrateControl {
    type Error;

    /// Retargets the encoder's average bitrate without restarting the stream. Implementations may
    /// treat requests they consider insignificant as successful no-ops.
    fn set_bitrate(&mut self, bits_per_second: u32) -> Result<(), Self::Error>;
}

/// Key frame requests, e.g. in response to a receiver's picture loss indication.
pub trait KeyFrameControl {
    /// Requests that the next frame submitted to the encoder be a key frame. The request applies
    /// to exactly one frame.
    fn force_key_frame(&mut self);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stream_control_object_safety() {
        let _b: *const dyn BitrateControl<Error = ()>;
        let _k: *const dyn KeyFrameControl;
    }
}
