//! Generic stream decoder trait for the playback path.

use crate::error::CodecError;

/// Converts compressed frames into mono i16 PCM at the playback rate.
///
/// Implementations handle format-specific decoding and output resampling
/// internally. Decoding runs on the background worker, so implementors
/// must be `Send`.
pub trait StreamDecoder: Send {
    /// Decode one compressed frame.
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, CodecError>;

    /// Forget inter-frame state.
    fn reset(&mut self);

    /// Rebuild for a new stream rate. Same rate is a no-op.
    fn set_sample_rate(&mut self, sample_rate: u32) -> Result<(), CodecError>;

    fn sample_rate(&self) -> u32;
}
