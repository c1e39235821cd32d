//! audio - Codec pipeline between the device's PCM hardware and the session
//!
//! Resampling, Opus encode/decode, the playback decode queue and built-in
//! prompt sounds. Pure data transforms; threading is the caller's business.

pub mod decode_queue;
pub mod opus_codec;
pub mod prompt_sound;
pub mod resampler;
pub mod stream_decoder;

pub use decode_queue::{AudioFrame, DecodeQueue};
pub use opus_codec::{OpusDecoder, OpusEncoder, ENCODE_SAMPLE_RATE};
pub use prompt_sound::{PromptSound, SoundBank};
pub use resampler::{CaptureResampler, Resampler};
pub use stream_decoder::StreamDecoder;
