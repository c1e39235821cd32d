//! Opus encoder/decoder wrappers.
//!
//! - Encoder: 16 kHz mono PCM → buffered into whole frames → Opus packets
//! - Decoder: Opus packet → PCM at the session rate → resample to the output rate

use super::resampler::Resampler;
use super::stream_decoder::StreamDecoder;
use crate::error::CodecError;

/// Sample rate every outbound frame is encoded at.
pub const ENCODE_SAMPLE_RATE: u32 = 16000;

// ======================== Opus Encoder ========================

pub struct OpusEncoder {
    encoder: opus::Encoder,
    sample_rate: u32,
    duration_ms: u32,
    /// Leftover samples that did not fill a whole frame yet.
    pending: Vec<i16>,
}

impl OpusEncoder {
    /// * `sample_rate` - PCM rate handed to `encode` (16000 for the session)
    /// * `duration_ms` - Frame duration in ms (e.g. 60)
    pub fn new(sample_rate: u32, duration_ms: u32) -> Result<Self, CodecError> {
        let mut encoder =
            opus::Encoder::new(sample_rate, opus::Channels::Mono, opus::Application::Voip)?;
        encoder.set_bitrate(opus::Bitrate::Auto)?;

        Ok(Self {
            encoder,
            sample_rate,
            duration_ms,
            pending: Vec::new(),
        })
    }

    pub fn frame_samples(&self) -> usize {
        (self.sample_rate * self.duration_ms / 1000) as usize
    }

    /// Append mono PCM and encode every complete frame now available.
    ///
    /// Partial input stays buffered until the next call.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<Vec<u8>>, CodecError> {
        self.pending.extend_from_slice(pcm);

        let frame_samples = self.frame_samples();
        let mut packets = Vec::new();
        let mut offset = 0;
        while self.pending.len() - offset >= frame_samples {
            let frame = &self.pending[offset..offset + frame_samples];
            let mut opus_buf = vec![0u8; 4000];
            let encoded_len = self.encoder.encode(frame, &mut opus_buf)?;
            opus_buf.truncate(encoded_len);
            packets.push(opus_buf);
            offset += frame_samples;
        }
        self.pending.drain(..offset);
        Ok(packets)
    }

    /// Drop buffered input and the codec's internal history.
    pub fn reset_state(&mut self) {
        self.pending.clear();
        if let Err(e) = self.encoder.reset_state() {
            log::warn!("Failed to reset opus encoder: {}", e);
        }
    }
}

// ======================== Opus Decoder ========================

pub struct OpusDecoder {
    decoder: opus::Decoder,
    /// Rate of the incoming Opus stream.
    sample_rate: u32,
    output_sample_rate: u32,
    /// Present only when the stream rate differs from the output rate.
    resampler: Option<Resampler>,
}

impl OpusDecoder {
    /// * `sample_rate`        - Opus stream sample rate (negotiated with the server)
    /// * `output_sample_rate` - playback hardware rate
    pub fn new(sample_rate: u32, output_sample_rate: u32) -> Result<Self, CodecError> {
        let decoder = opus::Decoder::new(sample_rate, opus::Channels::Mono)?;
        Ok(Self {
            decoder,
            sample_rate,
            output_sample_rate,
            resampler: Self::output_resampler(sample_rate, output_sample_rate)?,
        })
    }

    fn output_resampler(
        sample_rate: u32,
        output_sample_rate: u32,
    ) -> Result<Option<Resampler>, CodecError> {
        if sample_rate == output_sample_rate {
            return Ok(None);
        }
        Ok(Some(Resampler::new(sample_rate, output_sample_rate, 1)?))
    }

    /// Decode an Opus packet to mono PCM at the output rate.
    pub fn decode(&mut self, opus_data: &[u8]) -> Result<Vec<i16>, CodecError> {
        // max 120ms @ 48kHz = 5760 samples, use 6000 for safety
        let mut pcm_buf = vec![0i16; 6000];
        let decoded = self.decoder.decode(opus_data, &mut pcm_buf, false)?;
        pcm_buf.truncate(decoded);

        match self.resampler.as_mut() {
            Some(resampler) => resampler.process(&pcm_buf),
            None => Ok(pcm_buf),
        }
    }
}

// ======================== StreamDecoder impl ========================

impl StreamDecoder for OpusDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, CodecError> {
        OpusDecoder::decode(self, data)
    }

    fn reset(&mut self) {
        if let Err(e) = self.decoder.reset_state() {
            log::warn!("Failed to reset opus decoder: {}", e);
        }
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }

    fn set_sample_rate(&mut self, sample_rate: u32) -> Result<(), CodecError> {
        if sample_rate == self.sample_rate {
            return Ok(());
        }
        *self = OpusDecoder::new(sample_rate, self.output_sample_rate)?;
        if self.resampler.is_some() {
            log::info!(
                "Resampling decoded audio {} -> {}",
                self.sample_rate,
                self.output_sample_rate
            );
        }
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
