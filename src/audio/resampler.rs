//! Streaming sample-rate conversion for 16-bit PCM, built on rubato.
//!
//! rubato consumes fixed 10 ms input chunks, so samples that do not fill a
//! whole chunk stay buffered until the next call. Each channel is kept in
//! its own buffer; interleaving happens at the edges.

use rubato::{FftFixedIn, Resampler as _};

use crate::error::CodecError;

/// Input chunks per second handed to rubato.
const CHUNKS_PER_SECOND: usize = 100;

fn to_float(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

fn to_pcm(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

pub struct Resampler {
    /// `None` when input and output rates match.
    fft: Option<FftFixedIn<f32>>,
    /// Per-channel input not yet handed to rubato.
    pending: Vec<Vec<f32>>,
}

impl Resampler {
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Result<Self, CodecError> {
        let channels = channels.max(1);
        let fft = if input_rate == output_rate {
            None
        } else {
            let chunk = (input_rate as usize / CHUNKS_PER_SECOND).max(1);
            Some(FftFixedIn::<f32>::new(
                input_rate as usize,
                output_rate as usize,
                chunk,
                1,
                channels,
            )?)
        };
        Ok(Self {
            fft,
            pending: vec![Vec::new(); channels],
        })
    }

    pub fn channels(&self) -> usize {
        self.pending.len()
    }

    /// Forget buffered input and filter history.
    pub fn reset(&mut self) {
        if let Some(fft) = self.fft.as_mut() {
            fft.reset();
        }
        for pending in &mut self.pending {
            pending.clear();
        }
    }

    /// Resample one mono block.
    pub fn process(&mut self, input: &[i16]) -> Result<Vec<i16>, CodecError> {
        Ok(self
            .process_planar(&[input])?
            .into_iter()
            .next()
            .unwrap_or_default())
    }

    /// Resample one block per channel. Every channel must carry the same
    /// number of samples.
    pub fn process_planar(&mut self, input: &[&[i16]]) -> Result<Vec<Vec<i16>>, CodecError> {
        let Some(fft) = self.fft.as_mut() else {
            return Ok(input.iter().map(|channel| channel.to_vec()).collect());
        };

        for (pending, channel) in self.pending.iter_mut().zip(input) {
            pending.extend(channel.iter().copied().map(to_float));
        }

        let mut output = vec![Vec::new(); self.pending.len()];
        loop {
            let needed = fft.input_frames_next();
            if self.pending.iter().any(|pending| pending.len() < needed) {
                break;
            }
            let chunk: Vec<&[f32]> = self
                .pending
                .iter()
                .map(|pending| &pending[..needed])
                .collect();
            let resampled = fft.process(&chunk[..], None)?;
            for (out, channel) in output.iter_mut().zip(resampled) {
                out.extend(channel.into_iter().map(to_pcm));
            }
            for pending in &mut self.pending {
                pending.drain(..needed);
            }
        }
        Ok(output)
    }
}

/// Capture-side converter for mono or mic+reference interleaved input.
///
/// Dual-channel frames are split, resampled per channel, then interleaved
/// again so the front end still sees `[mic, ref, mic, ref, ..]`.
pub struct CaptureResampler {
    inner: Resampler,
}

impl CaptureResampler {
    pub fn new(input_rate: u32, output_rate: u32, with_reference: bool) -> Result<Self, CodecError> {
        let channels = if with_reference { 2 } else { 1 };
        Ok(Self {
            inner: Resampler::new(input_rate, output_rate, channels)?,
        })
    }

    pub fn process(&mut self, input: &[i16]) -> Result<Vec<i16>, CodecError> {
        if self.inner.channels() == 1 {
            return self.inner.process(input);
        }

        let mic: Vec<i16> = input.iter().step_by(2).copied().collect();
        let reference: Vec<i16> = input.iter().skip(1).step_by(2).copied().collect();
        let resampled = self
            .inner
            .process_planar(&[mic.as_slice(), reference.as_slice()])?;

        let (mic, reference) = (&resampled[0], &resampled[1]);
        let frames = mic.len().min(reference.len());
        let mut output = Vec::with_capacity(frames * 2);
        for i in 0..frames {
            output.push(mic[i]);
            output.push(reference[i]);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Steady-state samples, skipping the filter's start-up transient.
    fn settled<T>(samples: &[T]) -> &[T] {
        &samples[samples.len() / 2..]
    }

    #[test]
    fn passthrough_when_rates_match() {
        let mut resampler = Resampler::new(16000, 16000, 1).unwrap();
        let input: Vec<i16> = (0..160).map(|i| i as i16).collect();
        assert_eq!(resampler.process(&input).unwrap(), input);
        assert!(resampler.process(&[]).unwrap().is_empty());
    }

    #[test]
    fn downsample_48k_to_16k_keeps_ratio_across_frames() {
        let mut resampler = Resampler::new(48000, 16000, 1).unwrap();
        let frame = vec![1000i16; 480];
        let total: usize = (0..10)
            .map(|_| resampler.process(&frame).unwrap().len())
            .sum();
        // 10 frames of 10 ms at 16 kHz
        assert_eq!(total, 1600);
    }

    #[test]
    fn partial_chunks_wait_for_more_input() {
        let mut resampler = Resampler::new(48000, 16000, 1).unwrap();
        assert!(resampler.process(&[0; 300]).unwrap().is_empty());
        assert_eq!(resampler.process(&[0; 180]).unwrap().len(), 160);

        resampler.process(&[0; 300]).unwrap();
        resampler.reset();
        assert!(resampler.process(&[0; 180]).unwrap().is_empty());
    }

    #[test]
    fn constant_signal_keeps_its_level() {
        let mut resampler = Resampler::new(24000, 16000, 1).unwrap();
        let mut output = Vec::new();
        for _ in 0..20 {
            output.extend(resampler.process(&[-8000i16; 240]).unwrap());
        }
        assert_eq!(output.len(), 3200);
        assert!(
            settled(&output).iter().all(|&s| (s + 8000).abs() < 400),
            "level drifted"
        );
    }

    #[test]
    fn dual_channel_keeps_channels_apart() {
        let mut capture = CaptureResampler::new(32000, 16000, true).unwrap();
        let mut input = Vec::new();
        for _ in 0..3200 {
            input.push(8000i16);
            input.push(-8000i16);
        }
        let output = capture.process(&input).unwrap();
        assert_eq!(output.len(), 3200);
        let pairs: Vec<&[i16]> = output.chunks(2).collect();
        assert!(
            settled(&pairs)
                .iter()
                .all(|pair| (pair[0] - 8000).abs() < 400 && (pair[1] + 8000).abs() < 400)
        );
    }

    #[test]
    fn mono_capture_is_plain_resample() {
        let mut capture = CaptureResampler::new(48000, 16000, false).unwrap();
        assert_eq!(capture.process(&vec![7i16; 960]).unwrap().len(), 320);
    }
}
