//! Built-in prompt sounds.
//!
//! Sounds ship as `.p3` files: back-to-back records of
//! `type:u8, reserved:u8, payload_size:u16 (big endian), payload`,
//! each payload one 60 ms Opus frame at 16 kHz.

use bytes::Bytes;
use std::path::Path;

use super::decode_queue::AudioFrame;
use crate::error::CodecError;

const RECORD_HEADER_LEN: usize = 4;

/// Frame duration of the prompt sound payloads.
pub const PROMPT_FRAME_DURATION_MS: u32 = 60;

/// Split a prompt sound container into frames. Payloads are slices of `data`.
pub fn parse_p3(data: &Bytes) -> Result<Vec<AudioFrame>, CodecError> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let available = data.len() - offset;
        if available < RECORD_HEADER_LEN {
            return Err(CodecError::TruncatedSound {
                offset,
                needed: RECORD_HEADER_LEN,
                available,
            });
        }
        let payload_size = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let start = offset + RECORD_HEADER_LEN;
        let remaining = data.len() - start;
        if remaining < payload_size {
            return Err(CodecError::TruncatedSound {
                offset,
                needed: payload_size,
                available: remaining,
            });
        }
        frames.push(AudioFrame::new(
            data.slice(start..start + payload_size),
            PROMPT_FRAME_DURATION_MS,
        ));
        offset = start + payload_size;
    }
    Ok(frames)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptSound {
    Activation,
    Upgrade,
    Exclamation,
    Success,
    Digit(u8),
}

impl PromptSound {
    fn file_name(self) -> String {
        match self {
            Self::Activation => "activation.p3".to_string(),
            Self::Upgrade => "upgrade.p3".to_string(),
            Self::Exclamation => "exclamation.p3".to_string(),
            Self::Success => "success.p3".to_string(),
            Self::Digit(d) => format!("{}.p3", d % 10),
        }
    }
}

/// In-memory prompt sounds. A sound that failed to load is empty (silent).
#[derive(Debug, Clone, Default)]
pub struct SoundBank {
    activation: Bytes,
    upgrade: Bytes,
    exclamation: Bytes,
    success: Bytes,
    digits: [Bytes; 10],
}

impl SoundBank {
    /// Load every sound from `dir`. Missing or unreadable files are logged.
    pub fn load(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let read = |sound: PromptSound| -> Bytes {
            let path = dir.join(sound.file_name());
            match std::fs::read(&path) {
                Ok(data) => Bytes::from(data),
                Err(e) => {
                    log::warn!("Prompt sound {} not loaded: {}", path.display(), e);
                    Bytes::new()
                }
            }
        };

        Self {
            activation: read(PromptSound::Activation),
            upgrade: read(PromptSound::Upgrade),
            exclamation: read(PromptSound::Exclamation),
            success: read(PromptSound::Success),
            digits: std::array::from_fn(|d| read(PromptSound::Digit(d as u8))),
        }
    }

    pub fn with_sound(mut self, sound: PromptSound, data: impl Into<Bytes>) -> Self {
        *self.slot_mut(sound) = data.into();
        self
    }

    fn slot_mut(&mut self, sound: PromptSound) -> &mut Bytes {
        match sound {
            PromptSound::Activation => &mut self.activation,
            PromptSound::Upgrade => &mut self.upgrade,
            PromptSound::Exclamation => &mut self.exclamation,
            PromptSound::Success => &mut self.success,
            PromptSound::Digit(d) => &mut self.digits[(d % 10) as usize],
        }
    }

    pub fn get(&self, sound: PromptSound) -> Bytes {
        match sound {
            PromptSound::Activation => self.activation.clone(),
            PromptSound::Upgrade => self.upgrade.clone(),
            PromptSound::Exclamation => self.exclamation.clone(),
            PromptSound::Success => self.success.clone(),
            PromptSound::Digit(d) => self.digits[(d % 10) as usize].clone(),
        }
    }
}
