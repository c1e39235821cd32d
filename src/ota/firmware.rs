//! Firmware images and the A/B boot slots they are written to.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::OtaError;
use crate::settings::write_atomic;

const IMAGE_MAGIC: u8 = 0xE9;
const IMAGE_HEADER_LEN: usize = 24;
const SEGMENT_HEADER_LEN: usize = 8;
const APP_DESC_LEN: usize = 256;
const APP_DESC_MAGIC: u32 = 0xABCD_5432;
/// Offset of the version field inside the app descriptor.
const APP_DESC_VERSION_OFFSET: usize = 16;
const APP_DESC_VERSION_LEN: usize = 32;

/// Bytes that must be buffered before the embedded version can be read.
pub const IMAGE_PREFIX_LEN: usize = IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN + APP_DESC_LEN;

/// Read the application version embedded in the first bytes of an image.
pub fn parse_image_version(prefix: &[u8]) -> Result<String, OtaError> {
    if prefix.len() < IMAGE_PREFIX_LEN {
        return Err(OtaError::InvalidImage(format!(
            "need {} header bytes, got {}",
            IMAGE_PREFIX_LEN,
            prefix.len()
        )));
    }
    if prefix[0] != IMAGE_MAGIC {
        return Err(OtaError::InvalidImage(format!(
            "bad image magic 0x{:02x}",
            prefix[0]
        )));
    }

    let desc = &prefix[IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN..];
    let magic = u32::from_le_bytes([desc[0], desc[1], desc[2], desc[3]]);
    if magic != APP_DESC_MAGIC {
        return Err(OtaError::InvalidImage(format!(
            "bad app descriptor magic 0x{:08x}",
            magic
        )));
    }

    let field = &desc[APP_DESC_VERSION_OFFSET..APP_DESC_VERSION_OFFSET + APP_DESC_VERSION_LEN];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    Ok(String::from_utf8_lossy(&field[..end]).into_owned())
}

/// Build a minimal image prefix carrying `version`. Used by tests and tooling.
pub fn build_image_prefix(version: &str) -> Vec<u8> {
    let mut image = vec![0u8; IMAGE_PREFIX_LEN];
    image[0] = IMAGE_MAGIC;
    let desc = IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN;
    image[desc..desc + 4].copy_from_slice(&APP_DESC_MAGIC.to_le_bytes());
    let bytes = version.as_bytes();
    let len = bytes.len().min(APP_DESC_VERSION_LEN - 1);
    let field = desc + APP_DESC_VERSION_OFFSET;
    image[field..field + len].copy_from_slice(&bytes[..len]);
    image
}

/// Boot slot management.
pub trait FirmwarePartitions: Send + Sync {
    fn running_version(&self) -> String;

    /// Cancel any pending rollback of the running image.
    fn mark_running_valid(&mut self) -> Result<(), OtaError>;

    /// Start writing the inactive slot with an image of `image_size` bytes.
    fn begin_update(&mut self, image_size: u64) -> Result<Box<dyn FirmwareWriter>, OtaError>;
}

pub trait FirmwareWriter: Send {
    fn write(&mut self, data: &[u8]) -> Result<(), OtaError>;

    /// Validate the written image and make it the next boot target.
    fn finish(self: Box<Self>) -> Result<(), OtaError>;

    /// Drop everything written so far. The running image is untouched.
    fn abort(self: Box<Self>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Slot {
    A,
    B,
}

impl Slot {
    fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            Self::A => "slot_a.bin",
            Self::B => "slot_b.bin",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BootState {
    boot: Slot,
    pending_verify: bool,
}

impl Default for BootState {
    fn default() -> Self {
        Self {
            boot: Slot::A,
            pending_verify: false,
        }
    }
}

/// Two image files plus a small boot record in one directory.
pub struct FileSlots {
    dir: PathBuf,
    running_version: String,
}

impl FileSlots {
    pub fn new(dir: impl Into<PathBuf>, running_version: impl Into<String>) -> Result<Self, OtaError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            running_version: running_version.into(),
        })
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("otadata.json")
    }

    fn load_state(&self) -> BootState {
        fs::read_to_string(self.state_path())
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    fn save_state(dir: &Path, state: &BootState) -> Result<(), OtaError> {
        let text = serde_json::to_string(state).map_err(|e| OtaError::Write(e.to_string()))?;
        write_atomic(&dir.join("otadata.json"), text.as_bytes())?;
        Ok(())
    }

    pub fn next_boot_image(&self) -> PathBuf {
        self.dir.join(self.load_state().boot.file_name())
    }

    pub fn pending_verify(&self) -> bool {
        self.load_state().pending_verify
    }
}

impl FirmwarePartitions for FileSlots {
    fn running_version(&self) -> String {
        self.running_version.clone()
    }

    fn mark_running_valid(&mut self) -> Result<(), OtaError> {
        let mut state = self.load_state();
        if !state.pending_verify {
            return Ok(());
        }
        log::info!("Marking firmware as valid");
        state.pending_verify = false;
        Self::save_state(&self.dir, &state)
    }

    fn begin_update(&mut self, image_size: u64) -> Result<Box<dyn FirmwareWriter>, OtaError> {
        let target = self.load_state().boot.other();
        let part_path = self.dir.join(format!("{}.part", target.file_name()));
        log::info!("Writing to slot {}", part_path.display());
        let file = File::create(&part_path).map_err(|e| OtaError::Write(e.to_string()))?;
        Ok(Box::new(FileSlotWriter {
            dir: self.dir.clone(),
            target,
            part_path,
            file,
            written: 0,
            expected: image_size,
        }))
    }
}

struct FileSlotWriter {
    dir: PathBuf,
    target: Slot,
    part_path: PathBuf,
    file: File,
    written: u64,
    expected: u64,
}

impl FirmwareWriter for FileSlotWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), OtaError> {
        self.file
            .write_all(data)
            .map_err(|e| OtaError::Write(e.to_string()))?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<(), OtaError> {
        self.file
            .flush()
            .and_then(|_| self.file.sync_all())
            .map_err(|e| OtaError::Write(e.to_string()))?;

        if self.written != self.expected {
            let _ = fs::remove_file(&self.part_path);
            return Err(OtaError::Validation(format!(
                "image is {} bytes, expected {}",
                self.written, self.expected
            )));
        }

        let mut prefix = vec![0u8; IMAGE_PREFIX_LEN.min(self.written as usize)];
        {
            use std::io::Read;
            File::open(&self.part_path)
                .and_then(|mut f| f.read_exact(&mut prefix))
                .map_err(|e| OtaError::Validation(e.to_string()))?;
        }
        if let Err(e) = parse_image_version(&prefix) {
            let _ = fs::remove_file(&self.part_path);
            return Err(OtaError::Validation(e.to_string()));
        }

        let image_path = self.dir.join(self.target.file_name());
        fs::rename(&self.part_path, &image_path).map_err(|e| OtaError::Write(e.to_string()))?;
        FileSlots::save_state(
            &self.dir,
            &BootState {
                boot: self.target,
                pending_verify: true,
            },
        )?;
        log::info!("Next boot from {}", image_path.display());
        Ok(())
    }

    fn abort(self: Box<Self>) {
        let _ = fs::remove_file(&self.part_path);
    }
}
