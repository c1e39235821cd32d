//! ota - Version check, activation and firmware download
//!
//! [`Ota`] talks to the version-check endpoint and streams firmware into the
//! inactive slot. [`checker::VersionChecker`] drives it as a long-lived task.

pub mod checker;
pub mod firmware;
pub mod http;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::board::{Platform, SettingsStore};
use crate::config::OtaConfig;
use crate::error::OtaError;
use firmware::{parse_image_version, FirmwarePartitions, FirmwareWriter, IMAGE_PREFIX_LEN};

pub use checker::VersionChecker;

const DOWNLOAD_CHUNK: usize = 512;

/// Who this device is, as reported to the version-check endpoint.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub client_id: String,
    pub app_name: String,
    pub board_type: String,
    pub board_name: String,
    pub language: String,
}

impl DeviceIdentity {
    fn post_body(&self, version: &str) -> String {
        json!({
            "uuid": self.client_id,
            "application": {
                "name": self.app_name,
                "version": version
            },
            "ota": {},
            "board": {
                "type": self.board_type,
                "name": self.board_name
            },
            "mac_address": self.device_id
        })
        .to_string()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FirmwareInfo {
    pub version: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Activation {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerTime {
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub timezone_offset: Option<i64>,
}

/// Version-check response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OtaManifest {
    pub firmware: Option<FirmwareInfo>,
    pub activation: Option<Activation>,
    pub mqtt: Option<Map<String, Value>>,
    pub server_time: Option<ServerTime>,
}

impl OtaManifest {
    pub fn parse(body: &str) -> Result<Self, OtaError> {
        serde_json::from_str(body).map_err(|e| OtaError::Manifest(e.to_string()))
    }
}

/// Transport used by [`Ota`]. The reqwest implementation is in [`http`].
#[async_trait]
pub trait OtaBackend: Send + Sync {
    /// POST `body` (GET when `None`) and return the response body.
    async fn fetch_manifest(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Option<String>,
    ) -> Result<String, OtaError>;

    async fn open_firmware(&self, url: &str) -> Result<Box<dyn FirmwareStream>, OtaError>;
}

#[async_trait]
pub trait FirmwareStream: Send {
    fn content_length(&self) -> Option<u64>;

    /// Read up to `buf.len()` bytes. `Ok(0)` means end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, OtaError>;
}

/// Parse dotted integers. Any non-numeric component makes the whole string unparseable.
fn parse_version(version: &str) -> Option<Vec<u64>> {
    version
        .trim()
        .split('.')
        .map(|part| part.trim().parse::<u64>().ok())
        .collect()
}

/// `true` when `new_version` is strictly newer than `current`.
///
/// Components are compared pairwise over the common prefix. When the prefix
/// is equal, the longer version only wins if its extra components are not all
/// zero, so `1.2` and `1.2.0` are the same version.
pub fn is_new_version_available(current: &str, new_version: &str) -> bool {
    let (Some(current), Some(newer)) = (parse_version(current), parse_version(new_version)) else {
        log::warn!("Unparseable version, {} vs {}", current, new_version);
        return false;
    };

    for (n, c) in newer.iter().zip(current.iter()) {
        if n > c {
            return true;
        } else if n < c {
            return false;
        }
    }

    newer.len() > current.len() && newer[current.len()..].iter().any(|&part| part != 0)
}

pub struct Ota {
    config: OtaConfig,
    identity: DeviceIdentity,
    backend: Arc<dyn OtaBackend>,
    partitions: Box<dyn FirmwarePartitions>,
    settings: Arc<dyn SettingsStore>,
    platform: Arc<dyn Platform>,

    current_version: String,
    firmware_version: String,
    firmware_url: String,
    has_new_version: bool,
    activation: Option<Activation>,
    has_mqtt_config: bool,
    timezone_offset_minutes: Option<i64>,
    marked_valid: bool,
}

impl Ota {
    pub fn new(
        config: OtaConfig,
        identity: DeviceIdentity,
        backend: Arc<dyn OtaBackend>,
        partitions: Box<dyn FirmwarePartitions>,
        settings: Arc<dyn SettingsStore>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        let current_version = partitions.running_version();
        Self {
            config,
            identity,
            backend,
            partitions,
            settings,
            platform,
            current_version,
            firmware_version: String::new(),
            firmware_url: String::new(),
            has_new_version: false,
            activation: None,
            has_mqtt_config: false,
            timezone_offset_minutes: None,
            marked_valid: false,
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            ("Device-Id".to_string(), self.identity.device_id.clone()),
            ("Client-Id".to_string(), self.identity.client_id.clone()),
            ("Accept-Language".to_string(), self.identity.language.clone()),
            (
                "User-Agent".to_string(),
                format!("{}/{}", self.identity.board_name, self.current_version),
            ),
            ("Content-Type".to_string(), "application/json".to_string()),
        ]
    }

    /// Poll the version-check endpoint once and apply the manifest.
    pub async fn check_version(&mut self) -> Result<(), OtaError> {
        self.current_version = self.partitions.running_version();
        log::info!("Current version: {}", self.current_version);

        if self.config.check_version_url.len() < 10 {
            return Err(OtaError::Network(
                "check version URL is not properly set".to_string(),
            ));
        }

        let body = self.identity.post_body(&self.current_version);
        let response = self
            .backend
            .fetch_manifest(&self.config.check_version_url, &self.headers(), Some(body))
            .await?;
        let manifest = OtaManifest::parse(&response)?;
        self.apply_manifest(manifest)
    }

    fn apply_manifest(&mut self, manifest: OtaManifest) -> Result<(), OtaError> {
        // 激活码保留到被展示为止
        if let Some(activation) = manifest.activation {
            self.activation = Some(activation);
        }

        self.has_mqtt_config = false;
        if let Some(mqtt) = manifest.mqtt {
            for (key, value) in &mqtt {
                let Some(value) = value.as_str() else {
                    continue;
                };
                if self.settings.get_string("mqtt", key).as_deref() != Some(value) {
                    self.settings.set_string("mqtt", key, value);
                }
            }
            self.has_mqtt_config = true;
        }

        self.timezone_offset_minutes = None;
        if let Some(ServerTime {
            timestamp: Some(timestamp),
            timezone_offset,
        }) = manifest.server_time
        {
            let offset = timezone_offset.unwrap_or(0);
            self.platform.set_system_time_ms(timestamp as i64, offset);
            self.timezone_offset_minutes = Some(offset);
        }

        let firmware = manifest
            .firmware
            .ok_or_else(|| OtaError::Manifest("missing firmware".to_string()))?;
        let version = firmware
            .version
            .ok_or_else(|| OtaError::Manifest("missing firmware.version".to_string()))?;
        let url = firmware
            .url
            .ok_or_else(|| OtaError::Manifest("missing firmware.url".to_string()))?;

        self.has_new_version = is_new_version_available(&self.current_version, &version);
        self.firmware_version = version;
        self.firmware_url = url;
        if self.has_new_version {
            log::info!("New version available: {}", self.firmware_version);
        } else {
            log::info!("Current is the latest version");
        }
        Ok(())
    }

    pub fn has_new_version(&self) -> bool {
        self.has_new_version
    }

    pub fn has_activation_code(&self) -> bool {
        self.activation.is_some()
    }

    /// Consume the pending activation code.
    pub fn take_activation(&mut self) -> Option<Activation> {
        self.activation.take()
    }

    pub fn has_mqtt_config(&self) -> bool {
        self.has_mqtt_config
    }

    pub fn timezone_offset_minutes(&self) -> Option<i64> {
        self.timezone_offset_minutes
    }

    pub fn firmware_version(&self) -> &str {
        &self.firmware_version
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    /// Cancel pending rollback. Only the first call per boot does anything.
    pub fn mark_current_version_valid(&mut self) {
        if self.marked_valid {
            return;
        }
        self.marked_valid = true;
        if let Err(e) = self.partitions.mark_running_valid() {
            log::error!("Failed to mark firmware valid: {}", e);
        }
    }

    /// Stream the advertised firmware into the inactive slot and make it the
    /// next boot target. `progress` receives (percent, bytes in the last second).
    pub async fn upgrade<F>(&mut self, mut progress: F) -> Result<(), OtaError>
    where
        F: FnMut(u32, usize) + Send,
    {
        log::info!("Upgrading firmware from {}", self.firmware_url);
        let mut stream = self.backend.open_firmware(&self.firmware_url).await?;
        let content_length = match stream.content_length() {
            Some(len) if len > 0 => len,
            _ => return Err(OtaError::Network("failed to get content length".to_string())),
        };

        let mut buffer = [0u8; DOWNLOAD_CHUNK];
        let mut header = Vec::with_capacity(IMAGE_PREFIX_LEN);
        let mut writer: Option<Box<dyn FirmwareWriter>> = None;
        let mut total_read: u64 = 0;
        let mut recent_read: usize = 0;
        let mut last_report = Instant::now();

        loop {
            let read = match stream.read(&mut buffer).await {
                Ok(read) => read,
                Err(e) => {
                    if let Some(writer) = writer.take() {
                        writer.abort();
                    }
                    return Err(e);
                }
            };
            total_read += read as u64;
            recent_read += read;

            if last_report.elapsed() >= Duration::from_secs(1) || read == 0 {
                let percent = (total_read * 100 / content_length).min(100) as u32;
                log::info!(
                    "Progress: {}% ({}/{}), Speed: {}B/s",
                    percent,
                    total_read,
                    content_length,
                    recent_read
                );
                progress(percent, recent_read);
                last_report = Instant::now();
                recent_read = 0;
            }

            if read == 0 {
                break;
            }

            let chunk = &buffer[..read];
            if let Some(active) = writer.as_mut() {
                if let Err(e) = active.write(chunk) {
                    if let Some(active) = writer.take() {
                        active.abort();
                    }
                    return Err(e);
                }
                continue;
            }

            header.extend_from_slice(chunk);
            if header.len() >= IMAGE_PREFIX_LEN {
                let new_version = parse_image_version(&header)?;
                log::info!("New firmware version: {}", new_version);
                if new_version == self.current_version {
                    log::error!("Firmware version is the same, skipping upgrade");
                    return Err(OtaError::SameVersion(new_version));
                }
                let mut new_writer = self.partitions.begin_update(content_length)?;
                if let Err(e) = new_writer.write(&header) {
                    new_writer.abort();
                    return Err(e);
                }
                header = Vec::new();
                writer = Some(new_writer);
            }
        }

        let Some(writer) = writer else {
            return Err(OtaError::InvalidImage(format!(
                "stream ended after {} bytes",
                total_read
            )));
        };
        if total_read != content_length {
            log::error!(
                "Download incomplete: {} of {} bytes",
                total_read,
                content_length
            );
            writer.abort();
            return Err(OtaError::InvalidImage(format!(
                "download incomplete: {} of {} bytes",
                total_read, content_length
            )));
        }
        writer.finish()?;
        log::info!("Firmware upgrade successful");
        Ok(())
    }
}
