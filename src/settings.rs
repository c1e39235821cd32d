//! JSON-file backed [`SettingsStore`].
//!
//! Layout: `{ "<namespace>": { "<key>": "<value>" } }`. Every write rewrites
//! the whole file; settings change rarely.

use serde_json::{Map, Value};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::board::SettingsStore;

pub struct JsonFileSettings {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl JsonFileSettings {
    /// Load `path`. A missing or corrupt file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Map<String, Value>>(&text) {
                Ok(values) => values,
                Err(e) => {
                    log::warn!("Settings file {} is corrupt, starting empty: {}", path.display(), e);
                    Map::new()
                }
            },
            Err(_) => Map::new(),
        };
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    fn save(&self, values: &Map<String, Value>) {
        let text = match serde_json::to_string_pretty(values) {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to serialize settings: {}", e);
                return;
            }
        };
        if let Err(e) = write_atomic(&self.path, text.as_bytes()) {
            log::error!("Failed to save settings to {}: {}", self.path.display(), e);
        }
    }
}

/// Replace `path` with `contents` so a crash leaves either the old file or
/// the new one, never a torn write.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)
}

impl SettingsStore for JsonFileSettings {
    fn get_string(&self, namespace: &str, key: &str) -> Option<String> {
        let values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        values
            .get(namespace)?
            .get(key)?
            .as_str()
            .map(str::to_string)
    }

    fn set_string(&self, namespace: &str, key: &str, value: &str) {
        let mut values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        let section = values
            .entry(namespace.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !section.is_object() {
            *section = Value::Object(Map::new());
        }
        if let Value::Object(section) = section {
            section.insert(key.to_string(), Value::String(value.to_string()));
        }
        self.save(&values);
    }
}
