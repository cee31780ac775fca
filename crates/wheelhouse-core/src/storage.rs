//! Settings persistence (a single JSON file in the data directory)

use crate::error::{WheelhouseError, WheelhouseResult};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};
use wheelhouse_types::Settings;

/// Loads and saves [`Settings`]
#[derive(Clone, Debug)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub const FILE_NAME: &'static str = "settings.json";

    /// Create a store in `data_dir`, creating the directory if needed
    pub async fn new(data_dir: PathBuf) -> WheelhouseResult<Self> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self {
            path: data_dir.join(Self::FILE_NAME),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the settings. A missing file gives the defaults, as does a
    /// malformed one (with a warning); missing keys take their defaults.
    pub async fn load(&self) -> WheelhouseResult<Settings> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<Settings>(&content) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                warn!(
                    "Ignoring malformed settings file {}: {}",
                    self.path.display(),
                    e
                );
                Ok(Settings::default())
            }
        }
    }

    pub async fn save(&self, settings: &Settings) -> WheelhouseResult<()> {
        validate(settings)?;
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, content).await?;
        info!("Saved settings to {}", self.path.display());
        Ok(())
    }

    /// Overwrite the stored settings with the defaults
    pub async fn reset(&self) -> WheelhouseResult<Settings> {
        let settings = Settings::default();
        self.save(&settings).await?;
        Ok(settings)
    }
}

/// Reject settings the core cannot work with
pub fn validate(settings: &Settings) -> WheelhouseResult<()> {
    if settings.max_concurrent_downloads == 0 {
        return Err(WheelhouseError::InvalidSetting(
            "max_concurrent_downloads must be at least 1".to_string(),
        ));
    }

    let parts: Vec<&str> = settings.python_version.trim().split('.').collect();
    let well_formed = (2..=3).contains(&parts.len())
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if !well_formed {
        return Err(WheelhouseError::InvalidSetting(format!(
            "python_version '{}' is not major.minor[.patch]",
            settings.python_version
        )));
    }

    match url::Url::parse(&settings.index_url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        _ => {
            return Err(WheelhouseError::InvalidSetting(format!(
                "index_url '{}' is not an http(s) URL",
                settings.index_url
            )))
        }
    }

    if settings.platform.trim().is_empty() {
        return Err(WheelhouseError::InvalidSetting(
            "platform must not be empty".to_string(),
        ));
    }

    Ok(())
}

/// Names of every setting, sorted
pub fn setting_keys() -> Vec<String> {
    match serde_json::to_value(Settings::default()) {
        Ok(Value::Object(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

/// Current value of one setting
pub fn get_setting(settings: &Settings, key: &str) -> WheelhouseResult<Value> {
    let value = serde_json::to_value(settings)?;
    value
        .get(key)
        .cloned()
        .ok_or_else(|| WheelhouseError::InvalidSetting(format!("unknown setting '{}'", key)))
}

/// Copy of `settings` with `key` set from its textual form
pub fn set_setting(settings: &Settings, key: &str, raw: &str) -> WheelhouseResult<Settings> {
    let mut value = serde_json::to_value(settings)?;
    let map = value
        .as_object_mut()
        .ok_or_else(|| WheelhouseError::Serialization("settings are not an object".to_string()))?;

    let current = map
        .get(key)
        .ok_or_else(|| WheelhouseError::InvalidSetting(format!("unknown setting '{}'", key)))?;

    let invalid = |expected: &str| {
        WheelhouseError::InvalidSetting(format!("{} expects {}, got '{}'", key, expected, raw))
    };
    let parsed = match current {
        Value::Bool(_) => Value::Bool(raw.trim().parse().map_err(|_| invalid("true or false"))?),
        Value::Number(_) => Value::from(
            raw.trim()
                .parse::<u64>()
                .map_err(|_| invalid("a non-negative integer"))?,
        ),
        _ => Value::String(raw.to_string()),
    };
    map.insert(key.to_string(), parsed);

    let updated: Settings = serde_json::from_value(value)?;
    validate(&updated)?;
    Ok(updated)
}
