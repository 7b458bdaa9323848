//! `GATEKEEP_HOME` layout and `options.json`

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use gatekeep_proto::ble::DEFAULT_DOOR_NAME;
use gatekeep_session::{SessionConfig, SessionOptions, SlotConfig};
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Roles in slot order; slot `i` of the config file belongs to `ROLES[i]`
pub const ROLES: [&str; 2] = ["door", "user"];

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("no home directory, set GATEKEEP_HOME")]
    NoHome,
    #[error("no advertised name for {0}, add one to options.json")]
    MissingName(String),
    #[error("config has {0} slots, only {max} are supported", max = ROLES.len())]
    TooManySlots(usize),
}

/// Get GATEKEEP_HOME directory, creating it if needed
pub fn gatekeep_home() -> Result<PathBuf, SettingsError> {
    let home = match std::env::var("GATEKEEP_HOME") {
        Ok(home) => PathBuf::from(home),
        Err(_) => dirs::home_dir().ok_or(SettingsError::NoHome)?.join(".gatekeep"),
    };

    fs::create_dir_all(&home).map_err(|source| SettingsError::Io { path: home.clone(), source })?;
    Ok(home)
}

pub fn data_path(home: &Path) -> PathBuf {
    home.join("data.txt")
}

/// Everything in `options.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(flatten)]
    pub session: SessionOptions,
    /// Advertised local name to look for, per role
    #[serde(default = "default_advertised_names")]
    pub advertised_names: BTreeMap<String, String>,
}

fn default_advertised_names() -> BTreeMap<String, String> {
    BTreeMap::from([("door".to_string(), DEFAULT_DOOR_NAME.to_string())])
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            advertised_names: default_advertised_names(),
        }
    }
}

impl Settings {
    /// Load `options.json` from `home`, writing the defaults on first use
    pub fn load_or_create(home: &Path) -> Result<Self, SettingsError> {
        let path = home.join("options.json");

        if path.exists() {
            let data = fs::read_to_string(&path)
                .map_err(|source| SettingsError::Io { path: path.clone(), source })?;
            let settings =
                serde_json::from_str(&data).map_err(|source| SettingsError::Json { path, source })?;
            return Ok(settings);
        }

        let settings = Self::default();
        let data = serde_json::to_string_pretty(&settings)
            .map_err(|source| SettingsError::Json { path: path.clone(), source })?;
        match fs::write(&path, data) {
            Ok(()) => info!("Wrote default options to {}", path.display()),
            // not fatal, the defaults still apply to this run
            Err(e) => warn!("could not write {}: {e}", path.display()),
        }
        Ok(settings)
    }

    pub fn advertised_name(&self, role: &str) -> Option<&str> {
        self.advertised_names.get(role).map(String::as_str)
    }

    /// Pair the stored GATT ids with roles and advertised names
    pub fn slots(&self, config: &SessionConfig) -> Result<Vec<SlotConfig>, SettingsError> {
        if config.slots.len() > ROLES.len() {
            return Err(SettingsError::TooManySlots(config.slots.len()));
        }

        config
            .slots
            .iter()
            .zip(ROLES)
            .map(|(ids, role)| {
                let name = self
                    .advertised_name(role)
                    .ok_or_else(|| SettingsError::MissingName(role.to_string()))?;
                Ok(SlotConfig::new(role, name, &ids.service_id, &ids.characteristic_id))
            })
            .collect()
    }
}
