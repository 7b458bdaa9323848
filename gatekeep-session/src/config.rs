//! Session configuration - runtime options and the persisted password file

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Timing and scan parameters of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// How often ready slots are read
    #[serde(with = "duration_ms", rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    /// Length of one scan request before `ScanStopped`
    #[serde(with = "duration_ms", rename = "scan_window_ms")]
    pub scan_window: Duration,
    /// Time a slot may spend connecting before it is given up
    #[serde(with = "duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,
    /// Report every advertisement, not just the first per peripheral
    #[serde(default = "default_allow_duplicates")]
    pub allow_duplicates: bool,
    /// Only report peripherals advertising one of these services (empty = all)
    #[serde(default)]
    pub service_filter: Vec<String>,
}

fn default_allow_duplicates() -> bool {
    true
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            scan_window: Duration::from_secs(8),
            connect_timeout: Duration::from_secs(10),
            allow_duplicates: default_allow_duplicates(),
            service_filter: Vec::new(),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where S: Serializer {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where D: Deserializer<'de> {
        let ms = u64::deserialize(deserializer)?;
        if ms == 0 {
            return Err(serde::de::Error::custom("duration must be at least 1ms"));
        }
        Ok(Duration::from_millis(ms))
    }
}

/// GATT service + characteristic of one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattIds {
    pub service_id: String,
    pub characteristic_id: String,
}

impl GattIds {
    pub fn new(service_id: impl Into<String>, characteristic_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            characteristic_id: characteristic_id.into(),
        }
    }
}

/// Password plus the GATT ids of every slot, in role order
///
/// On disk this is a flat text file: the service id and characteristic id of
/// each slot on their own lines, then the password on the last line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub password: String,
    pub slots: Vec<GattIds>,
}

impl SessionConfig {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut lines: Vec<&str> = content
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .collect();
        if lines.len() > 1 && lines.last() == Some(&"") {
            lines.pop();
        }

        if lines.len() < 3 || lines.len() % 2 == 0 {
            return Err(ConfigError::Malformed(format!(
                "expected id pairs followed by a password, got {} line(s)",
                lines.len()
            )));
        }

        let password = lines.pop().unwrap_or_default().to_string();
        let mut slots = Vec::with_capacity(lines.len() / 2);
        for pair in lines.chunks(2) {
            let (service, characteristic) = (pair[0].trim(), pair[1].trim());
            if service.is_empty() || characteristic.is_empty() {
                return Err(ConfigError::Malformed("empty service or characteristic id".into()));
            }
            slots.push(GattIds::new(service, characteristic));
        }

        Ok(Self { password, slots })
    }

    pub fn to_file_content(&self) -> String {
        let mut lines = Vec::with_capacity(self.slots.len() * 2 + 1);
        for ids in &self.slots {
            lines.push(ids.service_id.as_str());
            lines.push(ids.characteristic_id.as_str());
        }
        lines.push(self.password.as_str());
        lines.join("\n")
    }

    /// Load the config, `None` if the file does not exist yet
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the file at `path` with this config
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if self.password.contains('\n') {
            return Err(ConfigError::Malformed("password must be a single line".into()));
        }
        // an empty last line reads back as a trailing newline
        if self.password.is_empty() {
            return Err(ConfigError::Malformed("password must not be empty".into()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        remove(path)?;
        fs::write(path, self.to_file_content())?;
        Ok(())
    }
}

/// Delete the config file; a missing file is fine
pub fn remove(path: &Path) -> Result<(), ConfigError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single_slot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        let config = SessionConfig {
            password: "secret".into(),
            slots: vec![GattIds::new("180A", "2A57")],
        };

        config.save(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "180A\n2A57\nsecret");
        assert_eq!(SessionConfig::load(&path).unwrap(), Some(config));
    }

    #[test]
    fn round_trip_two_slots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        let config = SessionConfig {
            password: "pass word".into(),
            slots: vec![GattIds::new("180A", "2A57"), GattIds::new("180A", "2A58")],
        };
        config.save(&path).unwrap();
        assert_eq!(SessionConfig::load(&path).unwrap(), Some(config));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(SessionConfig::load(&dir.path().join("data.txt")).unwrap(), None);
    }

    #[test]
    fn parse_tolerates_trailing_newline_and_crlf() {
        let config = SessionConfig::parse("180A\r\n2A57\r\nsecret\n").unwrap();
        assert_eq!(config.password, "secret");
        assert_eq!(config.slots, vec![GattIds::new("180A", "2A57")]);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(matches!(SessionConfig::parse(""), Err(ConfigError::Malformed(_))));
        assert!(matches!(SessionConfig::parse("180A\nsecret"), Err(ConfigError::Malformed(_))));
        assert!(matches!(
            SessionConfig::parse("180A\n2A57\n180A\nsecret"),
            Err(ConfigError::Malformed(_))
        ));
        assert!(matches!(SessionConfig::parse("\n2A57\nsecret"), Err(ConfigError::Malformed(_))));
    }

    #[test]
    fn save_overwrites_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        SessionConfig { password: "a".into(), slots: vec![GattIds::new("1", "2")] }
            .save(&path)
            .unwrap();
        SessionConfig { password: "b".into(), slots: vec![GattIds::new("180A", "2A57")] }
            .save(&path)
            .unwrap();
        assert_eq!(SessionConfig::load(&path).unwrap().unwrap().password, "b");
    }

    #[test]
    fn multiline_password_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig { password: "a\nb".into(), slots: vec![GattIds::new("1", "2")] };
        assert!(config.save(&dir.path().join("data.txt")).is_err());
    }

    #[test]
    fn empty_password_is_never_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        let config = SessionConfig { password: String::new(), slots: vec![GattIds::new("180A", "2A57")] };

        assert!(matches!(config.save(&path), Err(ConfigError::Malformed(_))));
        assert!(!path.exists());
        assert_eq!(SessionConfig::load(&path).unwrap(), None);
    }

    #[test]
    fn empty_password_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        let good = SessionConfig { password: "secret".into(), slots: vec![GattIds::new("180A", "2A57")] };
        good.save(&path).unwrap();

        let empty = SessionConfig { password: String::new(), ..good.clone() };
        assert!(empty.save(&path).is_err());
        assert_eq!(SessionConfig::load(&path).unwrap(), Some(good));
    }

    #[test]
    fn remove_works_on_unreadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        fs::write(&path, "180A\n2A57\n").unwrap();
        assert!(SessionConfig::load(&path).is_err());

        remove(&path).unwrap();
        assert_eq!(SessionConfig::load(&path).unwrap(), None);
    }

    #[test]
    fn options_serialize_as_millis() {
        let json = serde_json::to_value(SessionOptions::default()).unwrap();
        assert_eq!(json["poll_interval_ms"], 250);
        assert_eq!(json["scan_window_ms"], 8000);

        let parsed: SessionOptions = serde_json::from_str(
            r#"{"poll_interval_ms": 100, "scan_window_ms": 4000, "connect_timeout_ms": 5000}"#,
        )
        .unwrap();
        assert_eq!(parsed.poll_interval, Duration::from_millis(100));
        assert!(parsed.allow_duplicates);
        assert!(parsed.service_filter.is_empty());
    }
}
