//! Operational configuration.
//!
//! The configuration is a YAML file, by default `~/.jaeger.yaml`. Every key
//! has a default so a missing or partial file is valid.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_LOCK_FILE: &str = "/var/tmp/sdss/jaeger.lock";
pub const MIN_BETA: f64 = 160.0;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub fps: FpsConfig,
    pub positioner: PositionerConfig,
    pub profiles: ProfilesConfig,
    pub safe_mode: SafeMode,
    pub files: FilesConfig,
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FpsConfig {
    pub use_lock: bool,
    /// Seconds between status poller iterations.
    pub status_poller_delay: f64,
    /// Seconds between position poller iterations.
    pub position_poller_delay: f64,
    /// Timeout in seconds for the discovery broadcasts during initialise.
    pub initialise_timeouts: f64,
    pub start_pollers: bool,
    pub check_low_temperature: bool,
    /// Quiescence window in seconds for broadcasts with unknown reply count.
    pub broadcast_quiescence: f64,
    pub disabled_positioners: Vec<u16>,
    /// Positioners physically present but not responding; id to (alpha, beta).
    pub offline_positioners: HashMap<u16, (f64, f64)>,
    pub disable_collision_detection_positioners: Vec<u16>,
    pub open_loop_positioners: Vec<u16>,
}

impl Default for FpsConfig {
    fn default() -> Self {
        Self {
            use_lock: true,
            status_poller_delay: 5.0,
            position_poller_delay: 30.0,
            initialise_timeouts: 0.5,
            start_pollers: true,
            check_low_temperature: true,
            broadcast_quiescence: 0.5,
            disabled_positioners: Vec::new(),
            offline_positioners: HashMap::new(),
            disable_collision_detection_positioners: Vec::new(),
            open_loop_positioners: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionerConfig {
    pub disable_precise_moves: bool,
    /// Default motor speed in RPM used when a move does not specify one.
    pub motor_speed: f64,
}

impl Default for PositionerConfig {
    fn default() -> Self {
        Self {
            disable_precise_moves: false,
            motor_speed: 1000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilesConfig {
    pub default: String,
    #[serde(flatten)]
    pub profiles: HashMap<String, InterfaceProfile>,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(
            "virtual".to_string(),
            InterfaceProfile {
                interface_type: "virtual".to_string(),
                channels: vec!["virtual0".to_string()],
            },
        );
        Self {
            default: "virtual".to_string(),
            profiles,
        }
    }
}

/// Describes one bus interface of a profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceProfile {
    #[serde(rename = "type")]
    pub interface_type: String,
    #[serde(default)]
    pub channels: Vec<String>,
}

/// `safe_mode: false` or `safe_mode: {min_beta: 165.0}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SafeMode {
    Flag(bool),
    Enabled { min_beta: f64 },
}

impl Default for SafeMode {
    fn default() -> Self {
        SafeMode::Flag(false)
    }
}

impl SafeMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, SafeMode::Flag(false))
    }

    pub fn min_beta(&self) -> Option<f64> {
        match self {
            SafeMode::Flag(false) => None,
            SafeMode::Flag(true) => Some(MIN_BETA),
            SafeMode::Enabled { min_beta } => Some(*min_beta),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub log_dir: Option<PathBuf>,
    pub lock_file: PathBuf,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
        }
    }
}

impl Config {
    /// Loads the configuration from an explicit YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Loads `~/.jaeger.yaml` if present, otherwise returns the defaults.
    pub fn user_default() -> Result<Self> {
        if let Some(home) = std::env::var_os("HOME") {
            let user_file = Path::new(&home).join(".jaeger.yaml");
            if user_file.exists() {
                return Self::load(user_file);
            }
        }
        Ok(Config::default())
    }

    pub fn profile(&self, name: &str) -> Option<&InterfaceProfile> {
        self.profiles.profiles.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.fps.use_lock);
        assert_eq!(config.fps.status_poller_delay, 5.0);
        assert!(!config.safe_mode.is_enabled());
        assert_eq!(config.files.lock_file, PathBuf::from(DEFAULT_LOCK_FILE));
        assert!(config.profile("virtual").is_some());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
fps:
  use_lock: false
  disabled_positioners: [5, 7]
  offline_positioners:
    9: [12.5, 180.0]
safe_mode:
  min_beta: 165.0
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(!config.fps.use_lock);
        assert_eq!(config.fps.disabled_positioners, vec![5, 7]);
        assert_eq!(config.fps.offline_positioners[&9], (12.5, 180.0));
        assert_eq!(config.safe_mode.min_beta(), Some(165.0));
        // Untouched sections keep their defaults.
        assert!(config.fps.start_pollers);
        assert_eq!(config.positioner.motor_speed, 1000.0);
    }

    #[test]
    fn test_safe_mode_flag_forms() {
        let config: Config = serde_yaml::from_str("safe_mode: false").unwrap();
        assert!(!config.safe_mode.is_enabled());

        let config: Config = serde_yaml::from_str("safe_mode: true").unwrap();
        assert_eq!(config.safe_mode.min_beta(), Some(MIN_BETA));
    }
}
