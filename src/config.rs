use crate::utils::get_data_dir;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

/// Persisted defaults for the kill switch and the dial profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Phonebook entry name provisioned and dialed by `connect`
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Display name stamped on installed filter objects
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Ask the engine to keep kill-switch rules across reboots
    #[serde(default)]
    pub persist: bool,
    /// Remote addresses that stay reachable while engaged
    #[serde(default)]
    pub remote_allow: Vec<IpNetwork>,
    /// Local addresses traffic may still originate from while engaged
    #[serde(default)]
    pub local_allow: Vec<IpNetwork>,
    /// Tunnel process exempted from blocking, by executable path
    #[serde(default)]
    pub tunnel_process: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            display_name: default_display_name(),
            persist: false,
            remote_allow: Vec::new(),
            local_allow: Vec::new(),
            tunnel_process: None,
        }
    }
}

fn default_device_name() -> String {
    "vpnguard IKEv2".to_string()
}

fn default_display_name() -> String {
    "vpnguard kill switch".to_string()
}

fn config_path() -> Option<PathBuf> {
    get_data_dir().map(|mut dir| {
        dir.push("config.json");
        dir
    })
}

/// Saves the config to disk using an atomic write pattern: a temporary file
/// in the target directory is written, flushed, then renamed over the
/// destination so a crash never leaves a half-written config.
pub async fn save_config(config: &AppConfig) -> std::io::Result<()> {
    let Some(path) = config_path() else {
        return Ok(());
    };
    let json = serde_json::to_string_pretty(config)?;

    tokio::task::spawn_blocking(move || {
        let dir = path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "config directory not found")
        })?;
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| std::io::Error::other(format!("config save task failed: {e}")))?
}

/// Loads the config from disk, or returns defaults if absent or unreadable
pub async fn load_config() -> AppConfig {
    if let Some(path) = config_path()
        && let Ok(json) = tokio::fs::read_to_string(&path).await
        && let Ok(config) = serde_json::from_str::<AppConfig>(&json)
    {
        return config;
    }
    AppConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.device_name, "vpnguard IKEv2");
        assert!(!config.persist);
        assert!(config.remote_allow.is_empty());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"remote_allow": ["10.0.0.1/32"]}"#).unwrap();
        assert_eq!(config.device_name, "vpnguard IKEv2");
        assert_eq!(config.remote_allow.len(), 1);
        assert_eq!(config.remote_allow[0].to_string(), "10.0.0.1/32");
    }

    #[test]
    fn test_round_trip() {
        let config = AppConfig {
            persist: true,
            local_allow: vec!["192.168.0.0/16".parse().unwrap()],
            ..AppConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
