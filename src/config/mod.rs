use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::registry::RequesterId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Conversion settings
    pub conversion: ConversionConfig,

    /// Access control
    #[serde(default)]
    pub access: AccessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Target audio bitrate in kbit/s
    pub bitrate: u32,

    /// Maximum number of concurrently active conversion tasks
    pub max_queue_size: usize,

    /// Base directory for conversion output (system temp dir if unset)
    pub download_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Requester id with administrative rights
    pub owner_id: Option<RequesterId>,

    /// Requester ids allowed to submit conversions
    #[serde(default)]
    pub whitelist: Vec<RequesterId>,
}

impl AccessConfig {
    /// Whether `requester` may submit conversion requests.
    ///
    /// With no owner and an empty whitelist, access control is considered
    /// unconfigured and everyone is permitted.
    pub fn permits(&self, requester: RequesterId) -> bool {
        if self.owner_id.is_none() && self.whitelist.is_empty() {
            return true;
        }
        self.owner_id == Some(requester) || self.whitelist.contains(&requester)
    }

    pub fn is_owner(&self, requester: RequesterId) -> bool {
        self.owner_id == Some(requester)
    }

    /// Add `requester` to the whitelist. Returns false if already present.
    pub fn allow(&mut self, requester: RequesterId) -> bool {
        if self.whitelist.contains(&requester) {
            return false;
        }
        self.whitelist.push(requester);
        true
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            conversion: ConversionConfig {
                bitrate: 128,
                max_queue_size: 4,
                download_dir: None,
            },
            access: AccessConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file or create default
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content =
                fs_err::read_to_string(&config_path).context("Failed to read config file")?;

            let config: Config =
                serde_yaml::from_str(&content).context("Failed to parse config file")?;

            config.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save().await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        fs_err::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    /// Get configuration file path
    fn config_path() -> Result<PathBuf> {
        // First try current directory for easy testing
        let local_config = PathBuf::from("config.yaml");
        if local_config.exists() {
            return Ok(local_config);
        }

        let config_dir = dirs::config_dir().context("Could not determine config directory")?;

        Ok(config_dir.join("audiofetch").join("config.yaml"))
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.conversion.bitrate == 0 {
            anyhow::bail!("Bitrate must be positive");
        }

        if self.conversion.max_queue_size == 0 {
            anyhow::bail!("Queue size must be at least 1");
        }

        Ok(())
    }

    /// Resolved base directory for conversion output
    pub fn download_dir(&self) -> PathBuf {
        self.conversion
            .download_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("audiofetch"))
    }

    /// Point the user at the config file for manual editing
    pub fn interactive_setup(&self) -> Result<()> {
        println!("Edit the config file to change settings:");
        println!("  {}", Self::config_path()?.display());
        Ok(())
    }

    /// Display current configuration
    pub fn display(&self) {
        println!("Current Configuration:");
        println!("  Bitrate: {} kbps", self.conversion.bitrate);
        println!("  Max queue size: {}", self.conversion.max_queue_size);
        println!("  Download dir: {}", self.download_dir().display());
        match self.access.owner_id {
            Some(owner) => println!("  Owner: {owner}"),
            None => println!("  Owner: (unset)"),
        }
        println!("  Whitelist: {:?}", self.access.whitelist);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_bitrate() {
        let mut config = Config::default();
        config.conversion.bitrate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let mut config = Config::default();
        config.conversion.max_queue_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let mut config = Config::default();
        config.access.owner_id = Some(42);
        config.access.whitelist = vec![1, 2];

        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(parsed.conversion.bitrate, 128);
        assert_eq!(parsed.access.owner_id, Some(42));
        assert_eq!(parsed.access.whitelist, vec![1, 2]);
    }

    #[test]
    fn test_permits_unconfigured_access_is_open() {
        let access = AccessConfig::default();
        assert!(access.permits(1));
    }

    #[test]
    fn test_permits_owner_and_whitelist_only() {
        let access = AccessConfig {
            owner_id: Some(10),
            whitelist: vec![20],
        };
        assert!(access.permits(10));
        assert!(access.permits(20));
        assert!(!access.permits(30));
    }

    #[test]
    fn test_allow_deduplicates() {
        let mut access = AccessConfig {
            owner_id: Some(10),
            whitelist: vec![],
        };
        assert!(access.allow(20));
        assert!(!access.allow(20));
        assert_eq!(access.whitelist, vec![20]);
    }
}
