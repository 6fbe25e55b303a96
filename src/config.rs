use std::path::Path;

use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};

use crate::actions::ButtonMap;

pub const DEFAULT_CONFIG_PATH: &str = "lifecycle.ron";

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LifecycleConfig {
    pub update: UpdateConfig,
    pub restart: RestartConfig,
    pub buttons: ButtonMap,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct UpdateConfig {
    /// `owner/name`; a repo stored on the device takes precedence
    pub repo: Option<String>,
    pub prerelease: bool,
    pub api_base: String,
    pub firmware_asset: String,
    pub user_agent: String,
    pub max_redirects: u8,
    /// Releases fetched from the list endpoint
    pub release_list_len: u8,
    /// Largest release feed document accepted
    pub max_feed_bytes: usize,
    pub check_interval_secs: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            repo: None,
            prerelease: false,
            api_base: "https://api.github.com".to_string(),
            firmware_asset: "main.bin".to_string(),
            user_agent: "esp32-ota".to_string(),
            max_redirects: 5,
            release_list_len: 5,
            max_feed_bytes: 256 * 1024,
            check_interval_secs: 24 * 60 * 60,
        }
    }
}

impl UpdateConfig {
    pub fn signature_asset(&self) -> String {
        format!("{}.sig", self.firmware_asset)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RestartConfig {
    /// Consecutive operator resets that trigger a factory reset
    pub threshold_min: u32,
    /// The persisted count saturates here
    pub threshold_max: u32,
    /// Uptime after which the device counts as stable and the count clears
    pub stable_window_ms: u64,
    pub countdown_secs: u32,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            threshold_min: 10,
            threshold_max: 12,
            stable_window_ms: 5000,
            countdown_secs: 11,
        }
    }
}

impl LifecycleConfig {
    pub fn load() -> Result<LifecycleConfig, Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<LifecycleConfig, Error> {
        let path = path.as_ref();
        let config = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_ron(&config)
    }

    pub fn from_ron(config: &str) -> Result<LifecycleConfig, Error> {
        let config: LifecycleConfig = ron::from_str(config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let restart = &self.restart;
        if restart.threshold_min == 0 {
            bail!("restart.threshold_min must be at least 1");
        }
        if restart.threshold_max < restart.threshold_min {
            bail!(
                "restart.threshold_max ({}) is below threshold_min ({})",
                restart.threshold_max,
                restart.threshold_min
            );
        }
        if self.update.max_redirects == 0 {
            bail!("update.max_redirects must be at least 1");
        }
        if self.update.firmware_asset.is_empty() {
            bail!("update.firmware_asset must not be empty");
        }
        if let Some(repo) = &self.update.repo {
            if repo.split('/').filter(|part| !part.is_empty()).count() != 2 {
                bail!("update.repo must look like owner/name, got {:?}", repo);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::LifecycleAction;

    #[test]
    fn test_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lifecycle.ron");
        std::fs::write(
            &path,
            r#"(
    update: (
        repo: Some("acme/lamp"),
        prerelease: true,
    ),
    restart: (
        threshold_min: 4,
        threshold_max: 6,
    ),
    buttons: (
        double: NoOp,
    ),
)"#,
        )
        .unwrap();

        let config = LifecycleConfig::load_from(&path).unwrap();
        assert_eq!(config.update.repo.as_deref(), Some("acme/lamp"));
        assert!(config.update.prerelease);
        assert_eq!(config.update.max_redirects, 5);
        assert_eq!(config.update.signature_asset(), "main.bin.sig");
        assert_eq!(config.restart.threshold_min, 4);
        assert_eq!(config.restart.stable_window_ms, 5000);
        assert_eq!(config.buttons.double, LifecycleAction::NoOp);
        assert_eq!(config.buttons.long, LifecycleAction::FactoryReset);
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(LifecycleConfig::from_ron("()").unwrap(), LifecycleConfig::default());
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let err = LifecycleConfig::from_ron("(restart: (threshold_min: 10, threshold_max: 3))")
            .unwrap_err();
        assert!(err.to_string().contains("threshold_max"));
        assert!(LifecycleConfig::from_ron(r#"(update: (repo: Some("lamp")))"#).is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LifecycleConfig::load_from(dir.path().join("nope.ron")).is_err());
    }
}
