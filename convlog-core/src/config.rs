/// Runtime configuration for conversation logs and peer sync.
///
/// Loaded from JSON; every field has a default so a partial file (or none at
/// all) is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use convlog_protocol::conversation::limits::MAX_COMMITS_PER_FETCH;
use convlog_protocol::conversation::QuorumPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ConvlogConfig {
    /// Root for `FsStore` conversation directories.
    pub data_dir: PathBuf,
    /// Scheme of conversation channel names (`<scheme>://<device>/<conversation>`).
    pub channel_scheme: String,
    pub fetch_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Max commits requested from, or served to, a peer in one fetch round.
    /// Longer histories take several rounds.
    pub max_commits_per_fetch: usize,
    /// Decoded commits kept in memory per directory store.
    pub commit_cache_size: usize,
    pub quorum: QuorumPolicy,
}

impl Default for ConvlogConfig {
    fn default() -> Self {
        ConvlogConfig {
            data_dir: PathBuf::from("convlog-data"),
            channel_scheme: "git".to_string(),
            fetch_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            max_commits_per_fetch: MAX_COMMITS_PER_FETCH,
            commit_cache_size: 1024,
            quorum: QuorumPolicy::default(),
        }
    }
}

impl ConvlogConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json(&text)?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: ConvlogConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let scheme_ok = !self.channel_scheme.is_empty()
            && self
                .channel_scheme
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '+' || c == '-');
        if !scheme_ok {
            return Err(ConfigError::Invalid(format!(
                "channel_scheme {:?}",
                self.channel_scheme
            )));
        }
        if self.max_commits_per_fetch == 0 {
            return Err(ConfigError::Invalid("max_commits_per_fetch must be > 0".into()));
        }
        if self.fetch_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be > 0".into()));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ConvlogConfig::from_json(r#"{"fetch_timeout_ms": 500}"#).unwrap();
        assert_eq!(config.fetch_timeout(), Duration::from_millis(500));
        assert_eq!(config.channel_scheme, "git");
        assert_eq!(config.quorum, QuorumPolicy::MajorityExcludingTarget);
    }

    #[test]
    fn test_quorum_policy_from_json() {
        let config = ConvlogConfig::from_json(r#"{"quorum": {"fixed": 2}}"#).unwrap();
        assert_eq!(config.quorum, QuorumPolicy::Fixed(2));

        let config = ConvlogConfig::from_json(r#"{"quorum": "unanimous"}"#).unwrap();
        assert_eq!(config.quorum, QuorumPolicy::Unanimous);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(matches!(
            ConvlogConfig::from_json(r#"{"channel_scheme": "Git://"}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ConvlogConfig::from_json(r#"{"max_commits_per_fetch": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(ConvlogConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("convlog.json");
        let config = ConvlogConfig {
            connect_timeout_ms: 42,
            ..ConvlogConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(ConvlogConfig::load(&path).unwrap(), config);
    }
}
