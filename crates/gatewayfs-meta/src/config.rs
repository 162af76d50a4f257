//! Gateway configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MetaError, MetaResult};

/// Configuration of one gateway process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Two-character gateway name, also used in suffixed names.
    pub gateway_name: String,
    /// Numeric gateway id; 0 is reserved as invalid.
    pub gateway_id: u16,
    /// Directory holding journal segments.
    pub journal_dir: PathBuf,
    /// Interval between journal compaction runs, in seconds.
    pub journal_cleanup_secs: u64,
    /// Staged transactions older than this are flushed, in seconds.
    pub commit_interval_secs: u64,
    /// Number of staged operations that triggers an immediate flush.
    pub commit_threshold: usize,
    /// Upper bound on committers writing to the store at the same time.
    pub max_concurrent_commits: usize,
    /// Number of remote messages processed in parallel.
    pub message_worker_threads: usize,
    /// Attempts per remote message before the process gives up.
    pub message_max_attempts: u32,
    /// Capacity of the LRU of paths known to exist.
    pub existing_path_cache_size: usize,
    /// A journal segment is closed once it grows past this size.
    pub max_segment_bytes: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_name: "ny".to_string(),
            gateway_id: u16::from_be_bytes(*b"ny"),
            journal_dir: PathBuf::from("/var/lib/gatewayfs/journal"),
            journal_cleanup_secs: 60,
            commit_interval_secs: 1,
            commit_threshold: 1000,
            max_concurrent_commits: 16,
            message_worker_threads: 8,
            message_max_attempts: 3,
            existing_path_cache_size: 4096,
            max_segment_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Settings consumed by the transaction manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Age at which staged transactions are flushed.
    pub commit_interval: Duration,
    /// Staged-operation count that triggers an immediate flush.
    pub commit_threshold: usize,
    /// Maximum committers in their write phase at once.
    pub max_concurrent_commits: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        GatewayConfig::default().manager_config()
    }
}

/// Settings consumed by the journal.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalConfig {
    /// Directory holding journal segments.
    pub dir: PathBuf,
    /// Segment roll-over size.
    pub max_segment_bytes: u64,
    /// Interval of the background compaction task.
    pub cleanup_interval: Duration,
}

impl JournalConfig {
    /// Journal config for `dir` with default sizing.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let defaults = GatewayConfig::default();
        Self {
            dir: dir.into(),
            max_segment_bytes: defaults.max_segment_bytes,
            cleanup_interval: Duration::from_secs(defaults.journal_cleanup_secs),
        }
    }
}

impl GatewayConfig {
    /// Load config from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: GatewayConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> MetaResult<()> {
        if self.gateway_name.len() != 2 || !self.gateway_name.is_ascii() {
            return Err(MetaError::Config(format!(
                "gateway name must be two ASCII characters, got {:?}",
                self.gateway_name
            )));
        }
        if self.gateway_id == 0 {
            return Err(MetaError::Config("gateway id 0 is reserved".into()));
        }
        if self.commit_threshold == 0 {
            return Err(MetaError::Config("commit_threshold must be > 0".into()));
        }
        if self.max_concurrent_commits == 0 {
            return Err(MetaError::Config(
                "max_concurrent_commits must be > 0".into(),
            ));
        }
        if self.message_worker_threads == 0 {
            return Err(MetaError::Config(
                "message_worker_threads must be > 0".into(),
            ));
        }
        if self.message_max_attempts == 0 {
            return Err(MetaError::Config("message_max_attempts must be > 0".into()));
        }
        if self.existing_path_cache_size == 0 {
            return Err(MetaError::Config(
                "existing_path_cache_size must be > 0".into(),
            ));
        }
        if self.max_segment_bytes < 4096 {
            return Err(MetaError::Config(
                "max_segment_bytes must be at least 4096".into(),
            ));
        }
        Ok(())
    }

    /// Transaction manager settings.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            commit_interval: Duration::from_secs(self.commit_interval_secs),
            commit_threshold: self.commit_threshold,
            max_concurrent_commits: self.max_concurrent_commits,
        }
    }

    /// Journal settings.
    pub fn journal_config(&self) -> JournalConfig {
        JournalConfig {
            dir: self.journal_dir.clone(),
            max_segment_bytes: self.max_segment_bytes,
            cleanup_interval: Duration::from_secs(self.journal_cleanup_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_is_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.manager_config().commit_threshold, 1000);
        assert_eq!(
            config.journal_config().cleanup_interval,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
gateway_name = "la"
gateway_id = 2
journal_dir = "/tmp/gfs-journal"
commit_threshold = 50
"#
        )
        .unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.gateway_name, "la");
        assert_eq!(config.gateway_id, 2);
        assert_eq!(config.journal_dir, PathBuf::from("/tmp/gfs-journal"));
        assert_eq!(config.commit_threshold, 50);
        assert_eq!(config.commit_interval_secs, 1);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"gateway_name": "sb", "gateway_id": 7, "message_worker_threads": 2}}"#
        )
        .unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.gateway_name, "sb");
        assert_eq!(config.message_worker_threads, 2);
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(GatewayConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = GatewayConfig {
            gateway_name: "abc".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(MetaError::Config(_))));

        let config = GatewayConfig {
            commit_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GatewayConfig {
            gateway_id: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
