use crate::core::{HotCloseError, Result};
use crate::storage::DurabilityMode;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_NAME: &str = "change_history_db";
pub const DB_VERSION: &str = "1.0";
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1250);
pub const DEFAULT_CAPACITY_MB: u64 = 500;

/// Hot close configuration
///
/// Built with chained setters or read from `HOTCLOSE_*` environment variables.
#[derive(Debug, Clone)]
pub struct HotCloseConfig {
    /// Master switch. When off, debounced captures are never scheduled.
    pub enabled: bool,

    /// Quiet period after the last activity before a capture fires.
    pub debounce: Duration,

    /// Byte ceiling for the whole store, all four tables together.
    pub capacity_bytes: u64,

    /// Where the WAL and snapshot live. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,

    pub durability: DurabilityMode,

    /// WAL records written before the store compacts into a snapshot.
    pub checkpoint_threshold: usize,
}

impl HotCloseConfig {
    pub fn new() -> Self {
        Self {
            enabled: true,
            debounce: DEFAULT_DEBOUNCE,
            capacity_bytes: DEFAULT_CAPACITY_MB * 1024 * 1024,
            data_dir: None,
            durability: DurabilityMode::default(),
            checkpoint_threshold: 1000,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn capacity_bytes(mut self, bytes: u64) -> Self {
        self.capacity_bytes = bytes;
        self
    }

    pub fn capacity_mb(mut self, mb: u64) -> Self {
        self.capacity_bytes = mb.saturating_mul(1024 * 1024);
        self
    }

    pub fn data_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.data_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }

    pub fn checkpoint_threshold(mut self, threshold: usize) -> Self {
        self.checkpoint_threshold = threshold;
        self
    }

    /// Read overrides from the environment on top of the defaults.
    ///
    /// Recognized keys: `HOTCLOSE_ENABLED`, `HOTCLOSE_DEBOUNCE_MS`,
    /// `HOTCLOSE_CAPACITY_MB`, `HOTCLOSE_DATA_DIR`, `HOTCLOSE_DURABILITY`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::new();

        if let Some(raw) = lookup("HOTCLOSE_ENABLED") {
            config.enabled = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(HotCloseError::Config(format!(
                        "HOTCLOSE_ENABLED must be a boolean, got '{}'",
                        other
                    )));
                }
            };
        }
        if let Some(raw) = lookup("HOTCLOSE_DEBOUNCE_MS") {
            let ms = raw.trim().parse::<u64>().map_err(|_| {
                HotCloseError::Config(format!("HOTCLOSE_DEBOUNCE_MS must be an integer, got '{}'", raw))
            })?;
            config.debounce = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup("HOTCLOSE_CAPACITY_MB") {
            let mb = raw.trim().parse::<u64>().map_err(|_| {
                HotCloseError::Config(format!("HOTCLOSE_CAPACITY_MB must be an integer, got '{}'", raw))
            })?;
            config = config.capacity_mb(mb);
        }
        if let Some(raw) = lookup("HOTCLOSE_DATA_DIR") {
            if !raw.trim().is_empty() {
                config.data_dir = Some(PathBuf::from(raw));
            }
        }
        if let Some(raw) = lookup("HOTCLOSE_DURABILITY") {
            config.durability = raw.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity_bytes == 0 {
            return Err(HotCloseError::Config("capacity must be > 0".to_string()));
        }
        if self.checkpoint_threshold == 0 {
            return Err(HotCloseError::Config("checkpoint_threshold must be > 0".to_string()));
        }
        if self.data_dir.is_none() && self.durability == DurabilityMode::Sync {
            return Err(HotCloseError::Config(
                "durability 'sync' requires a data directory".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for HotCloseConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = HotCloseConfig::default();
        assert!(config.enabled);
        assert_eq!(config.debounce, Duration::from_millis(1250));
        assert_eq!(config.capacity_bytes, 500 * 1024 * 1024);
        assert!(config.data_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = HotCloseConfig::new()
            .debounce(Duration::from_millis(200))
            .capacity_mb(300)
            .data_dir("/tmp/hotclose")
            .durability(DurabilityMode::Sync);

        assert_eq!(config.debounce, Duration::from_millis(200));
        assert_eq!(config.capacity_bytes, 300 * 1024 * 1024);
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/hotclose")));
        assert_eq!(config.durability, DurabilityMode::Sync);
    }

    #[test]
    fn test_from_env_overrides() {
        let config = HotCloseConfig::from_lookup(lookup(&[
            ("HOTCLOSE_ENABLED", "off"),
            ("HOTCLOSE_DEBOUNCE_MS", "400"),
            ("HOTCLOSE_CAPACITY_MB", "1"),
            ("HOTCLOSE_DURABILITY", "none"),
        ]))
        .unwrap();

        assert!(!config.enabled);
        assert_eq!(config.debounce, Duration::from_millis(400));
        assert_eq!(config.capacity_bytes, 1024 * 1024);
        assert_eq!(config.durability, DurabilityMode::None);
    }

    #[test]
    fn test_from_env_rejects_garbage() {
        assert!(HotCloseConfig::from_lookup(lookup(&[("HOTCLOSE_DEBOUNCE_MS", "soon")])).is_err());
        assert!(HotCloseConfig::from_lookup(lookup(&[("HOTCLOSE_ENABLED", "maybe")])).is_err());
        assert!(HotCloseConfig::from_lookup(lookup(&[("HOTCLOSE_CAPACITY_MB", "0")])).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(HotCloseConfig::new().capacity_bytes(0).validate().is_err());
        assert!(HotCloseConfig::new().checkpoint_threshold(0).validate().is_err());
        assert!(
            HotCloseConfig::new()
                .durability(DurabilityMode::Sync)
                .validate()
                .is_err()
        );
    }
}
