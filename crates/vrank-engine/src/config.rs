use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use vrank_core::FAVORITE_CAPACITY;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Relative paths resolve against the data directory; `~` is expanded.
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "vrank.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub threads: usize,
    pub poll_interval_ms: u64,
    pub lease_secs: i64,
    pub batch_size: usize,
    pub max_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 2,
            poll_interval_ms: 500,
            lease_secs: 60,
            batch_size: 200,
            max_attempts: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    pub favorite_capacity: usize,
    /// Membership changes touching more items than this go to the queue.
    pub membership_sync_limit: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            favorite_capacity: FAVORITE_CAPACITY,
            membership_sync_limit: 500,
        }
    }
}

/// The knobs the engine itself reads; the rest of [`Config`] belongs to the
/// process hosting it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub favorite_capacity: usize,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub membership_sync_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Config::default().engine_config()
    }
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&s).with_context(|| "parse vrank.toml")?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            favorite_capacity: self.ranking.favorite_capacity,
            batch_size: self.worker.batch_size,
            max_attempts: self.worker.max_attempts,
            membership_sync_limit: self.ranking.membership_sync_limit,
        }
    }

    pub fn config_path(data_dir: &Path) -> PathBuf {
        data_dir.join("vrank.toml")
    }

    pub fn db_path(&self, data_dir: &Path) -> PathBuf {
        let expanded = PathBuf::from(shellexpand::tilde(&self.store.path).to_string());
        if expanded.is_absolute() {
            expanded
        } else {
            data_dir.join(expanded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_defaults() {
        let cfg: Config = toml::from_str("[worker]\nbatch_size = 10\n").unwrap();
        assert_eq!(cfg.worker.batch_size, 10);
        assert_eq!(cfg.worker.max_attempts, 5);
        assert_eq!(cfg.ranking.favorite_capacity, 25);
        assert_eq!(cfg.store.path, "vrank.db");
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = Config::config_path(dir.path());
        let mut cfg = Config::default();
        cfg.ranking.membership_sync_limit = 7;
        cfg.save_to(&path).unwrap();
        let back = Config::load_from(&path).unwrap();
        assert_eq!(back.ranking.membership_sync_limit, 7);
        assert_eq!(back.engine_config().membership_sync_limit, 7);
    }

    #[test]
    fn db_path_resolves_relative_to_data_dir() {
        let cfg = Config::default();
        let dir = Path::new("/srv/vrank");
        assert_eq!(cfg.db_path(dir), PathBuf::from("/srv/vrank/vrank.db"));

        let mut abs = Config::default();
        abs.store.path = "/var/lib/vrank.db".to_string();
        assert_eq!(abs.db_path(dir), PathBuf::from("/var/lib/vrank.db"));
    }
}
