use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use vrank_core::{RankError, RankResult};
use vrank_storage::Storage;
use vrank_storage_sqlite::SqliteStorage;

use crate::{Config, EngineConfig};

/// The ranking engine over one storage backend. All operations are
/// synchronous and safe to call from many threads at once; per-list
/// exclusivity comes from [`vrank_storage::RankStore::with_list`].
pub struct Engine<S> {
    store: Arc<S>,
    cfg: EngineConfig,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            cfg: self.cfg.clone(),
        }
    }
}

impl<S: Storage> Engine<S> {
    pub fn new(store: Arc<S>, cfg: EngineConfig) -> Self {
        Self { store, cfg }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Runs `op`, and runs it once more from a fresh read if it hit an
    /// eligibility race. A second race is logged and reported as skipped;
    /// the next reconciliation of the item converges it.
    pub(crate) fn retry_race_once<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> RankResult<T>,
        skipped: impl FnOnce() -> T,
    ) -> RankResult<T> {
        match op() {
            Err(RankError::EligibilityRace { item, reason }) => {
                debug!(%item, %reason, "{what}: eligibility race, retrying");
                match op() {
                    Err(RankError::EligibilityRace { item, reason }) => {
                        warn!(%item, %reason, "{what}: eligibility race persisted, skipping");
                        Ok(skipped())
                    }
                    other => other,
                }
            }
            other => other,
        }
    }
}

/// A data directory holding `vrank.toml` and the SQLite store.
pub struct Service {
    pub data_dir: PathBuf,
    pub cfg: Config,
    pub engine: Arc<Engine<SqliteStorage>>,
}

impl Service {
    pub fn open(data_dir: PathBuf) -> Result<Self> {
        let cfg_path = Config::config_path(&data_dir);
        let cfg = if cfg_path.exists() {
            Config::load_from(&cfg_path)?
        } else {
            let cfg = Config::default();
            cfg.save_to(&cfg_path)?;
            cfg
        };
        let storage = SqliteStorage::open(&cfg.db_path(&data_dir))?;
        let engine = Arc::new(Engine::new(Arc::new(storage), cfg.engine_config()));
        Ok(Self { data_dir, cfg, engine })
    }

    pub fn init(data_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(data_dir).with_context(|| format!("create data dir {}", data_dir.display()))?;
        let cfg_path = Config::config_path(data_dir);
        let cfg = if cfg_path.exists() {
            Config::load_from(&cfg_path)?
        } else {
            let cfg = Config::default();
            cfg.save_to(&cfg_path)?;
            cfg
        };
        // create db
        let _ = SqliteStorage::open(&cfg.db_path(data_dir))?;
        Ok(())
    }
}
