//! Atomic file persistence for config and overrides (spec §4.11, §9).
//!
//! Writes go to a temp file in the same directory, `fsync`'d, then renamed
//! over the target — a crash can never leave a half-written config on disk.
//! A SHA-256 marker of the last-written content suppresses redundant writes
//! (and the fsync they'd cost) when nothing actually changed, the same
//! "detect unchanged content before touching disk" idea `DSado88-squall`'s
//! on-disk cache uses its hash for.

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::RwLock,
};

use sha2::{Digest, Sha256};

use crate::config::RoutingConfig;
use crate::error::{RouterError, RouterResult};
use crate::stats::{StatsRegistry, FAMILY_FALLBACK_REASON};

pub struct FilePersistence {
    config_path: PathBuf,
    overrides_path: PathBuf,
    last_config_hash: RwLock<Option<String>>,
    last_overrides_hash: RwLock<Option<String>>,
}

impl FilePersistence {
    pub fn new(config_path: PathBuf, overrides_path: PathBuf) -> Self {
        Self {
            config_path,
            overrides_path,
            last_config_hash: RwLock::new(None),
            last_overrides_hash: RwLock::new(None),
        }
    }

    /// Returns `Ok(true)` if a write actually happened, `Ok(false)` if the
    /// content was unchanged since the last successful write.
    pub fn persist_config(&self, config: &RoutingConfig, stats: &StatsRegistry) -> RouterResult<bool> {
        let json = serde_json::to_vec_pretty(config)
            .map_err(|e| RouterError::PersistenceFailed(e.to_string()))?;
        self.write_if_changed(&self.config_path, &json, &self.last_config_hash, stats)
    }

    pub fn persist_overrides(&self, overrides: &[(String, String)], stats: &StatsRegistry) -> RouterResult<bool> {
        let json = serde_json::to_vec_pretty(overrides)
            .map_err(|e| RouterError::PersistenceFailed(e.to_string()))?;
        self.write_if_changed(&self.overrides_path, &json, &self.last_overrides_hash, stats)
    }

    pub fn load_overrides(&self) -> RouterResult<Vec<(String, String)>> {
        if !self.overrides_path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.overrides_path)
            .map_err(|e| RouterError::PersistenceFailed(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| RouterError::PersistenceFailed(e.to_string()))
    }

    fn write_if_changed(
        &self,
        path: &Path,
        contents: &[u8],
        last_hash: &RwLock<Option<String>>,
        stats: &StatsRegistry,
    ) -> RouterResult<bool> {
        let hash = hash_hex(contents);
        if last_hash.read().unwrap().as_deref() == Some(hash.as_str()) {
            return Ok(false);
        }

        if let Err(e) = write_atomic(path, contents) {
            stats.incr(FAMILY_FALLBACK_REASON, "config_migration_write_failure");
            return Err(RouterError::PersistenceFailed(e.to_string()));
        }

        *last_hash.write().unwrap() = Some(hash);
        Ok(true)
    }
}

fn hash_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp_path)?;
        f.write_all(contents)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
