//! ACID-durable knowledge vault backed by redb.
//!
//! The whole knowledge store is kept as one versioned bincode snapshot under
//! a fixed key, next to a few small metadata entries.

use std::path::{Path, PathBuf};

use redb::{Database, ReadableTable, TableDefinition, TableError};

use crate::error::{AirisResult, StoreError};
use crate::knowledge::KnowledgeStore;
use crate::store::StoreResult;

/// Snapshots and metadata (string keys → binary values).
const VAULT_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("vault");

const SNAPSHOT_KEY: &str = "knowledge";
const STEP_KEY: &str = "time_step";

/// Durable home of one agent's knowledge.
pub struct KnowledgeVault {
    db: Database,
    path: PathBuf,
}

impl KnowledgeVault {
    /// Open or create `<name>.redb` in `data_dir`.
    pub fn open(data_dir: &Path, name: &str) -> StoreResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Io { source: e })?;
        let path = data_dir.join(format!("{name}.redb"));
        let db = Database::create(&path).map_err(|e| StoreError::Redb {
            message: format!("failed to open redb at {}: {e}", path.display()),
        })?;
        tracing::debug!(path = %path.display(), "knowledge vault opened");
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `store`. Fails without writing when the store has broken rules.
    pub fn save(&self, store: &KnowledgeStore) -> AirisResult<()> {
        let bytes = store.to_bytes()?;
        self.put(SNAPSHOT_KEY, &bytes)?;
        tracing::info!(
            path = %self.path.display(),
            bytes = bytes.len(),
            rules = store.stats().rules,
            "knowledge saved"
        );
        Ok(())
    }

    /// Load the stored knowledge; an empty store when nothing was saved yet.
    pub fn load(&self) -> AirisResult<KnowledgeStore> {
        let bytes = self.get(SNAPSHOT_KEY)?;
        let store = KnowledgeStore::from_bytes(bytes.as_deref())?;
        tracing::info!(
            path = %self.path.display(),
            rules = store.stats().rules,
            fresh = bytes.is_none(),
            "knowledge loaded"
        );
        Ok(store)
    }

    /// Record how many environment steps the saved knowledge covers.
    pub fn set_time_step(&self, step: u64) -> StoreResult<()> {
        self.put(STEP_KEY, &step.to_le_bytes())
    }

    pub fn time_step(&self) -> StoreResult<u64> {
        let Some(bytes) = self.get(STEP_KEY)? else {
            return Ok(0);
        };
        let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| StoreError::Serialization {
            message: format!("time step entry has {} bytes, expected 8", bytes.len()),
        })?;
        Ok(u64::from_le_bytes(raw))
    }

    /// Remove the saved snapshot. Returns whether one existed.
    pub fn clear(&self) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(|e| StoreError::Redb {
            message: format!("begin_write failed: {e}"),
        })?;
        let existed = {
            let mut table = txn.open_table(VAULT_TABLE).map_err(|e| StoreError::Redb {
                message: format!("open_table failed: {e}"),
            })?;
            let removed = table.remove(SNAPSHOT_KEY).map_err(|e| StoreError::Redb {
                message: format!("remove failed: {e}"),
            })?;
            removed.is_some()
        };
        txn.commit().map_err(|e| StoreError::Redb {
            message: format!("commit failed: {e}"),
        })?;
        Ok(existed)
    }

    /// Every key currently held, in key order.
    pub fn keys(&self) -> StoreResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Redb {
            message: format!("begin_read failed: {e}"),
        })?;
        let table = match txn.open_table(VAULT_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::Redb {
                    message: format!("open_table failed: {e}"),
                });
            }
        };
        let mut keys = Vec::new();
        for entry in table.iter().map_err(|e| StoreError::Redb {
            message: format!("iter failed: {e}"),
        })? {
            let (key, _) = entry.map_err(|e| StoreError::Redb {
                message: format!("iter failed: {e}"),
            })?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }

    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(|e| StoreError::Redb {
            message: format!("begin_write failed: {e}"),
        })?;
        {
            let mut table = txn.open_table(VAULT_TABLE).map_err(|e| StoreError::Redb {
                message: format!("open_table failed: {e}"),
            })?;
            table.insert(key, value).map_err(|e| StoreError::Redb {
                message: format!("insert failed: {e}"),
            })?;
        }
        txn.commit().map_err(|e| StoreError::Redb {
            message: format!("commit failed: {e}"),
        })?;
        Ok(())
    }

    /// `Ok(None)` when the key or the table does not exist yet.
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Redb {
            message: format!("begin_read failed: {e}"),
        })?;
        let table = match txn.open_table(VAULT_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => {
                return Err(StoreError::Redb {
                    message: format!("open_table failed: {e}"),
                });
            }
        };
        let result = table.get(key).map_err(|e| StoreError::Redb {
            message: format!("get failed: {e}"),
        })?;
        Ok(result.map(|guard| guard.value().to_vec()))
    }
}

impl std::fmt::Debug for KnowledgeVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeVault").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::knowledge::RuleObservation;
    use crate::observation::{Grid, Pos};
    use tempfile::TempDir;

    fn learned_store() -> KnowledgeStore {
        let mut store = KnowledgeStore::new();
        let right = store.intern_action("right", 1);
        let prior = Grid::from_rows(vec![vec![1, 0]]).unwrap();
        store.find_or_create_rule(RuleObservation {
            trigger: 1,
            action: right,
            pos: Pos::new(0, 0),
            delta: -1,
            post: 0,
            evidence: Vec::new(),
            prior: &prior,
            aux: &[],
            mutual: BTreeSet::new(),
            step: 0,
        });
        store
    }

    #[test]
    fn fresh_vault_loads_empty_store() {
        let dir = TempDir::new().unwrap();
        let vault = KnowledgeVault::open(&dir.path().join("data"), "agent").unwrap();
        assert!(vault.path().ends_with("agent.redb"));
        assert!(vault.load().unwrap().is_empty());
        assert_eq!(vault.time_step().unwrap(), 0);
        assert!(vault.keys().unwrap().is_empty());
    }

    #[test]
    fn save_and_reload_across_reopens() {
        let dir = TempDir::new().unwrap();
        let store = learned_store();
        {
            let vault = KnowledgeVault::open(dir.path(), "agent").unwrap();
            vault.save(&store).unwrap();
            vault.set_time_step(42).unwrap();
        }

        let vault = KnowledgeVault::open(dir.path(), "agent").unwrap();
        let loaded = vault.load().unwrap();
        assert_eq!(loaded.stats(), store.stats());
        assert_eq!(vault.time_step().unwrap(), 42);
        assert_eq!(vault.keys().unwrap(), vec!["knowledge".to_string(), "time_step".to_string()]);
    }

    #[test]
    fn clear_drops_snapshot() {
        let dir = TempDir::new().unwrap();
        let vault = KnowledgeVault::open(dir.path(), "agent").unwrap();
        vault.save(&learned_store()).unwrap();
        assert!(vault.clear().unwrap());
        assert!(!vault.clear().unwrap());
        assert!(vault.load().unwrap().is_empty());
    }
}
