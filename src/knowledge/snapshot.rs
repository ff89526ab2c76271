//! Opaque save/load boundary for the knowledge store.
//!
//! The blob is a versioned bincode encoding of the rule and exception arenas,
//! the action registry and the planning budget. Derived indexes are rebuilt on
//! load.

use serde::{Deserialize, Serialize};

use super::KnowledgeStore;
use crate::error::{AirisResult, KnowledgeError, StoreError};

/// Bumped whenever the persisted layout changes.
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    store: &'a KnowledgeStore,
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    store: KnowledgeStore,
}

impl KnowledgeStore {
    /// Serialize the store. Refuses when any rule is structurally broken.
    pub fn to_bytes(&self) -> AirisResult<Vec<u8>> {
        let broken = self.broken_rules().count();
        if broken > 0 {
            return Err(KnowledgeError::Corrupted { count: broken }.into());
        }
        let bytes = bincode::serialize(&SnapshotRef {
            version: SNAPSHOT_VERSION,
            store: self,
        })
        .map_err(|e| StoreError::Serialization {
            message: format!("failed to encode knowledge snapshot: {e}"),
        })?;
        tracing::debug!(bytes = bytes.len(), rules = self.stats().rules, "knowledge serialized");
        Ok(bytes)
    }

    /// Restore a store. A missing blob yields an empty store.
    pub fn from_bytes(bytes: Option<&[u8]>) -> AirisResult<Self> {
        let Some(bytes) = bytes else {
            return Ok(Self::new());
        };
        let snapshot: Snapshot = bincode::deserialize(bytes).map_err(|e| StoreError::Serialization {
            message: format!("failed to decode knowledge snapshot: {e}"),
        })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::Serialization {
                message: format!(
                    "knowledge snapshot version {} is not supported (expected {SNAPSHOT_VERSION})",
                    snapshot.version
                ),
            }
            .into());
        }
        let mut store = snapshot.store;
        store.reindex();
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::error::AirisError;
    use crate::knowledge::{AuxChange, ExceptionObservation, Inclusion, RuleObservation};
    use crate::observation::{Grid, Offset, Pos};

    fn populated() -> KnowledgeStore {
        let mut store = KnowledgeStore::new();
        let right = store.intern_action("right", 1);
        let prior = Grid::from_rows(vec![vec![0, 1, 0]]).unwrap();
        let aux = [AuxChange { pre: 2, delta: 0 }];
        let rule = store.find_or_create_rule(RuleObservation {
            trigger: 1,
            action: right,
            pos: Pos::new(1, 0),
            delta: -1,
            post: 0,
            evidence: vec![Inclusion::new(Offset::new(1, 0), 0, 1)],
            prior: &prior,
            aux: &aux,
            mutual: BTreeSet::new(),
            step: 0,
        });
        let blocked = Grid::from_rows(vec![vec![0, 1, 2]]).unwrap();
        store
            .find_or_create_exception(
                rule,
                ExceptionObservation {
                    action: right,
                    pos: Pos::new(1, 0),
                    prior: &blocked,
                    actual: &blocked,
                    aux: &aux,
                    mutual: BTreeSet::new(),
                    step: 1,
                },
            )
            .unwrap();
        store.set_planning_budget(2000);
        store
    }

    #[test]
    fn missing_blob_is_empty_store() {
        let store = KnowledgeStore::from_bytes(None).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.planning_budget(), None);
    }

    #[test]
    fn restore_rebuilds_indexes() {
        let store = populated();
        let bytes = store.to_bytes().unwrap();
        let restored = KnowledgeStore::from_bytes(Some(&bytes)).unwrap();

        assert_eq!(restored.stats(), store.stats());
        assert_eq!(restored.planning_budget(), Some(2000));
        let right = restored.action_id("right", 1).unwrap();
        assert_eq!(restored.lookup_rules(1, right).len(), 1);
        assert!(restored.knows_value(1));
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        let err = KnowledgeStore::from_bytes(Some(b"not a snapshot")).unwrap_err();
        assert!(matches!(err, AirisError::Store(StoreError::Serialization { .. })));
    }

    #[test]
    fn broken_store_refuses_to_serialize() {
        let mut store = populated();
        let right = store.action_id("right", 1).unwrap();
        let rule = store.lookup_rules(1, right)[0].id;
        let prior = Grid::from_rows(vec![vec![0, 1, 0]]).unwrap();
        let aux = [AuxChange { pre: 2, delta: 0 }];
        store
            .find_or_create_exception(
                rule,
                ExceptionObservation {
                    action: right,
                    pos: Pos::new(1, 0),
                    prior: &prior,
                    actual: &prior,
                    aux: &aux,
                    mutual: BTreeSet::new(),
                    step: 2,
                },
            )
            .unwrap();
        assert!(store.prune_rule(rule, Pos::new(1, 0), &prior, &prior).is_err());

        let err = store.to_bytes().unwrap_err();
        assert!(matches!(
            err,
            AirisError::Knowledge(KnowledgeError::Corrupted { count: 1 })
        ));
    }
}
