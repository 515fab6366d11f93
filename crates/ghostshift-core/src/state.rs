//! Durable migration state: catalog, RefLog and changelog.

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::naming::NameAllocator;
use crate::reflog::RefLog;
use crate::versioning::Changelog;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything a migration run reads and mutates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Physical structure of the database.
    pub catalog: Catalog,
    /// Logical to physical table bindings per version.
    pub reflog: RefLog,
    /// Version chain.
    pub changelog: Changelog,
}

impl State {
    /// Bootstrap state for a freshly introspected catalog: a root version holding
    /// every table under its own name.
    pub fn bootstrap(catalog: Catalog, names: &mut dyn NameAllocator) -> Result<Self> {
        let changelog = Changelog::with_generated_root(names);
        let reflog = RefLog::init(&catalog, changelog.root())?;
        Ok(Self {
            catalog,
            reflog,
            changelog,
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// sled-backed store for [`State`].
pub struct StateStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl StateStore {
    /// Tree name for the state document.
    pub const TREE_NAME: &'static str = "ghostshift:state";

    const STATE_KEY: &'static [u8] = b"state";

    /// Open or create a store at `path`.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Self::open(db)
    }

    /// Open a store on an already opened database.
    pub fn open(db: sled::Db) -> Result<Self> {
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self { db, tree })
    }

    /// A store that lives in memory only.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::open(db)
    }

    /// The underlying database, for sibling stores such as run records.
    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    /// Load the persisted state, if any.
    pub fn load(&self) -> Result<Option<State>> {
        match self.tree.get(Self::STATE_KEY)? {
            Some(bytes) => Ok(Some(State::from_json(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load the persisted state, failing when the store was never initialised.
    pub fn require(&self) -> Result<State> {
        self.load()?
            .ok_or_else(|| Error::not_found("state", Self::TREE_NAME))
    }

    /// Persist `state`, replacing any previous one.
    pub fn save(&self, state: &State) -> Result<()> {
        self.tree.insert(Self::STATE_KEY, state.to_json()?)?;
        self.tree.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, ColumnType, TableDef};
    use crate::naming::SequentialNameAllocator;

    fn create_state() -> State {
        let catalog = Catalog::new("shop")
            .with_table(
                TableDef::new("customers")
                    .with_column(ColumnDef::new("id", ColumnType::BigInt).identity())
                    .with_column(ColumnDef::new("name", ColumnType::Text)),
            )
            .unwrap();
        State::bootstrap(catalog, &mut SequentialNameAllocator::new()).unwrap()
    }

    #[test]
    fn test_bootstrap_binds_tables_at_root() {
        let state = create_state();
        let root = state.changelog.root().clone();
        let key = state.reflog.get_table_ref(&root, "customers").unwrap();
        assert_eq!(state.reflog.table(key).unwrap().ref_id(), "customers");
        assert!(state.reflog.is_active(&root));
    }

    #[test]
    fn test_store_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_path(temp_dir.path()).unwrap();
        assert!(store.load().unwrap().is_none());
        assert!(store.require().is_err());

        let state = create_state();
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), Some(state));
    }

    #[test]
    fn test_temporary_store() {
        let store = StateStore::temporary().unwrap();
        let state = create_state();
        store.save(&state).unwrap();
        assert_eq!(store.require().unwrap(), state);
    }
}
