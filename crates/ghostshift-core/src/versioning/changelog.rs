//! The append-only chain of schema versions.

use super::operation::SchemaOperation;
use crate::error::{Error, Result};
use crate::naming::NameAllocator;
use crate::util::current_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier of a schema version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(String);

impl VersionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VersionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A node in the version chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// Version id.
    pub id: VersionId,
    /// Predecessor; `None` only for the root.
    pub parent: Option<VersionId>,
    /// Successor, linked when the next version is appended.
    pub child: Option<VersionId>,
    /// The operation that produced this version; `None` only for the root.
    pub operation: Option<SchemaOperation>,
    /// Change set this version belongs to.
    pub change_set: Option<String>,
}

/// A named group of consecutive versions authored together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Change set id.
    pub id: String,
    /// Author.
    pub author: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Creation time (microseconds since epoch).
    pub created_at: u64,
    /// Versions created by this change set, in order.
    pub versions: Vec<VersionId>,
}

/// Append-only version chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changelog {
    root: VersionId,
    last: VersionId,
    versions: BTreeMap<VersionId, Version>,
    change_sets: Vec<ChangeSet>,
}

impl Changelog {
    /// Create a changelog holding only a root version.
    pub fn new(root: VersionId) -> Self {
        let mut versions = BTreeMap::new();
        versions.insert(
            root.clone(),
            Version {
                id: root.clone(),
                parent: None,
                child: None,
                operation: None,
                change_set: None,
            },
        );
        Self {
            last: root.clone(),
            root,
            versions,
            change_sets: Vec::new(),
        }
    }

    /// Create a changelog with a generated root id.
    pub fn with_generated_root(names: &mut dyn NameAllocator) -> Self {
        Self::new(VersionId::new(names.next_token()))
    }

    pub fn root(&self) -> &VersionId {
        &self.root
    }

    /// The newest version.
    pub fn last(&self) -> &VersionId {
        &self.last
    }

    /// Look up a version.
    pub fn version(&self, id: &VersionId) -> Result<&Version> {
        self.versions
            .get(id)
            .ok_or_else(|| Error::not_found("version", id.as_str()))
    }

    pub fn contains(&self, id: &VersionId) -> bool {
        self.versions.contains_key(id)
    }

    pub fn change_sets(&self) -> &[ChangeSet] {
        &self.change_sets
    }

    /// Append one version per operation under a new change set.
    pub fn add_change_set(
        &mut self,
        author: impl Into<String>,
        description: Option<String>,
        operations: Vec<SchemaOperation>,
        names: &mut dyn NameAllocator,
    ) -> Result<&ChangeSet> {
        if operations.is_empty() {
            return Err(Error::InvalidArgument(
                "a change set needs at least one operation".to_string(),
            ));
        }

        let taken: Vec<String> = self.change_sets.iter().map(|c| c.id.clone()).collect();
        let change_set_id = names.allocate("", &|candidate| {
            taken.iter().any(|t| t == candidate)
        });

        let mut created = Vec::with_capacity(operations.len());
        for operation in operations {
            let id = self.append(operation, &change_set_id, names);
            created.push(id);
        }

        self.change_sets.push(ChangeSet {
            id: change_set_id,
            author: author.into(),
            description,
            created_at: current_timestamp(),
            versions: created,
        });
        let index = self.change_sets.len() - 1;
        Ok(&self.change_sets[index])
    }

    fn append(
        &mut self,
        operation: SchemaOperation,
        change_set: &str,
        names: &mut dyn NameAllocator,
    ) -> VersionId {
        let id = {
            let versions = &self.versions;
            VersionId::new(names.allocate("", &|candidate| {
                versions.contains_key(&VersionId::from(candidate))
            }))
        };

        if let Some(parent) = self.versions.get_mut(&self.last) {
            parent.child = Some(id.clone());
        }

        self.versions.insert(
            id.clone(),
            Version {
                id: id.clone(),
                parent: Some(self.last.clone()),
                child: None,
                operation: Some(operation),
                change_set: Some(change_set.to_string()),
            },
        );
        self.last = id.clone();
        id
    }

    /// Distance from the root.
    pub fn position(&self, id: &VersionId) -> Result<usize> {
        let mut position = 0;
        let mut current = self.version(id)?;
        while let Some(parent) = &current.parent {
            current = self.version(parent)?;
            position += 1;
        }
        Ok(position)
    }

    /// Versions after `from` up to and including `to`, oldest first.
    pub fn path(&self, from: &VersionId, to: &VersionId) -> Result<Vec<VersionId>> {
        self.version(from)?;
        let mut path = Vec::new();
        let mut current = self.version(to)?;
        while current.id != *from {
            path.push(current.id.clone());
            match &current.parent {
                Some(parent) => current = self.version(parent)?,
                None => {
                    return Err(Error::InvalidArgument(format!(
                        "version {} is not a descendant of {}",
                        to, from
                    )))
                }
            }
        }
        path.reverse();
        Ok(path)
    }

    /// All versions from the root, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Version> {
        let mut next = self.versions.get(&self.root);
        std::iter::from_fn(move || {
            let current = next?;
            next = current.child.as_ref().and_then(|c| self.versions.get(c));
            Some(current)
        })
    }
}
