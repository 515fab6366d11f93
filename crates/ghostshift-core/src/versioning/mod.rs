//! Schema versions and the operations that produce them.

mod changelog;
mod operation;

pub use changelog::{ChangeSet, Changelog, Version, VersionId};
pub use operation::SchemaOperation;
