#[cfg(test)]
use mockall::automock;

use super::DataTree;
use crate::DatastoreKind;
use crate::ValidationError;

/// Seam for the schema layer. Called with the complete candidate tree of a
/// datastore before any subscriber sees the change.
#[cfg_attr(test, automock)]
pub trait SchemaValidator: Send + Sync + 'static {
    fn validate(
        &self,
        datastore: DatastoreKind,
        tree: &DataTree,
    ) -> Result<(), ValidationError>;
}

/// Validator for schema-less use: every tree is valid.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl SchemaValidator for AcceptAll {
    fn validate(
        &self,
        _datastore: DatastoreKind,
        _tree: &DataTree,
    ) -> Result<(), ValidationError> {
        Ok(())
    }
}
