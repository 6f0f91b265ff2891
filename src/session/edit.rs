use crate::oper::EditOperation;
use crate::oper::OperEdit;
use crate::tree::DataTree;
use crate::tree::XPath;
use crate::Error;
use crate::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EditOptions {
    /// Set fails if the node exists, delete fails if it does not
    pub strict: bool,
}

impl EditOptions {
    pub fn strict() -> Self {
        Self { strict: true }
    }
}

/// One buffered, not yet applied edit of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingEdit {
    pub(crate) operation: EditOperation,
    pub(crate) path: XPath,
    pub(crate) value: Option<String>,
    pub(crate) strict: bool,
}

impl PendingEdit {
    pub(crate) fn new(
        operation: EditOperation,
        path: XPath,
        value: Option<String>,
        strict: bool,
    ) -> Result<Self> {
        if operation != EditOperation::Remove && !path.is_concrete() {
            return Err(crate::PathError::WildcardInEdit(path.to_string()).into());
        }
        if path.is_root() {
            return Err(Error::InvalidArgument("edits need a path below the root".to_string()));
        }
        Ok(Self {
            operation,
            path,
            value,
            strict,
        })
    }

    /// Applies the edit to a configuration tree.
    pub(crate) fn apply_config(
        &self,
        tree: &mut DataTree,
    ) -> Result<()> {
        match self.operation {
            EditOperation::Merge => tree.merge_path(&self.path.to_keys()?, self.value.clone()),
            EditOperation::Create => {
                if !tree.create_path(&self.path.to_keys()?, self.value.clone()) && self.strict {
                    return Err(Error::Exists(self.path.to_string()));
                }
            }
            EditOperation::Remove => {
                if tree.remove_matching(&self.path) == 0 && self.strict {
                    return Err(Error::NotFound(self.path.to_string()));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn to_oper_edit(&self) -> OperEdit {
        OperEdit::new(self.operation, &self.path, self.value.clone())
    }
}

/// Edits that recreate the terminal nodes of `tree` with `operation`.
pub(crate) fn edits_from_tree(
    tree: &DataTree,
    operation: EditOperation,
    strict: bool,
) -> Result<Vec<PendingEdit>> {
    tree.terminal_nodes()
        .into_iter()
        .map(|(keys, node)| {
            let value = match operation {
                EditOperation::Remove => None,
                _ => node.value.clone(),
            };
            PendingEdit::new(operation, XPath::from_keys(&keys), value, strict)
        })
        .collect()
}
