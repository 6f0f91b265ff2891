use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use super::DataNode;
use super::DataTree;
use super::NodeKey;
use super::XPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOperation {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub operation: ChangeOperation,
    /// Canonical path of the changed node
    pub path: String,
    pub keys: Vec<NodeKey>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl Change {
    pub fn module(&self) -> Option<&str> {
        self.keys.first().and_then(NodeKey::module)
    }
}

/// Ordered node-level differences between two trees. Every node of a
/// created or deleted subtree is listed, parents before children.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    changes: Vec<Change>,
}

impl Diff {
    pub fn between(
        old: &DataTree,
        new: &DataTree,
    ) -> Self {
        let mut changes = Vec::new();
        let mut prefix = Vec::new();
        diff_level(old.roots(), new.roots(), &mut prefix, &mut changes);
        Self { changes }
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Changes inside the subtrees selected by `xpath`.
    pub fn filter(
        &self,
        xpath: &XPath,
    ) -> Diff {
        Diff {
            changes: self
                .changes
                .iter()
                .filter(|change| xpath.covers(&change.keys))
                .cloned()
                .collect(),
        }
    }

    /// Replays the changes on `tree`. Applied to the `old` tree of
    /// [`Diff::between`], it yields the `new` one.
    pub fn apply(
        &self,
        tree: &mut DataTree,
    ) {
        for change in &self.changes {
            match change.operation {
                ChangeOperation::Created | ChangeOperation::Modified => {
                    tree.set_value(&change.keys, change.new_value.clone())
                }
                ChangeOperation::Deleted => {
                    tree.remove_path(&change.keys);
                }
            }
        }
    }

    pub fn modules(&self) -> BTreeSet<String> {
        self.changes
            .iter()
            .filter_map(|change| change.module().map(str::to_string))
            .collect()
    }
}

impl DataTree {
    pub fn diff(
        old: &DataTree,
        new: &DataTree,
    ) -> Diff {
        Diff::between(old, new)
    }
}

fn diff_level(
    old: &BTreeMap<NodeKey, DataNode>,
    new: &BTreeMap<NodeKey, DataNode>,
    prefix: &mut Vec<NodeKey>,
    out: &mut Vec<Change>,
) {
    let keys: BTreeSet<&NodeKey> = old.keys().chain(new.keys()).collect();
    for key in keys {
        prefix.push(key.clone());
        match (old.get(key), new.get(key)) {
            (Some(before), Some(after)) => {
                if before.value != after.value {
                    out.push(change(ChangeOperation::Modified, prefix, &before.value, &after.value));
                }
                diff_level(&before.children, &after.children, prefix, out);
            }
            (None, Some(after)) => whole_subtree(ChangeOperation::Created, after, prefix, out),
            (Some(before), None) => whole_subtree(ChangeOperation::Deleted, before, prefix, out),
            (None, None) => {}
        }
        prefix.pop();
    }
}

fn whole_subtree(
    operation: ChangeOperation,
    node: &DataNode,
    prefix: &mut Vec<NodeKey>,
    out: &mut Vec<Change>,
) {
    let absent = None;
    let (old, new) = match operation {
        ChangeOperation::Deleted => (&node.value, &absent),
        _ => (&absent, &node.value),
    };
    out.push(change(operation, prefix, old, new));
    for (key, child) in &node.children {
        prefix.push(key.clone());
        whole_subtree(operation, child, prefix, out);
        prefix.pop();
    }
}

fn change(
    operation: ChangeOperation,
    keys: &[NodeKey],
    old_value: &Option<String>,
    new_value: &Option<String>,
) -> Change {
    Change {
        operation,
        path: XPath::from_keys(keys).to_string(),
        keys: keys.to_vec(),
        old_value: old_value.clone(),
        new_value: new_value.clone(),
    }
}
