use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use super::NodeKey;
use super::XPath;
use super::SELF_PREDICATE;
use crate::Result;
use crate::StorageError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataNode {
    pub value: Option<String>,
    pub children: BTreeMap<NodeKey, DataNode>,
}

impl DataNode {
    fn for_key(key: &NodeKey) -> Self {
        let mut node = DataNode::default();
        for (name, value) in &key.predicates {
            if name == SELF_PREDICATE {
                node.value = Some(value.clone());
            } else {
                node.children.insert(
                    NodeKey::new(name.clone()),
                    DataNode {
                        value: Some(value.clone()),
                        children: BTreeMap::new(),
                    },
                );
            }
        }
        node
    }

    /// Childless, or only holding the leaves that mirror its own keys.
    fn is_terminal(
        &self,
        key: &NodeKey,
    ) -> bool {
        self.children.keys().all(|child| key.is_key_leaf(child))
    }

    fn count(&self) -> usize {
        1 + self.children.values().map(DataNode::count).sum::<usize>()
    }

    fn truncated(
        &self,
        depth: u32,
    ) -> DataNode {
        DataNode {
            value: self.value.clone(),
            children: match depth {
                0 => self.children.clone(),
                1 => BTreeMap::new(),
                _ => self
                    .children
                    .iter()
                    .map(|(k, child)| (k.clone(), child.truncated(depth - 1)))
                    .collect(),
            },
        }
    }

    fn merge_from(
        &mut self,
        other: &DataNode,
    ) {
        if other.value.is_some() {
            self.value = other.value.clone();
        }
        for (key, child) in &other.children {
            match self.children.entry(key.clone()) {
                Entry::Occupied(mut existing) => existing.get_mut().merge_from(child),
                Entry::Vacant(slot) => {
                    slot.insert(child.clone());
                }
            }
        }
    }
}

/// Schema-less data tree. Top-level names carry their module prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTree {
    roots: BTreeMap<NodeKey, DataNode>,
}

impl DataTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Number of nodes, key leaves included.
    pub fn len(&self) -> usize {
        self.roots.values().map(DataNode::count).sum()
    }

    pub fn roots(&self) -> &BTreeMap<NodeKey, DataNode> {
        &self.roots
    }

    pub fn get(
        &self,
        keys: &[NodeKey],
    ) -> Option<&DataNode> {
        let (first, rest) = keys.split_first()?;
        rest.iter()
            .try_fold(self.roots.get(first)?, |node, key| node.children.get(key))
    }

    pub fn contains(
        &self,
        path: &str,
    ) -> Result<bool> {
        let keys = XPath::parse(path)?.to_keys()?;
        Ok(self.get(&keys).is_some())
    }

    /// Value of the node at `path`, `None` if absent or valueless.
    pub fn value(
        &self,
        path: &str,
    ) -> Result<Option<&str>> {
        let keys = XPath::parse(path)?.to_keys()?;
        Ok(self.get(&keys).and_then(|node| node.value.as_deref()))
    }

    /// Creates missing nodes along `keys`; sets the value of the last one
    /// when `value` is given.
    pub fn merge_path(
        &mut self,
        keys: &[NodeKey],
        value: Option<String>,
    ) {
        let Some((first, rest)) = keys.split_first() else {
            return;
        };
        let mut node = self
            .roots
            .entry(first.clone())
            .or_insert_with(|| DataNode::for_key(first));
        for key in rest {
            node = node
                .children
                .entry(key.clone())
                .or_insert_with(|| DataNode::for_key(key));
        }
        if value.is_some() {
            node.value = value;
        }
    }

    /// Like [`DataTree::merge_path`] but only if the node is absent.
    /// Returns whether anything was created.
    pub fn create_path(
        &mut self,
        keys: &[NodeKey],
        value: Option<String>,
    ) -> bool {
        if keys.is_empty() || self.get(keys).is_some() {
            return false;
        }
        self.merge_path(keys, value);
        true
    }

    /// Removes the subtree at `keys`. Absent paths are not an error.
    pub fn remove_path(
        &mut self,
        keys: &[NodeKey],
    ) -> bool {
        match keys.split_last() {
            None => false,
            Some((last, [])) => self.roots.remove(last).is_some(),
            Some((last, parents)) => {
                let Some((first, rest)) = parents.split_first() else {
                    return false;
                };
                let mut node = match self.roots.get_mut(first) {
                    Some(node) => node,
                    None => return false,
                };
                for key in rest {
                    node = match node.children.get_mut(key) {
                        Some(child) => child,
                        None => return false,
                    };
                }
                node.children.remove(last).is_some()
            }
        }
    }

    /// Removes every subtree selected by `path`; wildcards allowed.
    /// Returns the number of subtrees removed.
    pub fn remove_matching(
        &mut self,
        path: &XPath,
    ) -> usize {
        if path.is_root() {
            let removed = self.roots.len();
            self.roots.clear();
            return removed;
        }
        remove_in(&mut self.roots, path, 0)
    }

    /// Copy of the nodes selected by `query` with their ancestors.
    ///
    /// `max_depth` 0 keeps whole subtrees; otherwise a selected node keeps
    /// `max_depth - 1` levels of descendants.
    pub fn select(
        &self,
        query: &XPath,
        max_depth: u32,
    ) -> DataTree {
        let roots = select_in(&self.roots, query, 0, max_depth);
        DataTree { roots }
    }

    /// Merges `other` into `self`. Instances already present are updated in
    /// place, never duplicated.
    pub fn merge_tree(
        &mut self,
        other: &DataTree,
    ) {
        for (key, node) in &other.roots {
            match self.roots.entry(key.clone()) {
                Entry::Occupied(mut existing) => existing.get_mut().merge_from(node),
                Entry::Vacant(slot) => {
                    slot.insert(node.clone());
                }
            }
        }
    }

    /// Sets the value of the node at `keys`, creating it if needed. Unlike
    /// [`DataTree::merge_path`], `None` clears the value.
    pub fn set_value(
        &mut self,
        keys: &[NodeKey],
        value: Option<String>,
    ) {
        self.merge_path(keys, None);
        let Some((first, rest)) = keys.split_first() else {
            return;
        };
        let Some(mut node) = self.roots.get_mut(first) else {
            return;
        };
        for key in rest {
            node = match node.children.get_mut(key) {
                Some(child) => child,
                None => return,
            };
        }
        node.value = value;
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self).map_err(StorageError::from)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes).map_err(StorageError::from)?)
    }

    /// Modules with at least one top-level node.
    pub fn modules(&self) -> BTreeSet<String> {
        self.roots
            .keys()
            .filter_map(|key| key.module().map(str::to_string))
            .collect()
    }

    /// Every node in pre-order as (path keys, node).
    pub fn nodes(&self) -> Vec<(Vec<NodeKey>, &DataNode)> {
        let mut out = Vec::new();
        let mut prefix = Vec::new();
        collect_nodes(&self.roots, &mut prefix, &mut out);
        out
    }

    /// Nodes that end an edit: leaves, empty containers and list entries
    /// holding nothing but their keys. Key leaves themselves are skipped.
    pub fn terminal_nodes(&self) -> Vec<(Vec<NodeKey>, &DataNode)> {
        self.nodes()
            .into_iter()
            .filter(|(keys, node)| match keys.as_slice() {
                [.., parent, key] if parent.is_key_leaf(key) => false,
                [.., key] => node.is_terminal(key),
                [] => false,
            })
            .collect()
    }

    /// (path, value) of every node holding a value.
    pub fn leaves(&self) -> Vec<(String, String)> {
        self.nodes()
            .into_iter()
            .filter_map(|(keys, node)| {
                node.value
                    .as_ref()
                    .map(|value| (XPath::from_keys(&keys).to_string(), value.clone()))
            })
            .collect()
    }
}

fn remove_in(
    children: &mut BTreeMap<NodeKey, DataNode>,
    path: &XPath,
    depth: usize,
) -> usize {
    let Some(step) = path.steps().get(depth) else {
        return 0;
    };
    let last = depth + 1 == path.steps().len();

    if last {
        let before = children.len();
        children.retain(|key, _| !step.matches(key));
        return before - children.len();
    }

    children
        .iter_mut()
        .filter(|(key, _)| step.matches(key))
        .map(|(_, child)| remove_in(&mut child.children, path, depth + 1))
        .sum()
}

fn select_in(
    children: &BTreeMap<NodeKey, DataNode>,
    query: &XPath,
    depth: usize,
    max_depth: u32,
) -> BTreeMap<NodeKey, DataNode> {
    let Some(step) = query.steps().get(depth) else {
        // whole level selected
        return children
            .iter()
            .map(|(key, node)| (key.clone(), node.truncated(max_depth)))
            .collect();
    };
    let last = depth + 1 == query.steps().len();

    let mut out = BTreeMap::new();
    for (key, node) in children.iter().filter(|(key, _)| step.matches(key)) {
        if last {
            out.insert(key.clone(), node.truncated(max_depth));
            continue;
        }
        let selected = select_in(&node.children, query, depth + 1, max_depth);
        if selected.is_empty() {
            continue;
        }
        let mut ancestor = DataNode {
            value: node.value.clone(),
            children: node
                .children
                .iter()
                .filter(|(child, _)| key.is_key_leaf(child))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        ancestor.children.extend(selected);
        out.insert(key.clone(), ancestor);
    }
    out
}

fn collect_nodes<'a>(
    children: &'a BTreeMap<NodeKey, DataNode>,
    prefix: &mut Vec<NodeKey>,
    out: &mut Vec<(Vec<NodeKey>, &'a DataNode)>,
) {
    for (key, node) in children {
        prefix.push(key.clone());
        out.push((prefix.clone(), node));
        collect_nodes(&node.children, prefix, out);
        prefix.pop();
    }
}
