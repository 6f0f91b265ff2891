use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::tree::DataTree;
use crate::tree::XPath;
use crate::utils::process::process_alive;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditOperation {
    /// Insert or overwrite
    Merge,
    /// Insert only if absent
    Create,
    /// Delete the subtree; absent paths are ignored
    Remove,
}

/// Who pushed an edit layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOrigin {
    pub pid: u32,
    pub connection_id: u64,
    pub session_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperEdit {
    pub operation: EditOperation,
    /// Canonical xpath; wildcards only for `Remove`
    pub path: String,
    pub value: Option<String>,
}

impl OperEdit {
    pub fn new(
        operation: EditOperation,
        path: &XPath,
        value: Option<String>,
    ) -> Self {
        Self {
            operation,
            path: path.to_string(),
            value,
        }
    }

    fn xpath(&self) -> Result<XPath> {
        Ok(XPath::parse(&self.path)?)
    }

    /// Applies the edit to `tree`.
    pub fn apply(
        &self,
        tree: &mut DataTree,
    ) -> Result<()> {
        let path = self.xpath()?;
        match self.operation {
            EditOperation::Remove => {
                tree.remove_matching(&path);
            }
            EditOperation::Merge => tree.merge_path(&path.to_keys()?, self.value.clone()),
            EditOperation::Create => {
                tree.create_path(&path.to_keys()?, self.value.clone());
            }
        }
        Ok(())
    }
}

/// Operational data pushed by one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditLayer {
    pub origin: EditOrigin,
    /// Position of the layer among all layers; later layers win
    pub sequence: u64,
    edits: Vec<OperEdit>,
}

impl EditLayer {
    pub fn new(
        origin: EditOrigin,
        sequence: u64,
    ) -> Self {
        Self {
            origin,
            sequence,
            edits: vec![],
        }
    }

    pub fn edits(&self) -> &[OperEdit] {
        &self.edits
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Appends `edit`, dropping earlier edits it makes redundant, so that
    /// repeated delete/create rounds of one instance keep the layer bounded.
    pub fn push(
        &mut self,
        edit: OperEdit,
    ) -> Result<()> {
        let path = edit.xpath()?;
        match edit.operation {
            EditOperation::Remove => {
                let mut kept = Vec::with_capacity(self.edits.len());
                for earlier in self.edits.drain(..) {
                    if !path.covers_path(&earlier.xpath()?) {
                        kept.push(earlier);
                    }
                }
                self.edits = kept;
            }
            EditOperation::Merge => self
                .edits
                .retain(|earlier| earlier.operation == EditOperation::Remove || earlier.path != edit.path),
            EditOperation::Create => {
                let shadowed = self
                    .edits
                    .iter()
                    .any(|earlier| earlier.operation != EditOperation::Remove && earlier.path == edit.path);
                if shadowed {
                    return Ok(());
                }
            }
        }
        self.edits.push(edit);
        Ok(())
    }

    /// Applies the edits that can touch `query` to `tree`.
    pub fn apply_to(
        &self,
        tree: &mut DataTree,
        query: &XPath,
    ) -> Result<()> {
        for edit in &self.edits {
            if query.intersects(&edit.xpath()?) {
                edit.apply(tree)?;
            }
        }
        Ok(())
    }
}

/// Content of the operational datastore: every session's edit layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperState {
    layers: BTreeMap<u64, EditLayer>,
    next_sequence: u64,
}

impl OperState {
    /// Layer of `origin.session_id`, created on first use.
    pub fn layer_mut(
        &mut self,
        origin: EditOrigin,
    ) -> &mut EditLayer {
        let next_sequence = &mut self.next_sequence;
        self.layers.entry(origin.session_id).or_insert_with(|| {
            *next_sequence += 1;
            EditLayer::new(origin, *next_sequence)
        })
    }

    pub fn layer(
        &self,
        session_id: u64,
    ) -> Option<&EditLayer> {
        self.layers.get(&session_id)
    }

    /// Layers in the order they apply.
    pub fn layers(&self) -> Vec<&EditLayer> {
        let mut layers: Vec<&EditLayer> = self.layers.values().collect();
        layers.sort_by_key(|layer| layer.sequence);
        layers
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn remove_layer(
        &mut self,
        session_id: u64,
    ) -> bool {
        self.layers.remove(&session_id).is_some()
    }

    /// Drops every layer of one connection. Returns how many were dropped.
    pub fn remove_connection(
        &mut self,
        pid: u32,
        connection_id: u64,
    ) -> usize {
        let before = self.layers.len();
        self.layers
            .retain(|_, layer| !(layer.origin.pid == pid && layer.origin.connection_id == connection_id));
        before - self.layers.len()
    }

    /// Drops layers pushed by processes that no longer exist.
    pub fn purge_dead(&mut self) -> Vec<EditOrigin> {
        let dead: Vec<EditOrigin> = self
            .layers
            .values()
            .filter(|layer| !process_alive(layer.origin.pid))
            .map(|layer| layer.origin)
            .collect();
        for origin in &dead {
            debug!(pid = origin.pid, session_id = origin.session_id, "Dropping edit layer of dead process");
            self.layers.remove(&origin.session_id);
        }
        dead
    }

    /// Applies every layer relevant to `query` on top of `tree`.
    pub fn apply(
        &self,
        tree: &mut DataTree,
        query: &XPath,
    ) -> Result<()> {
        for layer in self.layers() {
            layer.apply_to(tree, query)?;
        }
        Ok(())
    }
}
