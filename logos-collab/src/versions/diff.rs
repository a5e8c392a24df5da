//! Field-level diff between two document states.
//!
//! Only the tracked fields of metadata, layers and canvas settings are
//! compared (see [`logos_core::TrackedFields`]). Layers are matched purely by
//! id: an id present on one side only is added or removed, an id present on
//! both sides is modified if any tracked field differs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use logos_core::{DocumentState, Layer, LayerId, TrackedFields};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old: Value,
    pub new: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerModification {
    pub layer_id: LayerId,
    pub changes: Vec<FieldChange>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LayerChanges {
    /// Ids only in the newer state, in its stacking order.
    pub added: Vec<LayerId>,
    /// Ids only in the older state, in its stacking order.
    pub removed: Vec<LayerId>,
    pub modified: Vec<LayerModification>,
}

impl LayerChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionDiff {
    pub from_version: u64,
    pub to_version: u64,
    pub metadata: Vec<FieldChange>,
    pub layers: LayerChanges,
    pub canvas: Vec<FieldChange>,
}

impl VersionDiff {
    /// Diff `from` (at `from_version`) against `to` (at `to_version`).
    pub fn between(from_version: u64, from: &DocumentState, to_version: u64, to: &DocumentState) -> Self {
        Self {
            from_version,
            to_version,
            metadata: field_changes(&from.metadata, &to.metadata),
            layers: layer_changes(&from.layers, &to.layers),
            canvas: field_changes(&from.canvas, &to.canvas),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty() && self.layers.is_empty() && self.canvas.is_empty()
    }

    /// Total number of reported changes across all categories.
    pub fn change_count(&self) -> usize {
        self.metadata.len()
            + self.canvas.len()
            + self.layers.added.len()
            + self.layers.removed.len()
            + self.layers.modified.len()
    }
}

fn field_changes<T: TrackedFields>(old: &T, new: &T) -> Vec<FieldChange> {
    old.tracked_fields()
        .into_iter()
        .zip(new.tracked_fields())
        .filter(|((_, a), (_, b))| a != b)
        .map(|((field, old), (_, new))| FieldChange {
            field: field.to_string(),
            old,
            new,
        })
        .collect()
}

fn layer_changes(old: &[Layer], new: &[Layer]) -> LayerChanges {
    let old_by_id: HashMap<&str, &Layer> = old.iter().map(|l| (l.id.as_str(), l)).collect();
    let new_by_id: HashMap<&str, &Layer> = new.iter().map(|l| (l.id.as_str(), l)).collect();

    let mut changes = LayerChanges::default();

    for layer in new {
        match old_by_id.get(layer.id.as_str()) {
            None => changes.added.push(layer.id.clone()),
            Some(previous) => {
                let fields = field_changes(*previous, layer);
                if !fields.is_empty() {
                    changes.modified.push(LayerModification {
                        layer_id: layer.id.clone(),
                        changes: fields,
                    });
                }
            }
        }
    }

    changes.removed = old
        .iter()
        .filter(|l| !new_by_id.contains_key(l.id.as_str()))
        .map(|l| l.id.clone())
        .collect();

    changes
}
