//! # logos-core — Design document model shared by the Logos services
//!
//! A document is a name plus metadata, an ordered stack of layers (each a
//! positioned catalog item), and the canvas it is drawn on. The whole
//! [`DocumentState`] is what the collaboration engine snapshots, diffs and
//! restores.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub mod tracked;

pub use tracked::{FieldValues, TrackedFields};

/// Document identifier.
pub type DocumentId = Uuid;
/// User identifier.
pub type UserId = Uuid;
/// Layer identifier, unique within a document (e.g. `"sleeve-1"`).
pub type LayerId = String;

/// Full state of a design document at one point in time.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct DocumentState {
    pub metadata: DocumentMetadata,
    /// Layers in stacking order (bottom first).
    pub layers: Vec<Layer>,
    pub canvas: CanvasSettings,
}

impl DocumentState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: DocumentMetadata::new(name),
            layers: Vec::new(),
            canvas: CanvasSettings::default(),
        }
    }

    /// Builder-style helper used by fixtures and tests.
    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn layer(&self, id: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    pub fn layer_mut(&mut self, id: &str) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.id == id)
    }

    /// Insert or replace a layer, keeping its position if it already exists.
    pub fn upsert_layer(&mut self, layer: Layer) {
        match self.layers.iter_mut().find(|l| l.id == layer.id) {
            Some(existing) => *existing = layer,
            None => self.layers.push(layer),
        }
    }

    pub fn remove_layer(&mut self, id: &str) -> Option<Layer> {
        let index = self.layers.iter().position(|l| l.id == id)?;
        Some(self.layers.remove(index))
    }

    pub fn layer_ids(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|l| l.id.as_str())
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct DocumentMetadata {
    pub name: String,
    pub description: Option<String>,
    /// Workflow status (`draft`, `review`, `final`, ...).
    pub status: String,
    pub tags: Vec<String>,
    /// Free-form attributes; persisted but not diffed.
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl DocumentMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            status: "draft".to_string(),
            tags: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        Self::new("Untitled")
    }
}

/// 2D placement of a layer on the canvas.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Transform {
    pub x: f32,
    pub y: f32,
    /// Degrees, clockwise.
    pub rotation: f32,
    pub scale_x: f32,
    pub scale_y: f32,
}

impl Transform {
    pub fn at(x: f32, y: f32) -> Self {
        Self { x, y, ..Self::default() }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            rotation: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
        }
    }
}

/// One positioned catalog item within a document. Layers are the unit of
/// edit locking.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Layer {
    pub id: LayerId,
    /// Catalog item rendered by this layer, if any.
    pub catalog_item_id: Option<String>,
    pub name: String,
    pub transform: Transform,
    pub z_index: i32,
    pub visible: bool,
    pub opacity: f32,
    pub color: Option<String>,
    /// Item-specific properties; persisted but not diffed.
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Layer {
    pub fn new(id: impl Into<LayerId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            catalog_item_id: None,
            name: name.into(),
            transform: Transform::default(),
            z_index: 0,
            visible: true,
            opacity: 1.0,
            color: None,
            properties: Map::new(),
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_catalog_item(mut self, item: impl Into<String>) -> Self {
        self.catalog_item_id = Some(item.into());
        self
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct CanvasSettings {
    pub width: u32,
    pub height: u32,
    pub background_color: String,
    pub grid_enabled: bool,
    pub grid_size: u32,
    pub snap_to_grid: bool,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl Default for CanvasSettings {
    fn default() -> Self {
        Self {
            width: 1200,
            height: 1600,
            background_color: "#ffffff".to_string(),
            grid_enabled: false,
            grid_size: 20,
            snap_to_grid: false,
            extra: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_creation() {
        let doc = DocumentState::new("Summer jacket");
        assert_eq!(doc.metadata.name, "Summer jacket");
        assert_eq!(doc.metadata.status, "draft");
        assert!(doc.layers.is_empty());
        assert_eq!(doc.canvas, CanvasSettings::default());
    }

    #[test]
    fn test_upsert_keeps_position() {
        let mut doc = DocumentState::new("doc")
            .with_layer(Layer::new("body", "Body"))
            .with_layer(Layer::new("sleeve-1", "Sleeve"))
            .with_layer(Layer::new("collar", "Collar"));

        let mut sleeve = doc.layer("sleeve-1").unwrap().clone();
        sleeve.transform = Transform::at(40.0, 12.0);
        doc.upsert_layer(sleeve);

        let ids: Vec<&str> = doc.layer_ids().collect();
        assert_eq!(ids, vec!["body", "sleeve-1", "collar"]);
        assert_eq!(doc.layer("sleeve-1").unwrap().transform.x, 40.0);

        doc.upsert_layer(Layer::new("pocket", "Pocket"));
        assert_eq!(doc.layers.len(), 4);
    }

    #[test]
    fn test_remove_layer() {
        let mut doc = DocumentState::new("doc").with_layer(Layer::new("a", "A"));
        assert!(doc.remove_layer("a").is_some());
        assert!(doc.remove_layer("a").is_none());
        assert!(doc.layers.is_empty());
    }

    #[test]
    fn test_json_roundtrip_preserves_free_form_fields() {
        let mut layer = Layer::new("sleeve-1", "Sleeve").with_catalog_item("cat-77");
        layer.properties.insert("fabric".into(), Value::from("denim"));
        let mut doc = DocumentState::new("doc").with_layer(layer);
        doc.canvas.extra.insert("unit".into(), Value::from("mm"));

        let json = serde_json::to_string(&doc).unwrap();
        let back: DocumentState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_missing_free_form_fields_default() {
        let json = r#"{"id":"a","catalog_item_id":null,"name":"A",
            "transform":{"x":0.0,"y":0.0,"rotation":0.0,"scale_x":1.0,"scale_y":1.0},
            "z_index":0,"visible":true,"opacity":1.0,"color":null}"#;
        let layer: Layer = serde_json::from_str(json).unwrap();
        assert!(layer.properties.is_empty());
    }
}
