//! Tracked-field allowlists.
//!
//! Version diffs compare only the fields listed here. Free-form maps
//! (`extra`, `properties`) and anything added later stay out of diffs until
//! they are added to the list explicitly.

use serde_json::{json, Value};

use crate::{CanvasSettings, DocumentMetadata, Layer};

/// Ordered `(field name, value)` pairs.
pub type FieldValues = Vec<(&'static str, Value)>;

pub trait TrackedFields {
    /// Field names compared by diffs, in reporting order.
    const FIELDS: &'static [&'static str];

    fn tracked_fields(&self) -> FieldValues;
}

impl TrackedFields for DocumentMetadata {
    const FIELDS: &'static [&'static str] = &["name", "description", "status", "tags"];

    fn tracked_fields(&self) -> FieldValues {
        vec![
            ("name", json!(self.name)),
            ("description", json!(self.description)),
            ("status", json!(self.status)),
            ("tags", json!(self.tags)),
        ]
    }
}

impl TrackedFields for Layer {
    const FIELDS: &'static [&'static str] = &[
        "catalog_item_id",
        "name",
        "x",
        "y",
        "rotation",
        "scale_x",
        "scale_y",
        "z_index",
        "visible",
        "opacity",
        "color",
    ];

    fn tracked_fields(&self) -> FieldValues {
        vec![
            ("catalog_item_id", json!(self.catalog_item_id)),
            ("name", json!(self.name)),
            ("x", json!(self.transform.x)),
            ("y", json!(self.transform.y)),
            ("rotation", json!(self.transform.rotation)),
            ("scale_x", json!(self.transform.scale_x)),
            ("scale_y", json!(self.transform.scale_y)),
            ("z_index", json!(self.z_index)),
            ("visible", json!(self.visible)),
            ("opacity", json!(self.opacity)),
            ("color", json!(self.color)),
        ]
    }
}

impl TrackedFields for CanvasSettings {
    const FIELDS: &'static [&'static str] = &[
        "width",
        "height",
        "background_color",
        "grid_enabled",
        "grid_size",
        "snap_to_grid",
    ];

    fn tracked_fields(&self) -> FieldValues {
        vec![
            ("width", json!(self.width)),
            ("height", json!(self.height)),
            ("background_color", json!(self.background_color)),
            ("grid_enabled", json!(self.grid_enabled)),
            ("grid_size", json!(self.grid_size)),
            ("snap_to_grid", json!(self.snap_to_grid)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names<T: TrackedFields>(value: &T) -> Vec<&'static str> {
        value.tracked_fields().into_iter().map(|(name, _)| name).collect()
    }

    #[test]
    fn test_field_lists_match_values() {
        assert_eq!(names(&DocumentMetadata::default()), DocumentMetadata::FIELDS);
        assert_eq!(names(&Layer::new("a", "A")), Layer::FIELDS);
        assert_eq!(names(&CanvasSettings::default()), CanvasSettings::FIELDS);
    }

    #[test]
    fn test_free_form_fields_not_tracked() {
        let mut a = Layer::new("a", "A");
        let b = a.clone();
        a.properties.insert("stitch".into(), json!("double"));
        assert_eq!(a.tracked_fields(), b.tracked_fields());
    }
}
