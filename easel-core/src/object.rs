//! Canvas objects and their sync metadata.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resolver::VersionStamp;

/// Opaque, immutable object identifier.
pub type ObjectId = Uuid;

/// RGBA color, each channel in `0.0..=1.0`.
pub type Color = [f32; 4];

/// Shape family of a canvas object. Rendering is not this crate's concern;
/// the kind only travels with the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShapeKind {
    Rect,
    Ellipse,
    Line,
    Text,
    Image,
    Frame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TextAlign {
    #[default]
    Left,
    Center,
    Right,
}

/// Text content carried by text objects (and optionally by shapes with labels).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub content: String,
    pub font_family: String,
    pub font_size: f32,
    pub align: TextAlign,
}

impl TextBlock {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            font_family: "Inter".to_string(),
            font_size: 16.0,
            align: TextAlign::Left,
        }
    }
}

/// Who last changed an object, and when (milliseconds since the Unix epoch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EditorMeta {
    pub user_id: String,
    pub user_name: String,
    pub timestamp_millis: u64,
}

impl EditorMeta {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>, timestamp_millis: u64) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            timestamp_millis,
        }
    }
}

/// A mutable shape or text record on a canvas.
///
/// `version` and `last_editor` belong to the sync engine. Values supplied
/// by the UI in those fields are overwritten when a local change is stamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasObject {
    pub id: ObjectId,
    pub kind: ShapeKind,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub rotation: f32,
    pub fill: Option<Color>,
    pub stroke: Option<Color>,
    pub stroke_width: f32,
    pub text: Option<TextBlock>,
    pub visible: bool,
    pub locked: bool,
    /// Paint order; higher is drawn later.
    pub z: i64,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub last_editor: Option<EditorMeta>,
}

impl CanvasObject {
    /// Create an unversioned object of the given kind and bounds.
    pub fn new(kind: ShapeKind, x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            x,
            y,
            width,
            height,
            rotation: 0.0,
            fill: None,
            stroke: None,
            stroke_width: 1.0,
            text: None,
            visible: true,
            locked: false,
            z: 0,
            version: 0,
            last_editor: None,
        }
    }

    pub fn rect(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::new(ShapeKind::Rect, x, y, width, height)
    }

    pub fn ellipse(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::new(ShapeKind::Ellipse, x, y, width, height)
    }

    pub fn text(x: f32, y: f32, content: impl Into<String>) -> Self {
        let mut obj = Self::new(ShapeKind::Text, x, y, 0.0, 0.0);
        obj.text = Some(TextBlock::new(content));
        obj
    }

    pub fn with_id(mut self, id: ObjectId) -> Self {
        self.id = id;
        self
    }

    pub fn with_fill(mut self, fill: Color) -> Self {
        self.fill = Some(fill);
        self
    }

    pub fn with_z(mut self, z: i64) -> Self {
        self.z = z;
        self
    }

    /// Compare the user-visible field set, ignoring sync metadata.
    pub fn same_content(&self, other: &CanvasObject) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.x == other.x
            && self.y == other.y
            && self.width == other.width
            && self.height == other.height
            && self.rotation == other.rotation
            && self.fill == other.fill
            && self.stroke == other.stroke
            && self.stroke_width == other.stroke_width
            && self.text == other.text
            && self.visible == other.visible
            && self.locked == other.locked
            && self.z == other.z
    }

    /// The conflict-resolution stamp of this object.
    pub fn stamp(&self) -> VersionStamp {
        match &self.last_editor {
            Some(meta) => VersionStamp::new(self.version, meta.timestamp_millis, meta.user_id.clone()),
            None => VersionStamp::version_only(self.version),
        }
    }

    /// Overwrite the sync metadata.
    pub fn stamped(mut self, version: u64, meta: EditorMeta) -> Self {
        self.version = version;
        self.last_editor = Some(meta);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_content_ignores_sync_metadata() {
        let a = CanvasObject::rect(0.0, 0.0, 10.0, 10.0);
        let b = a.clone().stamped(42, EditorMeta::new("u1", "Una", 1000));
        assert!(a.same_content(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_same_content_detects_geometry_change() {
        let a = CanvasObject::rect(0.0, 0.0, 10.0, 10.0);
        let mut b = a.clone();
        b.x = 5.0;
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_stamp_without_editor() {
        let mut obj = CanvasObject::ellipse(1.0, 1.0, 2.0, 2.0);
        obj.version = 7;
        let stamp = obj.stamp();
        assert_eq!(stamp.version, 7);
        assert!(stamp.timestamp_millis.is_none());
        assert!(stamp.user_id.is_none());
    }

    #[test]
    fn test_json_roundtrip_defaults_sync_fields() {
        let obj = CanvasObject::text(5.0, 5.0, "hello").with_z(3);
        let mut value = serde_json::to_value(&obj).unwrap();
        let map = value.as_object_mut().unwrap();
        map.remove("version");
        map.remove("last_editor");

        let parsed: CanvasObject = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.version, 0);
        assert!(parsed.last_editor.is_none());
        assert_eq!(parsed.text.unwrap().content, "hello");
    }
}
