use std::fmt;

use serde_json::{Map, Value};

/// Value shape accepted by a metadata field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Bool,
    Float,
    TextList,
}

/// One interpreted metadata field of a category.
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
}

const fn field(name: &'static str, ty: FieldType) -> FieldSpec {
    FieldSpec { name, ty }
}

const COMMON_FIELDS: &[FieldSpec] = &[
    field("display_name", FieldType::Text),
    field("hide_from_toc", FieldType::Bool),
];

const VIDEO_FIELDS: &[FieldSpec] = &[
    field("sub", FieldType::Text),
    field("youtube_id_0_75", FieldType::Text),
    field("youtube_id_1_0", FieldType::Text),
    field("youtube_id_1_25", FieldType::Text),
    field("youtube_id_1_5", FieldType::Text),
    field("html5_sources", FieldType::TextList),
    field("speed", FieldType::Float),
];

const PROBLEM_FIELDS: &[FieldSpec] = &[
    field("weight", FieldType::Float),
    field("attempts", FieldType::Float),
    field("showanswer", FieldType::Text),
];

/// Typed accessors for the metadata fields a category interprets.
///
/// Fields outside the registry are carried through untouched; metadata is
/// free-form, the registry only owns the keys the system itself reads.
pub struct FieldRegistry {
    category_fields: &'static [FieldSpec],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "metadata field `{}`: {}", self.field, self.message)
    }
}

impl std::error::Error for FieldError {}

impl FieldRegistry {
    pub fn for_category(category: &str) -> Self {
        let category_fields: &'static [FieldSpec] = match category {
            "video" => VIDEO_FIELDS,
            "problem" => PROBLEM_FIELDS,
            _ => &[],
        };
        Self { category_fields }
    }

    fn spec(&self, name: &str) -> Option<&FieldSpec> {
        COMMON_FIELDS
            .iter()
            .chain(self.category_fields.iter())
            .find(|spec| spec.name == name)
    }

    /// Validate and coerce an incoming value for a field. Unregistered fields
    /// pass through unchanged.
    pub fn coerce(&self, name: &str, value: &Value) -> Result<Value, FieldError> {
        let Some(spec) = self.spec(name) else {
            return Ok(value.clone());
        };

        match spec.ty {
            FieldType::Text => match value {
                Value::String(_) => Ok(value.clone()),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                _ => Err(FieldError::new(name, "expected a string")),
            },
            FieldType::Bool => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::String(s) if s == "true" || s == "false" => {
                    Ok(Value::Bool(s == "true"))
                }
                _ => Err(FieldError::new(name, "expected a boolean")),
            },
            FieldType::Float => match value {
                Value::Number(n) if n.as_f64().is_some() => Ok(value.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| FieldError::new(name, "expected a number")),
                _ => Err(FieldError::new(name, "expected a number")),
            },
            FieldType::TextList => match value {
                Value::Array(entries) if entries.iter().all(Value::is_string) => {
                    Ok(value.clone())
                }
                _ => Err(FieldError::new(name, "expected a list of strings")),
            },
        }
    }
}

/// Apply the partial-patch semantics of a save request to existing metadata.
///
/// Entries with a JSON null value are removed, non-null entries are coerced
/// and written, and every field named in `nullout` ends up cleared — even
/// when `metadata` also carries a value for it.
pub fn apply_metadata_patch(
    existing: &mut Map<String, Value>,
    nullout: &[String],
    metadata: &Map<String, Value>,
    registry: &FieldRegistry,
) -> Result<(), FieldError> {
    for (name, value) in metadata {
        if value.is_null() {
            existing.remove(name);
        } else {
            existing.insert(name.clone(), registry.coerce(name, value)?);
        }
    }

    for name in nullout {
        existing.remove(name);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn nullout_clears_field() {
        let registry = FieldRegistry::for_category("video");
        let mut existing = map(json!({"display_name": "Old", "sub": "welcome"}));
        apply_metadata_patch(
            &mut existing,
            &["display_name".to_string()],
            &Map::new(),
            &registry,
        )
        .unwrap();
        assert!(!existing.contains_key("display_name"));
        assert_eq!(existing["sub"], json!("welcome"));
    }

    #[test]
    fn nullout_clears_even_when_metadata_sets_the_field() {
        let registry = FieldRegistry::for_category("video");
        let mut existing = map(json!({"display_name": "Old"}));
        apply_metadata_patch(
            &mut existing,
            &["display_name".to_string()],
            &map(json!({"display_name": "New"})),
            &registry,
        )
        .unwrap();
        assert!(!existing.contains_key("display_name"));
    }

    #[test]
    fn null_value_removes_field() {
        let registry = FieldRegistry::for_category("video");
        let mut existing = map(json!({"sub": "welcome", "display_name": "Clip"}));
        apply_metadata_patch(
            &mut existing,
            &[],
            &map(json!({"sub": null})),
            &registry,
        )
        .unwrap();
        assert!(!existing.contains_key("sub"));
        assert_eq!(existing["display_name"], json!("Clip"));
    }

    #[test]
    fn values_are_coerced_on_write() {
        let registry = FieldRegistry::for_category("video");
        let mut existing = Map::new();
        apply_metadata_patch(
            &mut existing,
            &[],
            &map(json!({"speed": "1.25", "hide_from_toc": "true", "display_name": 42})),
            &registry,
        )
        .unwrap();
        assert_eq!(existing["speed"], json!(1.25));
        assert_eq!(existing["hide_from_toc"], json!(true));
        assert_eq!(existing["display_name"], json!("42"));
    }

    #[test]
    fn bad_typed_value_is_rejected() {
        let registry = FieldRegistry::for_category("video");
        let mut existing = Map::new();
        let err = apply_metadata_patch(
            &mut existing,
            &[],
            &map(json!({"html5_sources": "not-a-list"})),
            &registry,
        )
        .unwrap_err();
        assert_eq!(err.field, "html5_sources");
        assert!(existing.is_empty());
    }

    #[test]
    fn unregistered_fields_pass_through() {
        let registry = FieldRegistry::for_category("chapter");
        let mut existing = Map::new();
        apply_metadata_patch(
            &mut existing,
            &[],
            &map(json!({"custom_flag": {"nested": true}})),
            &registry,
        )
        .unwrap();
        assert_eq!(existing["custom_flag"], json!({"nested": true}));
    }
}
