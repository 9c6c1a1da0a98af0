//! Content fingerprinting for change detection.
//!
//! The fingerprint is a pure function of an entity's source-defined fields:
//! same fields in any order produce the same digest, and any field change
//! produces a different one. System metadata never participates.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::errors::Result;
use crate::models::Entity;

/// SHA-256 hex digest over the canonical form of the entity's fields.
pub fn content_hash(entity: &Entity) -> Result<String> {
    Ok(hash_fields(&entity.fields))
}

pub fn hash_fields(fields: &Map<String, Value>) -> String {
    let mut hasher = Sha256::new();
    write_canonical_map(&mut hasher, fields);
    hex::encode(hasher.finalize())
}

// Canonical form: keys visited in sorted order at every nesting level, each
// scalar rendered through serde_json. Insertion order never leaks into the
// digest.
fn write_canonical_map(hasher: &mut Sha256, map: &Map<String, Value>) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    hasher.update(b"{");
    for key in keys {
        hasher.update(key.as_bytes());
        hasher.update(b":");
        write_canonical_value(hasher, &map[key]);
        hasher.update(b",");
    }
    hasher.update(b"}");
}

fn write_canonical_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Object(map) => write_canonical_map(hasher, map),
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                write_canonical_value(hasher, item);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        scalar => hasher.update(scalar.to_string().as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn entity_with(fields: &[(&str, Value)]) -> Entity {
        let mut entity = Entity::new(
            "github",
            "issue",
            "issue-1",
            Uuid::nil(),
            Uuid::nil(),
        );
        for (key, value) in fields {
            entity.fields.insert(key.to_string(), value.clone());
        }
        entity
    }

    #[test]
    fn test_hash_is_order_independent() {
        let forward = entity_with(&[("a", json!(1)), ("b", json!("x"))]);
        let backward = entity_with(&[("b", json!("x")), ("a", json!(1))]);
        assert_eq!(
            content_hash(&forward).unwrap(),
            content_hash(&backward).unwrap()
        );
    }

    #[test]
    fn test_hash_changes_on_any_field_change() {
        let base = entity_with(&[("title", json!("foo")), ("body", json!("bar"))]);
        let edited = entity_with(&[("title", json!("foo")), ("body", json!("baz"))]);
        let extended = entity_with(&[
            ("title", json!("foo")),
            ("body", json!("bar")),
            ("label", json!("bug")),
        ]);
        let hash = content_hash(&base).unwrap();
        assert_ne!(hash, content_hash(&edited).unwrap());
        assert_ne!(hash, content_hash(&extended).unwrap());
    }

    #[test]
    fn test_hash_ignores_system_metadata() {
        let mut entity = entity_with(&[("title", json!("foo"))]);
        let before = content_hash(&entity).unwrap();
        entity.db_row_id = Some(Uuid::new_v4());
        entity.updated_at = chrono::Utc::now();
        assert_eq!(before, content_hash(&entity).unwrap());
    }

    #[test]
    fn test_nested_objects_are_canonicalized() {
        let left = entity_with(&[("meta", json!({"x": 1, "y": [1, 2]}))]);
        let right = entity_with(&[("meta", json!({"y": [1, 2], "x": 1}))]);
        assert_eq!(content_hash(&left).unwrap(), content_hash(&right).unwrap());

        let reordered_array = entity_with(&[("meta", json!({"x": 1, "y": [2, 1]}))]);
        assert_ne!(
            content_hash(&left).unwrap(),
            content_hash(&reordered_array).unwrap()
        );
    }
}
