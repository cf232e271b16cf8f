//! Regrouping of flat dot-notation keys into nested mappings.
//!
//! Callers may address nested fields with flat keys such as
//! `"outer.inner": value`. Before validation and coercion, such keys are
//! regrouped under the dict field named by their first path segment,
//! recursively. Dotted keys that match no dict field are left in place and
//! reported to the caller, which decides whether to drop or reject them.

use serde_json::Value;

use crate::field::{Column, FieldKind};
use crate::Document;

/// Regroup every dotted key of `document` under its matching dict field.
/// Returns the dotted keys (full paths) that matched no dict field.
pub fn regroup_dotted_keys(document: &mut Document, fields: &[Column]) -> Vec<String> {
    let mut unmatched = Vec::new();

    let dotted: Vec<String> = document
        .keys()
        .filter(|key| key.contains('.'))
        .cloned()
        .collect();
    for key in dotted {
        let (outer, rest) = match key.split_once('.') {
            Some(parts) => parts,
            None => continue,
        };
        let is_dict_field = fields
            .iter()
            .any(|field| field.name() == outer && field.kind().is_dict_kind());
        if !is_dict_field {
            unmatched.push(key);
            continue;
        }
        let value = match document.remove(&key) {
            Some(value) => value,
            None => continue,
        };
        match document.get_mut(outer) {
            Some(Value::Object(inner)) => {
                inner.insert(rest.to_string(), value);
            }
            _ => {
                let mut inner = Document::new();
                inner.insert(rest.to_string(), value);
                document.insert(outer.to_string(), Value::Object(inner));
            }
        }
    }

    // Regrouped entries may themselves be dotted relative to the inner
    // field set.
    for field in fields {
        let inner_fields = match field.kind() {
            FieldKind::Dict(dict_fields) => dict_fields.resolve(document),
            _ => continue,
        };
        if let Some(Value::Object(inner)) = document.get_mut(field.name()) {
            for inner_key in regroup_dotted_keys(inner, &inner_fields) {
                unmatched.push(format!("{}.{inner_key}", field.name()));
            }
        }
    }

    unmatched
}
