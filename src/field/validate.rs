//! Value validation. Validation never mutates the document and collects
//! every error instead of stopping at the first one.

use serde_json::Value;
use uuid::Uuid;

use super::convert::{parse_date, parse_datetime};
use super::{Column, DictFields, FieldKind};
use crate::error::FieldErrors;
use crate::filter::{values_equal, FilterOperand, FilterValue};
use crate::Document;

pub(crate) const MISSING_FIELD: &str = "Missing data for required field.";

/// Which operation the document is validated for. Queries never enforce
/// mandatory fields and only look at the entries actually provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WritePhase {
    Insert,
    Update,
    Query,
}

fn push(errors: &mut FieldErrors, key: &str, message: String) {
    errors.entry(key.to_string()).or_default().push(message);
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn number_to_string(number: &serde_json::Number) -> String {
    match number.as_i64() {
        Some(integer) => integer.to_string(),
        None => number.to_string(),
    }
}

fn render_choices(choices: &[Value]) -> String {
    Value::Array(choices.to_vec()).to_string()
}

impl Column {
    pub fn validate_insert(&self, document: &Document) -> FieldErrors {
        self.validate_write(document, WritePhase::Insert)
    }

    pub fn validate_update(&self, document: &Document) -> FieldErrors {
        self.validate_write(document, WritePhase::Update)
    }

    pub(crate) fn validate_write(&self, document: &Document, phase: WritePhase) -> FieldErrors {
        let mut errors = FieldErrors::new();
        match document.get(&self.name) {
            None | Some(Value::Null) => {
                let nullable = match phase {
                    WritePhase::Insert => self.nullable_on_insert,
                    WritePhase::Update => self.nullable_on_update,
                    WritePhase::Query => true,
                };
                if !nullable {
                    push(&mut errors, &self.name, MISSING_FIELD.to_string());
                }
            }
            Some(value) => self.validate_value(value, &self.name, document, phase, &mut errors),
        }
        errors
    }

    /// The message used when a value is not of the expected shape.
    pub(crate) fn type_error(&self) -> String {
        match &self.kind {
            FieldKind::FreeDict | FieldKind::Dict(_) => "Must be a dictionary.".to_string(),
            FieldKind::FreeList | FieldKind::List(_) => "Must be a list.".to_string(),
            kind => format!("Not a valid {}.", kind.type_name()),
        }
    }

    pub(crate) fn validate_value(
        &self,
        value: &Value,
        key: &str,
        document: &Document,
        phase: WritePhase,
        errors: &mut FieldErrors,
    ) {
        match &self.kind {
            FieldKind::Str => self.validate_str(value, key, errors),
            FieldKind::Int => self.validate_int(value, key, errors),
            FieldKind::Float => self.validate_float(value, key, errors),
            FieldKind::Bool => {
                if !value.is_boolean() {
                    push(errors, key, self.type_error());
                }
            }
            FieldKind::Date => {
                let valid = matches!(value, Value::String(text) if parse_date(text).is_some());
                if !valid {
                    push(errors, key, self.type_error());
                }
            }
            FieldKind::DateTime => {
                let valid = matches!(value, Value::String(text) if parse_datetime(text).is_some());
                if !valid {
                    push(errors, key, self.type_error());
                }
            }
            FieldKind::Enumeration(members) => match value {
                Value::String(name) => {
                    if !members.iter().any(|member| member.name == *name) {
                        let names: Vec<Value> = members
                            .iter()
                            .map(|member| Value::String(member.name.clone()))
                            .collect();
                        push(
                            errors,
                            key,
                            format!(
                                "Value \"{name}\" is not within {}.",
                                render_choices(&names)
                            ),
                        );
                    }
                }
                _ => push(errors, key, self.type_error()),
            },
            FieldKind::ObjectId => {
                let valid = matches!(value, Value::String(text) if Uuid::parse_str(text).is_ok());
                if !valid {
                    push(errors, key, self.type_error());
                }
            }
            FieldKind::FreeList => match value {
                Value::Array(items) => self.validate_length(value, items.len(), key, errors),
                _ => push(errors, key, self.type_error()),
            },
            FieldKind::FreeDict => match value {
                Value::Object(entries) => self.validate_length(value, entries.len(), key, errors),
                _ => push(errors, key, self.type_error()),
            },
            FieldKind::List(item) => match value {
                Value::Array(items) => {
                    self.validate_length(value, items.len(), key, errors);
                    for (index, element) in items.iter().enumerate() {
                        let mut with_item = document.clone();
                        with_item.insert(self.name.clone(), element.clone());
                        for (item_key, messages) in item.validate_write(&with_item, phase) {
                            let rebased = item_key.replacen(&self.name, key, 1);
                            for message in messages {
                                push(errors, &format!("{rebased}[{index}]"), message);
                            }
                        }
                    }
                }
                _ => push(errors, key, self.type_error()),
            },
            FieldKind::Dict(fields) => match value {
                Value::Object(inner) => {
                    self.validate_length(value, inner.len(), key, errors);
                    self.validate_dict_inner(fields, inner, key, document, phase, errors);
                }
                _ => push(errors, key, self.type_error()),
            },
        }
    }

    fn validate_dict_inner(
        &self,
        fields: &DictFields,
        inner: &Document,
        key: &str,
        document: &Document,
        phase: WritePhase,
        errors: &mut FieldErrors,
    ) {
        for inner_field in fields.resolve(document) {
            if phase == WritePhase::Query && !inner.contains_key(&inner_field.name) {
                continue;
            }
            for (inner_key, messages) in inner_field.validate_write(inner, phase) {
                for message in messages {
                    push(errors, &format!("{key}.{inner_key}"), message);
                }
            }
        }
    }

    fn validate_str(&self, value: &Value, key: &str, errors: &mut FieldErrors) {
        let text = match value {
            Value::String(text) => text.clone(),
            Value::Number(number) => number_to_string(number),
            _ => {
                push(errors, key, self.type_error());
                return;
            }
        };
        if let Some(choices) = self.choices.resolve() {
            let coerced = Value::String(text.clone());
            if !choices.iter().any(|choice| values_equal(choice, &coerced)) {
                push(
                    errors,
                    key,
                    format!("Value \"{text}\" is not within {}.", render_choices(&choices)),
                );
            }
        }
        self.validate_length(&Value::String(text.clone()), text.chars().count(), key, errors);
    }

    fn validate_int(&self, value: &Value, key: &str, errors: &mut FieldErrors) {
        let number = match value {
            Value::Number(number) => number.as_i64(),
            Value::String(text) => text.trim().parse::<i64>().ok(),
            _ => None,
        };
        match number {
            Some(number) => self.validate_number(Value::from(number), key, errors),
            None => push(errors, key, self.type_error()),
        }
    }

    fn validate_float(&self, value: &Value, key: &str, errors: &mut FieldErrors) {
        let number = match value {
            Value::Number(number) => number.as_f64(),
            Value::String(text) => text.trim().parse::<f64>().ok(),
            _ => None,
        };
        match number {
            Some(number) => self.validate_number(Value::from(number), key, errors),
            None => push(errors, key, self.type_error()),
        }
    }

    fn validate_number(&self, coerced: Value, key: &str, errors: &mut FieldErrors) {
        if let Some(choices) = self.choices.resolve() {
            if !choices.iter().any(|choice| values_equal(choice, &coerced)) {
                push(
                    errors,
                    key,
                    format!(
                        "Value \"{}\" is not within {}.",
                        plain(&coerced),
                        render_choices(&choices)
                    ),
                );
            }
        }
        let value = coerced.as_f64().unwrap_or_default();
        if let Some(min) = &self.min_value {
            if min.as_f64().map(|min| value < min).unwrap_or(false) {
                push(
                    errors,
                    key,
                    format!(
                        "Value \"{}\" is too small. Minimum value is {}.",
                        plain(&coerced),
                        plain(min)
                    ),
                );
            }
        }
        if let Some(max) = &self.max_value {
            if max.as_f64().map(|max| value > max).unwrap_or(false) {
                push(
                    errors,
                    key,
                    format!(
                        "Value \"{}\" is too big. Maximum value is {}.",
                        plain(&coerced),
                        plain(max)
                    ),
                );
            }
        }
    }

    fn validate_length(&self, value: &Value, length: usize, key: &str, errors: &mut FieldErrors) {
        if let Some(min) = self.min_length {
            if length < min {
                push(
                    errors,
                    key,
                    format!(
                        "Value \"{}\" is too small. Minimum length is {min}.",
                        plain(value)
                    ),
                );
            }
        }
        if let Some(max) = self.max_length {
            if length > max {
                push(
                    errors,
                    key,
                    format!(
                        "Value \"{}\" is too big. Maximum length is {max}.",
                        plain(value)
                    ),
                );
            }
        }
    }

    /// Validate one query filter entry. Explicit nulls are always accepted
    /// here; whether they become a clause is decided during coercion.
    pub(crate) fn validate_query_value(
        &self,
        value: &FilterValue,
        key: &str,
        context: &Document,
        errors: &mut FieldErrors,
    ) {
        match value {
            FilterValue::Single(operand) => {
                self.validate_query_operand(operand, key, context, errors)
            }
            FilterValue::Many(operands) => {
                if matches!(self.kind, FieldKind::FreeList | FieldKind::List(_)) {
                    // A list of plain values on a list field is the array
                    // value itself, not a list of candidates.
                    let mut items = Vec::with_capacity(operands.len());
                    for operand in operands {
                        match operand {
                            FilterOperand::Value(item) => items.push(item.clone()),
                            FilterOperand::Cmp(_, _) => {
                                push(errors, key, self.type_error());
                                return;
                            }
                        }
                    }
                    self.validate_value(
                        &Value::Array(items),
                        key,
                        context,
                        WritePhase::Query,
                        errors,
                    );
                } else {
                    for operand in operands {
                        self.validate_query_operand(operand, key, context, errors);
                    }
                }
            }
        }
    }

    fn validate_query_operand(
        &self,
        operand: &FilterOperand,
        key: &str,
        context: &Document,
        errors: &mut FieldErrors,
    ) {
        match operand {
            FilterOperand::Value(Value::Null) => {}
            FilterOperand::Value(value) => {
                self.validate_value(value, key, context, WritePhase::Query, errors)
            }
            FilterOperand::Cmp(_, value) => {
                if self.allow_comparison_signs {
                    self.validate_value(value, key, context, WritePhase::Query, errors);
                } else {
                    push(errors, key, self.type_error());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::CmpOp;
    use serde_json::json;

    fn bound(mut column: Column) -> Column {
        column.bind().unwrap();
        column
    }

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_missing_mandatory_field() {
        let column = bound(Column::string("key").primary_key());
        let errors = column.validate_insert(&Document::new());
        assert_eq!(errors["key"], vec!["Missing data for required field."]);
        let errors = column.validate_insert(&doc(json!({"key": null})));
        assert_eq!(errors["key"], vec!["Missing data for required field."]);
    }

    #[test]
    fn test_optional_field_accepts_absence() {
        let column = bound(Column::string("key"));
        assert!(column.validate_insert(&Document::new()).is_empty());
    }

    #[test]
    fn test_str_accepts_numbers() {
        let column = bound(Column::string("key"));
        assert!(column.validate_insert(&doc(json!({"key": 256}))).is_empty());
        assert!(column.validate_insert(&doc(json!({"key": 1.5}))).is_empty());
        let errors = column.validate_insert(&doc(json!({"key": true})));
        assert_eq!(errors["key"], vec!["Not a valid str."]);
    }

    #[test]
    fn test_str_length_bounds() {
        let column = bound(Column::string("key").min_length(3).max_length(4));
        let errors = column.validate_insert(&doc(json!({"key": "a"})));
        assert_eq!(
            errors["key"],
            vec!["Value \"a\" is too small. Minimum length is 3."]
        );
        let errors = column.validate_insert(&doc(json!({"key": "abcde"})));
        assert_eq!(
            errors["key"],
            vec!["Value \"abcde\" is too big. Maximum length is 4."]
        );
        assert!(column.validate_insert(&doc(json!({"key": "abc"}))).is_empty());
    }

    #[test]
    fn test_int_accepts_string_form() {
        let column = bound(Column::integer("key"));
        assert!(column.validate_insert(&doc(json!({"key": "3"}))).is_empty());
        let errors = column.validate_insert(&doc(json!({"key": "abc"})));
        assert_eq!(errors["key"], vec!["Not a valid int."]);
        let errors = column.validate_insert(&doc(json!({"key": 1.5})));
        assert_eq!(errors["key"], vec!["Not a valid int."]);
    }

    #[test]
    fn test_int_value_bounds_inclusive() {
        let column = bound(Column::integer("key").min_value(json!(2)).max_value(json!(10)));
        assert!(column.validate_insert(&doc(json!({"key": 2}))).is_empty());
        assert!(column.validate_insert(&doc(json!({"key": 10}))).is_empty());
        let errors = column.validate_insert(&doc(json!({"key": 1})));
        assert_eq!(
            errors["key"],
            vec!["Value \"1\" is too small. Minimum value is 2."]
        );
        let errors = column.validate_insert(&doc(json!({"key": 11})));
        assert_eq!(
            errors["key"],
            vec!["Value \"11\" is too big. Maximum value is 10."]
        );
    }

    #[test]
    fn test_float_accepts_int_and_string_form() {
        let column = bound(Column::float("key"));
        assert!(column.validate_insert(&doc(json!({"key": 3}))).is_empty());
        assert!(column.validate_insert(&doc(json!({"key": "1.5"}))).is_empty());
        let errors = column.validate_insert(&doc(json!({"key": "abc"})));
        assert_eq!(errors["key"], vec!["Not a valid float."]);
    }

    #[test]
    fn test_choices() {
        let column = bound(Column::string("key").choices(vec![json!("a"), json!("b")]));
        assert!(column.validate_insert(&doc(json!({"key": "a"}))).is_empty());
        let errors = column.validate_insert(&doc(json!({"key": "c"})));
        assert_eq!(errors["key"], vec!["Value \"c\" is not within [\"a\",\"b\"]."]);
    }

    #[test]
    fn test_date_and_datetime() {
        let date = bound(Column::date("d"));
        assert!(date.validate_insert(&doc(json!({"d": "2017-05-15"}))).is_empty());
        let errors = date.validate_insert(&doc(json!({"d": "not a date"})));
        assert_eq!(errors["d"], vec!["Not a valid date."]);

        let datetime = bound(Column::datetime("dt"));
        assert!(datetime
            .validate_insert(&doc(json!({"dt": "2016-09-23T23:59:59Z"})))
            .is_empty());
        let errors = datetime.validate_insert(&doc(json!({"dt": 5})));
        assert_eq!(errors["dt"], vec!["Not a valid datetime."]);
    }

    #[test]
    fn test_enumeration_accepts_member_names() {
        let column = bound(Column::enumeration("state", &[("Valid", 1), ("Invalid", 2)]));
        assert!(column.validate_insert(&doc(json!({"state": "Valid"}))).is_empty());
        let errors = column.validate_insert(&doc(json!({"state": "Unknown"})));
        assert_eq!(
            errors["state"],
            vec!["Value \"Unknown\" is not within [\"Valid\",\"Invalid\"]."]
        );
    }

    #[test]
    fn test_object_id() {
        let column = bound(Column::object_id("id"));
        assert!(column
            .validate_insert(&doc(json!({"id": "123e4567-e89b-12d3-a456-426614174000"})))
            .is_empty());
        let errors = column.validate_insert(&doc(json!({"id": "not an id"})));
        assert_eq!(errors["id"], vec!["Not a valid id."]);
    }

    #[test]
    fn test_list_items_validated_with_index_suffix() {
        let column = bound(Column::list(
            "values",
            Column::string("").choices(vec![json!("a"), json!("b")]),
        ));
        let errors = column.validate_insert(&doc(json!({"values": ["a", "c"]})));
        assert_eq!(
            errors["values[1]"],
            vec!["Value \"c\" is not within [\"a\",\"b\"]."]
        );
        let errors = column.validate_insert(&doc(json!({"values": "not a list"})));
        assert_eq!(errors["values"], vec!["Must be a list."]);
    }

    #[test]
    fn test_dict_inner_errors_are_prefixed() {
        let column = bound(Column::dict(
            "nested",
            vec![Column::string("inner").nullable(false)],
        ));
        let errors = column.validate_insert(&doc(json!({"nested": {}})));
        assert_eq!(
            errors["nested.inner"],
            vec!["Missing data for required field."]
        );
        let errors = column.validate_insert(&doc(json!({"nested": "not a dict"})));
        assert_eq!(errors["nested"], vec!["Must be a dictionary."]);
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let column = bound(
            Column::string("key")
                .choices(vec![json!("a")])
                .min_length(3),
        );
        let errors = column.validate_insert(&doc(json!({"key": "b"})));
        assert_eq!(errors["key"].len(), 2);
    }

    #[test]
    fn test_query_rejects_comparison_when_not_allowed() {
        let column = bound(Column::integer("key"));
        let mut errors = FieldErrors::new();
        column.validate_query_value(
            &FilterValue::from((CmpOp::Greater, json!(3))),
            "key",
            &Document::new(),
            &mut errors,
        );
        assert_eq!(errors["key"], vec!["Not a valid int."]);

        let column = bound(Column::integer("key").allow_comparison_signs());
        let mut errors = FieldErrors::new();
        column.validate_query_value(
            &FilterValue::from((CmpOp::Greater, json!(3))),
            "key",
            &Document::new(),
            &mut errors,
        );
        assert!(errors.is_empty());
    }

    #[test]
    fn test_query_candidates_each_validated() {
        let column = bound(Column::integer("key"));
        let mut errors = FieldErrors::new();
        column.validate_query_value(
            &FilterValue::from(vec![json!(1), json!("abc")]),
            "key",
            &Document::new(),
            &mut errors,
        );
        assert_eq!(errors["key"], vec!["Not a valid int."]);
    }
}
