//! Coercion to the stored canonical form, serialization back to the
//! exchange form, and translation of query filters into backend conditions.
//!
//! Coercion assumes validation already passed: values it cannot interpret
//! are passed through unchanged.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{Column, FieldKind};
use crate::filter::{
    compare_values, values_equal, Clause, CmpOp, Condition, FilterOperand, FilterValue,
};
use crate::Document;

/// Parse an ISO-8601 datetime, a naive datetime (assumed UTC) or a plain
/// date (midnight UTC).
pub(crate) fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

pub(crate) fn parse_date(text: &str) -> Option<NaiveDate> {
    parse_datetime(text).map(|datetime| datetime.date_naive())
}

pub(crate) fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// The current UTC time in the stored canonical form.
pub(crate) fn now_utc() -> String {
    format_datetime(Utc::now())
}

fn number_to_string(number: &serde_json::Number) -> String {
    match number.as_i64() {
        Some(integer) => integer.to_string(),
        None => number.to_string(),
    }
}

fn json_ordering(a: &Value, b: &Value) -> Ordering {
    compare_values(a, b).unwrap_or(Ordering::Equal)
}

impl Column {
    pub fn coerce_insert(&self, document: &mut Document) {
        self.coerce_write(document);
    }

    pub fn coerce_update(&self, document: &mut Document) {
        self.coerce_write(document);
    }

    fn coerce_write(&self, document: &mut Document) {
        match document.get(&self.name) {
            None => {}
            Some(Value::Null) => {
                let keep_null = self.store_none
                    && !matches!(
                        self.kind,
                        FieldKind::FreeList
                            | FieldKind::List(_)
                            | FieldKind::FreeDict
                            | FieldKind::Dict(_)
                    );
                if !keep_null {
                    document.remove(&self.name);
                }
            }
            Some(value) => {
                let value = value.clone();
                let context = document.clone();
                let coerced = self.coerce_value(value, &context);
                document.insert(self.name.clone(), coerced);
            }
        }
    }

    /// Canonical stored form of a validated value.
    pub(crate) fn coerce_value(&self, value: Value, context: &Document) -> Value {
        match &self.kind {
            FieldKind::Str => match value {
                Value::Number(number) => Value::String(number_to_string(&number)),
                other => other,
            },
            FieldKind::Int => match value {
                Value::String(text) => text
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .unwrap_or(Value::String(text)),
                other => other,
            },
            FieldKind::Float => match value {
                Value::String(text) => text
                    .trim()
                    .parse::<f64>()
                    .map(Value::from)
                    .unwrap_or(Value::String(text)),
                other => other,
            },
            FieldKind::Bool | FieldKind::FreeList | FieldKind::FreeDict => value,
            FieldKind::DateTime => match &value {
                Value::String(text) => parse_datetime(text)
                    .map(|datetime| Value::String(format_datetime(datetime)))
                    .unwrap_or(value),
                _ => value,
            },
            FieldKind::Date => match &value {
                Value::String(text) => parse_date(text)
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
                    .map(|midnight| {
                        Value::String(format_datetime(Utc.from_utc_datetime(&midnight)))
                    })
                    .unwrap_or(value),
                _ => value,
            },
            FieldKind::Enumeration(members) => match &value {
                Value::String(name) => members
                    .iter()
                    .find(|member| member.name == *name)
                    .map(|member| Value::from(member.value))
                    .unwrap_or(value),
                _ => value,
            },
            FieldKind::ObjectId => match &value {
                Value::String(text) => Uuid::parse_str(text)
                    .map(|id| Value::String(id.hyphenated().to_string()))
                    .unwrap_or(value),
                _ => value,
            },
            FieldKind::List(item) => match value {
                Value::Array(items) => {
                    let mut coerced: Vec<Value> = items
                        .into_iter()
                        .map(|element| item.coerce_value(element, context))
                        .collect();
                    if self.sorted {
                        coerced.sort_by(json_ordering);
                    }
                    Value::Array(coerced)
                }
                other => other,
            },
            FieldKind::Dict(fields) => match value {
                Value::Object(mut inner) => {
                    let resolved = fields.resolve(context);
                    inner.retain(|entry, _| {
                        let known = resolved.iter().any(|field| field.name == *entry);
                        if !known {
                            log::debug!("Removing unknown entry '{}.{entry}'.", self.name);
                        }
                        known
                    });
                    for field in &resolved {
                        field.coerce_write(&mut inner);
                    }
                    Value::Object(inner)
                }
                other => other,
            },
        }
    }

    /// Fill the field in a stored document with its exchange form, using the
    /// default value when the field is null or absent.
    pub fn serialize(&self, document: &mut Document) {
        match document.get(&self.name).cloned() {
            None | Some(Value::Null) => {
                let default = self.default_value.resolve(document).unwrap_or(Value::Null);
                document.insert(self.name.clone(), default);
            }
            Some(value) => {
                let context = document.clone();
                document.insert(self.name.clone(), self.serialize_value(value, &context));
            }
        }
    }

    pub(crate) fn serialize_value(&self, value: Value, context: &Document) -> Value {
        match &self.kind {
            FieldKind::DateTime => match &value {
                Value::String(text) => parse_datetime(text)
                    .map(|datetime| Value::String(format_datetime(datetime)))
                    .unwrap_or(value),
                _ => value,
            },
            FieldKind::Date => match &value {
                Value::String(text) => parse_datetime(text)
                    .map(|datetime| Value::String(datetime.date_naive().to_string()))
                    .unwrap_or(value),
                _ => value,
            },
            FieldKind::Enumeration(members) => match value.as_i64() {
                Some(stored) => members
                    .iter()
                    .find(|member| member.value == stored)
                    .map(|member| Value::String(member.name.clone()))
                    .unwrap_or(value),
                None => value,
            },
            FieldKind::List(item) => match value {
                Value::Array(items) => Value::Array(
                    items
                        .into_iter()
                        .map(|element| item.serialize_value(element, context))
                        .collect(),
                ),
                other => other,
            },
            FieldKind::Dict(fields) => match value {
                Value::Object(mut inner) => {
                    let resolved = fields.resolve(context);
                    inner.retain(|entry, _| {
                        let known = resolved.iter().any(|field| field.name == *entry);
                        if !known {
                            log::debug!("Removing legacy entry '{}.{entry}'.", self.name);
                        }
                        known
                    });
                    for field in &resolved {
                        field.serialize(&mut inner);
                    }
                    Value::Object(inner)
                }
                other => other,
            },
            _ => value,
        }
    }

    /// Translate one validated query filter entry into backend clauses.
    /// `prefix` is the dotted path of the enclosing dict fields, empty at
    /// top level.
    pub(crate) fn coerce_query_value(
        &self,
        value: FilterValue,
        prefix: &str,
        context: &Document,
        clauses: &mut Vec<Clause>,
    ) {
        let path = format!("{prefix}{}", self.name);
        match value {
            FilterValue::Single(FilterOperand::Value(Value::Null)) => {
                if self.allow_none_as_filter {
                    clauses.push(Clause::new(path, Condition::IsNull));
                } else {
                    log::debug!("Ignoring null filter on '{path}'.");
                }
            }
            FilterValue::Single(FilterOperand::Value(Value::Object(inner))) => {
                if let FieldKind::Dict(fields) = &self.kind {
                    let child_prefix = format!("{path}.");
                    for field in fields.resolve(context) {
                        if let Some(inner_value) = inner.get(&field.name) {
                            field.coerce_query_value(
                                FilterValue::from(inner_value.clone()),
                                &child_prefix,
                                context,
                                clauses,
                            );
                        }
                    }
                } else {
                    clauses.push(Clause::new(path, Condition::Eq(Value::Object(inner))));
                }
            }
            FilterValue::Single(FilterOperand::Value(Value::Array(items))) => {
                let items = match &self.kind {
                    FieldKind::List(item) => items
                        .into_iter()
                        .map(|element| item.coerce_value(element, context))
                        .collect(),
                    _ => items,
                };
                clauses.push(Clause::new(path, Condition::Eq(Value::Array(items))));
            }
            FilterValue::Single(FilterOperand::Value(value)) => {
                let coerced = self.coerce_value(value, context);
                clauses.push(Clause::new(path, self.equality_condition(coerced, context)));
            }
            FilterValue::Single(FilterOperand::Cmp(op, value)) => {
                let coerced = self.coerce_value(value, context);
                clauses.push(Clause::new(path, Condition::Cmp(vec![(op, coerced)])));
            }
            FilterValue::Many(operands) => {
                self.coerce_query_candidates(operands, path, context, clauses)
            }
        }
    }

    fn coerce_query_candidates(
        &self,
        operands: Vec<FilterOperand>,
        path: String,
        context: &Document,
        clauses: &mut Vec<Clause>,
    ) {
        if operands.is_empty() {
            log::debug!("Ignoring empty candidate list on '{path}'.");
            return;
        }
        if matches!(self.kind, FieldKind::FreeList | FieldKind::List(_)) {
            let mut items: Vec<Value> = operands
                .into_iter()
                .filter_map(|operand| match operand {
                    FilterOperand::Value(item) => Some(item),
                    FilterOperand::Cmp(_, _) => None,
                })
                .collect();
            if let FieldKind::List(item) = &self.kind {
                items = items
                    .into_iter()
                    .map(|element| item.coerce_value(element, context))
                    .collect();
            }
            clauses.push(Clause::new(path, Condition::Eq(Value::Array(items))));
            return;
        }

        let mut values: Vec<Value> = Vec::new();
        let mut bounds: Vec<(CmpOp, Value)> = Vec::new();
        for operand in operands {
            match operand {
                FilterOperand::Value(Value::Null) => {}
                FilterOperand::Value(value) => values.push(self.coerce_value(value, context)),
                FilterOperand::Cmp(op, value) => {
                    bounds.push((op, self.coerce_value(value, context)))
                }
            }
        }

        let condition = match (values.is_empty(), bounds.is_empty()) {
            (true, true) => return,
            (false, true) => {
                let default = self.coerced_default(context);
                let matches_default = default
                    .map(|default| values.iter().any(|value| values_equal(value, &default)))
                    .unwrap_or(false);
                if matches_default {
                    Condition::AnyOf(vec![Condition::Missing, Condition::In(values)])
                } else {
                    Condition::In(values)
                }
            }
            (true, false) => Condition::Cmp(bounds),
            (false, false) => {
                Condition::AnyOf(vec![Condition::Cmp(bounds), Condition::In(values)])
            }
        };
        clauses.push(Clause::new(path, condition));
    }

    /// Equality that also matches documents persisted before the field
    /// existed, when filtering on the field's own default value.
    fn equality_condition(&self, coerced: Value, context: &Document) -> Condition {
        let matches_default = self
            .coerced_default(context)
            .map(|default| values_equal(&coerced, &default))
            .unwrap_or(false);
        if matches_default {
            Condition::AnyOf(vec![Condition::Missing, Condition::Eq(coerced)])
        } else {
            Condition::Eq(coerced)
        }
    }

    fn coerced_default(&self, context: &Document) -> Option<Value> {
        self.default_value
            .resolve(context)
            .map(|default| self.coerce_value(default, context))
    }
}
