use std::cmp::Ordering;

use serde_json::Value;

use crate::Document;

/// Comparison operators available for fields that opted into range queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Greater,
    GreaterOrEqual,
    Lower,
    LowerOrEqual,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Greater => ">",
            CmpOp::GreaterOrEqual => ">=",
            CmpOp::Lower => "<",
            CmpOp::LowerOrEqual => "<=",
        }
    }
}

/// One candidate inside a filter: either a plain value or a comparison pair.
#[derive(Debug, Clone)]
pub enum FilterOperand {
    Value(Value),
    Cmp(CmpOp, Value),
}

/// The value side of a filter entry: a single candidate, or a list of
/// candidates meaning "any of".
#[derive(Debug, Clone)]
pub enum FilterValue {
    Single(FilterOperand),
    Many(Vec<FilterOperand>),
}

impl From<Value> for FilterValue {
    fn from(value: Value) -> Self {
        FilterValue::Single(FilterOperand::Value(value))
    }
}

impl From<(CmpOp, Value)> for FilterValue {
    fn from((op, value): (CmpOp, Value)) -> Self {
        FilterValue::Single(FilterOperand::Cmp(op, value))
    }
}

impl From<Vec<Value>> for FilterValue {
    fn from(values: Vec<Value>) -> Self {
        FilterValue::Many(values.into_iter().map(FilterOperand::Value).collect())
    }
}

impl From<Vec<FilterOperand>> for FilterValue {
    fn from(operands: Vec<FilterOperand>) -> Self {
        FilterValue::Many(operands)
    }
}

impl FilterValue {
    /// Render back to a plain JSON value, used to echo received filters in
    /// validation errors. Comparison pairs render as `[">=", value]` arrays.
    pub fn to_value(&self) -> Value {
        fn operand(op: &FilterOperand) -> Value {
            match op {
                FilterOperand::Value(v) => v.clone(),
                FilterOperand::Cmp(sign, v) => {
                    Value::Array(vec![Value::String(sign.symbol().into()), v.clone()])
                }
            }
        }
        match self {
            FilterValue::Single(op) => operand(op),
            FilterValue::Many(ops) => Value::Array(ops.iter().map(operand).collect()),
        }
    }
}

/// A flat, ordered set of query filters plus the limit/offset pseudo filters.
/// Field names may use dot notation to address nested fields.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    fields: Vec<(String, FilterValue)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter entry. Replaces any previous entry for the same field.
    pub fn with(mut self, name: &str, value: impl Into<FilterValue>) -> Self {
        self.insert(name, value.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn insert(&mut self, name: &str, value: FilterValue) {
        if let Some(entry) = self.fields.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
        } else {
            self.fields.push((name.to_string(), value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&FilterValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn remove(&mut self, name: &str) -> Option<FilterValue> {
        let position = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(position).1)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FilterValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Echo the filters as a plain JSON object for error reporting.
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (name, value) in &self.fields {
            map.insert(name.clone(), value.to_value());
        }
        Value::Object(map)
    }
}

/// A backend-native condition on one (possibly dotted) field path.
/// This is what field coercion translates raw filter values into.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Stored value equals this value. Against a stored array, also matches
    /// when the array contains the value.
    Eq(Value),
    /// Stored value equals any of these values.
    In(Vec<Value>),
    /// Interval bounds, all of which must hold.
    Cmp(Vec<(CmpOp, Value)>),
    /// Stored value is null, or the key is absent.
    IsNull,
    /// The key is physically absent from the stored document.
    Missing,
    /// Any of the alternatives matches.
    AnyOf(Vec<Condition>),
}

/// A fully-coerced query clause: dotted field path plus condition. A query is
/// the conjunction of its clauses.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub path: String,
    pub condition: Condition,
}

impl Clause {
    pub fn new(path: impl Into<String>, condition: Condition) -> Self {
        Clause {
            path: path.into(),
            condition,
        }
    }

    pub fn matches(&self, document: &Document) -> bool {
        self.condition.matches(document, &self.path)
    }
}

impl Condition {
    pub fn matches(&self, document: &Document, path: &str) -> bool {
        let stored = lookup(document, path);
        match self {
            Condition::Eq(expected) => match stored {
                Some(value) => value_matches(value, expected),
                None => false,
            },
            Condition::In(candidates) => match stored {
                Some(value) => candidates.iter().any(|c| value_matches(value, c)),
                None => false,
            },
            Condition::Cmp(bounds) => match stored {
                Some(value) => bounds.iter().all(|(op, bound)| {
                    match compare_values(value, bound) {
                        Some(ordering) => match op {
                            CmpOp::Greater => ordering == Ordering::Greater,
                            CmpOp::GreaterOrEqual => ordering != Ordering::Less,
                            CmpOp::Lower => ordering == Ordering::Less,
                            CmpOp::LowerOrEqual => ordering != Ordering::Greater,
                        },
                        None => false,
                    }
                }),
                None => false,
            },
            Condition::IsNull => matches!(stored, None | Some(Value::Null)),
            Condition::Missing => stored.is_none(),
            Condition::AnyOf(alternatives) => {
                alternatives.iter().any(|c| c.matches(document, path))
            }
        }
    }
}

/// Resolve a dotted path against a document, descending into nested objects.
pub fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = document.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Equality with numeric tolerance (integer 1 equals float 1.0) and
/// element-containment semantics against stored arrays.
fn value_matches(stored: &Value, expected: &Value) -> bool {
    if values_equal(stored, expected) {
        return true;
    }
    match (stored, expected) {
        (Value::Array(items), e) if !e.is_array() => items.iter().any(|i| values_equal(i, e)),
        _ => false,
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(xf), Some(yf)) => xf == yf,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Ordering across values of the same family: numbers compare numerically,
/// strings lexicographically (canonical ISO-8601 strings are chronological).
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_eq_matches_numeric_families() {
        let d = doc(json!({"count": 3}));
        assert!(Condition::Eq(json!(3.0)).matches(&d, "count"));
        assert!(!Condition::Eq(json!(4)).matches(&d, "count"));
    }

    #[test]
    fn test_eq_against_stored_array_uses_containment() {
        let d = doc(json!({"tags": ["a", "b"]}));
        assert!(Condition::Eq(json!("a")).matches(&d, "tags"));
        assert!(Condition::Eq(json!(["a", "b"])).matches(&d, "tags"));
        assert!(!Condition::Eq(json!("c")).matches(&d, "tags"));
    }

    #[test]
    fn test_in_condition() {
        let d = doc(json!({"status": "open"}));
        assert!(Condition::In(vec![json!("open"), json!("closed")]).matches(&d, "status"));
        assert!(!Condition::In(vec![json!("closed")]).matches(&d, "status"));
    }

    #[test]
    fn test_cmp_interval() {
        let d = doc(json!({"value": 5}));
        let between = Condition::Cmp(vec![
            (CmpOp::GreaterOrEqual, json!(5)),
            (CmpOp::Lower, json!(10)),
        ]);
        assert!(between.matches(&d, "value"));
        let above = Condition::Cmp(vec![(CmpOp::Greater, json!(5))]);
        assert!(!above.matches(&d, "value"));
    }

    #[test]
    fn test_cmp_on_iso_strings_is_chronological() {
        let d = doc(json!({"at": "2017-05-15T00:00:00Z"}));
        let after = Condition::Cmp(vec![(CmpOp::Greater, json!("2017-05-14T00:00:00Z"))]);
        assert!(after.matches(&d, "at"));
    }

    #[test]
    fn test_is_null_matches_absent_and_null() {
        let d = doc(json!({"present": null}));
        assert!(Condition::IsNull.matches(&d, "present"));
        assert!(Condition::IsNull.matches(&d, "absent"));
        assert!(Condition::Missing.matches(&d, "absent"));
        assert!(!Condition::Missing.matches(&d, "present"));
    }

    #[test]
    fn test_any_of_absent_or_equal() {
        let condition = Condition::AnyOf(vec![Condition::Missing, Condition::Eq(json!("dft"))]);
        assert!(condition.matches(&doc(json!({})), "field"));
        assert!(condition.matches(&doc(json!({"field": "dft"})), "field"));
        assert!(!condition.matches(&doc(json!({"field": "other"})), "field"));
    }

    #[test]
    fn test_dotted_path_lookup() {
        let d = doc(json!({"outer": {"inner": "v"}}));
        assert!(Condition::Eq(json!("v")).matches(&d, "outer.inner"));
        assert!(!Condition::Eq(json!("v")).matches(&d, "outer.other"));
    }

    #[test]
    fn test_filters_replace_and_echo() {
        let filters = Filters::new()
            .with("a", json!(1))
            .with("b", (CmpOp::GreaterOrEqual, json!(2)))
            .with("a", json!(3));
        assert_eq!(filters.to_value(), json!({"a": 3, "b": [">=", 2]}));
    }
}
