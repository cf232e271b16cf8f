//! Field descriptors: the closed set of field kinds a model can declare, the
//! per-field configuration, and the definition-time checks applied when a
//! model binds its fields.
//!
//! A [`Column`] owns everything the model needs to validate, coerce and
//! serialize one field. Validation and conversion live in the `validate` and
//! `convert` submodules.

pub(crate) mod convert;
mod validate;

use std::sync::Arc;

use serde_json::Value;

use crate::Document;

pub(crate) use validate::MISSING_FIELD;

/// Computes the inner field set of a dynamic dict field from the document
/// being processed.
pub type GetFields = Arc<dyn Fn(&Document) -> Vec<Column> + Send + Sync>;

/// Computes a default value from the document being processed.
pub type GetValue = Arc<dyn Fn(&Document) -> Value + Send + Sync>;

/// Computes the authorized choices at validation time.
pub type GetChoices = Arc<dyn Fn() -> Vec<Value> + Send + Sync>;

/// One member of an enumeration field: the name callers exchange and the
/// value actually stored.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumMember {
    pub name: String,
    pub value: i64,
}

/// Inner field set of a dict field: fixed at definition time, or computed
/// from the document (with a fallback set used for documentation).
#[derive(Clone)]
pub enum DictFields {
    Static(Vec<Column>),
    Computed {
        default: Vec<Column>,
        get: GetFields,
    },
}

impl DictFields {
    /// The inner fields applicable to the given document.
    pub fn resolve(&self, document: &Document) -> Vec<Column> {
        match self {
            DictFields::Static(fields) => fields.clone(),
            DictFields::Computed { get, .. } => {
                let mut fields = (get)(document);
                for field in &mut fields {
                    if let Err(error) = field.bind() {
                        log::warn!("Skipping invalid computed field definition: {error}");
                    }
                }
                fields
            }
        }
    }

    /// The inner fields used for documentation and examples.
    pub fn default_fields(&self) -> &[Column] {
        match self {
            DictFields::Static(fields) => fields,
            DictFields::Computed { default, .. } => default,
        }
    }
}

/// The closed set of field kinds.
#[derive(Clone)]
pub enum FieldKind {
    Str,
    Int,
    Float,
    Bool,
    /// Stored as a midnight UTC datetime string, exchanged as `YYYY-MM-DD`.
    Date,
    /// Stored and exchanged as an ISO-8601 UTC string.
    DateTime,
    /// Exchanged as member names, stored as member values.
    Enumeration(Vec<EnumMember>),
    /// Opaque identifier, canonicalized to hyphenated lowercase UUID form.
    ObjectId,
    /// A list with unconstrained items.
    FreeList,
    /// A mapping with unconstrained entries.
    FreeDict,
    /// A list whose items all follow one descriptor.
    List(Box<Column>),
    /// A nested mapping with its own field set.
    Dict(DictFields),
}

impl FieldKind {
    /// The name used in "Not a valid ..." messages and descriptions.
    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            FieldKind::Str => "str",
            FieldKind::Int => "int",
            FieldKind::Float => "float",
            FieldKind::Bool => "bool",
            FieldKind::Date => "date",
            FieldKind::DateTime => "datetime",
            FieldKind::Enumeration(_) => "enum value",
            FieldKind::ObjectId => "id",
            FieldKind::FreeList | FieldKind::List(_) => "list",
            FieldKind::FreeDict | FieldKind::Dict(_) => "dict",
        }
    }

    pub(crate) fn is_dict_kind(&self) -> bool {
        matches!(self, FieldKind::FreeDict | FieldKind::Dict(_))
    }
}

/// How a field is indexed in the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Two documents cannot share the same set of unique-indexed values.
    Unique,
    /// Indexed for lookup only.
    Other,
}

/// Default value of a field: absent, a literal, or computed per document.
#[derive(Clone)]
pub enum DefaultValue {
    None,
    Fixed(Value),
    Computed(GetValue),
}

impl DefaultValue {
    pub fn is_some(&self) -> bool {
        !matches!(self, DefaultValue::None)
    }

    /// Resolve against the given document. `None` when no default exists or
    /// the computed default yields null.
    pub fn resolve(&self, document: &Document) -> Option<Value> {
        let value = match self {
            DefaultValue::None => return None,
            DefaultValue::Fixed(value) => value.clone(),
            DefaultValue::Computed(get) => (get)(document),
        };
        if value.is_null() {
            None
        } else {
            Some(value)
        }
    }
}

/// Authorized values of a field.
#[derive(Clone)]
pub enum Choices {
    None,
    Fixed(Vec<Value>),
    Computed(GetChoices),
}

impl Choices {
    pub(crate) fn resolve(&self) -> Option<Vec<Value>> {
        match self {
            Choices::None => None,
            Choices::Fixed(values) => Some(values.clone()),
            Choices::Computed(get) => Some((get)()),
        }
    }
}

/// A single field descriptor. Built with the constructor for its kind, then
/// configured builder-style; the model builder calls [`Column::bind`] once to
/// enforce definition-time invariants and derive nullability.
#[derive(Clone)]
pub struct Column {
    pub(crate) name: String,
    pub(crate) kind: FieldKind,
    pub(crate) is_primary_key: bool,
    pub(crate) should_auto_increment: bool,
    pub(crate) index_kind: Option<IndexKind>,
    pub(crate) is_required: bool,
    pub(crate) allow_none_as_filter: bool,
    pub(crate) allow_comparison_signs: bool,
    pub(crate) store_none: bool,
    pub(crate) sorted: bool,
    pub(crate) default_value: DefaultValue,
    pub(crate) choices: Choices,
    pub(crate) min_value: Option<Value>,
    pub(crate) max_value: Option<Value>,
    pub(crate) min_length: Option<usize>,
    pub(crate) max_length: Option<usize>,
    pub(crate) description: Option<String>,
    pub(crate) example: Option<Value>,
    pub(crate) counter_name: Option<String>,
    pub(crate) explicit_nullable: Option<bool>,
    pub(crate) nullable_on_insert: bool,
    pub(crate) nullable_on_update: bool,
    bound: bool,
}

impl Column {
    fn new(name: &str, kind: FieldKind) -> Self {
        Column {
            name: name.to_string(),
            kind,
            is_primary_key: false,
            should_auto_increment: false,
            index_kind: None,
            is_required: false,
            allow_none_as_filter: false,
            allow_comparison_signs: false,
            store_none: false,
            sorted: false,
            default_value: DefaultValue::None,
            choices: Choices::None,
            min_value: None,
            max_value: None,
            min_length: None,
            max_length: None,
            description: None,
            example: None,
            counter_name: None,
            explicit_nullable: None,
            nullable_on_insert: true,
            nullable_on_update: true,
            bound: false,
        }
    }

    pub fn string(name: &str) -> Self {
        Column::new(name, FieldKind::Str)
    }

    pub fn integer(name: &str) -> Self {
        Column::new(name, FieldKind::Int)
    }

    pub fn float(name: &str) -> Self {
        Column::new(name, FieldKind::Float)
    }

    pub fn boolean(name: &str) -> Self {
        Column::new(name, FieldKind::Bool)
    }

    pub fn date(name: &str) -> Self {
        Column::new(name, FieldKind::Date)
    }

    pub fn datetime(name: &str) -> Self {
        Column::new(name, FieldKind::DateTime)
    }

    pub fn enumeration(name: &str, members: &[(&str, i64)]) -> Self {
        let members = members
            .iter()
            .map(|(member_name, value)| EnumMember {
                name: member_name.to_string(),
                value: *value,
            })
            .collect();
        Column::new(name, FieldKind::Enumeration(members))
    }

    pub fn object_id(name: &str) -> Self {
        Column::new(name, FieldKind::ObjectId)
    }

    pub fn free_list(name: &str) -> Self {
        Column::new(name, FieldKind::FreeList)
    }

    pub fn free_dict(name: &str) -> Self {
        Column::new(name, FieldKind::FreeDict)
    }

    /// A list whose items all follow `item`. The item descriptor's name is
    /// replaced by the list's name when the field is bound.
    pub fn list(name: &str, item: Column) -> Self {
        Column::new(name, FieldKind::List(Box::new(item)))
    }

    pub fn dict(name: &str, fields: Vec<Column>) -> Self {
        Column::new(name, FieldKind::Dict(DictFields::Static(fields)))
    }

    /// A dict whose inner fields depend on the document being processed.
    /// `default` is the field set used for documentation and examples.
    pub fn dict_computed(
        name: &str,
        default: Vec<Column>,
        get: impl Fn(&Document) -> Vec<Column> + Send + Sync + 'static,
    ) -> Self {
        Column::new(
            name,
            FieldKind::Dict(DictFields::Computed {
                default,
                get: Arc::new(get),
            }),
        )
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.should_auto_increment = true;
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.explicit_nullable = Some(nullable);
        self
    }

    /// Make the field mandatory in queries.
    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default_value = DefaultValue::Fixed(value);
        self
    }

    pub fn computed_default(
        mut self,
        get: impl Fn(&Document) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.default_value = DefaultValue::Computed(Arc::new(get));
        self
    }

    pub fn choices(mut self, values: Vec<Value>) -> Self {
        self.choices = Choices::Fixed(values);
        self
    }

    pub fn computed_choices(mut self, get: impl Fn() -> Vec<Value> + Send + Sync + 'static) -> Self {
        self.choices = Choices::Computed(Arc::new(get));
        self
    }

    pub fn min_value(mut self, value: Value) -> Self {
        self.min_value = Some(value);
        self
    }

    pub fn max_value(mut self, value: Value) -> Self {
        self.max_value = Some(value);
        self
    }

    pub fn min_length(mut self, length: usize) -> Self {
        self.min_length = Some(length);
        self
    }

    pub fn max_length(mut self, length: usize) -> Self {
        self.max_length = Some(length);
        self
    }

    pub fn indexed(mut self, kind: IndexKind) -> Self {
        self.index_kind = Some(kind);
        self
    }

    /// Let an explicit null filter match documents where the field is null
    /// or absent, instead of being discarded.
    pub fn allow_none_as_filter(mut self) -> Self {
        self.allow_none_as_filter = true;
        self
    }

    /// Accept `>`, `>=`, `<`, `<=` comparison pairs in query filters.
    pub fn allow_comparison_signs(mut self) -> Self {
        self.allow_comparison_signs = true;
        self
    }

    /// Persist explicit nulls instead of removing the key.
    pub fn store_none(mut self) -> Self {
        self.store_none = true;
        self
    }

    /// Sort list items before persisting.
    pub fn sorted(mut self) -> Self {
        self.sorted = true;
        self
    }

    pub fn description(mut self, text: &str) -> Self {
        self.description = Some(text.to_string());
        self
    }

    pub fn example(mut self, value: Value) -> Self {
        self.example = Some(value);
        self
    }

    /// Use a custom counter name instead of the field name for
    /// auto-increment.
    pub fn counter_name(mut self, name: &str) -> Self {
        self.counter_name = Some(name.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_primary_key(&self) -> bool {
        self.is_primary_key
    }

    pub fn should_auto_increment(&self) -> bool {
        self.should_auto_increment
    }

    pub fn index_kind(&self) -> Option<IndexKind> {
        self.index_kind
    }

    /// Enforce definition-time invariants and derive per-phase nullability.
    /// Called once by the model builder; defects in the declaration are
    /// fatal.
    pub(crate) fn bind(&mut self) -> Result<(), String> {
        if self.bound {
            return Ok(());
        }

        if self.name.is_empty() {
            return Err("A field name is mandatory.".to_string());
        }
        if self.name.contains('.') {
            return Err(format!("{} is not a valid field name: dots are not allowed.", self.name));
        }
        if self.name != self.name.trim() {
            return Err(format!(
                "{:?} is not a valid field name: leading or trailing spaces are not allowed.",
                self.name
            ));
        }

        if self.is_primary_key {
            if self.index_kind.is_some() {
                return Err(format!(
                    "Primary key fields are supposed to be indexed as unique ({}).",
                    self.name
                ));
            }
            self.index_kind = Some(IndexKind::Unique);
        }

        if self.should_auto_increment && !matches!(self.kind, FieldKind::Int) {
            return Err("Only int fields can be auto incremented.".to_string());
        }

        match self.explicit_nullable {
            Some(false) => {
                if self.should_auto_increment {
                    return Err(
                        "A field cannot be mandatory and auto incremented at the same time."
                            .to_string(),
                    );
                }
                if self.default_value.is_some() {
                    return Err(
                        "A field cannot be mandatory and having a default value at the same time."
                            .to_string(),
                    );
                }
                self.nullable_on_insert = false;
                self.nullable_on_update = false;
            }
            _ => {
                let has_default = self.default_value.is_some();
                self.nullable_on_insert =
                    !self.is_primary_key || has_default || self.should_auto_increment;
                self.nullable_on_update = !self.is_primary_key || has_default;
            }
        }

        self.check_bounds()?;

        match &mut self.kind {
            FieldKind::List(item) => {
                item.name = self.name.clone();
                item.bind()?;
            }
            FieldKind::Dict(DictFields::Static(fields)) => {
                for field in fields {
                    field.bind()?;
                }
            }
            FieldKind::Dict(DictFields::Computed { default, .. }) => {
                for field in default {
                    field.bind()?;
                }
            }
            _ => {}
        }

        // A nullable dict without an explicit default still serializes as a
        // mapping of its inner defaults.
        if let FieldKind::Dict(fields) = &self.kind {
            if self.nullable_on_insert && !self.default_value.is_some() {
                let fields = fields.clone();
                self.default_value = DefaultValue::Computed(Arc::new(move |document| {
                    let mut inner = Document::new();
                    for field in fields.resolve(document) {
                        inner.insert(
                            field.name.clone(),
                            field.default_value.resolve(document).unwrap_or(Value::Null),
                        );
                    }
                    Value::Object(inner)
                }));
            }
        }

        if let Some(example) = self.example.clone() {
            let mut document = Document::new();
            document.insert(self.name.clone(), example);
            let errors = self.validate_insert(&document);
            if !errors.is_empty() {
                return Err(format!(
                    "{} is not a valid example for field {}.",
                    document[&self.name], self.name
                ));
            }
        }

        self.bound = true;
        Ok(())
    }

    fn check_bounds(&self) -> Result<(), String> {
        if let (Some(min), Some(max)) = (&self.min_value, &self.max_value) {
            let ordered = match (min.as_f64(), max.as_f64()) {
                (Some(min), Some(max)) => min <= max,
                _ => true,
            };
            if !ordered {
                return Err(format!(
                    "Maximum value of {} must be greater or equal to its minimum value.",
                    self.name
                ));
            }
        }
        for bound in [&self.min_value, &self.max_value].into_iter().flatten() {
            let valid = match self.kind {
                FieldKind::Int => bound.as_i64().is_some(),
                FieldKind::Float => bound.is_number(),
                _ => false,
            };
            if !valid {
                return Err(format!(
                    "Minimum and maximum values are only supported on int and float fields ({}).",
                    self.name
                ));
            }
        }
        if let (Some(min), Some(max)) = (self.min_length, self.max_length) {
            if min > max {
                return Err(format!(
                    "Maximum length of {} must be greater or equal to its minimum length.",
                    self.name
                ));
            }
        }
        Ok(())
    }

    /// The counter identity used for auto-increment: (category, name).
    pub(crate) fn counter_ids(&self, collection: &str) -> (String, String) {
        (
            collection.to_string(),
            self.counter_name.clone().unwrap_or_else(|| self.name.clone()),
        )
    }

    /// A sample value for documentation: the declared example, the default
    /// value, or a canned sample for the kind.
    pub fn example_value(&self) -> Value {
        if let Some(example) = &self.example {
            return example.clone();
        }
        if let Some(default) = self.default_value.resolve(&Document::new()) {
            return default;
        }
        match &self.kind {
            FieldKind::Str => Value::String("sample_value".to_string()),
            FieldKind::Int => Value::from(1),
            FieldKind::Float => Value::from(1.4),
            FieldKind::Bool => Value::Bool(true),
            FieldKind::Date => Value::String("2017-09-24".to_string()),
            FieldKind::DateTime => Value::String("2017-09-24T15:36:09Z".to_string()),
            FieldKind::Enumeration(members) => members
                .first()
                .map(|member| Value::String(member.name.clone()))
                .unwrap_or(Value::Null),
            FieldKind::ObjectId => {
                Value::String("123e4567-e89b-12d3-a456-426614174000".to_string())
            }
            FieldKind::FreeList => Value::Array(vec![Value::String("sample_value".to_string())]),
            FieldKind::FreeDict => {
                let mut inner = Document::new();
                inner.insert("key".to_string(), Value::String("value".to_string()));
                Value::Object(inner)
            }
            FieldKind::List(item) => Value::Array(vec![item.example_value()]),
            FieldKind::Dict(fields) => {
                let mut inner = Document::new();
                for field in fields.default_fields() {
                    inner.insert(field.name.clone(), field.example_value());
                }
                Value::Object(inner)
            }
        }
    }

    /// Description entry used by the model description dictionary.
    pub(crate) fn describe(&self) -> Document {
        let mut entry = Document::new();
        entry.insert("name".to_string(), Value::String(self.name.clone()));
        entry.insert(
            "type".to_string(),
            Value::String(self.kind.type_name().to_string()),
        );
        entry.insert("primary_key".to_string(), Value::Bool(self.is_primary_key));
        entry.insert(
            "nullable".to_string(),
            Value::Bool(self.nullable_on_insert),
        );
        if let Some(description) = &self.description {
            entry.insert(
                "description".to_string(),
                Value::String(description.clone()),
            );
        }
        entry.insert("example".to_string(), self.example_value());
        entry
    }
}
