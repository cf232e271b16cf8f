//! The document model: an ordered field set bound to one collection,
//! exposing CRUD operations with the three-phase protocol: validate the
//! raw input (collecting every error), coerce a copy to the stored
//! canonical form, persist, then serialize the stored form back to the
//! exchange form.

pub mod versioned;

use std::sync::Arc;

use serde_json::Value;

use crate::audit::{ActorResolver, AuditAction, AuditRecorder};
use crate::error::{DocBaseError, FieldErrors, Result};
use crate::field::{Column, FieldKind, IndexKind, MISSING_FIELD};
use crate::filter::{Clause, Condition, FilterOperand, FilterValue, Filters};
use crate::nested;
use crate::store::{self, DocumentStore, StoreError};
use crate::Document;

pub use versioned::{RollbackGuard, VersionedCrudModel};

const UNKNOWN_FIELD: &str = "Unknown field";

/// Collect the dotted paths of indexed fields, descending into dict fields.
fn index_paths(fields: &[Column], kind: IndexKind, prefix: &str, out: &mut Vec<String>) {
    for field in fields {
        if field.index_kind() == Some(kind) {
            out.push(format!("{prefix}{}", field.name()));
        }
        if let FieldKind::Dict(inner) = field.kind() {
            index_paths(
                inner.default_fields(),
                kind,
                &format!("{prefix}{}.", field.name()),
                out,
            );
        }
    }
}

/// Builds a [`CrudModel`] or [`VersionedCrudModel`]: collection name, field
/// set, unknown-field policy, audit and actor configuration.
pub struct ModelBuilder {
    name: String,
    store: Arc<DocumentStore>,
    fields: Vec<Column>,
    skip_unknown_fields: bool,
    skip_log_for_unknown_fields: Vec<String>,
    audited: bool,
    actor: Option<ActorResolver>,
    rollback_guard: Option<RollbackGuard>,
    skip_name_check: bool,
}

impl ModelBuilder {
    pub fn new(name: &str, store: Arc<DocumentStore>) -> Self {
        ModelBuilder {
            name: name.to_string(),
            store,
            fields: Vec::new(),
            skip_unknown_fields: true,
            skip_log_for_unknown_fields: Vec::new(),
            audited: false,
            actor: None,
            rollback_guard: None,
            skip_name_check: false,
        }
    }

    /// Builder for internal collections, exempt from the reserved-name
    /// check.
    pub(crate) fn internal(name: &str, store: Arc<DocumentStore>) -> Self {
        let mut builder = ModelBuilder::new(name, store);
        builder.skip_name_check = true;
        builder
    }

    pub fn field(mut self, column: Column) -> Self {
        self.fields.push(column);
        self
    }

    /// Report unknown fields as validation errors instead of silently
    /// dropping them.
    pub fn reject_unknown_fields(mut self) -> Self {
        self.skip_unknown_fields = false;
        self
    }

    /// Do not log when this unknown field is dropped.
    pub fn skip_log_for_unknown_field(mut self, name: &str) -> Self {
        self.skip_log_for_unknown_fields.push(name.to_string());
        self
    }

    /// Record every mutation in an audit collection.
    pub fn audited(mut self) -> Self {
        self.audited = true;
        self
    }

    /// Resolve the name recorded as `audit_user`. Defaults to an empty
    /// string.
    pub fn actor(mut self, resolver: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.actor = Some(Arc::new(resolver));
        self
    }

    /// Veto hook called before a rollback mutates anything, with the target
    /// revision, the filters and the row-versions that would become
    /// current. A non-empty error map aborts the rollback.
    pub fn rollback_guard(
        mut self,
        guard: impl Fn(i64, &Filters, &[Document]) -> FieldErrors + Send + Sync + 'static,
    ) -> Self {
        self.rollback_guard = Some(Arc::new(guard));
        self
    }

    pub fn build(self) -> Result<CrudModel> {
        self.build_model(false)
    }

    pub fn build_versioned(self) -> Result<VersionedCrudModel> {
        let guard = self.rollback_guard.clone();
        let inner = self.build_model(true)?;
        Ok(VersionedCrudModel::new(inner, guard))
    }

    fn build_model(self, versioned: bool) -> Result<CrudModel> {
        if !self.skip_name_check {
            if self.name.is_empty() {
                return Err(DocBaseError::Definition(
                    "A collection name is mandatory.".to_string(),
                ));
            }
            if self.name == "counters" || self.name.starts_with("audit") {
                return Err(DocBaseError::Definition(format!(
                    "{} is a reserved collection name.",
                    self.name
                )));
            }
        }

        let mut fields = self.fields;
        if versioned {
            fields.push(
                Column::integer(versioned::VALID_SINCE)
                    .description("Revision at which the document became valid."),
            );
            fields.push(
                Column::integer(versioned::VALID_UNTIL)
                    .indexed(IndexKind::Unique)
                    .description("Revision at which the document stopped being valid, -1 while current."),
            );
        }
        if fields.is_empty() {
            return Err(DocBaseError::Definition(
                "A model must have at least one field.".to_string(),
            ));
        }
        for field in &mut fields {
            field.bind().map_err(DocBaseError::Definition)?;
        }
        for (position, field) in fields.iter().enumerate() {
            if fields[..position].iter().any(|other| other.name() == field.name()) {
                return Err(DocBaseError::Definition(format!(
                    "Field {} is declared more than once.",
                    field.name()
                )));
            }
        }

        let primary_keys: Vec<String> = fields
            .iter()
            .filter(|field| field.is_primary_key())
            .map(|field| field.name().to_string())
            .collect();
        let mut unique_paths = Vec::new();
        index_paths(&fields, IndexKind::Unique, "", &mut unique_paths);
        let mut other_paths = Vec::new();
        index_paths(&fields, IndexKind::Other, "", &mut other_paths);
        self.store
            .ensure_indexes(&self.name, &unique_paths, &other_paths)?;

        let actor: ActorResolver = self.actor.unwrap_or_else(|| Arc::new(String::new));
        let audit = if !self.audited {
            None
        } else if versioned {
            Some(Box::new(AuditRecorder::shared(
                &self.name,
                self.store.clone(),
                actor,
            )?))
        } else {
            Some(Box::new(AuditRecorder::shadow(
                &self.name,
                &fields,
                self.store.clone(),
                actor,
            )?))
        };

        Ok(CrudModel {
            name: self.name,
            fields,
            primary_keys,
            unique_paths,
            store: self.store,
            skip_unknown_fields: self.skip_unknown_fields,
            skip_log_for_unknown_fields: self.skip_log_for_unknown_fields,
            audit,
        })
    }
}

pub struct CrudModel {
    pub(crate) name: String,
    pub(crate) fields: Vec<Column>,
    pub(crate) primary_keys: Vec<String>,
    pub(crate) unique_paths: Vec<String>,
    pub(crate) store: Arc<DocumentStore>,
    skip_unknown_fields: bool,
    skip_log_for_unknown_fields: Vec<String>,
    // The recorder embeds a model of its own, so the field is boxed to
    // keep the type finite.
    pub(crate) audit: Option<Box<AuditRecorder>>,
}

impl CrudModel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Column] {
        &self.fields
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|field| field.name().to_string()).collect()
    }

    pub fn primary_key_names(&self) -> &[String] {
        &self.primary_keys
    }

    fn field(&self, name: &str) -> Option<&Column> {
        self.fields.iter().find(|field| field.name() == name)
    }

    /// Insert one document. Returns its serialized form, with generated and
    /// defaulted fields filled in.
    pub fn add(&self, document: Value) -> Result<Document> {
        let received = document.clone();
        let document = match document {
            Value::Object(map) => map,
            _ => {
                return Err(DocBaseError::validation_message(
                    received,
                    "Must be a dictionary.",
                ))
            }
        };
        let errors = self.validate_insert(&document);
        if !errors.is_empty() {
            return Err(DocBaseError::validation(received, errors));
        }
        let mut coerced = document;
        self.coerce_insert_document(&mut coerced)?;
        self.insert_coerced(coerced)
    }

    pub(crate) fn insert_coerced(&self, coerced: Document) -> Result<Document> {
        log::debug!("Inserting one document into '{}'...", self.name);
        let key = store::unique_key(&coerced, &self.unique_paths);
        match self.store.insert_one(&self.name, &coerced, key) {
            Ok(()) => {}
            Err(StoreError::DuplicateKey { .. }) => {
                return Err(DocBaseError::validation_message(
                    Value::Object(self.serialize_document(coerced)),
                    "This document already exists.",
                ));
            }
            Err(error) => return Err(error.into()),
        }
        if let Some(audit) = &self.audit {
            audit.record_document(AuditAction::Insert, &coerced)?;
        }
        log::debug!("Document inserted into '{}'.", self.name);
        Ok(self.serialize_document(coerced))
    }

    /// Insert a batch atomically. Validation errors are keyed by the entry
    /// index followed by the field path.
    pub fn add_all(&self, documents: Value) -> Result<Vec<Document>> {
        let received = documents.clone();
        let entries = match documents {
            Value::Array(entries) => entries,
            _ => return Err(DocBaseError::validation_message(received, "Must be a list.")),
        };
        if entries.is_empty() {
            return Err(DocBaseError::validation_message(received, "No data provided."));
        }
        let mut errors = FieldErrors::new();
        for (index, entry) in entries.iter().enumerate() {
            match entry {
                Value::Object(document) => {
                    for (key, messages) in self.validate_insert(document) {
                        errors
                            .entry(format!("{index}.{key}"))
                            .or_default()
                            .extend(messages);
                    }
                }
                _ => {
                    errors
                        .entry(index.to_string())
                        .or_default()
                        .push("Must be a dictionary.".to_string());
                }
            }
        }
        if !errors.is_empty() {
            return Err(DocBaseError::validation(received, errors));
        }
        let mut coerced_entries = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Value::Object(mut document) = entry {
                self.coerce_insert_document(&mut document)?;
                coerced_entries.push(document);
            }
        }
        self.insert_coerced_many(coerced_entries)
    }

    pub(crate) fn insert_coerced_many(&self, documents: Vec<Document>) -> Result<Vec<Document>> {
        log::debug!(
            "Inserting {} documents into '{}'...",
            documents.len(),
            self.name
        );
        let entries: Vec<(Document, Option<String>)> = documents
            .into_iter()
            .map(|document| {
                let key = store::unique_key(&document, &self.unique_paths);
                (document, key)
            })
            .collect();
        match self.store.insert_many(&self.name, &entries) {
            Ok(()) => {}
            Err(StoreError::DuplicateKey { index }) => {
                let mut errors = FieldErrors::new();
                errors.insert(
                    index.map(|index| index.to_string()).unwrap_or_default(),
                    vec!["This document already exists.".to_string()],
                );
                let received = Value::Array(
                    entries
                        .iter()
                        .map(|(document, _)| Value::Object(document.clone()))
                        .collect(),
                );
                return Err(DocBaseError::validation(received, errors));
            }
            Err(error) => return Err(error.into()),
        }
        let documents: Vec<Document> =
            entries.into_iter().map(|(document, _)| document).collect();
        if let Some(audit) = &self.audit {
            for document in &documents {
                audit.record_document(AuditAction::Insert, document)?;
            }
        }
        Ok(documents
            .into_iter()
            .map(|document| self.serialize_document(document))
            .collect())
    }

    /// Fetch the single document matching the filters, or `None`. Fails when
    /// more than one matches.
    pub fn get(&self, mut filters: Filters) -> Result<Option<Document>> {
        filters.limit = None;
        filters.offset = None;
        let received = filters.to_value();
        let errors = self.validate_query(&filters);
        if !errors.is_empty() {
            return Err(DocBaseError::validation(received, errors));
        }
        let clauses = self.query_clauses(&filters);
        match self.store.find_unique(&self.name, &clauses) {
            Ok(found) => Ok(found.map(|document| self.serialize_document(document))),
            Err(StoreError::MultipleMatches) => Err(DocBaseError::validation_message(
                received,
                "More than one result: Consider another filtering.",
            )),
            Err(error) => Err(error.into()),
        }
    }

    pub fn get_all(&self, mut filters: Filters) -> Result<Vec<Document>> {
        let limit = filters.limit.take();
        let offset = filters.offset.take();
        let received = filters.to_value();
        let errors = self.validate_query(&filters);
        if !errors.is_empty() {
            return Err(DocBaseError::validation(received, errors));
        }
        let clauses = self.query_clauses(&filters);
        log::debug!("Querying '{}'...", self.name);
        let documents = self.store.find(&self.name, &clauses, limit, offset)?;
        Ok(documents
            .into_iter()
            .map(|document| self.serialize_document(document))
            .collect())
    }

    /// Every row-version of the matching documents. A non-versioned model
    /// has a single version per document.
    pub fn get_history(&self, filters: Filters) -> Result<Vec<Document>> {
        self.get_all(filters)
    }

    /// The latest version of the matching document. Without versioning that
    /// is the stored document itself.
    pub fn get_last(&self, filters: Filters) -> Result<Option<Document>> {
        self.get(filters)
    }

    /// Update the document identified by the primary key values. Fields not
    /// provided keep their stored value; nested mappings merge per entry.
    /// Returns the document before and after the update.
    pub fn update(&self, document: Value) -> Result<(Document, Document)> {
        let received = document.clone();
        let document = match document {
            Value::Object(map) => map,
            _ => {
                return Err(DocBaseError::validation_message(
                    received,
                    "Must be a dictionary.",
                ))
            }
        };
        let errors = self.validate_update(&document);
        if !errors.is_empty() {
            return Err(DocBaseError::validation(received, errors));
        }
        let mut coerced = document;
        self.coerce_update_document(&mut coerced);
        self.update_coerced(coerced)
    }

    pub(crate) fn update_coerced(&self, coerced: Document) -> Result<(Document, Document)> {
        let selector = self.primary_key_clauses(&coerced);
        match self
            .store
            .update_one(&self.name, &selector, &coerced, &self.unique_paths)
        {
            Ok((before, after)) => {
                if let Some(audit) = &self.audit {
                    audit.record_document(AuditAction::Update, &after)?;
                }
                Ok((
                    self.serialize_document(before),
                    self.serialize_document(after),
                ))
            }
            Err(StoreError::NotFound) => Err(DocBaseError::NotFound {
                key: self.primary_key_value(&coerced),
            }),
            Err(StoreError::DuplicateKey { .. }) => Err(DocBaseError::validation_message(
                Value::Object(self.serialize_document(coerced)),
                "This document already exists.",
            )),
            Err(error) => Err(error.into()),
        }
    }

    /// Update a batch. Every entry is validated before any is applied.
    pub fn update_all(&self, documents: Value) -> Result<Vec<(Document, Document)>> {
        let received = documents.clone();
        let entries = match documents {
            Value::Array(entries) => entries,
            _ => return Err(DocBaseError::validation_message(received, "Must be a list.")),
        };
        if entries.is_empty() {
            return Err(DocBaseError::validation_message(received, "No data provided."));
        }
        let mut errors = FieldErrors::new();
        for (index, entry) in entries.iter().enumerate() {
            match entry {
                Value::Object(document) => {
                    for (key, messages) in self.validate_update(document) {
                        errors
                            .entry(format!("{index}.{key}"))
                            .or_default()
                            .extend(messages);
                    }
                }
                _ => {
                    errors
                        .entry(index.to_string())
                        .or_default()
                        .push("Must be a dictionary.".to_string());
                }
            }
        }
        if !errors.is_empty() {
            return Err(DocBaseError::validation(received, errors));
        }
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Value::Object(mut document) = entry {
                self.coerce_update_document(&mut document);
                results.push(self.update_coerced(document)?);
            }
        }
        Ok(results)
    }

    /// Remove every matching document, returning how many were removed.
    /// Removing with no filters also resets the model's counters.
    pub fn remove(&self, filters: Filters) -> Result<usize> {
        let received = filters.to_value();
        let errors = self.validate_query(&filters);
        if !errors.is_empty() {
            return Err(DocBaseError::validation(received, errors));
        }
        let clauses = self.query_clauses(&filters);
        if let Some(audit) = &self.audit {
            audit.record_removal(&clauses)?;
        }
        if clauses.is_empty() {
            log::debug!("Removing all documents from '{}', resetting counters.", self.name);
            self.reset_counters()?;
        }
        Ok(self.store.delete_many(&self.name, &clauses)?)
    }

    pub fn reset_counters(&self) -> Result<()> {
        for field in &self.fields {
            if field.should_auto_increment() {
                let (category, name) = field.counter_ids(&self.name);
                self.store.reset_counter(&category, &name)?;
            }
        }
        Ok(())
    }

    /// Non-versioned models are never revised.
    pub fn current_revision(&self) -> Result<i64> {
        Ok(0)
    }

    /// Audit trail of this model, empty when audit is not enabled.
    pub fn audit_records(&self, filters: Filters) -> Result<Vec<Document>> {
        match &self.audit {
            Some(audit) => audit.get_all(filters),
            None => Ok(Vec::new()),
        }
    }

    /// Stable introspection mapping: the collection name plus one entry per
    /// field, mapping the field name to itself.
    pub fn description_dictionary(&self) -> Document {
        let mut description = Document::new();
        description.insert("collection".to_string(), Value::String(self.name.clone()));
        for field in &self.fields {
            description.insert(
                field.name().to_string(),
                Value::String(field.name().to_string()),
            );
        }
        description
    }

    /// Rich per-field documentation (type, nullability, description,
    /// example), for documentation generators.
    pub fn documentation(&self) -> Document {
        let mut documentation = Document::new();
        documentation.insert("collection".to_string(), Value::String(self.name.clone()));
        documentation.insert(
            "fields".to_string(),
            Value::Array(
                self.fields
                    .iter()
                    .map(|field| Value::Object(field.describe()))
                    .collect(),
            ),
        );
        documentation
    }

    pub fn validate_insert(&self, document: &Document) -> FieldErrors {
        let mut working = document.clone();
        let unmatched = nested::regroup_dotted_keys(&mut working, &self.fields);
        let mut errors = FieldErrors::new();
        self.unknown_field_errors(&working, &unmatched, &mut errors);
        for field in &self.fields {
            for (key, messages) in field.validate_insert(&working) {
                errors.entry(key).or_default().extend(messages);
            }
        }
        errors
    }

    pub fn validate_update(&self, document: &Document) -> FieldErrors {
        let mut working = document.clone();
        let unmatched = nested::regroup_dotted_keys(&mut working, &self.fields);
        let mut errors = FieldErrors::new();
        self.unknown_field_errors(&working, &unmatched, &mut errors);
        for field in &self.fields {
            if !field.is_primary_key() && !working.contains_key(field.name()) {
                continue;
            }
            for (key, messages) in field.validate_update(&working) {
                errors.entry(key).or_default().extend(messages);
            }
        }
        errors
    }

    pub fn validate_query(&self, filters: &Filters) -> FieldErrors {
        let mut errors = FieldErrors::new();
        let context = self.filter_context(filters);
        for (name, value) in filters.iter() {
            match self.resolve_filter_field(name, &context) {
                Some(column) => column.validate_query_value(value, name, &context, &mut errors),
                None => {
                    if !self.skip_unknown_fields {
                        errors
                            .entry(name.to_string())
                            .or_default()
                            .push(UNKNOWN_FIELD.to_string());
                    }
                }
            }
        }
        for field in &self.fields {
            if field.is_required && filters.get(field.name()).is_none() {
                errors
                    .entry(field.name().to_string())
                    .or_default()
                    .push(MISSING_FIELD.to_string());
            }
        }
        errors
    }

    fn unknown_field_errors(
        &self,
        document: &Document,
        unmatched: &[String],
        errors: &mut FieldErrors,
    ) {
        if self.skip_unknown_fields {
            return;
        }
        for key in document.keys() {
            if !key.contains('.') && self.field(key).is_none() {
                errors
                    .entry(key.clone())
                    .or_default()
                    .push(UNKNOWN_FIELD.to_string());
            }
        }
        for key in unmatched {
            errors
                .entry(key.clone())
                .or_default()
                .push(UNKNOWN_FIELD.to_string());
        }
    }

    pub(crate) fn coerce_insert_document(&self, document: &mut Document) -> Result<()> {
        let unmatched = nested::regroup_dotted_keys(document, &self.fields);
        self.drop_unknown_fields(document, unmatched);
        for field in &self.fields {
            if field.should_auto_increment() && !document.contains_key(field.name()) {
                let (category, name) = field.counter_ids(&self.name);
                let value = self.store.increment_counter(&category, &name)?;
                document.insert(field.name().to_string(), Value::from(value));
            } else {
                field.coerce_insert(document);
            }
        }
        Ok(())
    }

    pub(crate) fn coerce_update_document(&self, document: &mut Document) {
        let unmatched = nested::regroup_dotted_keys(document, &self.fields);
        self.drop_unknown_fields(document, unmatched);
        for field in &self.fields {
            field.coerce_update(document);
        }
    }

    fn drop_unknown_fields(&self, document: &mut Document, unmatched: Vec<String>) {
        let unknown: Vec<String> = document
            .keys()
            .filter(|key| self.field(key).is_none())
            .cloned()
            .collect();
        for key in unknown {
            document.remove(&key);
            if !self.skip_log_for_unknown_fields.contains(&key) {
                log::warn!("Skipping unknown field {key}.");
            }
        }
        // Regrouped leftovers under dict fields are dropped by dict
        // coercion itself.
        for key in unmatched {
            if !self.skip_log_for_unknown_fields.contains(&key) {
                log::warn!("Skipping unknown field {key}.");
            }
        }
    }

    /// Translate validated filters into backend clauses. Unknown filter
    /// fields are skipped.
    pub(crate) fn query_clauses(&self, filters: &Filters) -> Vec<Clause> {
        let context = self.filter_context(filters);
        let mut clauses = Vec::new();
        for (name, value) in filters.iter() {
            match self.resolve_filter_field(name, &context) {
                Some(column) => {
                    let prefix = match name.rfind('.') {
                        Some(position) => &name[..=position],
                        None => "",
                    };
                    column.coerce_query_value(value.clone(), prefix, &context, &mut clauses);
                }
                None => {
                    if !self.skip_log_for_unknown_fields.contains(&name.to_string()) {
                        log::warn!("Skipping unknown filter {name}.");
                    }
                }
            }
        }
        clauses
    }

    /// Resolve a possibly dotted filter path to its leaf field descriptor.
    fn resolve_filter_field(&self, path: &str, context: &Document) -> Option<Column> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.field(first)?.clone();
        for segment in segments {
            let inner = match current.kind() {
                FieldKind::Dict(fields) => fields.resolve(context),
                _ => return None,
            };
            current = inner.into_iter().find(|field| field.name() == segment)?;
        }
        Some(current)
    }

    /// Plain top-level filter values, used as the context for computed
    /// defaults and computed dict fields.
    fn filter_context(&self, filters: &Filters) -> Document {
        let mut context = Document::new();
        for (name, value) in filters.iter() {
            if let FilterValue::Single(FilterOperand::Value(plain)) = value {
                if !name.contains('.') {
                    context.insert(name.to_string(), plain.clone());
                }
            }
        }
        context
    }

    pub(crate) fn primary_key_clauses(&self, document: &Document) -> Vec<Clause> {
        self.primary_keys
            .iter()
            .map(|name| {
                Clause::new(
                    name.clone(),
                    Condition::Eq(document.get(name).cloned().unwrap_or(Value::Null)),
                )
            })
            .collect()
    }

    pub(crate) fn primary_key_value(&self, document: &Document) -> Value {
        let mut key = Document::new();
        for name in &self.primary_keys {
            key.insert(
                name.clone(),
                document.get(name).cloned().unwrap_or(Value::Null),
            );
        }
        Value::Object(key)
    }

    /// Stored form to exchange form: drop legacy fields, fill defaults,
    /// order by field declaration.
    pub fn serialize_document(&self, mut document: Document) -> Document {
        let legacy: Vec<String> = document
            .keys()
            .filter(|key| self.field(key).is_none())
            .cloned()
            .collect();
        for key in legacy {
            document.remove(&key);
            log::debug!("Removing legacy field '{key}' from response.");
        }
        for field in &self.fields {
            field.serialize(&mut document);
        }
        let mut ordered = Document::new();
        for field in &self.fields {
            if let Some(value) = document.remove(field.name()) {
                ordered.insert(field.name().to_string(), value);
            }
        }
        ordered
    }
}
