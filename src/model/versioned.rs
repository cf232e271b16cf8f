//! Bitemporal layer over [`CrudModel`]: every mutation creates a new
//! row-version stamped with a revision interval instead of touching the
//! stored document in place.
//!
//! Each row-version carries `valid_since_revision` (the revision that
//! created it) and `valid_until_revision` (the revision that retired it,
//! `-1` while current). Revisions come from one shared counter, so revision
//! numbers are comparable across versioned collections. History is never
//! deleted: `remove` retires the current version and `rollback_to`
//! re-asserts old versions as new current ones.

use std::sync::Arc;

use serde_json::{json, Value};

use super::CrudModel;
use crate::audit::AuditAction;
use crate::error::{DocBaseError, FieldErrors, Result};
use crate::filter::{Clause, CmpOp, Condition, Filters};
use crate::store::{self, StoreError};
use crate::Document;

pub const VALID_SINCE: &str = "valid_since_revision";
pub const VALID_UNTIL: &str = "valid_until_revision";

/// Sentinel stored in `valid_until_revision` while a row-version is the
/// current one.
pub const CURRENT_REVISION: i64 = -1;

pub(crate) const REVISION_CATEGORY: &str = "shared";
pub(crate) const REVISION_NAME: &str = "revision";

/// Veto hook called before a rollback mutates anything, with the target
/// revision, the filters and the row-versions that would become current.
/// A non-empty error map aborts the rollback.
pub type RollbackGuard =
    Arc<dyn Fn(i64, &Filters, &[Document]) -> FieldErrors + Send + Sync>;

pub struct VersionedCrudModel {
    inner: CrudModel,
    rollback_guard: Option<RollbackGuard>,
}

impl VersionedCrudModel {
    pub(crate) fn new(inner: CrudModel, rollback_guard: Option<RollbackGuard>) -> Self {
        VersionedCrudModel {
            inner,
            rollback_guard,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn fields(&self) -> &[crate::field::Column] {
        self.inner.fields()
    }

    pub fn field_names(&self) -> Vec<String> {
        self.inner.field_names()
    }

    pub fn primary_key_names(&self) -> &[String] {
        self.inner.primary_key_names()
    }

    pub fn description_dictionary(&self) -> Document {
        self.inner.description_dictionary()
    }

    pub fn documentation(&self) -> Document {
        self.inner.documentation()
    }

    pub fn audit_records(&self, filters: Filters) -> Result<Vec<Document>> {
        self.inner.audit_records(filters)
    }

    /// The latest revision delivered by the shared counter, 0 when nothing
    /// was ever revised.
    pub fn current_revision(&self) -> Result<i64> {
        Ok(self
            .inner
            .store
            .get_counter(REVISION_CATEGORY, REVISION_NAME)?)
    }

    fn next_revision(&self) -> Result<i64> {
        Ok(self
            .inner
            .store
            .increment_counter(REVISION_CATEGORY, REVISION_NAME)?)
    }

    /// Callers never control the versioning fields directly.
    fn strip_versioning(document: &mut Document) {
        document.remove(VALID_SINCE);
        document.remove(VALID_UNTIL);
    }

    fn current_only(mut filters: Filters) -> Filters {
        filters.remove(VALID_SINCE);
        filters.remove(VALID_UNTIL);
        filters.insert(VALID_UNTIL, json!(CURRENT_REVISION).into());
        filters
    }

    fn current_clause() -> Clause {
        Clause::new(VALID_UNTIL, Condition::Eq(json!(CURRENT_REVISION)))
    }

    fn insert_row(&self, row: &Document) -> Result<()> {
        let key = store::unique_key(row, &self.inner.unique_paths);
        match self.inner.store.insert_one(&self.inner.name, row, key) {
            Ok(()) => Ok(()),
            Err(StoreError::DuplicateKey { .. }) => Err(DocBaseError::validation_message(
                Value::Object(self.inner.serialize_document(row.clone())),
                "This document already exists.",
            )),
            Err(error) => Err(error.into()),
        }
    }

    pub fn add(&self, document: Value) -> Result<Document> {
        let received = document.clone();
        let mut document = match document {
            Value::Object(map) => map,
            _ => {
                return Err(DocBaseError::validation_message(
                    received,
                    "Must be a dictionary.",
                ))
            }
        };
        Self::strip_versioning(&mut document);
        let errors = self.inner.validate_insert(&document);
        if !errors.is_empty() {
            return Err(DocBaseError::validation(received, errors));
        }
        let mut coerced = document;
        self.inner.coerce_insert_document(&mut coerced)?;
        let revision = self.next_revision()?;
        coerced.insert(VALID_SINCE.to_string(), json!(revision));
        coerced.insert(VALID_UNTIL.to_string(), json!(CURRENT_REVISION));
        self.insert_row(&coerced)?;
        if let Some(audit) = &self.inner.audit {
            audit.record_revision(AuditAction::Insert, revision)?;
        }
        Ok(self.inner.serialize_document(coerced))
    }

    /// Insert a batch under a single revision.
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
        let mut documents = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            match entry {
                Value::Object(mut document) => {
                    Self::strip_versioning(&mut document);
                    for (key, messages) in self.inner.validate_insert(&document) {
                        errors
                            .entry(format!("{index}.{key}"))
                            .or_default()
                            .extend(messages);
                    }
                    documents.push(document);
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
        let revision = self.next_revision()?;
        let mut rows = Vec::with_capacity(documents.len());
        for mut document in documents {
            self.inner.coerce_insert_document(&mut document)?;
            document.insert(VALID_SINCE.to_string(), json!(revision));
            document.insert(VALID_UNTIL.to_string(), json!(CURRENT_REVISION));
            let key = store::unique_key(&document, &self.inner.unique_paths);
            rows.push((document, key));
        }
        match self.inner.store.insert_many(&self.inner.name, &rows) {
            Ok(()) => {}
            Err(StoreError::DuplicateKey { index }) => {
                let mut errors = FieldErrors::new();
                errors.insert(
                    index.map(|index| index.to_string()).unwrap_or_default(),
                    vec!["This document already exists.".to_string()],
                );
                let received = Value::Array(
                    rows.iter()
                        .map(|(document, _)| Value::Object(document.clone()))
                        .collect(),
                );
                return Err(DocBaseError::validation(received, errors));
            }
            Err(error) => return Err(error.into()),
        }
        if let Some(audit) = &self.inner.audit {
            audit.record_revision(AuditAction::Insert, revision)?;
        }
        Ok(rows
            .into_iter()
            .map(|(document, _)| self.inner.serialize_document(document))
            .collect())
    }

    pub fn get(&self, filters: Filters) -> Result<Option<Document>> {
        self.inner.get(Self::current_only(filters))
    }

    pub fn get_all(&self, filters: Filters) -> Result<Vec<Document>> {
        self.inner.get_all(Self::current_only(filters))
    }

    /// The most recent row-version of the matching document, even when it
    /// is currently deleted: the current version if one exists, otherwise
    /// the retired version with the highest `valid_since_revision`.
    pub fn get_last(&self, mut filters: Filters) -> Result<Option<Document>> {
        filters.remove(VALID_SINCE);
        filters.remove(VALID_UNTIL);
        let received = filters.to_value();
        let errors = self.inner.validate_query(&filters);
        if !errors.is_empty() {
            return Err(DocBaseError::validation(received, errors));
        }
        let clauses = self.inner.query_clauses(&filters);
        let mut current = clauses.clone();
        current.push(Self::current_clause());
        match self.inner.store.find_unique(&self.inner.name, &current) {
            Ok(Some(document)) => {
                return Ok(Some(self.inner.serialize_document(document)))
            }
            Ok(None) => {}
            Err(StoreError::MultipleMatches) => {
                return Err(DocBaseError::validation_message(
                    received,
                    "More than one result: Consider another filtering.",
                ))
            }
            Err(error) => return Err(error.into()),
        }
        let retired = self.inner.store.find(&self.inner.name, &clauses, None, None)?;
        Ok(retired
            .into_iter()
            .max_by_key(|document| {
                document
                    .get(VALID_SINCE)
                    .and_then(Value::as_i64)
                    .unwrap_or(0)
            })
            .map(|document| self.inner.serialize_document(document)))
    }

    /// Every row-version matching the filters, most recent first.
    pub fn get_history(&self, filters: Filters) -> Result<Vec<Document>> {
        let mut documents = self.inner.get_all(filters)?;
        documents.sort_by_key(|document| {
            std::cmp::Reverse(
                document
                    .get(VALID_SINCE)
                    .and_then(Value::as_i64)
                    .unwrap_or(0),
            )
        });
        Ok(documents)
    }

    pub fn update(&self, document: Value) -> Result<(Document, Document)> {
        let received = document.clone();
        let mut document = match document {
            Value::Object(map) => map,
            _ => {
                return Err(DocBaseError::validation_message(
                    received,
                    "Must be a dictionary.",
                ))
            }
        };
        Self::strip_versioning(&mut document);
        let errors = self.inner.validate_update(&document);
        if !errors.is_empty() {
            return Err(DocBaseError::validation(received, errors));
        }
        let mut coerced = document;
        self.inner.coerce_update_document(&mut coerced);
        // The revision is drawn only once the target is known to exist, so
        // a failed call leaves the shared counter untouched.
        let before = self.find_current(&coerced)?;
        let revision = self.next_revision()?;
        let images = self.apply_update(coerced, before, revision)?;
        if let Some(audit) = &self.inner.audit {
            audit.record_revision(AuditAction::Update, revision)?;
        }
        Ok(images)
    }

    /// Update a batch under a single revision. Every entry is validated and
    /// its target located before any entry is applied.
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
        let mut documents = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            match entry {
                Value::Object(mut document) => {
                    Self::strip_versioning(&mut document);
                    for (key, messages) in self.inner.validate_update(&document) {
                        errors
                            .entry(format!("{index}.{key}"))
                            .or_default()
                            .extend(messages);
                    }
                    documents.push(document);
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
        let mut prepared = Vec::with_capacity(documents.len());
        for mut document in documents {
            self.inner.coerce_update_document(&mut document);
            let before = self.find_current(&document)?;
            prepared.push((document, before));
        }
        let revision = self.next_revision()?;
        let mut results = Vec::with_capacity(prepared.len());
        for (coerced, before) in prepared {
            results.push(self.apply_update(coerced, before, revision)?);
        }
        if let Some(audit) = &self.inner.audit {
            audit.record_revision(AuditAction::Update, revision)?;
        }
        Ok(results)
    }

    /// The current row-version of the document identified by the coerced
    /// primary key values.
    fn find_current(&self, coerced: &Document) -> Result<Document> {
        let mut selector = self.inner.primary_key_clauses(coerced);
        selector.push(Self::current_clause());
        self.inner
            .store
            .find_one(&self.inner.name, &selector)?
            .ok_or_else(|| DocBaseError::NotFound {
                key: self.inner.primary_key_value(coerced),
            })
    }

    /// Archive the previous version, then stamp the current row with the
    /// changes and the new interval start.
    fn apply_update(
        &self,
        coerced: Document,
        before: Document,
        revision: i64,
    ) -> Result<(Document, Document)> {
        let mut selector = self.inner.primary_key_clauses(&coerced);
        selector.push(Self::current_clause());

        let mut archived = before.clone();
        archived.insert(VALID_UNTIL.to_string(), json!(revision));
        self.insert_row(&archived)?;

        let mut changes = coerced;
        changes.insert(VALID_SINCE.to_string(), json!(revision));
        changes.insert(VALID_UNTIL.to_string(), json!(CURRENT_REVISION));
        let (_, after) = match self.inner.store.update_one(
            &self.inner.name,
            &selector,
            &changes,
            &self.inner.unique_paths,
        ) {
            Ok(images) => images,
            Err(StoreError::NotFound) => {
                return Err(DocBaseError::NotFound {
                    key: self.inner.primary_key_value(&changes),
                })
            }
            Err(error) => return Err(error.into()),
        };
        Ok((
            self.inner.serialize_document(before),
            self.inner.serialize_document(after),
        ))
    }

    /// Retire the current version of every matching document. The history
    /// is kept; only the `valid_until_revision` stamp changes.
    pub fn remove(&self, mut filters: Filters) -> Result<usize> {
        filters.remove(VALID_SINCE);
        filters.remove(VALID_UNTIL);
        let received = filters.to_value();
        let errors = self.inner.validate_query(&filters);
        if !errors.is_empty() {
            return Err(DocBaseError::validation(received, errors));
        }
        let mut clauses = self.inner.query_clauses(&filters);
        if clauses.is_empty() {
            // Retiring everything restarts auto-increment numbering, like a
            // full delete on a non-versioned model. The shared revision
            // counter is not a model counter and keeps counting.
            self.inner.reset_counters()?;
        }
        clauses.push(Self::current_clause());
        let revision = self.next_revision()?;
        if let Some(audit) = &self.inner.audit {
            audit.record_revision(AuditAction::Delete, revision)?;
        }
        let mut retire = Document::new();
        retire.insert(VALID_UNTIL.to_string(), json!(revision));
        Ok(self.inner.store.set_fields_many(
            &self.inner.name,
            &clauses,
            &retire,
            &self.inner.unique_paths,
        )?)
    }

    /// Restore the matching documents to their state at `revision` by
    /// re-asserting the row-versions valid back then as new current
    /// versions. Documents created after `revision` are retired. Additive:
    /// no row-version is ever deleted. Returns the number of documents
    /// whose current state changed.
    pub fn rollback_to(&self, revision: i64, mut filters: Filters) -> Result<usize> {
        filters.remove(VALID_SINCE);
        filters.remove(VALID_UNTIL);
        let received = filters.to_value();
        if revision < 0 {
            let mut errors = FieldErrors::new();
            errors.insert(
                "revision".to_string(),
                vec![format!(
                    "Value \"{revision}\" is too small. Minimum value is 0."
                )],
            );
            return Err(DocBaseError::validation(received, errors));
        }
        let errors = self.inner.validate_query(&filters);
        if !errors.is_empty() {
            return Err(DocBaseError::validation(received, errors));
        }
        let clauses = self.inner.query_clauses(&filters);

        // Row-versions valid at the target revision but expired since.
        // The current sentinel is negative, so it never satisfies the
        // lower bound.
        let mut expired_clauses = clauses.clone();
        expired_clauses.push(Clause::new(
            VALID_SINCE,
            Condition::Cmp(vec![(CmpOp::LowerOrEqual, json!(revision))]),
        ));
        expired_clauses.push(Clause::new(
            VALID_UNTIL,
            Condition::Cmp(vec![(CmpOp::Greater, json!(revision))]),
        ));
        let expired = self
            .inner
            .store
            .find(&self.inner.name, &expired_clauses, None, None)?;

        if let Some(guard) = &self.rollback_guard {
            let errors = guard(revision, &filters, &expired);
            if !errors.is_empty() {
                return Err(DocBaseError::validation(received, errors));
            }
        }

        let new_revision = self.next_revision()?;
        let mut retire = Document::new();
        retire.insert(VALID_UNTIL.to_string(), json!(new_revision));

        // Retire the current version of each document being restored.
        for document in &expired {
            let mut selector = self.inner.primary_key_clauses(document);
            selector.push(Self::current_clause());
            self.inner.store.set_fields_many(
                &self.inner.name,
                &selector,
                &retire,
                &self.inner.unique_paths,
            )?;
        }

        // Retire documents that did not exist at the target revision.
        let mut created_after = clauses;
        created_after.push(Clause::new(
            VALID_SINCE,
            Condition::Cmp(vec![(CmpOp::Greater, json!(revision))]),
        ));
        created_after.push(Self::current_clause());
        let retired = self.inner.store.set_fields_many(
            &self.inner.name,
            &created_after,
            &retire,
            &self.inner.unique_paths,
        )?;

        // Re-assert the restored versions as current.
        let rows: Vec<(Document, Option<String>)> = expired
            .into_iter()
            .map(|mut document| {
                document.insert(VALID_SINCE.to_string(), json!(new_revision));
                document.insert(VALID_UNTIL.to_string(), json!(CURRENT_REVISION));
                let key = store::unique_key(&document, &self.inner.unique_paths);
                (document, key)
            })
            .collect();
        let restored = rows.len();
        if !rows.is_empty() {
            self.inner.store.insert_many(&self.inner.name, &rows)?;
        }
        if let Some(audit) = &self.inner.audit {
            audit.record_revision(AuditAction::Rollback, new_revision)?;
        }
        Ok(restored + retired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Column;
    use crate::model::ModelBuilder;
    use crate::store::DocumentStore;
    use pretty_assertions::assert_eq;

    fn store() -> Arc<DocumentStore> {
        Arc::new(DocumentStore::open_in_memory().unwrap())
    }

    fn versioned_model(store: Arc<DocumentStore>) -> VersionedCrudModel {
        ModelBuilder::new("tests", store)
            .field(Column::string("key").primary_key())
            .field(Column::enumeration("state", &[("Valid", 1), ("Invalid", 2)]))
            .build_versioned()
            .unwrap()
    }

    #[test]
    fn test_add_stamps_versioning_fields() {
        let model = versioned_model(store());
        let added = model.add(json!({"key": "first", "state": "Valid"})).unwrap();
        assert_eq!(
            Value::Object(added),
            json!({
                "key": "first",
                "state": "Valid",
                "valid_since_revision": 1,
                "valid_until_revision": -1,
            })
        );
    }

    #[test]
    fn test_update_archives_the_previous_version() {
        let model = versioned_model(store());
        model.add(json!({"key": "first", "state": "Valid"})).unwrap();
        let (before, after) = model
            .update(json!({"key": "first", "state": "Invalid"}))
            .unwrap();
        assert_eq!(before["valid_until_revision"], json!(-1));
        assert_eq!(after["valid_since_revision"], json!(2));
        assert_eq!(after["valid_until_revision"], json!(-1));

        let history = model.get_history(Filters::new()).unwrap();
        assert_eq!(
            history
                .iter()
                .map(|document| Value::Object(document.clone()))
                .collect::<Vec<_>>(),
            vec![
                json!({
                    "key": "first",
                    "state": "Invalid",
                    "valid_since_revision": 2,
                    "valid_until_revision": -1,
                }),
                json!({
                    "key": "first",
                    "state": "Valid",
                    "valid_since_revision": 1,
                    "valid_until_revision": 2,
                }),
            ]
        );
    }

    #[test]
    fn test_get_returns_only_current_versions() {
        let model = versioned_model(store());
        model.add(json!({"key": "first", "state": "Valid"})).unwrap();
        model.update(json!({"key": "first", "state": "Invalid"})).unwrap();
        let current = model
            .get(Filters::new().with("key", json!("first")))
            .unwrap()
            .unwrap();
        assert_eq!(current["state"], json!("Invalid"));
        assert_eq!(model.get_all(Filters::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_versioning_filters_from_caller_are_ignored_for_get() {
        let model = versioned_model(store());
        model.add(json!({"key": "first", "state": "Valid"})).unwrap();
        model.update(json!({"key": "first", "state": "Invalid"})).unwrap();
        let current = model
            .get(Filters::new().with("valid_until_revision", json!(2)))
            .unwrap()
            .unwrap();
        assert_eq!(current["valid_until_revision"], json!(-1));
    }

    #[test]
    fn test_remove_retires_without_deleting_history() {
        let model = versioned_model(store());
        model.add(json!({"key": "first", "state": "Valid"})).unwrap();
        assert_eq!(model.remove(Filters::new()).unwrap(), 1);
        assert!(model.get_all(Filters::new()).unwrap().is_empty());
        let history = model.get_history(Filters::new()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["valid_until_revision"], json!(2));
    }

    #[test]
    fn test_update_unknown_document_not_found() {
        let model = versioned_model(store());
        let error = model.update(json!({"key": "missing"})).unwrap_err();
        assert!(matches!(error, DocBaseError::NotFound { .. }));
    }

    #[test]
    fn test_add_all_uses_a_single_revision() {
        let model = versioned_model(store());
        let added = model
            .add_all(json!([{"key": "a"}, {"key": "b"}]))
            .unwrap();
        assert_eq!(added[0]["valid_since_revision"], json!(1));
        assert_eq!(added[1]["valid_since_revision"], json!(1));
        assert_eq!(model.current_revision().unwrap(), 1);
    }

    #[test]
    fn test_rollback_restores_previous_state() {
        let model = versioned_model(store());
        model.add(json!({"key": "first", "state": "Valid"})).unwrap(); // revision 1
        model.update(json!({"key": "first", "state": "Invalid"})).unwrap(); // revision 2
        model.add(json!({"key": "late", "state": "Valid"})).unwrap(); // revision 3

        // Back to revision 1: "first" regains its original state, "late"
        // disappears.
        let changed = model.rollback_to(1, Filters::new()).unwrap();
        assert_eq!(changed, 2);
        let current = model.get_all(Filters::new()).unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0]["key"], json!("first"));
        assert_eq!(current[0]["state"], json!("Valid"));

        // History keeps every version: rollback is additive.
        let history = model.get_history(Filters::new()).unwrap();
        assert_eq!(history.len(), 4);
    }

    #[test]
    fn test_rollback_to_current_state_is_a_no_op() {
        let model = versioned_model(store());
        model.add(json!({"key": "first", "state": "Valid"})).unwrap();
        let changed = model.rollback_to(1, Filters::new()).unwrap();
        assert_eq!(changed, 0);
        assert_eq!(model.get_all(Filters::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_rollback_restores_deleted_documents() {
        let model = versioned_model(store());
        model.add(json!({"key": "first", "state": "Valid"})).unwrap(); // revision 1
        model.remove(Filters::new().with("key", json!("first"))).unwrap(); // revision 2
        assert!(model.get_all(Filters::new()).unwrap().is_empty());

        let changed = model.rollback_to(1, Filters::new()).unwrap();
        assert_eq!(changed, 1);
        let current = model.get_all(Filters::new()).unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0]["state"], json!("Valid"));
    }

    #[test]
    fn test_rollback_guard_can_veto() {
        let model = ModelBuilder::new("tests", store())
            .field(Column::string("key").primary_key())
            .rollback_guard(|revision, _, _| {
                let mut errors = FieldErrors::new();
                if revision == 0 {
                    errors.insert(
                        "revision".to_string(),
                        vec!["Cannot roll back before the first import.".to_string()],
                    );
                }
                errors
            })
            .build_versioned()
            .unwrap();
        model.add(json!({"key": "first"})).unwrap();
        let error = model.rollback_to(0, Filters::new()).unwrap_err();
        assert!(matches!(error, DocBaseError::Validation { .. }));
        // Nothing was mutated.
        assert_eq!(model.current_revision().unwrap(), 1);
        assert_eq!(model.rollback_to(1, Filters::new()).unwrap(), 0);
    }

    #[test]
    fn test_rollback_rejects_negative_revision() {
        let model = versioned_model(store());
        let error = model.rollback_to(-3, Filters::new()).unwrap_err();
        assert!(matches!(error, DocBaseError::Validation { .. }));
    }

    #[test]
    fn test_shared_revision_counter_across_collections() {
        let store = store();
        let first = ModelBuilder::new("first", store.clone())
            .field(Column::string("key").primary_key())
            .build_versioned()
            .unwrap();
        let second = ModelBuilder::new("second", store)
            .field(Column::string("key").primary_key())
            .build_versioned()
            .unwrap();
        first.add(json!({"key": "a"})).unwrap();
        second.add(json!({"key": "b"})).unwrap();
        assert_eq!(
            second
                .get(Filters::new().with("key", json!("b")))
                .unwrap()
                .unwrap()["valid_since_revision"],
            json!(2)
        );
        assert_eq!(first.current_revision().unwrap(), 2);
    }

    #[test]
    fn test_empty_filter_remove_resets_counters() {
        let store = store();
        let model = ModelBuilder::new("tests", store)
            .field(Column::integer("key").primary_key().auto_increment())
            .build_versioned()
            .unwrap();
        model.add(json!({})).unwrap();
        model.remove(Filters::new()).unwrap();
        // Numbering restarts, the shared revision counter does not.
        let added = model.add(json!({})).unwrap();
        assert_eq!(added["key"], json!(1));
        assert_eq!(added["valid_since_revision"], json!(3));
    }

    #[test]
    fn test_filtered_remove_keeps_counters() {
        let store = store();
        let model = ModelBuilder::new("tests", store)
            .field(Column::integer("key").primary_key().auto_increment())
            .build_versioned()
            .unwrap();
        model.add(json!({})).unwrap();
        model.remove(Filters::new().with("key", json!(1))).unwrap();
        let added = model.add(json!({})).unwrap();
        assert_eq!(added["key"], json!(2));
    }

    #[test]
    fn test_failed_update_does_not_draw_a_revision() {
        let model = versioned_model(store());
        model.add(json!({"key": "first", "state": "Valid"})).unwrap();
        assert!(model
            .update(json!({"key": "first", "state": "Unknown"}))
            .is_err());
        assert!(model.update(json!({"key": "missing"})).is_err());
        assert_eq!(model.current_revision().unwrap(), 1);
        // The next successful mutation gets the very next revision.
        let (_, after) = model
            .update(json!({"key": "first", "state": "Invalid"}))
            .unwrap();
        assert_eq!(after["valid_since_revision"], json!(2));
    }

    #[test]
    fn test_update_all_validates_every_entry_first() {
        let model = versioned_model(store());
        model
            .add_all(json!([
                {"key": "a", "state": "Valid"},
                {"key": "b", "state": "Valid"},
            ]))
            .unwrap();
        let error = model
            .update_all(json!([
                {"key": "a", "state": "Invalid"},
                {"key": "b", "state": "Unknown"},
            ]))
            .unwrap_err();
        match error {
            DocBaseError::Validation { errors, .. } => {
                assert!(errors.contains_key("1.state"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // The valid first entry was not applied either.
        let current = model
            .get(Filters::new().with("key", json!("a")))
            .unwrap()
            .unwrap();
        assert_eq!(current["state"], json!("Valid"));
        assert_eq!(model.current_revision().unwrap(), 1);
        assert_eq!(model.get_history(Filters::new()).unwrap().len(), 2);
    }

    #[test]
    fn test_update_all_missing_target_applies_nothing() {
        let model = versioned_model(store());
        model.add(json!({"key": "a", "state": "Valid"})).unwrap();
        let error = model
            .update_all(json!([
                {"key": "a", "state": "Invalid"},
                {"key": "missing"},
            ]))
            .unwrap_err();
        assert!(matches!(error, DocBaseError::NotFound { .. }));
        let current = model
            .get(Filters::new().with("key", json!("a")))
            .unwrap()
            .unwrap();
        assert_eq!(current["state"], json!("Valid"));
        assert_eq!(model.current_revision().unwrap(), 1);
    }

    #[test]
    fn test_get_last_returns_the_current_version() {
        let model = versioned_model(store());
        model.add(json!({"key": "first", "state": "Valid"})).unwrap();
        model.update(json!({"key": "first", "state": "Invalid"})).unwrap();
        let last = model
            .get_last(Filters::new().with("key", json!("first")))
            .unwrap()
            .unwrap();
        assert_eq!(last["state"], json!("Invalid"));
        assert_eq!(last["valid_until_revision"], json!(-1));
    }

    #[test]
    fn test_get_last_returns_the_latest_version_of_a_deleted_document() {
        let model = versioned_model(store());
        model.add(json!({"key": "first", "state": "Valid"})).unwrap(); // revision 1
        model.update(json!({"key": "first", "state": "Invalid"})).unwrap(); // revision 2
        model.remove(Filters::new().with("key", json!("first"))).unwrap(); // revision 3

        assert!(model
            .get(Filters::new().with("key", json!("first")))
            .unwrap()
            .is_none());
        let last = model
            .get_last(Filters::new().with("key", json!("first")))
            .unwrap()
            .unwrap();
        assert_eq!(last["state"], json!("Invalid"));
        assert_eq!(last["valid_since_revision"], json!(2));
        assert_eq!(last["valid_until_revision"], json!(3));
    }

    #[test]
    fn test_get_last_none_when_nothing_matches() {
        let model = versioned_model(store());
        assert!(model
            .get_last(Filters::new().with("key", json!("missing")))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_rollback_guard_sees_the_restored_documents() {
        let model = ModelBuilder::new("tests", store())
            .field(Column::string("key").primary_key())
            .field(Column::enumeration("state", &[("Valid", 1), ("Invalid", 2)]))
            .rollback_guard(|_, _, restored| {
                let mut errors = FieldErrors::new();
                for document in restored {
                    if document.get("state") == Some(&json!(2)) {
                        errors
                            .entry("state".to_string())
                            .or_default()
                            .push("Cannot restore an invalid state.".to_string());
                    }
                }
                errors
            })
            .build_versioned()
            .unwrap();
        model.add(json!({"key": "first", "state": "Invalid"})).unwrap(); // revision 1
        model.update(json!({"key": "first", "state": "Valid"})).unwrap(); // revision 2

        // Restoring revision 1 would bring back the invalid state.
        let error = model.rollback_to(1, Filters::new()).unwrap_err();
        match error {
            DocBaseError::Validation { errors, .. } => {
                assert_eq!(errors["state"], vec!["Cannot restore an invalid state."]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Nothing was mutated.
        assert_eq!(model.current_revision().unwrap(), 2);
        let current = model
            .get(Filters::new().with("key", json!("first")))
            .unwrap()
            .unwrap();
        assert_eq!(current["state"], json!("Valid"));
    }
}
