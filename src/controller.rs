//! Request-level facade over a model: one controller per collection,
//! presenting the same operation set whether the underlying model is
//! versioned or not, and stripping caller-supplied read-only fields
//! before delegating.

use serde_json::Value;

use crate::error::{DocBaseError, Result};
use crate::field::Column;
use crate::filter::Filters;
use crate::model::versioned::{VALID_SINCE, VALID_UNTIL};
use crate::model::{CrudModel, VersionedCrudModel};
use crate::Document;

pub enum ModelHandle {
    Plain(CrudModel),
    Versioned(VersionedCrudModel),
}

impl From<CrudModel> for ModelHandle {
    fn from(model: CrudModel) -> Self {
        ModelHandle::Plain(model)
    }
}

impl From<VersionedCrudModel> for ModelHandle {
    fn from(model: VersionedCrudModel) -> Self {
        ModelHandle::Versioned(model)
    }
}

impl ModelHandle {
    fn fields(&self) -> &[Column] {
        match self {
            ModelHandle::Plain(model) => model.fields(),
            ModelHandle::Versioned(model) => model.fields(),
        }
    }
}

pub struct CrudController {
    model: ModelHandle,
}

impl CrudController {
    pub fn new(model: impl Into<ModelHandle>) -> Self {
        CrudController {
            model: model.into(),
        }
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    /// Fields the caller may not set on creation: generated values and the
    /// versioning stamps.
    fn creation_read_only(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .model
            .fields()
            .iter()
            .filter(|field| field.should_auto_increment())
            .map(|field| field.name())
            .collect();
        if matches!(self.model, ModelHandle::Versioned(_)) {
            names.push(VALID_SINCE);
            names.push(VALID_UNTIL);
        }
        names
    }

    fn strip(document: Value, read_only: &[&str]) -> Value {
        match document {
            Value::Object(mut map) => {
                for name in read_only {
                    map.remove(*name);
                }
                Value::Object(map)
            }
            other => other,
        }
    }

    fn strip_many(documents: Value, read_only: &[&str]) -> Value {
        match documents {
            Value::Array(entries) => Value::Array(
                entries
                    .into_iter()
                    .map(|entry| Self::strip(entry, read_only))
                    .collect(),
            ),
            other => other,
        }
    }

    pub fn post(&self, document: Value) -> Result<Document> {
        let document = Self::strip(document, &self.creation_read_only());
        match &self.model {
            ModelHandle::Plain(model) => model.add(document),
            ModelHandle::Versioned(model) => model.add(document),
        }
    }

    pub fn post_many(&self, documents: Value) -> Result<Vec<Document>> {
        let documents = Self::strip_many(documents, &self.creation_read_only());
        match &self.model {
            ModelHandle::Plain(model) => model.add_all(documents),
            ModelHandle::Versioned(model) => model.add_all(documents),
        }
    }

    /// Update one document. The versioning stamps are stripped; generated
    /// primary keys are kept, they identify the document to update.
    pub fn put(&self, document: Value) -> Result<(Document, Document)> {
        let document = Self::strip(document, &[VALID_SINCE, VALID_UNTIL]);
        match &self.model {
            ModelHandle::Plain(model) => model.update(document),
            ModelHandle::Versioned(model) => model.update(document),
        }
    }

    pub fn put_many(&self, documents: Value) -> Result<Vec<(Document, Document)>> {
        let documents = Self::strip_many(documents, &[VALID_SINCE, VALID_UNTIL]);
        match &self.model {
            ModelHandle::Plain(model) => model.update_all(documents),
            ModelHandle::Versioned(model) => model.update_all(documents),
        }
    }

    pub fn delete(&self, filters: Filters) -> Result<usize> {
        match &self.model {
            ModelHandle::Plain(model) => model.remove(filters),
            ModelHandle::Versioned(model) => model.remove(filters),
        }
    }

    pub fn get(&self, filters: Filters) -> Result<Vec<Document>> {
        match &self.model {
            ModelHandle::Plain(model) => model.get_all(filters),
            ModelHandle::Versioned(model) => model.get_all(filters),
        }
    }

    /// The single matching document, or an empty one when nothing matches.
    pub fn get_one(&self, filters: Filters) -> Result<Document> {
        let found = match &self.model {
            ModelHandle::Plain(model) => model.get(filters)?,
            ModelHandle::Versioned(model) => model.get(filters)?,
        };
        Ok(found.unwrap_or_default())
    }

    /// The latest version of the matching document, even when it is
    /// currently deleted on a versioned model. Empty when nothing matched.
    pub fn get_last(&self, filters: Filters) -> Result<Document> {
        let found = match &self.model {
            ModelHandle::Plain(model) => model.get_last(filters)?,
            ModelHandle::Versioned(model) => model.get_last(filters)?,
        };
        Ok(found.unwrap_or_default())
    }

    pub fn get_history(&self, filters: Filters) -> Result<Vec<Document>> {
        match &self.model {
            ModelHandle::Plain(model) => model.get_history(filters),
            ModelHandle::Versioned(model) => model.get_history(filters),
        }
    }

    pub fn rollback_to(&self, revision: i64, filters: Filters) -> Result<usize> {
        match &self.model {
            ModelHandle::Plain(_) => Err(DocBaseError::Definition(
                "Rollback is only available on versioned models.".to_string(),
            )),
            ModelHandle::Versioned(model) => model.rollback_to(revision, filters),
        }
    }

    pub fn get_audit(&self, filters: Filters) -> Result<Vec<Document>> {
        match &self.model {
            ModelHandle::Plain(model) => model.audit_records(filters),
            ModelHandle::Versioned(model) => model.audit_records(filters),
        }
    }

    pub fn get_model_description(&self) -> Document {
        match &self.model {
            ModelHandle::Plain(model) => model.description_dictionary(),
            ModelHandle::Versioned(model) => model.description_dictionary(),
        }
    }

    pub fn get_field_names(&self) -> Vec<String> {
        match &self.model {
            ModelHandle::Plain(model) => model.field_names(),
            ModelHandle::Versioned(model) => model.field_names(),
        }
    }

    /// The latest revision of the shared counter, 0 for non-versioned
    /// models.
    pub fn current_revision(&self) -> Result<i64> {
        match &self.model {
            ModelHandle::Plain(model) => model.current_revision(),
            ModelHandle::Versioned(model) => model.current_revision(),
        }
    }
}
