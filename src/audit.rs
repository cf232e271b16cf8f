//! Audit trail of model mutations.
//!
//! A non-versioned model writes one entry per mutated document into its own
//! shadow collection `audit_<collection>`, copying the document fields and
//! stamping a per-collection revision, the acting user, the UTC time and
//! the action. Versioned models already keep every row-version, so they
//! share a single `audit` collection recording only which collection
//! changed at which revision.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::Result;
use crate::field::convert::now_utc;
use crate::field::Column;
use crate::filter::{Clause, Filters};
use crate::model::{CrudModel, ModelBuilder};
use crate::store::{self, DocumentStore};
use crate::Document;

/// Resolves the name recorded as `audit_user`.
pub type ActorResolver = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
    Rollback,
}

impl AuditAction {
    pub fn label(self) -> &'static str {
        match self {
            AuditAction::Insert => "Insert",
            AuditAction::Update => "Update",
            AuditAction::Delete => "Delete",
            AuditAction::Rollback => "Rollback",
        }
    }

    fn stored_value(self) -> i64 {
        match self {
            AuditAction::Insert => 1,
            AuditAction::Update => 2,
            AuditAction::Delete => 3,
            AuditAction::Rollback => 4,
        }
    }
}

fn audit_columns() -> Vec<Column> {
    vec![
        Column::string("audit_user").description("User who performed the operation."),
        Column::datetime("audit_date_utc").description("UTC time of the operation."),
        Column::enumeration(
            "audit_action",
            &[("Insert", 1), ("Update", 2), ("Delete", 3), ("Rollback", 4)],
        ),
    ]
}

/// Writes and reads the audit trail of one parent model. Entries are
/// written directly to the backend, bypassing validation: they are built
/// from already-coerced documents.
pub struct AuditRecorder {
    model: CrudModel,
    parent: String,
    versioned: bool,
    actor: ActorResolver,
}

impl AuditRecorder {
    /// Shadow-collection recorder for a non-versioned parent.
    pub(crate) fn shadow(
        parent: &str,
        parent_fields: &[Column],
        store: Arc<DocumentStore>,
        actor: ActorResolver,
    ) -> Result<AuditRecorder> {
        let mut builder = ModelBuilder::internal(&format!("audit_{parent}"), store);
        for field in parent_fields {
            let mut field = field.clone();
            // Audit entries copy generated values instead of drawing new
            // ones, and trail queries never inherit query-required fields.
            field.should_auto_increment = false;
            field.counter_name = None;
            field.is_required = false;
            builder = builder.field(field);
        }
        builder = builder.field(
            Column::integer("revision")
                .primary_key()
                .description("Revision of the audited collection at this operation."),
        );
        for column in audit_columns() {
            builder = builder.field(column);
        }
        Ok(AuditRecorder {
            model: builder.build()?,
            parent: parent.to_string(),
            versioned: false,
            actor,
        })
    }

    /// Shared-collection recorder for a versioned parent.
    pub(crate) fn shared(
        parent: &str,
        store: Arc<DocumentStore>,
        actor: ActorResolver,
    ) -> Result<AuditRecorder> {
        let mut builder = ModelBuilder::internal("audit", store)
            .field(Column::string("table_name").primary_key())
            .field(Column::integer("revision").primary_key());
        for column in audit_columns() {
            builder = builder.field(column);
        }
        Ok(AuditRecorder {
            model: builder.build()?,
            parent: parent.to_string(),
            versioned: true,
            actor,
        })
    }

    fn stamp(&self, entry: &mut Document, action: AuditAction) {
        entry.insert("audit_user".to_string(), Value::String((self.actor)()));
        entry.insert("audit_date_utc".to_string(), Value::String(now_utc()));
        entry.insert("audit_action".to_string(), json!(action.stored_value()));
    }

    fn insert_entry(&self, entry: Document) -> Result<()> {
        let key = store::unique_key(&entry, &self.model.unique_paths);
        self.model.store.insert_one(&self.model.name, &entry, key)?;
        Ok(())
    }

    /// Record one mutated document (shadow variant).
    pub(crate) fn record_document(&self, action: AuditAction, document: &Document) -> Result<()> {
        let mut entry = document.clone();
        let revision = self.model.store.increment_counter(&self.parent, "revision")?;
        entry.insert("revision".to_string(), json!(revision));
        self.stamp(&mut entry, action);
        self.insert_entry(entry)
    }

    /// Record one entry per document about to be deleted. Called before
    /// the physical delete so the audited state is the deleted one.
    pub(crate) fn record_removal(&self, clauses: &[Clause]) -> Result<()> {
        let removed = self.model.store.find(&self.parent, clauses, None, None)?;
        for document in removed {
            self.record_document(AuditAction::Delete, &document)?;
        }
        Ok(())
    }

    /// Record one revision of the parent collection (shared variant).
    pub(crate) fn record_revision(&self, action: AuditAction, revision: i64) -> Result<()> {
        let mut entry = Document::new();
        entry.insert("table_name".to_string(), Value::String(self.parent.clone()));
        entry.insert("revision".to_string(), json!(revision));
        self.stamp(&mut entry, action);
        self.insert_entry(entry)
    }

    /// Audit entries of the parent collection, with the full filter
    /// contract.
    pub fn get_all(&self, mut filters: Filters) -> Result<Vec<Document>> {
        if self.versioned {
            filters.insert("table_name", json!(self.parent).into());
        }
        self.model.get_all(filters)
    }
}
