//! Embedded document backend over SQLite.
//!
//! Documents are stored as JSON text rows in a single `documents` table,
//! one row per document, keyed by collection. Unique indexes are enforced
//! through a `UNIQUE` constraint on a per-document key column holding the
//! JSON-encoded values of the unique-indexed field paths. Counters are one
//! row per (category, name) and incremented atomically. Filtering happens
//! in process by evaluating coerced query clauses against each document of
//! the collection.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;

use crate::field::convert::now_utc;
use crate::filter::{lookup, Clause};
use crate::Document;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no matching document")]
    NotFound,

    #[error("more than one matching document")]
    MultipleMatches,

    /// A document collides with an existing one on a unique index.
    /// `index` is the position of the offending entry in a batch insert.
    #[error("document violates a unique index")]
    DuplicateKey { index: Option<usize> },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The unique-index key of a document: the JSON-encoded array of its values
/// at the unique-indexed paths. `None` when the collection has no unique
/// index, which the backend exempts from the constraint.
pub fn unique_key(document: &Document, paths: &[String]) -> Option<String> {
    if paths.is_empty() {
        return None;
    }
    let values: Vec<Value> = paths
        .iter()
        .map(|path| lookup(document, path).cloned().unwrap_or(Value::Null))
        .collect();
    Some(Value::Array(values).to_string())
}

/// Apply one change to a document. Dotted paths descend into nested
/// mappings, and mapping values are flattened into per-leaf assignments so
/// updates merge nested content instead of replacing it.
fn set_path(target: &mut Document, path: &str, value: Value) {
    if let Value::Object(entries) = value {
        for (key, inner) in entries {
            set_path(target, &format!("{path}.{key}"), inner);
        }
        return;
    }
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((first, rest)) => {
            let entry = target
                .entry(first.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            if !entry.is_object() {
                *entry = Value::Object(Document::new());
            }
            if let Value::Object(inner) = entry {
                set_path(inner, rest, value);
            }
        }
    }
}

pub(crate) fn apply_changes(target: &mut Document, changes: &Document) {
    for (path, value) in changes {
        set_path(target, path, value.clone());
    }
}

fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn matching_rows(
    conn: &Connection,
    collection: &str,
    clauses: &[Clause],
) -> StoreResult<Vec<(i64, Document)>> {
    let mut statement = conn
        .prepare("SELECT doc_id, data_json FROM documents WHERE collection = ?1 ORDER BY doc_id")?;
    let rows = statement.query_map(params![collection], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut matching = Vec::new();
    for row in rows {
        let (doc_id, data) = row?;
        let document: Document = serde_json::from_str(&data)?;
        if clauses.iter().all(|clause| clause.matches(&document)) {
            matching.push((doc_id, document));
        }
    }
    Ok(matching)
}

pub struct DocumentStore {
    conn: Mutex<Connection>,
}

impl DocumentStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)
            .map_err(|error| StoreError::Unavailable(error.to_string()))?;
        Self::initialize(&conn)?;
        Ok(DocumentStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|error| StoreError::Unavailable(error.to_string()))?;
        Self::initialize(&conn)?;
        Ok(DocumentStore {
            conn: Mutex::new(conn),
        })
    }

    fn initialize(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                doc_id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                unique_key TEXT,
                data_json TEXT NOT NULL,
                UNIQUE (collection, unique_key)
            );
            CREATE INDEX IF NOT EXISTS idx_documents_collection
                ON documents (collection);
            CREATE TABLE IF NOT EXISTS counters (
                category TEXT NOT NULL,
                name TEXT NOT NULL,
                counter INTEGER NOT NULL,
                last_update_time TEXT NOT NULL,
                PRIMARY KEY (category, name)
            );
            CREATE TABLE IF NOT EXISTS indexes (
                collection TEXT NOT NULL,
                kind TEXT NOT NULL,
                fields_json TEXT NOT NULL,
                PRIMARY KEY (collection, kind)
            );",
        )
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
    }

    pub fn ping(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    pub fn insert_one(
        &self,
        collection: &str,
        document: &Document,
        unique_key: Option<String>,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        let data = serde_json::to_string(document)?;
        let result = conn.execute(
            "INSERT INTO documents (collection, unique_key, data_json) VALUES (?1, ?2, ?3)",
            params![collection, unique_key, data],
        );
        match result {
            Ok(_) => Ok(()),
            Err(error) if is_unique_violation(&error) => {
                Err(StoreError::DuplicateKey { index: None })
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Insert a batch atomically: either every entry is persisted or none is.
    pub fn insert_many(
        &self,
        collection: &str,
        entries: &[(Document, Option<String>)],
    ) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (index, (document, unique_key)) in entries.iter().enumerate() {
            let data = serde_json::to_string(document)?;
            let result = tx.execute(
                "INSERT INTO documents (collection, unique_key, data_json) VALUES (?1, ?2, ?3)",
                params![collection, unique_key, data],
            );
            match result {
                Ok(_) => {}
                Err(error) if is_unique_violation(&error) => {
                    return Err(StoreError::DuplicateKey {
                        index: Some(index),
                    });
                }
                Err(error) => return Err(error.into()),
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn find(
        &self,
        collection: &str,
        clauses: &[Clause],
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> StoreResult<Vec<Document>> {
        let conn = self.conn()?;
        let rows = matching_rows(&conn, collection, clauses)?;
        let documents = rows
            .into_iter()
            .map(|(_, document)| document)
            .skip(offset.unwrap_or(0))
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        Ok(documents)
    }

    pub fn find_one(&self, collection: &str, clauses: &[Clause]) -> StoreResult<Option<Document>> {
        Ok(self.find(collection, clauses, Some(1), None)?.into_iter().next())
    }

    /// Like [`DocumentStore::find_one`] but fails when the clauses match
    /// more than one document.
    pub fn find_unique(
        &self,
        collection: &str,
        clauses: &[Clause],
    ) -> StoreResult<Option<Document>> {
        let mut documents = self.find(collection, clauses, Some(2), None)?;
        if documents.len() > 1 {
            return Err(StoreError::MultipleMatches);
        }
        Ok(documents.pop())
    }

    pub fn count(&self, collection: &str, clauses: &[Clause]) -> StoreResult<usize> {
        let conn = self.conn()?;
        Ok(matching_rows(&conn, collection, clauses)?.len())
    }

    /// Find the first document matching `selector`, apply `changes` to it
    /// and persist the result, all in one transaction. Returns the document
    /// before and after the changes.
    pub fn update_one(
        &self,
        collection: &str,
        selector: &[Clause],
        changes: &Document,
        unique_paths: &[String],
    ) -> StoreResult<(Document, Document)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let rows = matching_rows(&tx, collection, selector)?;
        let (doc_id, before) = rows.into_iter().next().ok_or(StoreError::NotFound)?;
        let mut after = before.clone();
        apply_changes(&mut after, changes);
        let key = unique_key(&after, unique_paths);
        let data = serde_json::to_string(&after)?;
        let result = tx.execute(
            "UPDATE documents SET unique_key = ?1, data_json = ?2 WHERE doc_id = ?3",
            params![key, data, doc_id],
        );
        match result {
            Ok(_) => {
                tx.commit()?;
                Ok((before, after))
            }
            Err(error) if is_unique_violation(&error) => {
                Err(StoreError::DuplicateKey { index: None })
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Apply the same field assignments to every matching document.
    /// Returns the number of documents modified.
    pub fn set_fields_many(
        &self,
        collection: &str,
        clauses: &[Clause],
        sets: &Document,
        unique_paths: &[String],
    ) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let rows = matching_rows(&tx, collection, clauses)?;
        let modified = rows.len();
        for (doc_id, mut document) in rows {
            apply_changes(&mut document, sets);
            let key = unique_key(&document, unique_paths);
            let data = serde_json::to_string(&document)?;
            tx.execute(
                "UPDATE documents SET unique_key = ?1, data_json = ?2 WHERE doc_id = ?3",
                params![key, data, doc_id],
            )?;
        }
        tx.commit()?;
        Ok(modified)
    }

    pub fn delete_many(&self, collection: &str, clauses: &[Clause]) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let rows = matching_rows(&tx, collection, clauses)?;
        let removed = rows.len();
        for (doc_id, _) in rows {
            tx.execute("DELETE FROM documents WHERE doc_id = ?1", params![doc_id])?;
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Atomically increment a counter and return its new value. The counter
    /// starts at 1 on first use.
    pub fn increment_counter(&self, category: &str, name: &str) -> StoreResult<i64> {
        let conn = self.conn()?;
        let value = conn.query_row(
            "INSERT INTO counters (category, name, counter, last_update_time)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT (category, name)
             DO UPDATE SET counter = counter + 1, last_update_time = ?3
             RETURNING counter",
            params![category, name, now_utc()],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(value)
    }

    /// Current value of a counter, 0 when it was never incremented.
    pub fn get_counter(&self, category: &str, name: &str) -> StoreResult<i64> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT counter FROM counters WHERE category = ?1 AND name = ?2",
                params![category, name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0))
    }

    pub fn reset_counter(&self, category: &str, name: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM counters WHERE category = ?1 AND name = ?2",
            params![category, name],
        )?;
        Ok(())
    }

    /// Record the index layout of a collection and rebuild the stored unique
    /// keys when the unique field set changed since last time.
    pub fn ensure_indexes(
        &self,
        collection: &str,
        unique_paths: &[String],
        other_paths: &[String],
    ) -> StoreResult<()> {
        self.record_index(collection, "other", other_paths)?;
        if self.record_index(collection, "unique", unique_paths)? {
            log::info!("Updating unique index of '{collection}'...");
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let rows = matching_rows(&tx, collection, &[])?;
            for (doc_id, document) in rows {
                let key = unique_key(&document, unique_paths);
                tx.execute(
                    "UPDATE documents SET unique_key = ?1 WHERE doc_id = ?2",
                    params![key, doc_id],
                )?;
            }
            tx.commit()?;
            log::info!("Unique index of '{collection}' updated.");
        }
        Ok(())
    }

    /// Returns whether the recorded field set changed.
    fn record_index(&self, collection: &str, kind: &str, paths: &[String]) -> StoreResult<bool> {
        let desired = serde_json::to_string(paths)?;
        let conn = self.conn()?;
        let recorded = conn
            .query_row(
                "SELECT fields_json FROM indexes WHERE collection = ?1 AND kind = ?2",
                params![collection, kind],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        if recorded.as_deref() == Some(desired.as_str()) {
            return Ok(false);
        }
        let changed = recorded.is_some();
        conn.execute(
            "INSERT INTO indexes (collection, kind, fields_json) VALUES (?1, ?2, ?3)
             ON CONFLICT (collection, kind) DO UPDATE SET fields_json = ?3",
            params![collection, kind, desired],
        )?;
        Ok(changed)
    }

    /// Drop every document and counter of a collection, keeping the index
    /// records. Test and maintenance support.
    pub fn reset_collection(&self, collection: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM documents WHERE collection = ?1",
            params![collection],
        )?;
        conn.execute(
            "DELETE FROM counters WHERE category = ?1",
            params![collection],
        )?;
        Ok(())
    }

    /// Drop every document and counter of every collection.
    pub fn reset_all(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM documents", [])?;
        conn.execute("DELETE FROM counters", [])?;
        Ok(())
    }

    pub fn collection_names(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut statement =
            conn.prepare("SELECT DISTINCT collection FROM documents ORDER BY collection")?;
        let names = statement
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    /// Write every collection as a `<collection>.json` document array, plus
    /// the counters as `counters.json`.
    pub fn dump(&self, directory: &Path) -> StoreResult<()> {
        std::fs::create_dir_all(directory)?;
        for collection in self.collection_names()? {
            let documents = self.find(&collection, &[], None, None)?;
            let file = std::fs::File::create(directory.join(format!("{collection}.json")))?;
            serde_json::to_writer(file, &documents)?;
        }
        let counters = self.dump_counters()?;
        let file = std::fs::File::create(directory.join("counters.json"))?;
        serde_json::to_writer(file, &counters)?;
        Ok(())
    }

    fn dump_counters(&self) -> StoreResult<Vec<Value>> {
        let conn = self.conn()?;
        let mut statement =
            conn.prepare("SELECT category, name, counter, last_update_time FROM counters")?;
        let counters = statement
            .query_map([], |row| {
                let mut entry = Document::new();
                entry.insert("category".to_string(), Value::String(row.get(0)?));
                entry.insert("name".to_string(), Value::String(row.get(1)?));
                entry.insert("counter".to_string(), Value::from(row.get::<_, i64>(2)?));
                entry.insert("last_update_time".to_string(), Value::String(row.get(3)?));
                Ok(Value::Object(entry))
            })?
            .collect::<rusqlite::Result<Vec<Value>>>()?;
        Ok(counters)
    }

    /// Replace the store content with a previous [`DocumentStore::dump`].
    /// Unique keys are rebuilt from the recorded index layouts.
    pub fn restore(&self, directory: &Path) -> StoreResult<()> {
        self.reset_all()?;
        for entry in std::fs::read_dir(directory)? {
            let path = entry?.path();
            if path.extension().and_then(|extension| extension.to_str()) != Some("json") {
                continue;
            }
            let name = match path.file_stem().and_then(|stem| stem.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let content = std::fs::read_to_string(&path)?;
            if name == "counters" {
                self.restore_counters(&content)?;
                continue;
            }
            let documents: Vec<Document> = serde_json::from_str(&content)?;
            let unique_paths = self.recorded_unique_paths(&name)?;
            let entries: Vec<(Document, Option<String>)> = documents
                .into_iter()
                .map(|document| {
                    let key = unique_key(&document, &unique_paths);
                    (document, key)
                })
                .collect();
            self.insert_many(&name, &entries)?;
        }
        Ok(())
    }

    fn restore_counters(&self, content: &str) -> StoreResult<()> {
        let counters: Vec<Document> = serde_json::from_str(content)?;
        let conn = self.conn()?;
        for counter in counters {
            conn.execute(
                "INSERT OR REPLACE INTO counters (category, name, counter, last_update_time)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    counter.get("category").and_then(Value::as_str).unwrap_or_default(),
                    counter.get("name").and_then(Value::as_str).unwrap_or_default(),
                    counter.get("counter").and_then(Value::as_i64).unwrap_or_default(),
                    counter
                        .get("last_update_time")
                        .and_then(Value::as_str)
                        .unwrap_or_default(),
                ],
            )?;
        }
        Ok(())
    }

    fn recorded_unique_paths(&self, collection: &str) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let recorded = conn
            .query_row(
                "SELECT fields_json FROM indexes WHERE collection = ?1 AND kind = 'unique'",
                params![collection],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match recorded {
            Some(fields) => Ok(serde_json::from_str(&fields)?),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Condition;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    fn eq(path: &str, value: Value) -> Clause {
        Clause::new(path, Condition::Eq(value))
    }

    #[test]
    fn test_insert_and_find() {
        let store = DocumentStore::open_in_memory().unwrap();
        store.insert_one("tests", &doc(json!({"key": "a"})), None).unwrap();
        store.insert_one("tests", &doc(json!({"key": "b"})), None).unwrap();
        let all = store.find("tests", &[], None, None).unwrap();
        assert_eq!(all.len(), 2);
        let filtered = store.find("tests", &[eq("key", json!("b"))], None, None).unwrap();
        assert_eq!(filtered, vec![doc(json!({"key": "b"}))]);
    }

    #[test]
    fn test_unique_key_collision() {
        let store = DocumentStore::open_in_memory().unwrap();
        let paths = vec!["key".to_string()];
        let document = doc(json!({"key": "a", "value": 1}));
        store
            .insert_one("tests", &document, unique_key(&document, &paths))
            .unwrap();
        let collision = doc(json!({"key": "a", "value": 2}));
        let result = store.insert_one("tests", &collision, unique_key(&collision, &paths));
        assert!(matches!(result, Err(StoreError::DuplicateKey { index: None })));
    }

    #[test]
    fn test_no_unique_index_allows_duplicates() {
        let store = DocumentStore::open_in_memory().unwrap();
        let document = doc(json!({"key": "a"}));
        store.insert_one("tests", &document, None).unwrap();
        store.insert_one("tests", &document, None).unwrap();
        assert_eq!(store.count("tests", &[]).unwrap(), 2);
    }

    #[test]
    fn test_insert_many_is_atomic() {
        let store = DocumentStore::open_in_memory().unwrap();
        let paths = vec!["key".to_string()];
        let first = doc(json!({"key": "a"}));
        let second = doc(json!({"key": "a"}));
        let entries = vec![
            (first.clone(), unique_key(&first, &paths)),
            (second.clone(), unique_key(&second, &paths)),
        ];
        let result = store.insert_many("tests", &entries);
        assert!(matches!(
            result,
            Err(StoreError::DuplicateKey { index: Some(1) })
        ));
        assert_eq!(store.count("tests", &[]).unwrap(), 0);
    }

    #[test]
    fn test_find_limit_and_offset() {
        let store = DocumentStore::open_in_memory().unwrap();
        for index in 0..5 {
            store.insert_one("tests", &doc(json!({"index": index})), None).unwrap();
        }
        let page = store.find("tests", &[], Some(2), Some(1)).unwrap();
        assert_eq!(
            page,
            vec![doc(json!({"index": 1})), doc(json!({"index": 2}))]
        );
    }

    #[test]
    fn test_find_unique_rejects_ambiguity() {
        let store = DocumentStore::open_in_memory().unwrap();
        store.insert_one("tests", &doc(json!({"key": "a"})), None).unwrap();
        store.insert_one("tests", &doc(json!({"key": "a"})), None).unwrap();
        let result = store.find_unique("tests", &[eq("key", json!("a"))]);
        assert!(matches!(result, Err(StoreError::MultipleMatches)));
    }

    #[test]
    fn test_update_one_returns_both_images() {
        let store = DocumentStore::open_in_memory().unwrap();
        store
            .insert_one("tests", &doc(json!({"key": "a", "value": 1})), None)
            .unwrap();
        let (before, after) = store
            .update_one(
                "tests",
                &[eq("key", json!("a"))],
                &doc(json!({"value": 2})),
                &[],
            )
            .unwrap();
        assert_eq!(before, doc(json!({"key": "a", "value": 1})));
        assert_eq!(after, doc(json!({"key": "a", "value": 2})));
    }

    #[test]
    fn test_update_one_not_found() {
        let store = DocumentStore::open_in_memory().unwrap();
        let result = store.update_one("tests", &[eq("key", json!("a"))], &Document::new(), &[]);
        assert!(matches!(result, Err(StoreError::NotFound)));
    }

    #[test]
    fn test_dotted_changes_merge_nested_content() {
        let store = DocumentStore::open_in_memory().unwrap();
        store
            .insert_one(
                "tests",
                &doc(json!({"key": "a", "nested": {"kept": 1, "replaced": 1}})),
                None,
            )
            .unwrap();
        let (_, after) = store
            .update_one(
                "tests",
                &[eq("key", json!("a"))],
                &doc(json!({"nested.replaced": 2})),
                &[],
            )
            .unwrap();
        assert_eq!(
            after,
            doc(json!({"key": "a", "nested": {"kept": 1, "replaced": 2}}))
        );
    }

    #[test]
    fn test_set_fields_many_and_delete_many() {
        let store = DocumentStore::open_in_memory().unwrap();
        for index in 0..3 {
            store
                .insert_one("tests", &doc(json!({"index": index, "open": true})), None)
                .unwrap();
        }
        let modified = store
            .set_fields_many("tests", &[], &doc(json!({"open": false})), &[])
            .unwrap();
        assert_eq!(modified, 3);
        let removed = store
            .delete_many("tests", &[eq("index", json!(1))])
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count("tests", &[]).unwrap(), 2);
    }

    #[test]
    fn test_counters() {
        let store = DocumentStore::open_in_memory().unwrap();
        assert_eq!(store.get_counter("tests", "key").unwrap(), 0);
        assert_eq!(store.increment_counter("tests", "key").unwrap(), 1);
        assert_eq!(store.increment_counter("tests", "key").unwrap(), 2);
        assert_eq!(store.get_counter("tests", "key").unwrap(), 2);
        store.reset_counter("tests", "key").unwrap();
        assert_eq!(store.get_counter("tests", "key").unwrap(), 0);
        assert_eq!(store.increment_counter("tests", "key").unwrap(), 1);
    }

    #[test]
    fn test_ensure_indexes_rebuilds_unique_keys_on_change() {
        let store = DocumentStore::open_in_memory().unwrap();
        let initial = vec!["key".to_string()];
        store.ensure_indexes("tests", &initial, &[]).unwrap();
        let document = doc(json!({"key": "a", "other": "x"}));
        store
            .insert_one("tests", &document, unique_key(&document, &initial))
            .unwrap();

        // Extending the unique index re-keys existing documents, so the new
        // composite key no longer collides.
        let extended = vec!["key".to_string(), "other".to_string()];
        store.ensure_indexes("tests", &extended, &[]).unwrap();
        let second = doc(json!({"key": "a", "other": "y"}));
        store
            .insert_one("tests", &second, unique_key(&second, &extended))
            .unwrap();
        assert_eq!(store.count("tests", &[]).unwrap(), 2);
    }

    #[test]
    fn test_reset_collection_keeps_other_collections() {
        let store = DocumentStore::open_in_memory().unwrap();
        store.insert_one("first", &doc(json!({"key": 1})), None).unwrap();
        store.insert_one("second", &doc(json!({"key": 2})), None).unwrap();
        store.increment_counter("first", "key").unwrap();
        store.reset_collection("first").unwrap();
        assert_eq!(store.count("first", &[]).unwrap(), 0);
        assert_eq!(store.count("second", &[]).unwrap(), 1);
        assert_eq!(store.get_counter("first", "key").unwrap(), 0);
    }

    #[test]
    fn test_dump_and_restore_round_trip() {
        let directory = tempfile::tempdir().unwrap();
        let store = DocumentStore::open_in_memory().unwrap();
        let paths = vec!["key".to_string()];
        store.ensure_indexes("tests", &paths, &[]).unwrap();
        let document = doc(json!({"key": "a", "value": 1}));
        store
            .insert_one("tests", &document, unique_key(&document, &paths))
            .unwrap();
        store.increment_counter("tests", "value").unwrap();
        store.dump(directory.path()).unwrap();

        store.reset_all().unwrap();
        assert_eq!(store.count("tests", &[]).unwrap(), 0);

        store.restore(directory.path()).unwrap();
        assert_eq!(
            store.find("tests", &[], None, None).unwrap(),
            vec![document]
        );
        assert_eq!(store.get_counter("tests", "value").unwrap(), 1);
        // Restored documents keep their unique key.
        let collision = doc(json!({"key": "a"}));
        let result = store.insert_one("tests", &collision, unique_key(&collision, &paths));
        assert!(matches!(result, Err(StoreError::DuplicateKey { .. })));
    }

    #[test]
    fn test_file_backed_store_persists() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("docs.db");
        {
            let store = DocumentStore::open(&path).unwrap();
            store.insert_one("tests", &doc(json!({"key": "a"})), None).unwrap();
        }
        let store = DocumentStore::open(&path).unwrap();
        assert_eq!(store.count("tests", &[]).unwrap(), 1);
        store.ping().unwrap();
    }
}
