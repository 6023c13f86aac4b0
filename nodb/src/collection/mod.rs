use crate::config::CollectionDescriptor;
use crate::document::{self, Document, DELETED_FIELD, ID_FIELD};
use crate::error::{NodbError, Result};
use crate::filter::{Filter, Mode};
use crate::lock::{FileLock, LockRegistry};
use crate::pipeline::{Next, Pipeline};
use crate::storage::{self, FORMAT_VERSION};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// On-disk contents of one collection: `{ version, data, name, ...config }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionFile {
    pub version: String,
    #[serde(default)]
    pub data: Vec<Document>,
    #[serde(flatten)]
    pub descriptor: CollectionDescriptor,
}

/// A collection file before its documents are decoded, so a bad record
/// can be reported on its own.
#[derive(Deserialize)]
struct RawCollectionFile {
    version: String,
    #[serde(default)]
    data: Vec<Value>,
    #[serde(flatten)]
    descriptor: CollectionDescriptor,
}

impl RawCollectionFile {
    fn decode(self, path: &Path) -> Result<CollectionFile> {
        let data = self
            .data
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                let id = value
                    .get(ID_FIELD)
                    .and_then(Value::as_str)
                    .unwrap_or("<none>")
                    .to_string();
                serde_json::from_value(value).map_err(|e| {
                    NodbError::InvalidDocument(format!(
                        "{} entry {index} (_id {id}): {e}",
                        path.display()
                    ))
                })
            })
            .collect::<Result<Vec<Document>>>()?;

        Ok(CollectionFile {
            version: self.version,
            data,
            descriptor: self.descriptor,
        })
    }
}

/// Result of update, soft delete and hard delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub count: usize,
}

/// State forwarded between the steps of one operation.
enum Carry {
    Start,
    Loaded(CollectionFile),
    Staged {
        file: CollectionFile,
        outcome: Outcome,
    },
    Done(Outcome),
}

impl Carry {
    fn label(&self) -> &'static str {
        match self {
            Carry::Start => "start",
            Carry::Loaded(_) => "loaded",
            Carry::Staged { .. } => "staged",
            Carry::Done(_) => "done",
        }
    }
}

/// What an operation hands back to its caller.
enum Outcome {
    Stored(Document),
    Found(Vec<Document>),
    Written(WriteResult),
}

type Continuation<'a> = Next<'a, Carry, Outcome>;
type StepResult = Result<Option<Outcome>>;

/// Handle to one collection file. Every operation re-reads the file, so a
/// handle never serves stale data; mutating operations hold the file's
/// write lock from load to persist.
#[derive(Debug, Clone)]
pub struct Collection {
    descriptor: CollectionDescriptor,
    path: PathBuf,
    lock: FileLock,
}

impl Collection {
    pub(crate) fn new(
        descriptor: CollectionDescriptor,
        root: &Path,
        locks: &LockRegistry,
    ) -> Self {
        let path = root.join(format!("{}.json", descriptor.name));
        let lock = locks.get_lock(&path);
        Collection {
            descriptor,
            path,
            lock,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &CollectionDescriptor {
        &self.descriptor
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the empty collection template if the file does not exist yet.
    /// Returns whether a file was created.
    pub(crate) fn create_if_missing(&self) -> Result<bool> {
        let _guard = self.lock.write();
        if self.path.exists() {
            return Ok(false);
        }
        storage::write_json(&self.path, &self.template())?;
        log::debug!("Created collection file {}", self.path.display());
        Ok(true)
    }

    /// Read the whole collection file as it is on disk right now.
    pub fn open(&self) -> Result<CollectionFile> {
        let _guard = self.lock.read();
        self.load()
    }

    /// Insert a document. Returns it as stored, with `_id` and, when the
    /// collection audits dates, `created_date`/`modified_date`.
    pub fn insert(&self, data: Value) -> Result<Document> {
        let _guard = self.lock.write();
        let outcome = Pipeline::new()
            .then(self.load_step())
            .then(move |next, carry: Carry| {
                let mut file = loaded(carry, "insert")?;
                let mut doc = Document::from_input(unused_id(&file), data)?;
                if file.descriptor.config.date_audit {
                    doc.stamp(Utc::now());
                }
                file.data.push(doc.clone());
                next.call(Carry::Staged {
                    file,
                    outcome: Outcome::Stored(doc),
                })
            })
            .then(self.persist_step())
            .then(deliver)
            .run(Carry::Start)?;

        match outcome {
            Some(Outcome::Stored(doc)) => {
                log::debug!("Inserted {} into {}", doc.id, self.name());
                Ok(doc)
            }
            _ => Err(no_result("insert")),
        }
    }

    /// All documents matching `filter` that are not soft-deleted, in
    /// stored order.
    pub fn find(&self, filter: &Filter) -> Result<Vec<Document>> {
        let _guard = self.lock.read();
        let visible = filter.excluding_deleted();
        let outcome = Pipeline::new()
            .then(self.load_step())
            .then(|next, carry: Carry| {
                let file = loaded(carry, "find")?;
                let predicate = visible.predicate(Mode::Normal);
                let found: Vec<Document> = file.data.into_iter().filter(|d| predicate(d)).collect();
                next.call(Carry::Done(Outcome::Found(found)))
            })
            .then(deliver)
            .run(Carry::Start)?;

        match outcome {
            Some(Outcome::Found(docs)) => Ok(docs),
            _ => Err(no_result("find")),
        }
    }

    /// Number of documents `find` would return.
    pub fn count(&self, filter: &Filter) -> Result<usize> {
        Ok(self.find(filter)?.len())
    }

    /// Merge `updates` into every visible document matching `filter`.
    ///
    /// `modified_date` is left as stamped at insert.
    pub fn update(&self, filter: &Filter, updates: Map<String, Value>) -> Result<WriteResult> {
        document::validate_updates(&updates)?;
        let _guard = self.lock.write();
        let visible = filter.excluding_deleted();
        let outcome = Pipeline::new()
            .then(self.load_step())
            .then(|next, carry: Carry| {
                let mut file = loaded(carry, "update")?;
                let predicate = visible.predicate(Mode::Normal);
                let mut count = 0;
                for doc in file.data.iter_mut().filter(|d| predicate(d)) {
                    doc.merge(&updates)?;
                    count += 1;
                }
                let result = WriteResult { count };
                if count == 0 {
                    // Nothing changed; skip the write.
                    return Ok(Some(Outcome::Written(result)));
                }
                next.call(Carry::Staged {
                    file,
                    outcome: Outcome::Written(result),
                })
            })
            .then(self.persist_step())
            .then(deliver)
            .run(Carry::Start)?;

        let result = written(outcome, "update")?;
        log::debug!("Updated {} document(s) in {}", result.count, self.name());
        Ok(result)
    }

    /// Tombstone every visible document matching `filter`.
    pub fn soft_delete(&self, filter: &Filter) -> Result<WriteResult> {
        let mut tombstone = Map::new();
        tombstone.insert(DELETED_FIELD.to_string(), Value::Bool(true));
        self.update(filter, tombstone)
    }

    /// Physically remove every document matching `filter`, tombstoned or
    /// not. Surviving documents keep their relative order.
    pub fn hard_delete(&self, filter: &Filter) -> Result<WriteResult> {
        let _guard = self.lock.write();
        let outcome = Pipeline::new()
            .then(self.load_step())
            .then(|next, carry: Carry| {
                let mut file = loaded(carry, "hard delete")?;
                let before = file.data.len();
                let retain = filter.predicate(Mode::Inverted);
                file.data.retain(|d| retain(d));
                let result = WriteResult {
                    count: before - file.data.len(),
                };
                if result.count == 0 {
                    return Ok(Some(Outcome::Written(result)));
                }
                next.call(Carry::Staged {
                    file,
                    outcome: Outcome::Written(result),
                })
            })
            .then(self.persist_step())
            .then(deliver)
            .run(Carry::Start)?;

        let result = written(outcome, "hard delete")?;
        log::debug!("Removed {} document(s) from {}", result.count, self.name());
        Ok(result)
    }

    // ── Steps ──────────────────────────────────────────────────────

    fn load_step<'a>(&'a self) -> impl FnOnce(Continuation<'a>, Carry) -> StepResult + 'a {
        move |next, carry| match carry {
            Carry::Start => next.call(Carry::Loaded(self.load()?)),
            other => Err(unexpected("load", &other)),
        }
    }

    fn persist_step<'a>(&'a self) -> impl FnOnce(Continuation<'a>, Carry) -> StepResult + 'a {
        move |next, carry| match carry {
            Carry::Staged { file, outcome } => {
                storage::write_json(&self.path, &file)?;
                next.call(Carry::Done(outcome))
            }
            other => Err(unexpected("persist", &other)),
        }
    }

    fn load(&self) -> Result<CollectionFile> {
        match storage::read_json::<RawCollectionFile>(&self.path)? {
            Some(raw) => raw.decode(&self.path),
            None => {
                log::warn!(
                    "Collection file {} is missing; starting from an empty collection",
                    self.path.display()
                );
                Ok(self.template())
            }
        }
    }

    fn template(&self) -> CollectionFile {
        CollectionFile {
            version: FORMAT_VERSION.to_string(),
            data: Vec::new(),
            descriptor: self.descriptor.clone(),
        }
    }
}

/// Final step: hand the outcome back instead of continuing.
fn deliver(_next: Continuation<'_>, carry: Carry) -> StepResult {
    match carry {
        Carry::Done(outcome) => Ok(Some(outcome)),
        other => Err(unexpected("deliver", &other)),
    }
}

fn loaded(carry: Carry, step: &str) -> Result<CollectionFile> {
    match carry {
        Carry::Loaded(file) => Ok(file),
        other => Err(unexpected(step, &other)),
    }
}

fn written(outcome: Option<Outcome>, op: &str) -> Result<WriteResult> {
    match outcome {
        Some(Outcome::Written(result)) => Ok(result),
        _ => Err(no_result(op)),
    }
}

fn unexpected(step: &str, carry: &Carry) -> NodbError {
    NodbError::Pipeline(format!("{step} step received {} state", carry.label()))
}

fn no_result(op: &str) -> NodbError {
    NodbError::Pipeline(format!("{op} finished without a result"))
}

/// A fresh UUID that no document in `file` already uses.
fn unused_id(file: &CollectionFile) -> String {
    loop {
        let id = Uuid::new_v4().to_string();
        if !file.data.iter().any(|d| d.id == id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectionConfig;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup_collection(config: CollectionConfig) -> (TempDir, Collection) {
        let tmp = TempDir::new().unwrap();
        let registry = LockRegistry::new();
        let collection = Collection::new(
            CollectionDescriptor::new("people", config),
            tmp.path(),
            &registry,
        );
        collection.create_if_missing().unwrap();
        (tmp, collection)
    }

    fn updates(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_template_written_on_create() {
        let (_tmp, people) = setup_collection(CollectionConfig::new().date_audit(true));
        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(people.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], json!(FORMAT_VERSION));
        assert_eq!(raw["data"], json!([]));
        assert_eq!(raw["name"], json!("people"));
        assert_eq!(raw["dateAudit"], json!(true));
        assert!(!people.create_if_missing().unwrap());
    }

    #[test]
    fn test_insert_assigns_id() {
        let (_tmp, people) = setup_collection(CollectionConfig::new());
        let doc = people.insert(json!({ "name": "ashutosh" })).unwrap();
        assert!(Uuid::parse_str(&doc.id).is_ok());
        assert_eq!(doc.fields.get("name"), Some(&json!("ashutosh")));
        assert!(doc.created_date.is_none());

        let file = people.open().unwrap();
        assert_eq!(file.data, vec![doc]);
    }

    #[test]
    fn test_insert_with_date_audit() {
        let (_tmp, people) = setup_collection(CollectionConfig::new().date_audit(true));
        let doc = people.insert(json!({ "name": "ashutosh" })).unwrap();
        assert!(doc.created_date.is_some());
        assert_eq!(doc.created_date, doc.modified_date);
    }

    #[test]
    fn test_insert_rejects_non_object() {
        let (_tmp, people) = setup_collection(CollectionConfig::new());
        assert!(matches!(
            people.insert(json!("ashutosh")),
            Err(NodbError::InvalidDocument(_))
        ));
        assert!(people.open().unwrap().data.is_empty());
    }

    #[test]
    fn test_find_filters_and_keeps_order() {
        let (_tmp, people) = setup_collection(CollectionConfig::new());
        people.insert(json!({ "name": "a", "team": 1 })).unwrap();
        people.insert(json!({ "name": "b", "team": 2 })).unwrap();
        people.insert(json!({ "name": "c", "team": 1 })).unwrap();

        let team1 = people.find(&Filter::new().eq("team", 1)).unwrap();
        let names: Vec<_> = team1.iter().map(|d| d.fields["name"].clone()).collect();
        assert_eq!(names, vec![json!("a"), json!("c")]);
        assert_eq!(people.count(&Filter::new()).unwrap(), 3);
    }

    #[test]
    fn test_update_merges_fields_and_keeps_id() {
        let (_tmp, people) = setup_collection(CollectionConfig::new().date_audit(true));
        let original = people.insert(json!({ "name": "a" })).unwrap();

        let result = people
            .update(
                &Filter::new().eq("name", "a"),
                updates(json!({ "name": "b", "age": 30 })),
            )
            .unwrap();
        assert_eq!(result, WriteResult { count: 1 });

        let docs = people.find(&Filter::new()).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, original.id);
        assert_eq!(docs[0].fields["name"], json!("b"));
        assert_eq!(docs[0].fields["age"], json!(30));
        assert_eq!(docs[0].modified_date, original.modified_date);
    }

    #[test]
    fn test_update_without_matches_leaves_file_alone() {
        let (_tmp, people) = setup_collection(CollectionConfig::new());
        people.insert(json!({ "name": "a" })).unwrap();
        let before = std::fs::read_to_string(people.path()).unwrap();

        let result = people
            .update(&Filter::new().eq("name", "zzz"), updates(json!({ "x": 1 })))
            .unwrap();
        assert_eq!(result.count, 0);
        assert_eq!(std::fs::read_to_string(people.path()).unwrap(), before);
    }

    #[test]
    fn test_update_rejects_id_change() {
        let (_tmp, people) = setup_collection(CollectionConfig::new());
        people.insert(json!({ "name": "a" })).unwrap();
        let err = people
            .update(&Filter::new(), updates(json!({ "_id": "x" })))
            .unwrap_err();
        assert!(matches!(err, NodbError::ReservedField { .. }));
    }

    #[test]
    fn test_soft_delete_hides_but_keeps() {
        let (_tmp, people) = setup_collection(CollectionConfig::new());
        people.insert(json!({ "name": "a" })).unwrap();
        people.insert(json!({ "name": "b" })).unwrap();

        let result = people.soft_delete(&Filter::new().eq("name", "a")).unwrap();
        assert_eq!(result.count, 1);
        assert!(people.find(&Filter::new().eq("name", "a")).unwrap().is_empty());
        assert_eq!(people.open().unwrap().data.len(), 2);

        // Already tombstoned documents are not counted again
        let again = people.soft_delete(&Filter::new().eq("name", "a")).unwrap();
        assert_eq!(again.count, 0);

        // Nor can they be updated
        let result = people
            .update(&Filter::new().eq("name", "a"), updates(json!({ "x": 1 })))
            .unwrap();
        assert_eq!(result.count, 0);
    }

    #[test]
    fn test_hard_delete_removes_tombstoned_too() {
        let (_tmp, people) = setup_collection(CollectionConfig::new());
        people.insert(json!({ "name": "a" })).unwrap();
        people.insert(json!({ "name": "b" })).unwrap();
        people.insert(json!({ "name": "a" })).unwrap();
        people.soft_delete(&Filter::new().eq("name", "a")).unwrap();

        let result = people.hard_delete(&Filter::new().eq("name", "a")).unwrap();
        assert_eq!(result.count, 2);
        let file = people.open().unwrap();
        assert_eq!(file.data.len(), 1);
        assert_eq!(file.data[0].fields["name"], json!("b"));
    }

    #[test]
    fn test_hard_delete_multi_field_counts_matches_only() {
        let (_tmp, people) = setup_collection(CollectionConfig::new());
        people.insert(json!({ "name": "a", "team": 1 })).unwrap();
        people.insert(json!({ "name": "a", "team": 2 })).unwrap();
        people.insert(json!({ "name": "b", "team": 1 })).unwrap();

        let result = people
            .hard_delete(&Filter::new().eq("name", "a").eq("team", 1))
            .unwrap();
        assert_eq!(result.count, 1);
        assert_eq!(people.open().unwrap().data.len(), 2);
    }

    #[test]
    fn test_missing_file_is_recreated_on_write() {
        let (_tmp, people) = setup_collection(CollectionConfig::new());
        std::fs::remove_file(people.path()).unwrap();

        assert!(people.find(&Filter::new()).unwrap().is_empty());
        people.insert(json!({ "name": "a" })).unwrap();
        let file = people.open().unwrap();
        assert_eq!(file.descriptor.name, "people");
        assert_eq!(file.data.len(), 1);
    }

    #[test]
    fn test_corrupt_file_surfaces_error() {
        let (_tmp, people) = setup_collection(CollectionConfig::new());
        std::fs::write(people.path(), "not json").unwrap();
        assert!(matches!(
            people.insert(json!({ "name": "a" })),
            Err(NodbError::Json(_))
        ));
        assert!(matches!(
            people.find(&Filter::new()),
            Err(NodbError::Json(_))
        ));
    }

    #[test]
    fn test_date_audit_read_from_file() {
        let (_tmp, people) = setup_collection(CollectionConfig::new());
        let mut file = people.open().unwrap();
        file.descriptor.config.date_audit = true;
        storage::write_json(people.path(), &file).unwrap();

        let doc = people.insert(json!({ "name": "a" })).unwrap();
        assert!(doc.created_date.is_some());
    }

    #[test]
    fn test_config_keys_cannot_shadow_file_fields() {
        let (_tmp, people) = setup_collection(CollectionConfig::new().with("owner", "ops"));
        people.insert(json!({ "name": "a" })).unwrap();

        let file = people.open().unwrap();
        assert_eq!(file.version, FORMAT_VERSION);
        assert_eq!(file.descriptor.name, "people");
        assert_eq!(file.descriptor.config.extra["owner"], json!("ops"));
        assert!(!file.descriptor.config.extra.contains_key("version"));
        assert!(!file.descriptor.config.extra.contains_key("data"));
        assert_eq!(file.data.len(), 1);
    }

    #[test]
    fn test_loads_externally_written_file() {
        let (_tmp, people) = setup_collection(CollectionConfig::new());
        std::fs::write(
            people.path(),
            json!({
                "version": "0.0.1",
                "name": "people",
                "dateAudit": false,
                "data": [
                    { "_id": "a", "name": "live", "created_date": "2024-05-01T10:00:00Z" },
                    { "_id": "b", "name": "hidden", "__deleted": false },
                    {
                        "_id": "c",
                        "name": "precise",
                        "created_date": "2024-05-01T10:00:00.123456Z",
                        "modified_date": "2024-05-01T12:00:00+02:00"
                    }
                ]
            })
            .to_string(),
        )
        .unwrap();

        // Any __deleted value hides the document
        let names: Vec<_> = people
            .find(&Filter::new())
            .unwrap()
            .iter()
            .map(|d| d.fields["name"].clone())
            .collect();
        assert_eq!(names, vec![json!("live"), json!("precise")]);

        // A write keeps the tombstone and the stored precision
        people.update(&Filter::new().eq("_id", "a"), updates(json!({ "x": 1 }))).unwrap();
        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(people.path()).unwrap()).unwrap();
        assert_eq!(raw["data"][0]["created_date"], json!("2024-05-01T10:00:00.000Z"));
        assert_eq!(raw["data"][1]["__deleted"], json!(false));
        assert_eq!(raw["data"][2]["created_date"], json!("2024-05-01T10:00:00.123456Z"));
        assert_eq!(raw["data"][2]["modified_date"], json!("2024-05-01T10:00:00.000Z"));
    }

    #[test]
    fn test_bad_stored_document_is_named() {
        let (_tmp, people) = setup_collection(CollectionConfig::new());
        std::fs::write(
            people.path(),
            json!({
                "version": "0.0.1",
                "name": "people",
                "data": [
                    { "_id": "ok", "name": "a" },
                    { "_id": "broken", "created_date": "yesterday" }
                ]
            })
            .to_string(),
        )
        .unwrap();

        match people.find(&Filter::new()) {
            Err(NodbError::InvalidDocument(msg)) => {
                assert!(msg.contains("entry 1"), "{msg}");
                assert!(msg.contains("broken"), "{msg}");
            }
            other => panic!("expected InvalidDocument, got {other:?}"),
        }
    }
}
