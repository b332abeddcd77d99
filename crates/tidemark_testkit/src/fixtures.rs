//! Test fixtures: a note entity and an in-memory sync harness.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tidemark_engine::{
    EntityCodec, ManualClock, MemoryRemoteStore, RetryConfig, SyncConfig, SyncEngine, SyncError,
    SyncResult,
};
use tidemark_protocol::{Record, RemoteObject};
use tidemark_store::{
    FileWatermarkStore, LocalId, MemoryLocalStore, MemoryWatermarkStore, RowKey, TableSchema,
    WatermarkStore,
};

/// Local table holding notes.
pub const NOTES_TABLE: &str = "notes";
/// Remote bucket holding notes.
pub const NOTES_BUCKET: &str = "notes";
/// Watermark scope of the note sync task.
pub const NOTES_SCOPE: &str = "kavSync.notes";
/// Time the harness clock starts at.
pub const START_TIME: i64 = 1_000_000;

/// A synchronized note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Local primary key.
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalId>,
    /// Remote object id.
    #[serde(rename = "server_id", default)]
    pub remote_id: Option<String>,
    /// Last known remote modification time.
    #[serde(rename = "server_modified", default)]
    pub remote_modified: Option<i64>,
    /// Title.
    pub title: String,
    /// Body text.
    #[serde(default)]
    pub body: String,
}

impl Note {
    /// Creates a note that exists nowhere yet.
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            local_id: None,
            remote_id: None,
            remote_modified: None,
            title: title.into(),
            body: body.into(),
        }
    }

    /// Sets the remote id.
    #[must_use]
    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }
}

/// Maps notes to `notes` rows and remote objects with `title`/`body` fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoteCodec;

impl EntityCodec for NoteCodec {
    type Entity = Note;

    fn from_remote(&self, object: &RemoteObject) -> SyncResult<Note> {
        let title = object
            .fields
            .get("title")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Codec(format!("object {:?} has no title", object.id)))?;
        let body = object
            .fields
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default();

        Ok(Note {
            local_id: None,
            remote_id: object.id.clone(),
            remote_modified: object.modified_at,
            title: title.to_string(),
            body: body.to_string(),
        })
    }

    fn to_remote(&self, note: &Note) -> RemoteObject {
        let object = RemoteObject::new(Record::new())
            .with_field("title", note.title.clone())
            .with_field("body", note.body.clone());
        match &note.remote_id {
            Some(id) => object.with_id(id.clone()),
            None => object,
        }
    }

    fn to_record(&self, note: &Note, modified_at: i64) -> Record {
        let mut record = Record::new();
        if let Some(id) = note.local_id {
            record.insert("_id".into(), json!(id));
        }
        record.insert("server_id".into(), json!(note.remote_id));
        record.insert("server_modified".into(), json!(note.remote_modified));
        record.insert("title".into(), json!(note.title));
        record.insert("body".into(), json!(note.body));
        record.insert("modified".into(), json!(modified_at));
        record
    }

    fn from_record(&self, record: &Record) -> SyncResult<Note> {
        serde_json::from_value(Value::Object(record.clone()))
            .map_err(|e| SyncError::Codec(format!("bad note row: {e}")))
    }

    fn remote_id<'a>(&self, note: &'a Note) -> Option<&'a str> {
        note.remote_id.as_deref()
    }

    fn local_id(&self, note: &Note) -> Option<LocalId> {
        note.local_id
    }

    fn set_remote_state(&self, note: &mut Note, remote_id: &str, modified_at: i64) {
        note.remote_id = Some(remote_id.to_string());
        note.remote_modified = Some(modified_at);
    }
}

/// Schema of the `notes` table with the default bookkeeping columns.
pub fn notes_schema() -> TableSchema {
    TableSchema::new(NOTES_TABLE)
}

/// Builds a remote object field map for a note.
pub fn note_fields(title: &str, body: &str) -> Record {
    let mut fields = Record::new();
    fields.insert("title".into(), json!(title));
    fields.insert("body".into(), json!(body));
    fields
}

/// The engine type the harness builds.
pub type NoteEngine<W = MemoryWatermarkStore> =
    SyncEngine<NoteCodec, MemoryLocalStore, MemoryRemoteStore, W>;

/// In-memory stores and a manual clock shared by one or more engines.
pub struct TestHarness {
    /// Local notes table.
    pub local: Arc<MemoryLocalStore>,
    /// Remote notes bucket.
    pub remote: Arc<MemoryRemoteStore>,
    /// Watermark store.
    pub watermark: Arc<MemoryWatermarkStore>,
    /// Clock supplying cycle times, starting at [`START_TIME`].
    pub clock: Arc<ManualClock>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    /// Creates a harness with the default notes schema.
    pub fn new() -> Self {
        Self::with_schema(notes_schema())
    }

    /// Creates a harness with a custom local schema.
    pub fn with_schema(schema: TableSchema) -> Self {
        Self::with_stores(MemoryLocalStore::new(schema), MemoryRemoteStore::new())
    }

    /// Creates a harness around existing stores.
    pub fn with_stores(local: MemoryLocalStore, remote: MemoryRemoteStore) -> Self {
        Self {
            local: Arc::new(local),
            remote: Arc::new(remote),
            watermark: Arc::new(MemoryWatermarkStore::new()),
            clock: Arc::new(ManualClock::new(START_TIME)),
        }
    }

    /// Creates a second device: fresh local table, watermark and clock, same
    /// remote bucket.
    pub fn sharing_remote(&self) -> Self {
        Self {
            local: Arc::new(MemoryLocalStore::new(self.local.schema().clone())),
            remote: Arc::clone(&self.remote),
            watermark: Arc::new(MemoryWatermarkStore::new()),
            clock: Arc::new(ManualClock::new(START_TIME)),
        }
    }

    /// Default configuration for the note sync task, without retries.
    pub fn config(&self) -> SyncConfig {
        SyncConfig::new(NOTES_SCOPE, NOTES_BUCKET).with_retry(RetryConfig::no_retry())
    }

    /// Builds an engine with [`TestHarness::config`].
    pub fn engine(&self) -> NoteEngine {
        self.engine_with(self.config())
    }

    /// Builds an engine with a custom configuration.
    pub fn engine_with(&self, config: SyncConfig) -> NoteEngine {
        self.engine_with_watermark(config, Arc::clone(&self.watermark))
    }

    /// Builds an engine persisting its watermark somewhere else.
    pub fn engine_with_watermark<W: WatermarkStore>(
        &self,
        config: SyncConfig,
        watermark: Arc<W>,
    ) -> NoteEngine<W> {
        SyncEngine::new(
            config,
            NoteCodec,
            Arc::clone(&self.local),
            Arc::clone(&self.remote),
            watermark,
        )
        .with_clock(self.clock.clone())
    }

    /// Stores a note remotely as another client would, returning its id.
    pub fn seed_remote(&self, title: &str, modified_at: i64) -> String {
        self.remote
            .seed(NOTES_BUCKET, note_fields(title, ""), modified_at)
    }

    /// Inserts a note locally with the given local modification time.
    pub fn insert_local(&self, note: &Note, modified_at: i64) -> LocalId {
        self.local
            .insert(&NoteCodec.to_record(note, modified_at))
            .expect("insert failed")
            .expect("insert rejected by a constraint")
    }

    /// Reads a note back from the local table.
    pub fn local_note(&self, key: RowKey<'_>) -> Option<Note> {
        let row = self.local.get(key)?;
        Some(NoteCodec.from_record(&row).expect("stored row is a note"))
    }

    /// Every local note, ordered by local id.
    pub fn local_notes(&self) -> Vec<Note> {
        self.local
            .rows()
            .iter()
            .map(|row| NoteCodec.from_record(row).expect("stored row is a note"))
            .collect()
    }

    /// Reads the note watermark.
    pub fn watermark(&self) -> i64 {
        self.watermark.get(NOTES_SCOPE).expect("watermark read failed")
    }
}

/// A file watermark store in a temporary directory.
pub struct TempWatermark {
    /// The store.
    pub store: Arc<FileWatermarkStore>,
    /// The temporary directory (kept alive to prevent cleanup).
    pub dir: TempDir,
}

impl TempWatermark {
    /// Opens a fresh store under a new temporary directory.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let store = FileWatermarkStore::open(&dir.path().join("watermarks.json"))
            .expect("Failed to open watermark store");
        Self {
            store: Arc::new(store),
            dir,
        }
    }
}

impl Default for TempWatermark {
    fn default() -> Self {
        Self::new()
    }
}
