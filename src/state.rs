//! # State Store
//!
//! Read-through access to the two artifacts the organs write: a JSON telemetry
//! snapshot and a free-text status document ("blackboard").
//!
//! ## Guarantees
//! - No caching: every call re-reads the backing artifact.
//! - Never panics and never surfaces a fault: a missing, unreadable, or torn
//!   artifact comes back as [`NotFound`], which callers render as an offline
//!   payload.
//! - Read-only: the bridge never writes either artifact.
//!
//! The external writer does not write atomically, so a read overlapping a
//! write can observe a partial file. That shows up here as
//! [`NotFound::Malformed`] and is retried naturally by the next read.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

/// Opaque telemetry record: a JSON object of key to arbitrary value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Snapshot(pub serde_json::Map<String, serde_json::Value>);

impl Snapshot {
    /// Parse raw bytes into a snapshot. Anything other than a JSON object is
    /// rejected.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(bytes).map(Snapshot)
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.0.clone())
    }
}

/// Opaque free-form status text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusDocument(pub String);

impl StatusDocument {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Why an artifact could not be produced. All variants mean "offline".
#[derive(Debug, thiserror::Error)]
pub enum NotFound {
    #[error("{path} does not exist")]
    Missing { path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not a JSON object: {detail}")]
    Malformed { path: PathBuf, detail: String },
}

/// Storage port shared by request handlers, the push daemon and every
/// streaming session. Implementations must be safe to call concurrently and
/// must not hold locks across calls.
pub trait StateStore: Send + Sync + 'static {
    fn read_snapshot(&self) -> Result<Snapshot, NotFound>;
    fn read_status_document(&self) -> Result<StatusDocument, NotFound>;
}

/// Key of the sentinel payload served in place of a missing artifact.
pub const OFFLINE_KEY: &str = "error";

/// `{"error": "offline"}`
pub fn offline_payload() -> serde_json::Value {
    serde_json::json!({ OFFLINE_KEY: "offline" })
}

/// The snapshot as JSON, or [`offline_payload`] when it can't be read.
pub fn snapshot_or_offline(store: &dyn StateStore) -> serde_json::Value {
    match store.read_snapshot() {
        Ok(snapshot) => snapshot.to_value(),
        Err(e) => {
            tracing::debug!(error = %e, "snapshot unavailable");
            offline_payload()
        }
    }
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// The production store: two paths on local disk.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    snapshot_path: PathBuf,
    document_path: PathBuf,
}

impl FileStateStore {
    pub fn new(snapshot_path: impl Into<PathBuf>, document_path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_path: snapshot_path.into(),
            document_path: document_path.into(),
        }
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn document_path(&self) -> &Path {
        &self.document_path
    }
}

fn read_artifact(path: &Path) -> Result<Vec<u8>, NotFound> {
    std::fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            NotFound::Missing {
                path: path.to_path_buf(),
            }
        } else {
            NotFound::Unreadable {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })
}

impl StateStore for FileStateStore {
    fn read_snapshot(&self) -> Result<Snapshot, NotFound> {
        let bytes = read_artifact(&self.snapshot_path)?;
        Snapshot::from_slice(&bytes).map_err(|e| NotFound::Malformed {
            path: self.snapshot_path.clone(),
            detail: e.to_string(),
        })
    }

    fn read_status_document(&self) -> Result<StatusDocument, NotFound> {
        let bytes = read_artifact(&self.document_path)?;
        String::from_utf8(bytes)
            .map(StatusDocument)
            .map_err(|e| NotFound::Malformed {
                path: self.document_path.clone(),
                detail: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Store backed by raw bytes held in memory. Stands in for the organs'
/// files in tests and in embedders that produce telemetry in-process; the raw
/// form lets callers simulate torn writes.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshot: Mutex<Option<Vec<u8>>>,
    document: Mutex<Option<String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot bytes (`None` removes the artifact).
    pub fn set_snapshot_raw(&self, raw: Option<&[u8]>) {
        if let Ok(mut guard) = self.snapshot.lock() {
            *guard = raw.map(<[u8]>::to_vec);
        }
    }

    pub fn set_snapshot(&self, value: &serde_json::Value) {
        let raw = serde_json::to_vec(value).unwrap_or_default();
        self.set_snapshot_raw(Some(&raw));
    }

    pub fn set_document(&self, text: Option<&str>) {
        if let Ok(mut guard) = self.document.lock() {
            *guard = text.map(str::to_string);
        }
    }
}

const MEMORY_SNAPSHOT: &str = "<memory:snapshot>";
const MEMORY_DOCUMENT: &str = "<memory:document>";

impl StateStore for MemoryStateStore {
    fn read_snapshot(&self) -> Result<Snapshot, NotFound> {
        let raw = self
            .snapshot
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .ok_or_else(|| NotFound::Missing {
                path: PathBuf::from(MEMORY_SNAPSHOT),
            })?;
        Snapshot::from_slice(&raw).map_err(|e| NotFound::Malformed {
            path: PathBuf::from(MEMORY_SNAPSHOT),
            detail: e.to_string(),
        })
    }

    fn read_status_document(&self) -> Result<StatusDocument, NotFound> {
        self.document
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .map(StatusDocument)
            .ok_or_else(|| NotFound::Missing {
                path: PathBuf::from(MEMORY_DOCUMENT),
            })
    }
}
