//! Common types for the docbridge SDK

use crate::error::BridgeError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Document key
pub type Key = String;

/// What the transport hands back for one command
pub type Completion = std::result::Result<ResultBody, BridgeError>;

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque token correlating a submitted command with its completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        Self(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Synchronous durability requirement attached to a mutation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    #[default]
    None,
    Majority,
    MajorityAndPersistToActive,
    PersistToMajority,
}

/// Position of a mutation in a partition's history
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationToken {
    pub partition_id: u16,
    pub partition_uuid: u64,
    pub sequence_number: u64,
    pub bucket: String,
}

/// Operation kind carried by a [`Command`]
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Get,
    Exists,
    Upsert {
        value: Bytes,
        flags: u32,
        expiry: Option<Duration>,
    },
    Insert {
        value: Bytes,
        flags: u32,
        expiry: Option<Duration>,
    },
    Replace {
        value: Bytes,
        flags: u32,
        cas: u64,
    },
    Remove {
        cas: u64,
    },
    Touch {
        expiry: Duration,
    },
    Counter {
        delta: i64,
        initial: Option<u64>,
    },
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Exists => "exists",
            Self::Upsert { .. } => "upsert",
            Self::Insert { .. } => "insert",
            Self::Replace { .. } => "replace",
            Self::Remove { .. } => "remove",
            Self::Touch { .. } => "touch",
            Self::Counter { .. } => "counter",
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Get | Self::Exists)
    }
}

/// Immutable description of one key-value command
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub key: Key,
    pub kind: OpKind,
    /// Per-command timeout; the caller's wait timeout applies when unset
    pub timeout: Option<Duration>,
    pub durability: Durability,
    /// Tracing context propagated to the transport
    pub trace_id: Option<String>,
}

impl Command {
    pub fn new(key: impl Into<Key>, kind: OpKind) -> Self {
        Self {
            key: key.into(),
            kind,
            timeout: None,
            durability: Durability::None,
            trace_id: None,
        }
    }

    pub fn get(key: impl Into<Key>) -> Self {
        Self::new(key, OpKind::Get)
    }

    pub fn exists(key: impl Into<Key>) -> Self {
        Self::new(key, OpKind::Exists)
    }

    pub fn upsert(key: impl Into<Key>, value: impl Into<Bytes>) -> Self {
        Self::new(
            key,
            OpKind::Upsert {
                value: value.into(),
                flags: 0,
                expiry: None,
            },
        )
    }

    pub fn insert(key: impl Into<Key>, value: impl Into<Bytes>) -> Self {
        Self::new(
            key,
            OpKind::Insert {
                value: value.into(),
                flags: 0,
                expiry: None,
            },
        )
    }

    pub fn replace(key: impl Into<Key>, value: impl Into<Bytes>) -> Self {
        Self::new(
            key,
            OpKind::Replace {
                value: value.into(),
                flags: 0,
                cas: 0,
            },
        )
    }

    pub fn remove(key: impl Into<Key>) -> Self {
        Self::new(key, OpKind::Remove { cas: 0 })
    }

    pub fn touch(key: impl Into<Key>, expiry: Duration) -> Self {
        Self::new(key, OpKind::Touch { expiry })
    }

    pub fn counter(key: impl Into<Key>, delta: i64, initial: Option<u64>) -> Self {
        Self::new(key, OpKind::Counter { delta, initial })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Set the expected CAS on replace/remove; ignored by other kinds
    pub fn with_cas(mut self, expected: u64) -> Self {
        match &mut self.kind {
            OpKind::Replace { cas, .. } | OpKind::Remove { cas } => *cas = expected,
            _ => {}
        }
        self
    }

    /// Set item flags on a store command; ignored by other kinds
    pub fn with_flags(mut self, item_flags: u32) -> Self {
        match &mut self.kind {
            OpKind::Upsert { flags, .. }
            | OpKind::Insert { flags, .. }
            | OpKind::Replace { flags, .. } => *flags = item_flags,
            _ => {}
        }
        self
    }
}

/// Key-value document payload
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    pub value: Bytes,
    pub cas: u64,
    pub flags: u32,
    pub mutation_token: Option<MutationToken>,
}

impl Document {
    /// Decode the value as JSON
    pub fn content_as<T: DeserializeOwned>(&self) -> crate::Result<T> {
        serde_json::from_slice(&self.value)
            .map_err(|e| BridgeError::InvalidArgument(format!("document is not valid JSON: {}", e)))
    }

    /// Value as UTF-8 text, if it is valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// Raw HTTP response from a service endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

/// One row of a view query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    pub id: Option<String>,
    pub key: serde_json::Value,
    pub value: serde_json::Value,
}

/// One range-scan entry; `body` is `None` for ids-only scans
#[derive(Debug, Clone, PartialEq)]
pub struct ScanItem {
    pub id: String,
    pub body: Option<Document>,
}

/// Result payload, tagged by the kind of operation that produced it
#[derive(Debug, Clone, PartialEq)]
pub enum ResultBody {
    Document(Document),
    HttpResponse(HttpResponse),
    ViewRow(ViewRow),
    ScanRow(ScanItem),
}

impl ResultBody {
    pub fn cas(&self) -> Option<u64> {
        match self {
            Self::Document(doc) => Some(doc.cas),
            Self::ScanRow(item) => item.body.as_ref().map(|doc| doc.cas),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Self::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn into_document(self) -> Option<Document> {
        match self {
            Self::Document(doc) => Some(doc),
            _ => None,
        }
    }
}

/// Successful outcome of a single command
#[derive(Debug, Clone, PartialEq)]
pub struct OpResult {
    pub key: Key,
    pub body: ResultBody,
}

impl OpResult {
    pub fn new(key: impl Into<Key>, body: ResultBody) -> Self {
        Self {
            key: key.into(),
            body,
        }
    }

    pub fn document(&self) -> Option<&Document> {
        self.body.as_document()
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.document().map(|doc| &doc.value)
    }

    pub fn cas(&self) -> Option<u64> {
        self.body.cas()
    }
}

/// One element of a streamed result set
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Query(serde_json::Value),
    View(ViewRow),
    Scan(ScanItem),
}

impl Row {
    /// Approximate payload size, used for scan page accounting
    pub fn approx_size(&self) -> usize {
        match self {
            Self::Query(value) => value.to_string().len(),
            Self::View(row) => {
                row.id.as_ref().map_or(0, |id| id.len())
                    + row.key.to_string().len()
                    + row.value.to_string().len()
            }
            Self::Scan(item) => item.id.len() + item.body.as_ref().map_or(0, |d| d.value.len()),
        }
    }

    pub fn as_scan(&self) -> Option<&ScanItem> {
        match self {
            Self::Scan(item) => Some(item),
            _ => None,
        }
    }
}

/// Kind of streaming request
#[derive(Debug, Clone, PartialEq)]
pub enum StreamKind {
    Query,
    View { design: String, view: String },
}

/// Request producing a row stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub kind: StreamKind,
    pub statement: String,
    pub params: serde_json::Value,
}

impl StreamRequest {
    pub fn query(statement: impl Into<String>) -> Self {
        Self {
            kind: StreamKind::Query,
            statement: statement.into(),
            params: serde_json::Value::Null,
        }
    }

    pub fn view(design: impl Into<String>, view: impl Into<String>) -> Self {
        Self {
            kind: StreamKind::View {
                design: design.into(),
                view: view.into(),
            },
            statement: String::new(),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}
