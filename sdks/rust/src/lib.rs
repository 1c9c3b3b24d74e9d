//! # docbridge Rust SDK
//!
//! Blocking, batching and streaming core for a document database client whose
//! transport is entirely callback-driven.
//!
//! ## Features
//!
//! - **Single operations**: block on one completion with a timeout
//! - **Multi operations**: fan out N commands, collect N keyed results, with quiet mode
//! - **Pipelines**: queue single-key calls, wait once, get results in submission order
//! - **Streaming**: pull rows one at a time from query and view requests
//! - **Range scans**: create/continue/cancel sessions exposed as a row iterator
//! - **Loopback transport**: in-memory store with its own I/O thread for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use docbridge_sdk::{Client, ClientConfig, LoopbackTransport, MultiOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(LoopbackTransport::new()?);
//!     let client = Client::new(transport, ClientConfig::default())?;
//!
//!     client.upsert("user:1", "John Doe")?;
//!     let reply = client.get("user:1")?.into_result()?;
//!     println!("Value: {:?}", reply.value());
//!
//!     // Missing keys come back as NotFound entries in quiet mode
//!     let found = client.get_multi(["user:1", "user:2"], MultiOptions::quiet())?;
//!     println!("Found {} entries", found.len());
//!
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod loopback;
pub mod pipeline;
pub mod row_queue;
pub mod scan;
pub mod streaming;
pub mod transport;
pub mod types;
pub mod waiter;

pub use batch::{BatchHandle, Entry, MultiOptions, MultiResult, submit_batch, wait_batch};
pub use client::{Client, Reply};
pub use config::{ClientConfig, IoMode, LoggingConfig, ScanConfig, TimeoutConfig};
pub use error::{BridgeError, ErrorCode, Result};
pub use loopback::LoopbackTransport;
pub use pipeline::{Pipeline, PipelinePhase};
pub use row_queue::{Dequeued, RowQueue};
pub use scan::{
    ScanId, ScanLimits, ScanPage, ScanParams, ScanPhase, ScanSession, ScanTerm, ScanType,
    SnapshotRequirements,
};
pub use streaming::{RowStream, StreamControl, StreamProducer, StreamState};
pub use transport::{CompletionCallback, ScanCreateCallback, ScanPageCallback, Transport};
pub use types::{
    Command, Completion, Document, Durability, HttpResponse, Key, MutationToken, OpKind, OpResult,
    OperationId, ResultBody, Row, ScanItem, StreamKind, StreamRequest, ViewRow,
};
pub use waiter::{Completer, Waiter, wait_one};
