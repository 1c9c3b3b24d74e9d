//! Contract between the blocking core and the callback-driven transport.
//!
//! The transport owns the wire protocol, topology and the I/O thread. This
//! crate only needs a non-blocking submit and a completion callback that the
//! I/O thread invokes exactly once per accepted submission.

use crate::error::{BridgeError, ErrorCode, Result};
use crate::scan::{ScanId, ScanLimits, ScanPage, ScanParams};
use crate::streaming::StreamProducer;
use crate::types::{Command, Completion, OperationId, StreamRequest};

/// Invoked by the I/O thread with the originating id and the outcome
pub type CompletionCallback = Box<dyn FnOnce(OperationId, Completion) + Send + 'static>;

/// Invoked once the server accepted or refused a scan
pub type ScanCreateCallback = Box<dyn FnOnce(Result<ScanId>) + Send + 'static>;

/// Invoked with one page of scan results
pub type ScanPageCallback = Box<dyn FnOnce(Result<ScanPage>) + Send + 'static>;

/// Callback-driven transport.
///
/// Contract for every submitting method:
/// - it never blocks the caller and never runs the callback before returning;
/// - on `Ok`, the callback runs exactly once, on the I/O thread;
/// - on `Err`, the callback is dropped without being run.
pub trait Transport: Send + Sync {
    /// Submit a single key-value command
    fn submit(&self, command: Command, on_complete: CompletionCallback) -> Result<OperationId>;

    /// Start a streaming request; rows are pushed through `producer`, which
    /// must be finished or failed exactly once.
    fn submit_streaming(
        &self,
        request: StreamRequest,
        producer: StreamProducer,
    ) -> Result<OperationId> {
        let _ = (request, producer);
        Err(unsupported("streaming requests"))
    }

    /// Best-effort request to stop producing rows for a stream
    fn cancel_stream(&self, id: OperationId) {
        let _ = id;
    }

    /// Issue the server-side setup of a range scan
    fn scan_create(&self, params: &ScanParams, on_created: ScanCreateCallback) -> Result<OperationId> {
        let _ = (params, on_created);
        Err(unsupported("range scans"))
    }

    /// Request the next page of an existing scan
    fn scan_continue(
        &self,
        scan: &ScanId,
        limits: ScanLimits,
        on_page: ScanPageCallback,
    ) -> Result<OperationId> {
        let _ = (scan, limits, on_page);
        Err(unsupported("range scans"))
    }

    /// Release server-held scan state. Best-effort; may race a CONTINUE.
    fn cancel_scan(&self, scan: &ScanId) {
        let _ = scan;
    }
}

fn unsupported(what: &str) -> BridgeError {
    BridgeError::transport(
        ErrorCode::Protocol,
        format!("{} are not supported by this transport", what),
    )
}
