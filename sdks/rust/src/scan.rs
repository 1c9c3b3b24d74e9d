//! Range-scan sessions.
//!
//! A scan is created once, then paged with CONTINUE requests until the
//! server reports it exhausted, and must be cancelled if abandoned earlier
//! because the server holds cursor state until then. The session feeds the
//! pages into a [`RowStream`] and issues the next CONTINUE whenever the
//! stream's buffer runs low, with at most one CONTINUE in flight.

use crate::config::ClientConfig;
use crate::error::{BridgeError, Result};
use crate::streaming::{RowStream, StreamControl, StreamProducer};
use crate::transport::{ScanCreateCallback, ScanPageCallback, Transport};
use crate::types::Row;
use crate::waiter::Waiter;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// One end of a range scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTerm {
    pub term: String,
    pub exclusive: bool,
}

impl ScanTerm {
    pub fn inclusive(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            exclusive: false,
        }
    }

    pub fn exclusive(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            exclusive: true,
        }
    }
}

/// What a scan enumerates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanType {
    /// Keys between two terms, in key order
    Range { from: ScanTerm, to: ScanTerm },
    /// Keys starting with a prefix, in key order
    Prefix(String),
    /// Random sample of up to `limit` keys
    Sampling { limit: u64, seed: Option<u64> },
}

/// Consistency requirement for the scan snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRequirements {
    pub partition_uuid: u64,
    /// Snapshot must include at least this sequence number
    pub sequence_number: u64,
}

/// Parameters for [`ScanSession::create`]
#[derive(Debug, Clone, PartialEq)]
pub struct ScanParams {
    pub scan_type: ScanType,
    pub snapshot: Option<SnapshotRequirements>,
    pub ids_only: bool,
    /// Overrides the configured page item limit
    pub batch_item_limit: Option<u32>,
    /// Overrides the configured page byte limit
    pub batch_byte_limit: Option<u32>,
    /// Overrides the configured stream deadline
    pub timeout: Option<Duration>,
}

impl ScanParams {
    pub fn new(scan_type: ScanType) -> Self {
        Self {
            scan_type,
            snapshot: None,
            ids_only: false,
            batch_item_limit: None,
            batch_byte_limit: None,
            timeout: None,
        }
    }

    pub fn range(from: ScanTerm, to: ScanTerm) -> Self {
        Self::new(ScanType::Range { from, to })
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::new(ScanType::Prefix(prefix.into()))
    }

    pub fn sampling(limit: u64, seed: Option<u64>) -> Self {
        Self::new(ScanType::Sampling { limit, seed })
    }

    pub fn ids_only(mut self, ids_only: bool) -> Self {
        self.ids_only = ids_only;
        self
    }

    pub fn with_snapshot(mut self, snapshot: SnapshotRequirements) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_batch_limits(mut self, items: u32, bytes: u32) -> Self {
        self.batch_item_limit = Some(items);
        self.batch_byte_limit = Some(bytes);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<()> {
        match &self.scan_type {
            ScanType::Sampling { limit: 0, .. } => {
                return Err(BridgeError::InvalidArgument(
                    "sampling scan limit must be positive".to_string(),
                ));
            }
            ScanType::Range { from, to } if from.term > to.term => {
                return Err(BridgeError::InvalidArgument(format!(
                    "scan range start '{}' is after end '{}'",
                    from.term, to.term
                )));
            }
            _ => {}
        }
        if self.batch_item_limit == Some(0) || self.batch_byte_limit == Some(0) {
            return Err(BridgeError::InvalidArgument(
                "scan batch limits must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Server-assigned scan identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScanId(pub String);

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-page bounds sent with each CONTINUE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanLimits {
    pub item_limit: u32,
    pub byte_limit: u32,
}

/// One CONTINUE response
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPage {
    pub rows: Vec<Row>,
    /// The server has no more rows; the scan is released server-side
    pub complete: bool,
}

/// Lifecycle of a [`ScanSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Created,
    Continuing,
    Exhausted,
    Cancelled,
    Failed,
}

impl ScanPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exhausted | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug)]
struct SessionState {
    phase: ScanPhase,
    outstanding_continue: bool,
    pages: u64,
}

struct SessionInner {
    self_ref: Weak<SessionInner>,
    transport: Arc<dyn Transport>,
    scan_id: ScanId,
    limits: ScanLimits,
    low_watermark: usize,
    state: Mutex<SessionState>,
    producer: StreamProducer,
}

/// Handle to a live range scan
#[derive(Clone)]
pub struct ScanSession {
    inner: Arc<SessionInner>,
    stream: Arc<Mutex<Option<RowStream>>>,
}

impl fmt::Debug for ScanSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanSession")
            .field("scan_id", &self.inner.scan_id)
            .field("state", &*self.inner.state.lock())
            .finish_non_exhaustive()
    }
}

impl ScanSession {
    /// Issue the server-side scan setup and wait for its acceptance.
    ///
    /// If the acceptance arrives after the wait timed out, the orphaned
    /// scan is cancelled from the I/O thread.
    pub fn create(
        transport: Arc<dyn Transport>,
        params: ScanParams,
        config: &ClientConfig,
    ) -> Result<ScanSession> {
        params.validate()?;

        let limits = ScanLimits {
            item_limit: params
                .batch_item_limit
                .unwrap_or(config.scan.batch_item_limit),
            byte_limit: params
                .batch_byte_limit
                .unwrap_or(config.scan.batch_byte_limit),
        };
        let stream_timeout = params.timeout.unwrap_or_else(|| config.stream_timeout());

        let (waiter, completer) = Waiter::new();
        let orphan_transport = Arc::clone(&transport);
        let on_created: ScanCreateCallback = Box::new(move |created| {
            if let Err(Ok(scan_id)) = completer.complete(created) {
                warn!(%scan_id, "scan created after caller gave up, cancelling");
                orphan_transport.cancel_scan(&scan_id);
            }
        });

        transport
            .scan_create(&params, on_created)
            .map_err(|e| BridgeError::ScanSession(format!("create failed: {}", e)))?;
        let scan_id = waiter
            .wait(config.operation_timeout())
            .map_err(|e| match e {
                BridgeError::Timeout { .. } => e,
                other => BridgeError::ScanSession(format!("create failed: {}", other)),
            })?;
        debug!(%scan_id, ?limits, "range scan created");

        let (stream, producer) = RowStream::channel(config.poll_interval(), stream_timeout);
        let inner = Arc::new_cyclic(|self_ref| SessionInner {
            self_ref: self_ref.clone(),
            transport,
            scan_id,
            limits,
            low_watermark: config.scan.low_watermark,
            state: Mutex::new(SessionState {
                phase: ScanPhase::Created,
                outstanding_continue: false,
                pages: 0,
            }),
            producer,
        });
        let stream = stream.with_control(Arc::clone(&inner) as Arc<dyn StreamControl>);

        Ok(ScanSession {
            inner,
            stream: Arc::new(Mutex::new(Some(stream))),
        })
    }

    /// Take the row stream. Only the first call returns it.
    pub fn rows(&self) -> Result<RowStream> {
        self.stream.lock().take().ok_or_else(|| {
            BridgeError::ScanSession("row stream already taken".to_string())
        })
    }

    pub fn scan_id(&self) -> &ScanId {
        &self.inner.scan_id
    }

    pub fn phase(&self) -> ScanPhase {
        self.inner.state.lock().phase
    }

    pub fn pages_received(&self) -> u64 {
        self.inner.state.lock().pages
    }

    pub fn has_outstanding_continue(&self) -> bool {
        self.inner.state.lock().outstanding_continue
    }

    /// Release the server-side scan. Idempotent; no-op once terminal.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

impl SessionInner {
    fn issue_continue(self: &Arc<Self>, buffered: usize) {
        {
            let mut state = self.state.lock();
            if state.phase.is_terminal()
                || state.outstanding_continue
                || buffered > self.low_watermark
            {
                return;
            }
            state.outstanding_continue = true;
            state.phase = ScanPhase::Continuing;
        }

        debug!(scan_id = %self.scan_id, buffered, "issuing scan continue");
        let session = Arc::clone(self);
        let on_page: ScanPageCallback = Box::new(move |page| session.on_page(page));
        if let Err(err) = self
            .transport
            .scan_continue(&self.scan_id, self.limits, on_page)
        {
            self.fail(err);
        }
    }

    fn on_page(self: &Arc<Self>, page: Result<ScanPage>) {
        let page = match page {
            Ok(page) => page,
            Err(err) => {
                self.fail(err);
                return;
            }
        };

        {
            let state = self.state.lock();
            if state.phase == ScanPhase::Cancelled {
                debug!(scan_id = %self.scan_id, rows = page.rows.len(), "discarding page after cancel");
                return;
            }
        }

        for row in page.rows {
            self.producer.push(row);
        }

        let exhausted = {
            let mut state = self.state.lock();
            state.outstanding_continue = false;
            state.pages += 1;
            if page.complete && state.phase == ScanPhase::Continuing {
                state.phase = ScanPhase::Exhausted;
            }
            state.phase == ScanPhase::Exhausted
        };

        if exhausted {
            debug!(scan_id = %self.scan_id, "range scan exhausted");
            self.producer.finish();
        } else {
            // Empty pages would otherwise stall until the consumer's next poll
            self.issue_continue(self.producer.buffered());
        }
    }

    fn fail(&self, err: BridgeError) {
        {
            let mut state = self.state.lock();
            state.outstanding_continue = false;
            if state.phase == ScanPhase::Cancelled {
                debug!(scan_id = %self.scan_id, error = %err, "continue failed after cancel");
                return;
            }
            state.phase = ScanPhase::Failed;
        }
        warn!(scan_id = %self.scan_id, error = %err, "range scan failed");
        self.producer
            .fail(BridgeError::ScanSession(format!("continue failed: {}", err)));
    }

    fn cancel(&self) {
        {
            let mut state = self.state.lock();
            if state.phase.is_terminal() {
                return;
            }
            state.phase = ScanPhase::Cancelled;
        }
        debug!(scan_id = %self.scan_id, "cancelling range scan");
        self.transport.cancel_scan(&self.scan_id);
        self.producer.finish();
    }
}

impl StreamControl for SessionInner {
    fn request_more(&self, buffered: usize) {
        // The page callback needs an owning handle to the session
        if let Some(session) = self.self_ref.upgrade() {
            session.issue_continue(buffered);
        }
    }

    fn cancel(&self) {
        SessionInner::cancel(self);
    }
}
