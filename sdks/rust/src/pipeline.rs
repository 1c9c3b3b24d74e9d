//! Deferred-wait batching of single-key calls.
//!
//! While a pipeline is open, single-key calls are submitted immediately but
//! not waited for; their handles are kept in submission order. `end` waits
//! for all of them under one deadline and returns results in submission
//! order, regardless of the order completions arrived in. The deadline is
//! the longest timeout among the queued calls and the drain timeout.

use crate::batch::BatchHandle;
use crate::config::IoMode;
use crate::error::{BridgeError, Result};
use crate::types::{Key, OpResult};
use std::time::{Duration, Instant};
use tracing::debug;

/// Lifecycle of a [`Pipeline`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Idle,
    Open,
    Draining,
    Failed,
}

/// A submitted but not yet waited-for command
#[derive(Debug, Clone)]
pub struct PendingOp {
    pub key: Key,
    pub handle: BatchHandle,
    /// Timeout the call was issued with
    pub timeout: Duration,
}

/// Pipeline state owned by one connection
#[derive(Debug)]
pub struct Pipeline {
    phase: PipelinePhase,
    pending: Vec<PendingOp>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            phase: PipelinePhase::Idle,
            pending: Vec::new(),
        }
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.phase == PipelinePhase::Open
    }

    /// Number of operations queued since `begin`
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Open the pipeline. Fails if one is already in progress or the
    /// connection is driven by an event loop.
    pub fn begin(&mut self, mode: IoMode) -> Result<()> {
        if mode == IoMode::EventLoop {
            return Err(BridgeError::PipelineState(
                "pipelines are not available in event-loop mode".to_string(),
            ));
        }
        if self.phase != PipelinePhase::Idle {
            return Err(BridgeError::PipelineState(
                "pipeline already in progress".to_string(),
            ));
        }
        self.set_phase(PipelinePhase::Open);
        Ok(())
    }

    /// Queue a submitted operation; returns its position in the results
    pub fn push(&mut self, key: Key, handle: BatchHandle, timeout: Duration) -> Result<usize> {
        if !self.is_open() {
            return Err(BridgeError::PipelineState(
                "no pipeline in progress".to_string(),
            ));
        }
        self.pending.push(PendingOp {
            key,
            handle,
            timeout,
        });
        Ok(self.pending.len() - 1)
    }

    /// Move to `Draining` and hand out the queued operations
    pub fn start_drain(&mut self) -> Result<Vec<PendingOp>> {
        if !self.is_open() {
            return Err(BridgeError::PipelineState(
                "no pipeline in progress".to_string(),
            ));
        }
        self.set_phase(PipelinePhase::Draining);
        Ok(std::mem::take(&mut self.pending))
    }

    /// Record the drain outcome and return to `Idle`
    pub fn finish_drain(&mut self, failed: bool) {
        if failed {
            self.set_phase(PipelinePhase::Failed);
        }
        self.pending.clear();
        self.set_phase(PipelinePhase::Idle);
    }

    fn set_phase(&mut self, next: PipelinePhase) {
        debug!(from = ?self.phase, to = ?next, queued = self.pending.len(), "pipeline state change");
        self.phase = next;
    }
}

/// Wait for every pending operation under one shared deadline.
///
/// All operations are waited for even after one fails, so nothing is left
/// outstanding on the connection. The first failure in submission order is
/// then returned; otherwise the results in submission order. A quiet
/// not-found yields no value and is skipped.
pub fn drain(pending: Vec<PendingOp>, timeout: Duration) -> Result<Vec<OpResult>> {
    let timeout = pending
        .iter()
        .map(|op| op.timeout)
        .fold(timeout, Duration::max);
    let deadline = Instant::now() + timeout;
    let outcomes: Vec<(Key, Result<Option<OpResult>>)> = pending
        .into_iter()
        .map(|op| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = op.handle.wait_single(remaining).map_err(|err| match err {
                BridgeError::Timeout { .. } => BridgeError::Timeout { waited: timeout },
                other => other,
            });
            (op.key, outcome)
        })
        .collect();

    let mut results = Vec::with_capacity(outcomes.len());
    for (key, outcome) in outcomes {
        match outcome {
            Ok(Some(result)) => results.push(result),
            Ok(None) => debug!(%key, "pipelined operation returned no value"),
            Err(err) => {
                debug!(%key, error = %err, "pipelined operation failed");
                return Err(err);
            }
        }
    }
    Ok(results)
}
