//! Batch aggregation of independently completing commands.
//!
//! A batch fans out N commands and collects N completions keyed by document
//! key. Completions arrive in any order; the result is a lookup map, so
//! arrival order never matters. When the same key is submitted twice the
//! entry left in the map is whichever completion arrived last, which is
//! unspecified. Batch failures are always reported from that final map.

use crate::error::{BridgeError, Result};
use crate::transport::{CompletionCallback, Transport};
use crate::types::{Command, Completion, Key, OpResult, OperationId};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-key outcome of a batch
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Value(OpResult),
    /// Key did not exist and the batch was quiet
    NotFound,
    Failed(BridgeError),
}

impl Entry {
    pub fn is_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    pub fn value(&self) -> Option<&OpResult> {
        match self {
            Self::Value(result) => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&BridgeError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<Option<OpResult>> {
        match self {
            Self::Value(result) => Ok(Some(result)),
            Self::NotFound => Ok(None),
            Self::Failed(err) => Err(err),
        }
    }
}

/// Options for a multi-key call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultiOptions {
    /// Overrides the configured operation timeout
    pub timeout: Option<Duration>,
    /// Store not-found as [`Entry::NotFound`] and never raise per-key errors
    pub quiet: bool,
    /// On timeout, return what completed so far instead of failing
    pub allow_partial: bool,
}

impl MultiOptions {
    pub fn quiet() -> Self {
        Self {
            quiet: true,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn with_partial_results(mut self, allow: bool) -> Self {
        self.allow_partial = allow;
        self
    }
}

/// Keyed results of a batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiResult {
    entries: HashMap<Key, Entry>,
    pending: Vec<Key>,
}

impl MultiResult {
    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the wait timed out and partial results were requested
    pub fn is_partial(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Keys still outstanding when a partial result was taken
    pub fn pending_keys(&self) -> &[Key] {
        &self.pending
    }

    pub fn all_ok(&self) -> bool {
        self.entries.values().all(Entry::is_value)
    }

    /// Failed keys, sorted by key
    pub fn errors(&self) -> Vec<(&Key, &BridgeError)> {
        let mut failed: Vec<_> = self
            .entries
            .iter()
            .filter_map(|(key, entry)| entry.error().map(|err| (key, err)))
            .collect();
        failed.sort_by(|a, b| a.0.cmp(b.0));
        failed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Entry)> {
        self.entries.iter()
    }

    /// Successful values only; fails on the first errored key
    pub fn into_values(self) -> Result<HashMap<Key, OpResult>> {
        let mut values = HashMap::with_capacity(self.entries.len());
        for (key, entry) in self.entries {
            if let Some(result) = entry.into_result()? {
                values.insert(key, result);
            }
        }
        Ok(values)
    }
}

impl IntoIterator for MultiResult {
    type Item = (Key, Entry);
    type IntoIter = std::collections::hash_map::IntoIter<Key, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[derive(Debug)]
struct BatchState {
    submitted: usize,
    remaining: usize,
    keys: Vec<Key>,
    results: HashMap<Key, Entry>,
    /// Key of the first failure to arrive
    first_error: Option<Key>,
    /// The waiter timed out; later completions are logged and dropped
    abandoned: bool,
    /// Results were handed to a caller
    consumed: bool,
}

#[derive(Debug)]
struct BatchShared {
    state: Mutex<BatchState>,
    done: Condvar,
    quiet: bool,
}

impl BatchShared {
    fn record(&self, key: Key, completion: Completion) {
        let entry = match completion {
            Ok(body) => Entry::Value(OpResult::new(key.clone(), body)),
            Err(err) if self.quiet && err.is_not_found() => Entry::NotFound,
            Err(err) => Entry::Failed(err),
        };

        let mut state = self.state.lock();
        if state.remaining == 0 {
            drop(state);
            warn!(%key, "completion for an already finished batch, discarding");
            return;
        }
        state.remaining -= 1;
        let finished = state.remaining == 0;

        if state.abandoned || state.consumed {
            let remaining = state.remaining;
            drop(state);
            warn!(%key, remaining, "completion arrived after batch timed out, discarding");
            return;
        }

        if matches!(entry, Entry::Failed(_)) && state.first_error.is_none() {
            state.first_error = Some(key.clone());
        }
        state.results.insert(key, entry);
        drop(state);

        if finished {
            self.done.notify_all();
        }
    }
}

/// Shared handle to an in-flight batch
#[derive(Debug, Clone)]
pub struct BatchHandle {
    shared: Arc<BatchShared>,
}

impl BatchHandle {
    fn new(keys: Vec<Key>, quiet: bool) -> Self {
        let count = keys.len();
        Self {
            shared: Arc::new(BatchShared {
                state: Mutex::new(BatchState {
                    submitted: count,
                    remaining: count,
                    keys,
                    results: HashMap::with_capacity(count),
                    first_error: None,
                    abandoned: false,
                    consumed: false,
                }),
                done: Condvar::new(),
                quiet,
            }),
        }
    }

    pub fn submitted(&self) -> usize {
        self.shared.state.lock().submitted
    }

    pub fn remaining(&self) -> usize {
        self.shared.state.lock().remaining
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    pub fn is_quiet(&self) -> bool {
        self.shared.quiet
    }

    /// Block until every completion arrived or `timeout` elapses.
    ///
    /// Non-quiet batches fail with [`BridgeError::PartialBatchFailure`] when
    /// any key errored, listing the first error to arrive first. On timeout
    /// the batch is abandoned unless `allow_partial` is set.
    pub fn wait(&self, timeout: Duration, allow_partial: bool) -> Result<MultiResult> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        if state.consumed || state.abandoned {
            return Err(BridgeError::InvalidArgument(
                "batch results were already consumed".to_string(),
            ));
        }

        while state.remaining > 0 {
            if self.shared.done.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        if state.remaining > 0 {
            if !allow_partial {
                state.abandoned = true;
                state.results.clear();
                debug!(
                    submitted = state.submitted,
                    remaining = state.remaining,
                    "batch wait timed out"
                );
                return Err(BridgeError::Timeout { waited: timeout });
            }
            state.consumed = true;
            let entries = std::mem::take(&mut state.results);
            let mut seen = HashSet::new();
            let pending = state
                .keys
                .iter()
                .filter(|key| !entries.contains_key(*key) && seen.insert(*key))
                .cloned()
                .collect();
            return Ok(MultiResult { entries, pending });
        }

        state.consumed = true;
        let entries = std::mem::take(&mut state.results);
        let first_error = state.first_error.take();
        drop(state);

        if !self.shared.quiet {
            let mut failed: Vec<_> = entries
                .iter()
                .filter_map(|(key, entry)| entry.error().map(|err| (key.clone(), err.clone())))
                .collect();
            if !failed.is_empty() {
                failed.sort_by(|a, b| a.0.cmp(&b.0));
                // A later completion may have replaced the first failure
                let first_pos =
                    first_error.and_then(|first| failed.iter().position(|f| f.0 == first));
                if let Some(pos) = first_pos {
                    let first = failed.remove(pos);
                    failed.insert(0, first);
                }
                return Err(BridgeError::PartialBatchFailure { failed });
            }
        }

        Ok(MultiResult {
            entries,
            pending: Vec::new(),
        })
    }

    /// Wait on a one-command batch and unwrap its single outcome.
    ///
    /// Per-key errors come back as-is rather than wrapped in
    /// `PartialBatchFailure`.
    pub fn wait_single(&self, timeout: Duration) -> Result<Option<OpResult>> {
        match self.wait(timeout, false) {
            Ok(result) => match result.into_iter().next() {
                Some((_, entry)) => entry.into_result(),
                None => Ok(None),
            },
            Err(BridgeError::PartialBatchFailure { mut failed }) if failed.len() == 1 => {
                Err(failed.remove(0).1)
            }
            Err(err) => Err(err),
        }
    }
}

/// Fan `commands` out to the transport and return a handle to wait on.
///
/// A command the transport refuses at submit time is recorded as a
/// failed entry for its key; the batch itself is still returned.
pub fn submit_batch(
    transport: &dyn Transport,
    commands: Vec<Command>,
    quiet: bool,
) -> BatchHandle {
    let keys = commands.iter().map(|c| c.key.clone()).collect();
    let handle = BatchHandle::new(keys, quiet);

    for command in commands {
        let key = command.key.clone();
        let shared = Arc::clone(&handle.shared);
        let callback_key = key.clone();
        let on_complete: CompletionCallback = Box::new(move |_id: OperationId, completion| {
            shared.record(callback_key, completion);
        });

        if let Err(err) = transport.submit(command, on_complete) {
            debug!(%key, error = %err, "batch submit refused");
            handle.shared.record(key, Err(err));
        }
    }

    handle
}

/// Wait for a batch created by [`submit_batch`]
pub fn wait_batch(handle: &BatchHandle, timeout: Duration, allow_partial: bool) -> Result<MultiResult> {
    handle.wait(timeout, allow_partial)
}
