//! Single-operation waiter.
//!
//! A [`Waiter`] and its [`Completer`] share one reference-counted result
//! slot. The caller blocks in [`Waiter::wait`]; the I/O thread fills the
//! slot through [`Completer::complete`]. If the caller times out first the
//! slot stays alive until the completer is dropped, so a late completion
//! never touches freed state. Whichever side drops last frees the slot.

use crate::error::{BridgeError, ErrorCode, Result};
use crate::transport::{CompletionCallback, Transport};
use crate::types::{Command, OpResult, OperationId};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug)]
struct SlotState<T> {
    result: Option<Result<T>>,
    /// The waiter gave up; late completions are discarded
    abandoned: bool,
}

#[derive(Debug)]
struct Slot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

/// Caller side of a result slot
#[derive(Debug)]
pub struct Waiter<T> {
    slot: Arc<Slot<T>>,
}

/// Completion side of a result slot; consumed by [`Completer::complete`]
#[derive(Debug)]
pub struct Completer<T> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T> Waiter<T> {
    /// Create a connected waiter/completer pair
    pub fn new() -> (Waiter<T>, Completer<T>) {
        let slot = Arc::new(Slot {
            state: Mutex::new(SlotState {
                result: None,
                abandoned: false,
            }),
            ready: Condvar::new(),
        });
        (
            Waiter {
                slot: Arc::clone(&slot),
            },
            Completer { slot: Some(slot) },
        )
    }

    /// Block until the completion arrives or `timeout` elapses.
    pub fn wait(self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock();
        while state.result.is_none() {
            if self.slot.ready.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        match state.result.take() {
            Some(result) => result,
            None => {
                state.abandoned = true;
                Err(BridgeError::Timeout { waited: timeout })
            }
        }
    }

    /// Take the result without blocking, if it already arrived
    pub fn try_take(&self) -> Option<Result<T>> {
        self.slot.state.lock().result.take()
    }
}

impl<T> Completer<T> {
    /// Store the result and wake the waiter.
    ///
    /// Returns the value back as `Err` when the waiter already timed out,
    /// letting the caller release anything the value holds.
    pub fn complete(mut self, result: Result<T>) -> std::result::Result<(), Result<T>> {
        match self.slot.take() {
            Some(slot) => Self::fill(&slot, result),
            None => Err(result),
        }
    }

    fn fill(slot: &Slot<T>, result: Result<T>) -> std::result::Result<(), Result<T>> {
        let mut state = slot.state.lock();
        if state.abandoned {
            return Err(result);
        }
        state.result = Some(result);
        drop(state);
        slot.ready.notify_all();
        Ok(())
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        // A transport that drops its callback must not leave the waiter
        // hanging until the deadline.
        if let Some(slot) = self.slot.take() {
            let _ = Self::fill(
                &slot,
                Err(BridgeError::transport(
                    ErrorCode::Protocol,
                    "operation dropped without completion",
                )),
            );
        }
    }
}

/// Submit `command` and block until its completion or `timeout`.
pub fn wait_one(transport: &dyn Transport, command: Command, timeout: Duration) -> Result<OpResult> {
    let key = command.key.clone();
    let timeout = command.timeout.unwrap_or(timeout);
    let (waiter, completer) = Waiter::new();

    let callback_key = key.clone();
    let on_complete: CompletionCallback = Box::new(move |id: OperationId, completion| {
        if completer.complete(completion).is_err() {
            warn!(%id, key = %callback_key, "completion arrived after waiter timed out, discarding");
        }
    });

    let id = transport.submit(command, on_complete)?;
    debug!(%id, %key, "waiting for single operation");
    let body = waiter.wait(timeout)?;
    Ok(OpResult::new(key, body))
}
