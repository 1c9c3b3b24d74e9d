//! Pull-based row streaming over a [`RowQueue`].
//!
//! The transport pushes rows through a [`StreamProducer`] on the I/O thread;
//! the caller pulls them one at a time from a [`RowStream`]. A stream moves
//! `Initialized -> Streaming -> Complete | Failed | Cancelled`, and terminal
//! states never change again.
//!
//! `RowStream::next_row` takes `&mut self`, so a stream has exactly one
//! consumer at a time.

use crate::error::{BridgeError, Result};
use crate::row_queue::{Dequeued, RowQueue};
use crate::types::Row;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Lifecycle of a [`RowStream`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Initialized,
    Streaming,
    Complete,
    Failed,
    Cancelled,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

/// Hooks from a stream back into whatever feeds it
pub trait StreamControl: Send + Sync {
    /// Called before each wait with the number of rows currently buffered
    fn request_more(&self, buffered: usize) {
        let _ = buffered;
    }

    /// Ask the producer to stop. Must be safe to call more than once.
    fn cancel(&self);
}

#[derive(Debug, Default)]
struct StreamShared {
    queue: RowQueue<Row>,
    error: Mutex<Option<BridgeError>>,
}

/// Producer half of a row stream, handed to the transport
#[derive(Debug, Clone)]
pub struct StreamProducer {
    shared: Arc<StreamShared>,
}

impl StreamProducer {
    /// Enqueue a row. Returns `false` if the stream is already closed.
    pub fn push(&self, row: Row) -> bool {
        self.shared.queue.put(row)
    }

    /// Mark the stream failed and close it. The first error wins.
    pub fn fail(&self, err: BridgeError) {
        {
            let mut slot = self.shared.error.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.shared.queue.close();
    }

    /// Signal that no more rows will be produced
    pub fn finish(&self) {
        self.shared.queue.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.is_closed()
    }

    /// Rows pushed but not yet pulled
    pub fn buffered(&self) -> usize {
        self.shared.queue.size()
    }
}

/// Consumer half of a row stream
pub struct RowStream {
    shared: Arc<StreamShared>,
    control: Option<Arc<dyn StreamControl>>,
    state: StreamState,
    poll_interval: Duration,
    timeout: Duration,
    deadline: Instant,
    terminal_error: Option<BridgeError>,
    rows_yielded: u64,
    error_reported: bool,
}

impl fmt::Debug for RowStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowStream")
            .field("state", &self.state)
            .field("buffered", &self.shared.queue.size())
            .field("rows_yielded", &self.rows_yielded)
            .finish_non_exhaustive()
    }
}

impl RowStream {
    /// Create a connected stream/producer pair.
    ///
    /// `poll_interval` bounds each wait on the queue; `timeout` is the overall
    /// deadline, counted from now.
    pub fn channel(poll_interval: Duration, timeout: Duration) -> (RowStream, StreamProducer) {
        let shared = Arc::new(StreamShared::default());
        let stream = RowStream {
            shared: Arc::clone(&shared),
            control: None,
            state: StreamState::Initialized,
            poll_interval,
            timeout,
            deadline: Instant::now() + timeout,
            terminal_error: None,
            rows_yielded: 0,
            error_reported: false,
        };
        (stream, StreamProducer { shared })
    }

    /// Attach the producer-side hooks used for refill and cancellation
    pub fn with_control(mut self, control: Arc<dyn StreamControl>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn rows_yielded(&self) -> u64 {
        self.rows_yielded
    }

    /// Pull the next row.
    ///
    /// Returns `Ok(None)` at end of stream and on every call after it. A
    /// failed stream returns its error on every call.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        match self.state {
            StreamState::Complete | StreamState::Cancelled => return Ok(None),
            StreamState::Failed => return Err(self.failure()),
            StreamState::Initialized => self.transition(StreamState::Streaming),
            StreamState::Streaming => {}
        }

        loop {
            if let Some(control) = &self.control {
                control.request_more(self.shared.queue.size());
            }

            let remaining = self.deadline.saturating_duration_since(Instant::now());
            match self.shared.queue.get(self.poll_interval.min(remaining)) {
                Dequeued::Item(row) => {
                    self.rows_yielded += 1;
                    return Ok(Some(row));
                }
                Dequeued::Empty => {
                    if Instant::now() >= self.deadline {
                        let err = BridgeError::Timeout {
                            waited: self.timeout,
                        };
                        self.fail(err.clone());
                        // Release producer-side resources held for this stream
                        if let Some(control) = &self.control {
                            control.cancel();
                        }
                        return Err(err);
                    }
                }
                Dequeued::Closed => {
                    let producer_error = self.shared.error.lock().clone();
                    return match producer_error {
                        Some(err) => {
                            self.fail(err.clone());
                            Err(err)
                        }
                        None => {
                            self.transition(StreamState::Complete);
                            Ok(None)
                        }
                    };
                }
            }
        }
    }

    /// Stop the stream. Safe to call at any time, any number of times.
    ///
    /// Rows still in flight are discarded. If the producer already reported
    /// a failure the stream ends `Failed` instead of `Cancelled`.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.shared.queue.close();
        let discarded = self.shared.queue.clear();

        let producer_error = self.shared.error.lock().clone();
        match producer_error {
            Some(err) => self.fail(err),
            None => self.transition(StreamState::Cancelled),
        }
        debug!(discarded, "row stream cancelled");

        if let Some(control) = &self.control {
            control.cancel();
        }
    }

    /// Collect every remaining row
    pub fn collect_rows(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row()? {
            rows.push(row);
        }
        Ok(rows)
    }

    fn failure(&self) -> BridgeError {
        self.terminal_error
            .clone()
            .unwrap_or(BridgeError::CancelledByCaller)
    }

    fn fail(&mut self, err: BridgeError) {
        self.terminal_error = Some(err);
        self.transition(StreamState::Failed);
    }

    fn transition(&mut self, next: StreamState) {
        debug!(from = ?self.state, to = ?next, rows = self.rows_yielded, "row stream state change");
        self.state = next;
    }
}

impl Iterator for RowStream {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.error_reported {
            return None;
        }
        match self.next_row() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => None,
            Err(err) => {
                self.error_reported = true;
                Some(Err(err))
            }
        }
    }
}

impl Drop for RowStream {
    fn drop(&mut self) {
        self.cancel();
    }
}
