//! docbridge client implementation

use crate::batch::{MultiOptions, MultiResult, submit_batch};
use crate::config::ClientConfig;
use crate::error::{BridgeError, ErrorCode, Result};
use crate::pipeline::{self, Pipeline, PipelinePhase};
use crate::scan::{ScanParams, ScanSession};
use crate::streaming::{RowStream, StreamControl};
use crate::transport::Transport;
use crate::types::{Command, Key, OpResult, OperationId, StreamRequest};
use crate::waiter::wait_one;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Outcome of a single-key call
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The call completed
    Done(OpResult),
    /// The call was queued in an open pipeline at this position
    Queued(usize),
}

impl Reply {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued(_))
    }

    /// The completed result; fails for a queued reply
    pub fn into_result(self) -> Result<OpResult> {
        match self {
            Self::Done(result) => Ok(result),
            Self::Queued(index) => Err(BridgeError::PipelineState(format!(
                "operation {} is queued in a pipeline, read it from pipeline_end",
                index
            ))),
        }
    }
}

/// Cancels a streaming request on the transport
struct TransportStreamControl {
    transport: Arc<dyn Transport>,
    id: OperationId,
}

impl StreamControl for TransportStreamControl {
    fn cancel(&self) {
        debug!(id = %self.id, "cancelling streaming request");
        self.transport.cancel_stream(self.id);
    }
}

/// Main docbridge client
///
/// Clones share the transport, the configuration and the pipeline state.
#[derive(Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    pipeline: Arc<Mutex<Pipeline>>,
}

impl Client {
    /// Create a new client over `transport`
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            transport,
            pipeline: Arc::new(Mutex::new(Pipeline::new())),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Run one command with the configured operation timeout
    pub fn op(&self, command: Command) -> Result<Reply> {
        self.op_with_timeout(command, self.config.operation_timeout())
    }

    /// Run one command, blocking up to `timeout`.
    ///
    /// Inside an open pipeline the command is submitted and queued instead;
    /// `pipeline_end` then waits at least `timeout` for it.
    pub fn op_with_timeout(&self, command: Command, timeout: Duration) -> Result<Reply> {
        if !self.is_pipelining() {
            return wait_one(self.transport.as_ref(), command, timeout).map(Reply::Done);
        }

        // The transport is called with the pipeline unlocked
        let key = command.key.clone();
        let timeout = command.timeout.unwrap_or(timeout);
        let handle = submit_batch(self.transport.as_ref(), vec![command], false);

        let mut pipeline = self.pipeline.lock();
        if pipeline.is_open() {
            let index = pipeline.push(key, handle, timeout)?;
            return Ok(Reply::Queued(index));
        }
        drop(pipeline);

        debug!(%key, "pipeline ended during submit, waiting inline");
        handle
            .wait_single(timeout)?
            .map(Reply::Done)
            .ok_or_else(|| {
                BridgeError::transport(ErrorCode::Protocol, format!("no result for '{}'", key))
            })
    }

    /// Run several commands and collect their results by key.
    ///
    /// Not available while a pipeline is open.
    pub fn multi_op(&self, commands: Vec<Command>, options: MultiOptions) -> Result<MultiResult> {
        if self.pipeline.lock().phase() != PipelinePhase::Idle {
            return Err(BridgeError::PipelineState(
                "multi operations cannot be issued inside a pipeline".to_string(),
            ));
        }

        let timeout = options
            .timeout
            .unwrap_or_else(|| self.config.operation_timeout());
        let count = commands.len();
        let handle = submit_batch(self.transport.as_ref(), commands, options.quiet);
        debug!(count, quiet = options.quiet, "waiting for batch");
        handle.wait(timeout, options.allow_partial)
    }

    /// Start deferring single-key calls
    pub fn pipeline_begin(&self) -> Result<()> {
        self.pipeline.lock().begin(self.config.mode)
    }

    /// Wait for every deferred call and return results in submission order
    pub fn pipeline_end(&self) -> Result<Vec<OpResult>> {
        let pending = self.pipeline.lock().start_drain()?;
        let outcome = pipeline::drain(pending, self.config.operation_timeout());
        self.pipeline.lock().finish_drain(outcome.is_err());
        outcome
    }

    pub fn is_pipelining(&self) -> bool {
        self.pipeline.lock().is_open()
    }

    /// Start a streaming request and return its row iterator.
    ///
    /// `timeout` overrides the configured overall stream deadline.
    pub fn execute_streaming(
        &self,
        request: StreamRequest,
        timeout: Option<Duration>,
    ) -> Result<RowStream> {
        let timeout = timeout.unwrap_or_else(|| self.config.stream_timeout());
        let (stream, producer) = RowStream::channel(self.config.poll_interval(), timeout);
        let id = self.transport.submit_streaming(request, producer)?;
        debug!(%id, ?timeout, "streaming request submitted");

        let control = TransportStreamControl {
            transport: Arc::clone(&self.transport),
            id,
        };
        Ok(stream.with_control(Arc::new(control)))
    }

    /// Create a range scan and return its row iterator.
    ///
    /// Dropping the iterator before it is exhausted cancels the scan.
    pub fn scan_create(&self, params: ScanParams) -> Result<RowStream> {
        ScanSession::create(Arc::clone(&self.transport), params, &self.config)?.rows()
    }

    pub fn get(&self, key: impl Into<Key>) -> Result<Reply> {
        self.op(Command::get(key))
    }

    pub fn exists(&self, key: impl Into<Key>) -> Result<Reply> {
        self.op(Command::exists(key))
    }

    pub fn upsert(&self, key: impl Into<Key>, value: impl Into<Bytes>) -> Result<Reply> {
        self.op(Command::upsert(key, value))
    }

    pub fn insert(&self, key: impl Into<Key>, value: impl Into<Bytes>) -> Result<Reply> {
        self.op(Command::insert(key, value))
    }

    pub fn replace(&self, key: impl Into<Key>, value: impl Into<Bytes>, cas: u64) -> Result<Reply> {
        self.op(Command::replace(key, value).with_cas(cas))
    }

    pub fn remove(&self, key: impl Into<Key>) -> Result<Reply> {
        self.op(Command::remove(key))
    }

    pub fn counter(&self, key: impl Into<Key>, delta: i64, initial: Option<u64>) -> Result<Reply> {
        self.op(Command::counter(key, delta, initial))
    }

    pub fn get_multi<K: Into<Key>>(
        &self,
        keys: impl IntoIterator<Item = K>,
        options: MultiOptions,
    ) -> Result<MultiResult> {
        self.multi_op(keys.into_iter().map(Command::get).collect(), options)
    }

    pub fn upsert_multi<K: Into<Key>, V: Into<Bytes>>(
        &self,
        items: impl IntoIterator<Item = (K, V)>,
        options: MultiOptions,
    ) -> Result<MultiResult> {
        let commands = items
            .into_iter()
            .map(|(key, value)| Command::upsert(key, value))
            .collect();
        self.multi_op(commands, options)
    }

    pub fn remove_multi<K: Into<Key>>(
        &self,
        keys: impl IntoIterator<Item = K>,
        options: MultiOptions,
    ) -> Result<MultiResult> {
        self.multi_op(keys.into_iter().map(Command::remove).collect(), options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IoMode;
    use crate::transport::CompletionCallback;

    /// Transport that refuses everything
    struct ClosedTransport;

    impl Transport for ClosedTransport {
        fn submit(&self, _command: Command, _on_complete: CompletionCallback) -> Result<OperationId> {
            Err(BridgeError::transport(
                crate::error::ErrorCode::Network,
                "not connected",
            ))
        }
    }

    fn client(config: ClientConfig) -> Client {
        Client::new(Arc::new(ClosedTransport), config).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ClientConfig::default().with_operation_timeout(Duration::ZERO);
        assert!(Client::new(Arc::new(ClosedTransport), config).is_err());
    }

    #[test]
    fn test_submit_error_surfaces_from_op() {
        let client = client(ClientConfig::default());
        let err = client.get("k").unwrap_err();
        assert_eq!(err.code(), Some(crate::error::ErrorCode::Network));
    }

    #[test]
    fn test_submit_error_recorded_per_key_in_quiet_batch() {
        let client = client(ClientConfig::default());
        let result = client.get_multi(["a", "b"], MultiOptions::quiet()).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result.errors().len(), 2);
    }

    #[test]
    fn test_pipeline_end_without_begin() {
        let client = client(ClientConfig::default());
        assert!(matches!(
            client.pipeline_end(),
            Err(BridgeError::PipelineState(_))
        ));
    }

    #[test]
    fn test_pipeline_refused_in_event_loop_mode() {
        let client = client(ClientConfig::default().with_mode(IoMode::EventLoop));
        assert!(client.pipeline_begin().is_err());
        assert!(!client.is_pipelining());
    }

    #[test]
    fn test_multi_op_rejected_inside_pipeline() {
        let client = client(ClientConfig::default());
        client.pipeline_begin().unwrap();
        assert!(matches!(
            client.get_multi(["a"], MultiOptions::default()),
            Err(BridgeError::PipelineState(_))
        ));
    }

    #[test]
    fn test_pipelined_submit_error_raised_at_end() {
        let client = client(ClientConfig::default());
        client.pipeline_begin().unwrap();
        assert_eq!(client.get("a").unwrap(), Reply::Queued(0));
        assert_eq!(client.get("b").unwrap(), Reply::Queued(1));
        let err = client.pipeline_end().unwrap_err();
        assert_eq!(err.code(), Some(crate::error::ErrorCode::Network));
        assert!(!client.is_pipelining());
    }

    #[test]
    fn test_queued_reply_into_result_fails() {
        assert!(Reply::Queued(3).into_result().is_err());
    }

    #[test]
    fn test_streaming_unsupported_by_default() {
        let client = client(ClientConfig::default());
        assert!(
            client
                .execute_streaming(StreamRequest::query("x"), None)
                .is_err()
        );
        assert!(client.scan_create(ScanParams::prefix("x")).is_err());
    }
}
