//! Common test utilities

use docbridge_sdk::{
    BridgeError, Command, Completion, CompletionCallback, Document, OperationId, Result,
    ResultBody, Row, ScanCreateCallback, ScanId, ScanItem, ScanLimits, ScanPage,
    ScanPageCallback, ScanParams, StreamProducer, StreamRequest, Transport,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type PendingOp = (OperationId, Command, CompletionCallback);

#[derive(Default)]
struct Script {
    pending: Vec<PendingOp>,
    submitted: Vec<Command>,
    create_result: Option<Result<ScanId>>,
    pages: VecDeque<Result<ScanPage>>,
    parked_continues: Vec<ScanPageCallback>,
    continue_limits: Vec<ScanLimits>,
    producers: Vec<(OperationId, StreamProducer)>,
}

/// Transport whose completions are driven by the test.
///
/// Key-value submissions are parked until the test completes them, in any
/// order, from another thread. Scan pages are served from a script on
/// short-lived threads; a CONTINUE with no scripted page stays parked.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
    scan_cancels: AtomicUsize,
    stream_cancels: AtomicUsize,
}

#[allow(dead_code)] // Each test binary uses a different subset
impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Commands submitted so far, in submission order
    pub fn submitted(&self) -> Vec<Command> {
        self.script.lock().submitted.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.script.lock().pending.len()
    }

    /// Poll until at least `count` operations are parked
    pub fn wait_for_pending(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.pending_count() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    /// Complete the first parked operation for `key`
    pub fn complete(&self, key: &str, completion: Completion) -> bool {
        let op = {
            let mut script = self.script.lock();
            let index = script.pending.iter().position(|(_, cmd, _)| cmd.key == key);
            index.map(|i| script.pending.remove(i))
        };
        match op {
            Some((id, _, on_complete)) => {
                on_complete(id, completion);
                true
            }
            None => false,
        }
    }

    /// From a new thread, wait for `order.len()` parked operations and
    /// complete them in the given key order
    pub fn complete_in_order(
        self: &Arc<Self>,
        order: Vec<(&'static str, Completion)>,
    ) -> JoinHandle<()> {
        let transport = Arc::clone(self);
        thread::spawn(move || {
            assert!(transport.wait_for_pending(order.len(), Duration::from_secs(5)));
            for (key, completion) in order {
                assert!(transport.complete(key, completion), "no pending op for {}", key);
            }
        })
    }

    /// Drop every parked callback without running it
    pub fn drop_pending(&self) -> usize {
        let mut script = self.script.lock();
        let dropped = script.pending.len();
        script.pending.clear();
        dropped
    }

    pub fn set_create_result(&self, result: Result<ScanId>) {
        self.script.lock().create_result = Some(result);
    }

    pub fn push_page(&self, page: Result<ScanPage>) {
        self.script.lock().pages.push_back(page);
    }

    /// Deliver a scripted page to a parked CONTINUE, if any
    pub fn release_parked_continue(&self, page: Result<ScanPage>) -> bool {
        let parked = self.script.lock().parked_continues.pop();
        match parked {
            Some(on_page) => {
                thread::spawn(move || on_page(page));
                true
            }
            None => false,
        }
    }

    pub fn continues_issued(&self) -> usize {
        self.script.lock().continue_limits.len()
    }

    pub fn continue_limits(&self) -> Vec<ScanLimits> {
        self.script.lock().continue_limits.clone()
    }

    pub fn scan_cancels(&self) -> usize {
        self.scan_cancels.load(Ordering::SeqCst)
    }

    pub fn stream_cancels(&self) -> usize {
        self.stream_cancels.load(Ordering::SeqCst)
    }

    /// Producer of the most recent streaming request
    pub fn last_producer(&self) -> Option<StreamProducer> {
        self.script
            .lock()
            .producers
            .last()
            .map(|(_, producer)| producer.clone())
    }
}

impl Transport for ScriptedTransport {
    fn submit(&self, command: Command, on_complete: CompletionCallback) -> Result<OperationId> {
        let id = OperationId::next();
        let mut script = self.script.lock();
        script.submitted.push(command.clone());
        script.pending.push((id, command, on_complete));
        Ok(id)
    }

    fn submit_streaming(
        &self,
        _request: StreamRequest,
        producer: StreamProducer,
    ) -> Result<OperationId> {
        let id = OperationId::next();
        self.script.lock().producers.push((id, producer));
        Ok(id)
    }

    fn cancel_stream(&self, _id: OperationId) {
        self.stream_cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn scan_create(
        &self,
        _params: &ScanParams,
        on_created: ScanCreateCallback,
    ) -> Result<OperationId> {
        let result = self
            .script
            .lock()
            .create_result
            .take()
            .unwrap_or_else(|| Ok(ScanId("scan-1".to_string())));
        thread::spawn(move || on_created(result));
        Ok(OperationId::next())
    }

    fn scan_continue(
        &self,
        _scan: &ScanId,
        limits: ScanLimits,
        on_page: ScanPageCallback,
    ) -> Result<OperationId> {
        let mut script = self.script.lock();
        script.continue_limits.push(limits);
        match script.pages.pop_front() {
            Some(page) => {
                thread::spawn(move || on_page(page));
            }
            None => script.parked_continues.push(on_page),
        }
        Ok(OperationId::next())
    }

    fn cancel_scan(&self, _scan: &ScanId) {
        self.scan_cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// Successful document completion with `value`
#[allow(dead_code)]
pub fn doc(value: &str) -> Completion {
    Ok(ResultBody::Document(Document {
        value: value.as_bytes().to_vec().into(),
        cas: 1,
        ..Default::default()
    }))
}

#[allow(dead_code)]
pub fn not_found(key: &str) -> Completion {
    Err(BridgeError::not_found(key))
}

/// Scan page of ids-only rows
#[allow(dead_code)]
pub fn page(ids: &[&str], complete: bool) -> Result<ScanPage> {
    Ok(ScanPage {
        rows: ids
            .iter()
            .map(|id| {
                Row::Scan(ScanItem {
                    id: id.to_string(),
                    body: None,
                })
            })
            .collect(),
        complete,
    })
}

/// Ids of scan rows, in order
#[allow(dead_code)]
pub fn scan_ids(rows: &[Row]) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.as_scan().map(|item| item.id.clone()))
        .collect()
}
