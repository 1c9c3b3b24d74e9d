//! In-memory transport served by a dedicated I/O thread.
//!
//! Every accepted submission is queued to the `docbridge-io` thread and
//! completed from there, never from inside the submitting call. Useful for
//! tests and for running the blocking core without a cluster.

use crate::error::{BridgeError, ErrorCode, Result};
use crate::scan::{ScanId, ScanLimits, ScanPage, ScanParams, ScanType};
use crate::streaming::StreamProducer;
use crate::transport::{CompletionCallback, ScanCreateCallback, ScanPageCallback, Transport};
use crate::types::{
    Command, Completion, Document, Durability, MutationToken, OpKind, OperationId, ResultBody, Row,
    ScanItem, StreamKind, StreamRequest, ViewRow,
};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const IO_THREAD_NAME: &str = "docbridge-io";
const PARTITIONS: u16 = 1024;

enum Job {
    Op {
        id: OperationId,
        command: Command,
        on_complete: CompletionCallback,
    },
    Stream {
        id: OperationId,
        request: StreamRequest,
        producer: StreamProducer,
    },
    ScanCreate {
        params: ScanParams,
        on_created: ScanCreateCallback,
    },
    ScanContinue {
        scan: ScanId,
        limits: ScanLimits,
        on_page: ScanPageCallback,
    },
}

#[derive(Debug, Clone)]
struct StoredDoc {
    value: Bytes,
    flags: u32,
    cas: u64,
    expires_at: Option<Instant>,
}

impl StoredDoc {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug)]
struct ScanCursor {
    items: VecDeque<ScanItem>,
}

#[derive(Debug, Default)]
struct Store {
    docs: BTreeMap<String, StoredDoc>,
    next_cas: u64,
    seqno: u64,
    scans: HashMap<ScanId, ScanCursor>,
    /// Running streams and whether a cancel was requested
    streams: HashMap<OperationId, bool>,
}

struct LoopbackShared {
    store: Mutex<Store>,
    partition_uuid: u64,
    bucket: String,
    latency: Duration,
    operations: AtomicU64,
    scan_cancels: AtomicU64,
}

/// In-memory [`Transport`] with its own completion thread
pub struct LoopbackTransport {
    shared: Arc<LoopbackShared>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackTransport {
    pub fn new() -> Result<Self> {
        Self::with_latency(Duration::ZERO)
    }

    /// Delay every completion by `latency` on the I/O thread
    pub fn with_latency(latency: Duration) -> Result<Self> {
        let shared = Arc::new(LoopbackShared {
            store: Mutex::new(Store::default()),
            partition_uuid: Uuid::new_v4().as_u64_pair().0,
            bucket: "default".to_string(),
            latency,
            operations: AtomicU64::new(0),
            scan_cancels: AtomicU64::new(0),
        });

        let (sender, receiver) = mpsc::channel::<Job>();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(IO_THREAD_NAME.to_string())
            .spawn(move || run_io_loop(worker_shared, receiver))
            .map_err(|e| {
                BridgeError::transport(ErrorCode::Network, format!("failed to start I/O thread: {}", e))
            })?;
        info!(?latency, "loopback transport started");

        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Partition UUID reported in mutation tokens and checked by scan snapshots
    pub fn partition_uuid(&self) -> u64 {
        self.shared.partition_uuid
    }

    /// Highest sequence number assigned so far
    pub fn sequence_number(&self) -> u64 {
        self.shared.store.lock().seqno
    }

    /// Key-value operations completed so far
    pub fn operations(&self) -> u64 {
        self.shared.operations.load(Ordering::Relaxed)
    }

    /// Scan cancel requests received so far
    pub fn scan_cancels(&self) -> u64 {
        self.shared.scan_cancels.load(Ordering::Relaxed)
    }

    /// Scans holding a server-side cursor
    pub fn active_scans(&self) -> usize {
        self.shared.store.lock().scans.len()
    }

    /// Streams submitted and not yet finished by the I/O thread
    pub fn active_streams(&self) -> usize {
        self.shared.store.lock().streams.len()
    }

    pub fn document_count(&self) -> usize {
        self.shared.store.lock().docs.len()
    }

    /// Stop accepting work and join the I/O thread once queued jobs are done
    pub fn close(&self) {
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        if let Some(worker) = self.worker.lock().take() {
            // A callback may drop the last handle on the I/O thread itself
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                warn!("loopback I/O thread panicked");
            }
        }
        info!("loopback transport closed");
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or_else(|| BridgeError::transport(ErrorCode::Network, "loopback transport is closed"))?;
        sender
            .send(job)
            .map_err(|_| BridgeError::transport(ErrorCode::Network, "loopback I/O thread has exited"))
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl Transport for LoopbackTransport {
    fn submit(&self, command: Command, on_complete: CompletionCallback) -> Result<OperationId> {
        let id = OperationId::next();
        self.enqueue(Job::Op {
            id,
            command,
            on_complete,
        })?;
        Ok(id)
    }

    fn submit_streaming(&self, request: StreamRequest, producer: StreamProducer) -> Result<OperationId> {
        let id = OperationId::next();
        self.shared.store.lock().streams.insert(id, false);
        if let Err(err) = self.enqueue(Job::Stream {
            id,
            request,
            producer,
        }) {
            self.shared.store.lock().streams.remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    fn cancel_stream(&self, id: OperationId) {
        match self.shared.store.lock().streams.get_mut(&id) {
            Some(cancelled) => {
                debug!(%id, "stream cancel requested");
                *cancelled = true;
            }
            None => debug!(%id, "stream already finished, ignoring cancel"),
        }
    }

    fn scan_create(&self, params: &ScanParams, on_created: ScanCreateCallback) -> Result<OperationId> {
        self.enqueue(Job::ScanCreate {
            params: params.clone(),
            on_created,
        })?;
        Ok(OperationId::next())
    }

    fn scan_continue(
        &self,
        scan: &ScanId,
        limits: ScanLimits,
        on_page: ScanPageCallback,
    ) -> Result<OperationId> {
        self.enqueue(Job::ScanContinue {
            scan: scan.clone(),
            limits,
            on_page,
        })?;
        Ok(OperationId::next())
    }

    fn cancel_scan(&self, scan: &ScanId) {
        self.shared.scan_cancels.fetch_add(1, Ordering::Relaxed);
        let released = self.shared.store.lock().scans.remove(scan).is_some();
        debug!(%scan, released, "scan cancel requested");
    }
}

fn run_io_loop(shared: Arc<LoopbackShared>, receiver: mpsc::Receiver<Job>) {
    debug!("loopback I/O loop running");
    while let Ok(job) = receiver.recv() {
        if !shared.latency.is_zero() {
            thread::sleep(shared.latency);
        }
        match job {
            Job::Op {
                id,
                command,
                on_complete,
            } => {
                let completion = shared.execute(command);
                shared.operations.fetch_add(1, Ordering::Relaxed);
                on_complete(id, completion);
            }
            Job::Stream {
                id,
                request,
                producer,
            } => shared.stream(id, request, producer),
            Job::ScanCreate { params, on_created } => {
                let created = shared.create_scan(&params);
                on_created(created);
            }
            Job::ScanContinue {
                scan,
                limits,
                on_page,
            } => {
                let page = shared.next_page(&scan, limits);
                on_page(page);
            }
        }
    }
    debug!("loopback I/O loop stopped");
}

impl LoopbackShared {
    fn execute(&self, command: Command) -> Completion {
        if command.durability != Durability::None && command.kind.is_mutation() {
            return Err(BridgeError::transport(
                ErrorCode::DurabilityImpossible,
                format!("{:?} needs replicas, loopback has none", command.durability),
            ));
        }

        let now = Instant::now();
        let key = command.key;
        let mut store = self.store.lock();
        if store.docs.get(&key).is_some_and(|doc| doc.is_expired(now)) {
            store.docs.remove(&key);
        }

        match command.kind {
            OpKind::Get => {
                let doc = store.docs.get(&key).ok_or_else(|| BridgeError::not_found(&key))?;
                Ok(self.body(doc, None))
            }
            OpKind::Exists => {
                let doc = store.docs.get(&key).ok_or_else(|| BridgeError::not_found(&key))?;
                Ok(ResultBody::Document(Document {
                    cas: doc.cas,
                    flags: doc.flags,
                    ..Default::default()
                }))
            }
            OpKind::Upsert {
                value,
                flags,
                expiry,
            } => Ok(self.store_doc(&mut store, key, value, flags, expiry.map(|e| now + e))),
            OpKind::Insert {
                value,
                flags,
                expiry,
            } => {
                if store.docs.contains_key(&key) {
                    return Err(BridgeError::transport(
                        ErrorCode::KeyExists,
                        format!("document '{}' already exists", key),
                    ));
                }
                Ok(self.store_doc(&mut store, key, value, flags, expiry.map(|e| now + e)))
            }
            OpKind::Replace { value, flags, cas } => {
                let existing = store.docs.get(&key).ok_or_else(|| BridgeError::not_found(&key))?;
                check_cas(&key, existing, cas)?;
                let expires_at = existing.expires_at;
                Ok(self.store_doc(&mut store, key, value, flags, expires_at))
            }
            OpKind::Remove { cas } => {
                let existing = store.docs.get(&key).ok_or_else(|| BridgeError::not_found(&key))?;
                check_cas(&key, existing, cas)?;
                store.docs.remove(&key);
                let token = self.next_token(&mut store, &key);
                let cas = next_cas(&mut store);
                Ok(ResultBody::Document(Document {
                    cas,
                    mutation_token: Some(token),
                    ..Default::default()
                }))
            }
            OpKind::Touch { expiry } => {
                let cas = next_cas(&mut store);
                let doc = store
                    .docs
                    .get_mut(&key)
                    .ok_or_else(|| BridgeError::not_found(&key))?;
                doc.expires_at = Some(now + expiry);
                doc.cas = cas;
                Ok(ResultBody::Document(Document {
                    cas,
                    flags: doc.flags,
                    ..Default::default()
                }))
            }
            OpKind::Counter { delta, initial } => {
                let next = match store.docs.get(&key) {
                    Some(doc) => {
                        let current = std::str::from_utf8(&doc.value)
                            .ok()
                            .and_then(|text| text.trim().parse::<u64>().ok())
                            .ok_or_else(|| {
                                BridgeError::transport(
                                    ErrorCode::Other(0x0006),
                                    format!("document '{}' is not a counter", key),
                                )
                            })?;
                        apply_delta(current, delta)
                    }
                    None => initial.ok_or_else(|| BridgeError::not_found(&key))?,
                };
                let expires_at = store.docs.get(&key).and_then(|doc| doc.expires_at);
                Ok(self.store_doc(&mut store, key, Bytes::from(next.to_string()), 0, expires_at))
            }
        }
    }

    fn store_doc(
        &self,
        store: &mut Store,
        key: String,
        value: Bytes,
        flags: u32,
        expires_at: Option<Instant>,
    ) -> ResultBody {
        let cas = next_cas(store);
        let token = self.next_token(store, &key);
        let doc = StoredDoc {
            value,
            flags,
            cas,
            expires_at,
        };
        let body = self.body(&doc, Some(token));
        store.docs.insert(key, doc);
        body
    }

    fn body(&self, doc: &StoredDoc, token: Option<MutationToken>) -> ResultBody {
        ResultBody::Document(Document {
            value: doc.value.clone(),
            cas: doc.cas,
            flags: doc.flags,
            mutation_token: token,
        })
    }

    fn next_token(&self, store: &mut Store, key: &str) -> MutationToken {
        store.seqno += 1;
        MutationToken {
            partition_id: partition_of(key),
            partition_uuid: self.partition_uuid,
            sequence_number: store.seqno,
            bucket: self.bucket.clone(),
        }
    }

    /// Push documents whose id starts with the statement, one row at a time
    fn stream(&self, id: OperationId, request: StreamRequest, producer: StreamProducer) {
        let now = Instant::now();
        let matches: Vec<(String, Bytes)> = {
            let store = self.store.lock();
            store
                .docs
                .range::<String, _>((Bound::Included(&request.statement), Bound::Unbounded))
                .take_while(|(key, _)| key.starts_with(&request.statement))
                .filter(|(_, doc)| !doc.is_expired(now))
                .map(|(key, doc)| (key.clone(), doc.value.clone()))
                .collect()
        };
        debug!(%id, rows = matches.len(), "streaming request started");

        for (key, value) in matches {
            if self.store.lock().streams.get(&id).copied().unwrap_or(false) {
                debug!(%id, "streaming request cancelled");
                break;
            }
            let row = match &request.kind {
                StreamKind::Query => Row::Query(json!({ "id": key, "value": json_value(&value) })),
                StreamKind::View { .. } => Row::View(ViewRow {
                    id: Some(key.clone()),
                    key: Value::String(key),
                    value: json_value(&value),
                }),
            };
            if !producer.push(row) {
                debug!(%id, "consumer went away, stopping stream");
                break;
            }
        }
        self.store.lock().streams.remove(&id);
        producer.finish();
    }

    fn create_scan(&self, params: &ScanParams) -> Result<ScanId> {
        params.validate()?;
        let now = Instant::now();
        let mut store = self.store.lock();

        if let Some(snapshot) = params.snapshot {
            if snapshot.partition_uuid != self.partition_uuid {
                return Err(BridgeError::transport(
                    ErrorCode::Other(0x00a0),
                    "snapshot partition uuid does not match",
                ));
            }
            if snapshot.sequence_number > store.seqno {
                return Err(BridgeError::transport(
                    ErrorCode::TemporaryFailure,
                    format!(
                        "snapshot at seqno {} not yet available, current {}",
                        snapshot.sequence_number, store.seqno
                    ),
                ));
            }
        }

        let live = store.docs.iter().filter(|(_, doc)| !doc.is_expired(now));
        let mut selected: Vec<(&String, &StoredDoc)> = match &params.scan_type {
            ScanType::Range { from, to } => live
                .filter(|(key, _)| {
                    let key = key.as_str();
                    let above = if from.exclusive {
                        key > from.term.as_str()
                    } else {
                        key >= from.term.as_str()
                    };
                    let below = if to.exclusive {
                        key < to.term.as_str()
                    } else {
                        key <= to.term.as_str()
                    };
                    above && below
                })
                .collect(),
            ScanType::Prefix(prefix) => live
                .filter(|(key, _)| key.starts_with(prefix.as_str()))
                .collect(),
            ScanType::Sampling { .. } => live.collect(),
        };
        if let ScanType::Sampling { limit, seed } = &params.scan_type {
            let mut rng = StdRng::seed_from_u64(seed.unwrap_or(store.seqno));
            selected.shuffle(&mut rng);
            selected.truncate(usize::try_from(*limit).unwrap_or(usize::MAX));
        }

        let items: VecDeque<ScanItem> = selected
            .into_iter()
            .map(|(key, doc)| ScanItem {
                id: key.clone(),
                body: (!params.ids_only).then(|| Document {
                    value: doc.value.clone(),
                    cas: doc.cas,
                    flags: doc.flags,
                    mutation_token: None,
                }),
            })
            .collect();

        let scan_id = ScanId(Uuid::new_v4().to_string());
        debug!(%scan_id, items = items.len(), "scan created");
        store.scans.insert(scan_id.clone(), ScanCursor { items });
        Ok(scan_id)
    }

    fn next_page(&self, scan: &ScanId, limits: ScanLimits) -> Result<ScanPage> {
        let mut store = self.store.lock();
        let cursor = store.scans.get_mut(scan).ok_or_else(|| {
            BridgeError::transport(
                ErrorCode::RangeScanCancelled,
                format!("scan {} is not active", scan),
            )
        })?;

        let mut rows = Vec::new();
        let mut bytes = 0usize;
        while let Some(item) = cursor.items.front() {
            let size = item.id.len() + item.body.as_ref().map_or(0, |doc| doc.value.len());
            // A page always carries at least one item
            if !rows.is_empty()
                && (rows.len() >= limits.item_limit as usize
                    || bytes + size > limits.byte_limit as usize)
            {
                break;
            }
            bytes += size;
            if let Some(item) = cursor.items.pop_front() {
                rows.push(Row::Scan(item));
            }
        }

        let complete = cursor.items.is_empty();
        if complete {
            store.scans.remove(scan);
        }
        Ok(ScanPage { rows, complete })
    }
}

fn next_cas(store: &mut Store) -> u64 {
    store.next_cas += 1;
    store.next_cas
}

fn check_cas(key: &str, doc: &StoredDoc, expected: u64) -> Result<()> {
    if expected != 0 && expected != doc.cas {
        return Err(BridgeError::transport(
            ErrorCode::CasMismatch,
            format!("cas mismatch on '{}'", key),
        ));
    }
    Ok(())
}

/// Counters never go below zero
fn apply_delta(current: u64, delta: i64) -> u64 {
    if delta >= 0 {
        current.wrapping_add(delta.unsigned_abs())
    } else {
        current.saturating_sub(delta.unsigned_abs())
    }
}

fn partition_of(key: &str) -> u16 {
    let hash = key
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
    (hash % u32::from(PARTITIONS)) as u16
}

fn json_value(value: &Bytes) -> Value {
    serde_json::from_slice(value)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(value).into_owned()))
}
