//! Transport Bridge
//!
//! Registers pending port requests and hands them to an out-of-process or
//! in-process executor through a request stream. Each request owns a
//! single-shot completion slot: the first completion wins and is the value
//! the waiting caller observes; a second completion attempt is rejected as a
//! programming error rather than silently overwriting anything.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use super::TransportError;
use crate::types::{PortId, RequestId};

/// What the executor is asked to do on a port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRequestKind {
    Open { baud: u32 },
    Read { max_len: u32 },
    Write { bytes: Vec<u8> },
    BytesAvailable,
}

impl PortRequestKind {
    pub fn name(&self) -> &'static str {
        match self {
            PortRequestKind::Open { .. } => "open",
            PortRequestKind::Read { .. } => "read",
            PortRequestKind::Write { .. } => "write",
            PortRequestKind::BytesAvailable => "bytes_available",
        }
    }
}

/// One outstanding request handed to the executor
#[derive(Debug)]
pub struct PortRequest {
    pub request_id: RequestId,
    pub port: PortId,
    pub kind: PortRequestKind,
}

/// Successful completion payload, one variant per request kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortResponse {
    Opened,
    Bytes(Vec<u8>),
    Written,
    Available(u32),
}

/// Raw byte-level activity, published for transport subscribers
#[derive(Debug, Clone)]
pub struct PortActivity {
    pub port: PortId,
    pub direction: PortDirection,
    pub bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Sent,
    Received,
}

/// Awaitable handle for one pending request
///
/// Resolves when the executor delivers the completion; yields
/// `TransportError::Cancelled` if the port closes first.
pub struct PendingRequest {
    request_id: RequestId,
    rx: oneshot::Receiver<Result<PortResponse, TransportError>>,
}

impl PendingRequest {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub async fn wait(self) -> Result<PortResponse, TransportError> {
        match self.rx.await {
            Ok(result) => result,
            // sender dropped without completing: executor went away
            Err(_) => Err(TransportError::ExecutorGone),
        }
    }

    /// Await a read completion
    pub async fn wait_bytes(self) -> Result<Vec<u8>, TransportError> {
        match self.wait().await? {
            PortResponse::Bytes(bytes) => Ok(bytes),
            _ => Err(TransportError::PayloadMismatch("read")),
        }
    }

    /// Await an open or write completion
    pub async fn wait_done(self) -> Result<(), TransportError> {
        match self.wait().await? {
            PortResponse::Opened | PortResponse::Written => Ok(()),
            _ => Err(TransportError::PayloadMismatch("open/write")),
        }
    }

    /// Await a bytes-available completion
    pub async fn wait_available(self) -> Result<u32, TransportError> {
        match self.wait().await? {
            PortResponse::Available(n) => Ok(n),
            _ => Err(TransportError::PayloadMismatch("bytes_available")),
        }
    }
}

struct PendingSlot {
    port: PortId,
    tx: oneshot::Sender<Result<PortResponse, TransportError>>,
}

/// How many completed request ids are remembered for duplicate detection.
/// Polling drivers finish requests every few milliseconds, so the set must
/// not grow with uptime; ids older than the horizon are forgotten.
const COMPLETED_HORIZON: usize = 1024;

struct BridgeInner {
    next_id: u64,
    pending: HashMap<RequestId, PendingSlot>,
    /// Recent ids that already received their single completion (or were
    /// cancelled), oldest pruned past [`COMPLETED_HORIZON`]
    completed: HashSet<RequestId>,
    completed_order: VecDeque<RequestId>,
    request_tx: mpsc::UnboundedSender<PortRequest>,
    request_rx: Option<mpsc::UnboundedReceiver<PortRequest>>,
}

impl BridgeInner {
    fn mark_completed(&mut self, id: RequestId) {
        if self.completed.insert(id) {
            self.completed_order.push_back(id);
            while self.completed_order.len() > COMPLETED_HORIZON {
                if let Some(old) = self.completed_order.pop_front() {
                    self.completed.remove(&old);
                }
            }
        }
    }
}

/// Virtualizes serial-like byte channels behind a request/completion handshake
pub struct TransportBridge {
    inner: Mutex<BridgeInner>,
    activity: broadcast::Sender<PortActivity>,
}

impl TransportBridge {
    pub fn new() -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (activity, _) = broadcast::channel(256);
        TransportBridge {
            inner: Mutex::new(BridgeInner {
                next_id: 0,
                pending: HashMap::new(),
                completed: HashSet::new(),
                completed_order: VecDeque::new(),
                request_tx,
                request_rx: Some(request_rx),
            }),
            activity,
        }
    }

    /// Take the stream of outstanding requests.
    ///
    /// Whichever executor fulfills hardware I/O consumes this stream; it can
    /// only be taken once.
    pub fn take_request_stream(&self) -> Option<mpsc::UnboundedReceiver<PortRequest>> {
        self.inner.lock().expect("lock not poisoned").request_rx.take()
    }

    /// Subscribe to raw port activity
    pub fn subscribe_activity(&self) -> broadcast::Receiver<PortActivity> {
        self.activity.subscribe()
    }

    fn register(&self, port: PortId, kind: PortRequestKind) -> PendingRequest {
        let mut inner = self.inner.lock().expect("lock not poisoned");
        inner.next_id += 1;
        let request_id = RequestId(inner.next_id);
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(
            request_id,
            PendingSlot {
                port: port.clone(),
                tx,
            },
        );
        debug!(%request_id, %port, kind = kind.name(), "registered port request");
        // ignore send failure: an executor that dropped the stream surfaces
        // as ExecutorGone when the caller awaits
        let _ = inner.request_tx.send(PortRequest {
            request_id,
            port,
            kind,
        });
        PendingRequest { request_id, rx }
    }

    pub fn open(&self, port: PortId, baud: u32) -> PendingRequest {
        self.register(port, PortRequestKind::Open { baud })
    }

    pub fn read(&self, port: PortId, max_len: u32) -> PendingRequest {
        self.register(port, PortRequestKind::Read { max_len })
    }

    pub fn write(&self, port: PortId, bytes: Vec<u8>) -> PendingRequest {
        let sent = bytes.len();
        let pending = self.register(port.clone(), PortRequestKind::Write { bytes });
        let _ = self.activity.send(PortActivity {
            port,
            direction: PortDirection::Sent,
            bytes: sent,
        });
        pending
    }

    pub fn bytes_available(&self, port: PortId) -> PendingRequest {
        self.register(port, PortRequestKind::BytesAvailable)
    }

    fn complete(
        &self,
        request_id: RequestId,
        result: Result<PortResponse, TransportError>,
    ) -> Result<(), TransportError> {
        let slot = {
            let mut inner = self.inner.lock().expect("lock not poisoned");
            match inner.pending.remove(&request_id) {
                Some(slot) => {
                    inner.mark_completed(request_id);
                    slot
                }
                None => {
                    if inner.completed.contains(&request_id) {
                        warn!(%request_id, "rejected duplicate completion");
                        return Err(TransportError::DuplicateCompletion(request_id));
                    }
                    return Err(TransportError::UnknownRequest(request_id));
                }
            }
        };

        if let Ok(PortResponse::Bytes(bytes)) = &result {
            let _ = self.activity.send(PortActivity {
                port: slot.port.clone(),
                direction: PortDirection::Received,
                bytes: bytes.len(),
            });
        }

        // the caller may have stopped waiting; a dropped receiver is fine
        let _ = slot.tx.send(result);
        Ok(())
    }

    /// Deliver a successful completion for an outstanding request.
    ///
    /// Exactly one completion is ever accepted per request id.
    pub fn complete_ok(
        &self,
        request_id: RequestId,
        response: PortResponse,
    ) -> Result<(), TransportError> {
        self.complete(request_id, Ok(response))
    }

    /// Deliver an error completion for an outstanding request
    pub fn complete_err(&self, request_id: RequestId, error: String) -> Result<(), TransportError> {
        self.complete(request_id, Err(TransportError::Io(error)))
    }

    /// Cancel every outstanding request on a port.
    ///
    /// Waiters observe `TransportError::Cancelled`; late completions from the
    /// executor are rejected as duplicates.
    pub fn close_port(&self, port: &PortId) -> usize {
        let slots: Vec<(RequestId, PendingSlot)> = {
            let mut inner = self.inner.lock().expect("lock not poisoned");
            let ids: Vec<RequestId> = inner
                .pending
                .iter()
                .filter(|(_, slot)| &slot.port == port)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    inner.mark_completed(id);
                    inner.pending.remove(&id).map(|slot| (id, slot))
                })
                .collect()
        };

        let cancelled = slots.len();
        for (id, slot) in slots {
            let _ = slot.tx.send(Err(TransportError::Cancelled(id)));
        }
        if cancelled > 0 {
            debug!(%port, cancelled, "cancelled outstanding requests on closed port");
        }
        cancelled
    }

    /// Number of requests awaiting completion
    pub fn outstanding(&self) -> usize {
        self.inner.lock().expect("lock not poisoned").pending.len()
    }
}

impl Default for TransportBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str) -> PortId {
        PortId(name.to_string())
    }

    #[tokio::test]
    async fn test_completion_reaches_waiter() {
        let bridge = TransportBridge::new();
        let mut stream = bridge.take_request_stream().unwrap();

        let pending = bridge.read(port("ttyA"), 64);
        let request = stream.recv().await.unwrap();
        assert_eq!(request.kind, PortRequestKind::Read { max_len: 64 });

        bridge
            .complete_ok(request.request_id, PortResponse::Bytes(vec![1, 2, 3]))
            .unwrap();
        assert_eq!(pending.wait_bytes().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_second_completion_rejected_first_value_wins() {
        let bridge = TransportBridge::new();
        let _stream = bridge.take_request_stream().unwrap();

        let pending = bridge.read(port("ttyA"), 16);
        let id = pending.request_id();

        bridge
            .complete_ok(id, PortResponse::Bytes(vec![0xaa]))
            .unwrap();
        let err = bridge
            .complete_ok(id, PortResponse::Bytes(vec![0xbb]))
            .unwrap_err();
        assert_eq!(err, TransportError::DuplicateCompletion(id));

        // the waiter sees the first payload, not the rejected one
        assert_eq!(pending.wait_bytes().await.unwrap(), vec![0xaa]);
    }

    #[tokio::test]
    async fn test_unknown_request_id_rejected() {
        let bridge = TransportBridge::new();
        let err = bridge
            .complete_ok(RequestId(999), PortResponse::Written)
            .unwrap_err();
        assert_eq!(err, TransportError::UnknownRequest(RequestId(999)));
    }

    #[tokio::test]
    async fn test_close_port_cancels_outstanding() {
        let bridge = TransportBridge::new();
        let _stream = bridge.take_request_stream().unwrap();

        let a = bridge.read(port("ttyA"), 16);
        let b = bridge.write(port("ttyA"), vec![1]);
        let other = bridge.read(port("ttyB"), 16);

        assert_eq!(bridge.close_port(&port("ttyA")), 2);

        assert!(matches!(
            a.wait().await,
            Err(TransportError::Cancelled(_))
        ));
        assert!(matches!(
            b.wait().await,
            Err(TransportError::Cancelled(_))
        ));
        // unrelated port is untouched
        assert_eq!(bridge.outstanding(), 1);
        bridge
            .complete_ok(other.request_id(), PortResponse::Bytes(vec![]))
            .unwrap();
    }

    #[tokio::test]
    async fn test_completed_id_window_is_bounded() {
        let bridge = TransportBridge::new();
        let _stream = bridge.take_request_stream().unwrap();

        let first = bridge.read(port("ttyA"), 1);
        let first_id = first.request_id();
        bridge
            .complete_ok(first_id, PortResponse::Bytes(vec![]))
            .unwrap();

        let mut last_id = first_id;
        for _ in 0..COMPLETED_HORIZON {
            let pending = bridge.read(port("ttyA"), 1);
            last_id = pending.request_id();
            bridge
                .complete_ok(last_id, PortResponse::Bytes(vec![]))
                .unwrap();
        }

        // recent ids still trip duplicate detection
        assert_eq!(
            bridge
                .complete_ok(last_id, PortResponse::Written)
                .unwrap_err(),
            TransportError::DuplicateCompletion(last_id)
        );
        // the oldest id fell out of the window instead of pinning memory
        assert_eq!(
            bridge
                .complete_ok(first_id, PortResponse::Written)
                .unwrap_err(),
            TransportError::UnknownRequest(first_id)
        );
    }

    #[tokio::test]
    async fn test_late_completion_after_cancel_is_duplicate() {
        let bridge = TransportBridge::new();
        let _stream = bridge.take_request_stream().unwrap();

        let pending = bridge.read(port("ttyA"), 16);
        let id = pending.request_id();
        bridge.close_port(&port("ttyA"));

        let err = bridge
            .complete_ok(id, PortResponse::Bytes(vec![1]))
            .unwrap_err();
        assert_eq!(err, TransportError::DuplicateCompletion(id));
    }
}
