//! Port Executors and the Frame-Level Port Driver
//!
//! `run_executor` is the in-process fulfillment loop: it consumes the
//! bridge's request stream and resolves each request against a
//! [`PortBackend`]. A host-delegated deployment skips it and completes
//! requests across the boundary instead; the bridge cannot tell the
//! difference.
//!
//! [`PortDriver`] sits above the bridge on the coordinator side and speaks
//! frames: it writes queued device messages and polls for incoming bytes,
//! decoding them into [`DeviceToCoordinator`] messages.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::bridge::{PortRequestKind, PortResponse, TransportBridge};
use super::wire::{encode_frame, CoordinatorToDevice, DeviceToCoordinator, FrameCodec};
use super::TransportError;
use crate::types::PortId;

/// Hardware seam for the in-process executor
#[async_trait]
pub trait PortBackend: Send + Sync {
    async fn open(&self, port: &PortId, baud: u32) -> Result<(), String>;
    async fn read(&self, port: &PortId, max_len: u32) -> Result<Vec<u8>, String>;
    async fn write(&self, port: &PortId, bytes: &[u8]) -> Result<(), String>;
    async fn bytes_available(&self, port: &PortId) -> Result<u32, String>;
}

/// Consume the bridge's request stream against a backend.
///
/// Runs until the bridge is dropped. Each request receives exactly one
/// completion; duplicate rejections here would indicate a backend bug and are
/// logged rather than propagated.
pub async fn run_executor(
    bridge: Arc<TransportBridge>,
    mut requests: mpsc::UnboundedReceiver<super::bridge::PortRequest>,
    backend: Arc<dyn PortBackend>,
) {
    while let Some(request) = requests.recv().await {
        let result = match &request.kind {
            PortRequestKind::Open { baud } => backend
                .open(&request.port, *baud)
                .await
                .map(|_| PortResponse::Opened),
            PortRequestKind::Read { max_len } => backend
                .read(&request.port, *max_len)
                .await
                .map(PortResponse::Bytes),
            PortRequestKind::Write { bytes } => backend
                .write(&request.port, bytes)
                .await
                .map(|_| PortResponse::Written),
            PortRequestKind::BytesAvailable => backend
                .bytes_available(&request.port)
                .await
                .map(PortResponse::Available),
        };

        let delivery = match result {
            Ok(response) => bridge.complete_ok(request.request_id, response),
            Err(err) => bridge.complete_err(request.request_id, err),
        };
        if let Err(e) = delivery {
            // the request was cancelled while we were serving it
            debug!(request_id = %request.request_id, error = %e, "completion not delivered");
        }
    }
}

#[derive(Default)]
struct MemoryPort {
    open: bool,
    /// Bytes queued by the simulated device, waiting for coordinator reads
    to_coordinator: VecDeque<u8>,
    /// Bytes the coordinator wrote, waiting for the simulated device
    from_coordinator: Vec<u8>,
}

/// Loopback backend for tests and simulation
///
/// Each port is a pair of byte queues; tests inject device-side frames with
/// [`MemoryBackend::inject`] and observe coordinator writes with
/// [`MemoryBackend::drain_written`].
#[derive(Default)]
pub struct MemoryBackend {
    ports: Mutex<HashMap<PortId, MemoryPort>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes as if the device on `port` had sent them
    pub fn inject(&self, port: &PortId, bytes: &[u8]) {
        let mut ports = self.ports.lock().expect("lock not poisoned");
        ports
            .entry(port.clone())
            .or_default()
            .to_coordinator
            .extend(bytes);
    }

    /// Take everything the coordinator has written to `port`
    pub fn drain_written(&self, port: &PortId) -> Vec<u8> {
        let mut ports = self.ports.lock().expect("lock not poisoned");
        match ports.get_mut(port) {
            Some(p) => std::mem::take(&mut p.from_coordinator),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl PortBackend for MemoryBackend {
    async fn open(&self, port: &PortId, _baud: u32) -> Result<(), String> {
        let mut ports = self.ports.lock().expect("lock not poisoned");
        ports.entry(port.clone()).or_default().open = true;
        Ok(())
    }

    async fn read(&self, port: &PortId, max_len: u32) -> Result<Vec<u8>, String> {
        let mut ports = self.ports.lock().expect("lock not poisoned");
        let p = ports
            .get_mut(port)
            .filter(|p| p.open)
            .ok_or_else(|| format!("port {port} not open"))?;
        let n = (max_len as usize).min(p.to_coordinator.len());
        Ok(p.to_coordinator.drain(..n).collect())
    }

    async fn write(&self, port: &PortId, bytes: &[u8]) -> Result<(), String> {
        let mut ports = self.ports.lock().expect("lock not poisoned");
        let p = ports
            .get_mut(port)
            .filter(|p| p.open)
            .ok_or_else(|| format!("port {port} not open"))?;
        p.from_coordinator.extend_from_slice(bytes);
        Ok(())
    }

    async fn bytes_available(&self, port: &PortId) -> Result<u32, String> {
        let ports = self.ports.lock().expect("lock not poisoned");
        let p = ports
            .get(port)
            .filter(|p| p.open)
            .ok_or_else(|| format!("port {port} not open"))?;
        Ok(p.to_coordinator.len() as u32)
    }
}

/// Frame-level driver for one open port
pub struct PortDriver {
    bridge: Arc<TransportBridge>,
    port: PortId,
    codec: FrameCodec,
    poll_interval: Duration,
}

impl PortDriver {
    pub fn new(bridge: Arc<TransportBridge>, port: PortId) -> Self {
        PortDriver {
            bridge,
            port,
            codec: FrameCodec::new(),
            poll_interval: Duration::from_millis(10),
        }
    }

    pub fn port(&self) -> &PortId {
        &self.port
    }

    /// Open the underlying channel
    pub async fn open(&self, baud: u32) -> Result<(), TransportError> {
        self.bridge.open(self.port.clone(), baud).wait_done().await
    }

    /// Write one framed message
    pub async fn send(&self, message: &CoordinatorToDevice) -> Result<(), TransportError> {
        let frame = encode_frame(message).map_err(|e| TransportError::Io(e.to_string()))?;
        self.bridge
            .write(self.port.clone(), frame)
            .wait_done()
            .await
    }

    /// Poll once: read whatever is available and decode complete frames
    pub async fn poll_incoming(&mut self) -> Result<Vec<DeviceToCoordinator>, TransportError> {
        let available = self
            .bridge
            .bytes_available(self.port.clone())
            .wait_available()
            .await?;
        if available == 0 {
            return Ok(Vec::new());
        }

        let bytes = self
            .bridge
            .read(self.port.clone(), available)
            .wait_bytes()
            .await?;
        self.codec.extend(&bytes);

        let mut messages = Vec::new();
        loop {
            match self.codec.try_decode::<DeviceToCoordinator>() {
                Ok(Some(message)) => {
                    debug!(port = %self.port, gist = message.gist(), "decoded device message");
                    messages.push(message);
                }
                Ok(None) => break,
                Err(e) => {
                    // corrupt stream; drop the port rather than guess
                    error!(port = %self.port, error = %e, "frame corruption, closing port");
                    self.bridge.close_port(&self.port);
                    return Err(TransportError::Io(e.to_string()));
                }
            }
        }
        Ok(messages)
    }

    /// Run the driver loop: forward outbox messages down, decoded messages up.
    ///
    /// Returns when the outbox closes, the incoming channel closes, or the
    /// port dies.
    pub async fn run(
        mut self,
        baud: u32,
        mut outbox: mpsc::Receiver<CoordinatorToDevice>,
        incoming: mpsc::Sender<(PortId, DeviceToCoordinator)>,
    ) {
        if let Err(e) = self.open(baud).await {
            warn!(port = %self.port, error = %e, "could not open port");
            return;
        }

        let mut poll = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                queued = outbox.recv() => {
                    match queued {
                        Some(message) => {
                            if let Err(e) = self.send(&message).await {
                                warn!(port = %self.port, error = %e, "send failed, stopping driver");
                                self.bridge.close_port(&self.port);
                                return;
                            }
                        }
                        None => return,
                    }
                }
                _ = poll.tick() => {
                    match self.poll_incoming().await {
                        Ok(messages) => {
                            for message in messages {
                                if incoming.send((self.port.clone(), message)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(TransportError::Cancelled(_)) => return,
                        Err(e) => {
                            warn!(port = %self.port, error = %e, "poll failed, stopping driver");
                            self.bridge.close_port(&self.port);
                            return;
                        }
                    }
                }
            }
        }
    }
}
