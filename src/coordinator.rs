//! Coordinator Actor
//!
//! Single owner of all mutable coordinator state. Frontends talk to it
//! through a [`CoordinatorHandle`]; devices talk to it through per-port
//! drivers feeding one incoming channel. Because every mutation funnels
//! through this actor's loop, sessions, registry and key store never need
//! their own locks.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::events::EventBus;
use crate::frost::ShareCombiner;
use crate::keystore::{KeyStore, KeyStoreError};
use crate::registry::{DeviceListSnapshot, DeviceRegistry, RegistryError};
use crate::session::{
    Destination, Outgoing, ProtocolError, SessionCoordinator, SessionEvent, SessionStatus,
    SigningSnapshot,
};
use crate::storage::{CoordinatorStore, DeviceRecord, StorageError};
use crate::transport::bridge::TransportBridge;
use crate::transport::link::PortDriver;
use crate::transport::wire::{CoordinatorToDevice, DeviceToCoordinator};
use crate::types::{DeviceId, FrostKey, KeyId, PortId, SessionId, SignTask};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("coordinator is gone")]
    ChannelClosed,
}

enum Command {
    PortConnected {
        port: PortId,
    },
    PortDisconnected {
        port: PortId,
    },
    ListDevices {
        reply: oneshot::Sender<DeviceListSnapshot>,
    },
    ListKeys {
        reply: oneshot::Sender<Vec<FrostKey>>,
    },
    PreviewName {
        device: DeviceId,
        name: String,
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
    FinishName {
        device: DeviceId,
        name: String,
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
    StartKeygen {
        threshold: u16,
        devices: Vec<DeviceId>,
        key_name: String,
        reply: oneshot::Sender<Result<SessionId, CoordinatorError>>,
    },
    StartSigning {
        key_id: KeyId,
        signers: BTreeSet<DeviceId>,
        task: SignTask,
        reply: oneshot::Sender<Result<SessionId, CoordinatorError>>,
    },
    RestoreSigning {
        key_id: KeyId,
        reply: oneshot::Sender<Result<Option<SessionId>, CoordinatorError>>,
    },
    CancelSigning {
        reply: oneshot::Sender<()>,
    },
    CancelDevice {
        device: DeviceId,
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
    CancelAll {
        reply: oneshot::Sender<()>,
    },
    StartUpgrade {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<SessionId, CoordinatorError>>,
    },
    RenameKey {
        key_id: KeyId,
        name: String,
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
    NoncesAvailable {
        device: DeviceId,
        reply: oneshot::Sender<usize>,
    },
    SigningState {
        reply: oneshot::Sender<Option<SigningSnapshot>>,
    },
}

/// Cloneable frontend handle to a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
    events: EventBus,
}

impl CoordinatorHandle {
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    async fn send(&self, command: Command) -> Result<(), CoordinatorError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| CoordinatorError::ChannelClosed)
    }

    async fn ask<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| CoordinatorError::ChannelClosed)
    }

    /// Tell the coordinator a port appeared
    pub async fn port_connected(&self, port: PortId) -> Result<(), CoordinatorError> {
        self.send(Command::PortConnected { port }).await
    }

    /// Tell the coordinator a port went away
    pub async fn port_disconnected(&self, port: PortId) -> Result<(), CoordinatorError> {
        self.send(Command::PortDisconnected { port }).await
    }

    pub async fn list_devices(&self) -> Result<DeviceListSnapshot, CoordinatorError> {
        self.ask(|reply| Command::ListDevices { reply }).await
    }

    pub async fn list_keys(&self) -> Result<Vec<FrostKey>, CoordinatorError> {
        self.ask(|reply| Command::ListKeys { reply }).await
    }

    /// Stage a candidate label on the device's screen
    pub async fn preview_name(
        &self,
        device: DeviceId,
        name: String,
    ) -> Result<(), CoordinatorError> {
        self.ask(|reply| Command::PreviewName { device, name, reply })
            .await?
    }

    /// Commit a label; the device confirms on its own screen
    pub async fn finish_name(
        &self,
        device: DeviceId,
        name: String,
    ) -> Result<(), CoordinatorError> {
        self.ask(|reply| Command::FinishName { device, name, reply })
            .await?
    }

    pub async fn start_keygen(
        &self,
        threshold: u16,
        devices: Vec<DeviceId>,
        key_name: String,
    ) -> Result<SessionId, CoordinatorError> {
        self.ask(|reply| Command::StartKeygen {
            threshold,
            devices,
            key_name,
            reply,
        })
        .await?
    }

    pub async fn start_signing(
        &self,
        key_id: KeyId,
        signers: BTreeSet<DeviceId>,
        task: SignTask,
    ) -> Result<SessionId, CoordinatorError> {
        self.ask(|reply| Command::StartSigning {
            key_id,
            signers,
            task,
            reply,
        })
        .await?
    }

    /// Resume a persisted signing session for a key, if one exists
    pub async fn restore_signing(
        &self,
        key_id: KeyId,
    ) -> Result<Option<SessionId>, CoordinatorError> {
        self.ask(|reply| Command::RestoreSigning { key_id, reply })
            .await?
    }

    pub async fn cancel_signing(&self) -> Result<(), CoordinatorError> {
        self.ask(|reply| Command::CancelSigning { reply }).await
    }

    /// Tell one device to abort whatever protocol step it is showing
    pub async fn cancel_device(&self, device: DeviceId) -> Result<(), CoordinatorError> {
        self.ask(|reply| Command::CancelDevice { device, reply })
            .await?
    }

    /// Cancel every active session
    pub async fn cancel_all(&self) -> Result<(), CoordinatorError> {
        self.ask(|reply| Command::CancelAll { reply }).await
    }

    /// Push a firmware image to every connected device running older
    /// firmware
    pub async fn start_upgrade(&self, image: Vec<u8>) -> Result<SessionId, CoordinatorError> {
        self.ask(|reply| Command::StartUpgrade { image, reply })
            .await?
    }

    pub async fn rename_key(&self, key_id: KeyId, name: String) -> Result<(), CoordinatorError> {
        self.ask(|reply| Command::RenameKey { key_id, name, reply })
            .await?
    }

    pub async fn nonces_available(&self, device: DeviceId) -> Result<usize, CoordinatorError> {
        self.ask(|reply| Command::NoncesAvailable { device, reply })
            .await
    }

    pub async fn signing_state(&self) -> Result<Option<SigningSnapshot>, CoordinatorError> {
        self.ask(|reply| Command::SigningState { reply }).await
    }
}

/// The actor. Construct with [`Coordinator::new`], seed with
/// [`Coordinator::load_persisted`], then drive with [`Coordinator::run`].
pub struct Coordinator {
    config: Config,
    bridge: Arc<TransportBridge>,
    registry: DeviceRegistry,
    keystore: KeyStore,
    sessions: SessionCoordinator,
    combiner: Arc<dyn ShareCombiner>,
    store: Arc<dyn CoordinatorStore>,
    events: EventBus,
    commands: mpsc::Receiver<Command>,
    incoming_tx: mpsc::Sender<(PortId, DeviceToCoordinator)>,
    incoming: mpsc::Receiver<(PortId, DeviceToCoordinator)>,
    outboxes: HashMap<PortId, mpsc::Sender<CoordinatorToDevice>>,
}

impl Coordinator {
    pub fn new(
        config: Config,
        bridge: Arc<TransportBridge>,
        store: Arc<dyn CoordinatorStore>,
        combiner: Arc<dyn ShareCombiner>,
    ) -> (Self, CoordinatorHandle) {
        let (tx, commands) = mpsc::channel(64);
        let (incoming_tx, incoming) = mpsc::channel(256);
        let events = EventBus::new();
        let handle = CoordinatorHandle {
            tx,
            events: events.clone(),
        };
        let coordinator = Coordinator {
            registry: DeviceRegistry::new(config.latest_firmware),
            keystore: KeyStore::with_watermarks(config.nonce_low_water, config.nonce_target),
            sessions: SessionCoordinator::new(),
            config,
            bridge,
            combiner,
            store,
            events,
            commands,
            incoming_tx,
            incoming,
            outboxes: HashMap::new(),
        };
        (coordinator, handle)
    }

    /// Seed keys, labels and nonce counters from persistent storage
    pub async fn load_persisted(&mut self) -> Result<(), CoordinatorError> {
        for key in self.store.load_keys().await? {
            if let Err(e) = self.keystore.register_key(key) {
                warn!(error = %e, "skipping already-registered key");
            }
        }
        let devices = self.store.load_devices().await?;
        let labels = devices
            .iter()
            .filter_map(|d| d.label.clone().map(|l| (d.device_id, l)));
        self.registry.load_labels(labels);
        for record in &devices {
            self.keystore
                .restore_nonce_counter(record.device_id, record.nonce_counter);
        }
        info!(
            keys = self.keystore.keys_snapshot().len(),
            devices = devices.len(),
            "persisted state loaded"
        );
        Ok(())
    }

    /// Run until every handle is dropped
    pub async fn run(mut self) {
        // relay raw port traffic onto the event bus for diagnostics
        let mut activity = self.bridge.subscribe_activity();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match activity.recv().await {
                    Ok(item) => events.publish_port_activity(item),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => return,
                }
            }
        });

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            info!("all handles dropped, coordinator stopping");
                            return;
                        }
                    }
                }
                Some((port, message)) = self.incoming.recv() => {
                    self.handle_device_message(port, message).await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::PortConnected { port } => self.port_connected(port),
            Command::PortDisconnected { port } => self.port_disconnected(&port).await,
            Command::ListDevices { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
            Command::ListKeys { reply } => {
                let _ = reply.send(self.keystore.keys_snapshot());
            }
            Command::PreviewName { device, name, reply } => {
                let _ = reply.send(self.preview_name(device, name).await);
            }
            Command::FinishName { device, name, reply } => {
                let _ = reply.send(self.finish_name(device, name).await);
            }
            Command::StartKeygen {
                threshold,
                devices,
                key_name,
                reply,
            } => {
                let _ = reply.send(self.start_keygen(threshold, devices, key_name).await);
            }
            Command::StartSigning {
                key_id,
                signers,
                task,
                reply,
            } => {
                let _ = reply.send(self.start_signing(key_id, signers, task).await);
            }
            Command::RestoreSigning { key_id, reply } => {
                let _ = reply.send(self.restore_signing(key_id).await);
            }
            Command::CancelSigning { reply } => {
                self.cancel_signing().await;
                let _ = reply.send(());
            }
            Command::CancelDevice { device, reply } => {
                let _ = reply.send(self.cancel_device(device).await);
            }
            Command::CancelAll { reply } => {
                self.cancel_signing().await;
                let outgoing = self.sessions.cancel_keygen();
                self.route_outgoing(outgoing).await;
                let outgoing = self.sessions.cancel_upgrade();
                self.route_outgoing(outgoing).await;
                let _ = reply.send(());
            }
            Command::StartUpgrade { image, reply } => {
                let _ = reply.send(self.start_upgrade(image).await);
            }
            Command::RenameKey { key_id, name, reply } => {
                let _ = reply.send(self.rename_key(key_id, name).await);
            }
            Command::NoncesAvailable { device, reply } => {
                let _ = reply.send(self.keystore.nonces_available(&device));
            }
            Command::SigningState { reply } => {
                let _ = reply.send(self.sessions.signing_snapshot());
            }
        }
    }

    fn port_connected(&mut self, port: PortId) {
        if self.outboxes.contains_key(&port) {
            debug!(%port, "port already connected");
            return;
        }
        let (outbox_tx, outbox_rx) = mpsc::channel(64);
        self.outboxes.insert(port.clone(), outbox_tx);
        let driver = PortDriver::new(self.bridge.clone(), port.clone());
        let incoming = self.incoming_tx.clone();
        let baud = self.config.baud;
        info!(%port, "port connected, starting driver");
        tokio::spawn(driver.run(baud, outbox_rx, incoming));
    }

    async fn port_disconnected(&mut self, port: &PortId) {
        // dropping the outbox sender stops the driver loop
        self.outboxes.remove(port);
        self.bridge.close_port(port);
        let changes = self.registry.disconnect_port(port);
        if !changes.is_empty() {
            self.events.publish_device_list(self.registry.snapshot());
        }
    }

    async fn preview_name(
        &mut self,
        device: DeviceId,
        name: String,
    ) -> Result<(), CoordinatorError> {
        self.registry.update_name_preview(device, &name)?;
        self.send_to_device(device, CoordinatorToDevice::NamePreview { name })
            .await;
        self.events.publish_device_list(self.registry.snapshot());
        Ok(())
    }

    async fn finish_name(&mut self, device: DeviceId, name: String) -> Result<(), CoordinatorError> {
        // the registry commits once the device confirms with SetName; here we
        // only forward the request
        if !self.registry.is_connected(&device) {
            return Err(RegistryError::NotConnected(device).into());
        }
        self.send_to_device(device, CoordinatorToDevice::NameFinish { name })
            .await;
        Ok(())
    }

    async fn start_keygen(
        &mut self,
        threshold: u16,
        devices: Vec<DeviceId>,
        key_name: String,
    ) -> Result<SessionId, CoordinatorError> {
        for device in &devices {
            if !self.registry.is_connected(device) {
                return Err(RegistryError::NotConnected(*device).into());
            }
        }
        let (session_id, outgoing) = self.sessions.start_keygen(threshold, &devices, key_name)?;
        self.route_outgoing(outgoing).await;
        Ok(session_id)
    }

    async fn start_signing(
        &mut self,
        key_id: KeyId,
        signers: BTreeSet<DeviceId>,
        task: SignTask,
    ) -> Result<SessionId, CoordinatorError> {
        let key = self.keystore.get_key(&key_id)?.clone();
        // a superseded session is cancelled, so its record goes too
        let superseded = self.sessions.active_signing().map(|s| s.session_id());
        let result = self
            .sessions
            .start_signing(&key, task, signers, &mut self.keystore);
        if let Some(old) = superseded {
            if let Err(e) = self.store.purge_signing(&old).await {
                error!(error = %e, "could not purge superseded session");
            }
        }
        let (session_id, outgoing) = result?;
        // persisted at announce so a crash can resume it
        if let Some(session) = self.sessions.active_signing() {
            self.store.persist_signing(&session.to_persisted()).await?;
        }
        self.route_outgoing(outgoing).await;
        self.publish_signing_state();
        Ok(session_id)
    }

    async fn restore_signing(
        &mut self,
        key_id: KeyId,
    ) -> Result<Option<SessionId>, CoordinatorError> {
        let Some(record) = self.store.load_signing(&key_id).await? else {
            return Ok(None);
        };
        let key = self.keystore.get_key(&key_id)?.clone();
        // restoring the active session again must keep its own record
        let superseded = self
            .sessions
            .active_signing()
            .map(|s| s.session_id())
            .filter(|id| *id != record.session_id);
        let result = self
            .sessions
            .restore_signing(record, &key, &mut self.keystore);
        if let Some(old) = superseded {
            if let Err(e) = self.store.purge_signing(&old).await {
                error!(error = %e, "could not purge superseded session");
            }
        }
        let (session_id, outgoing) = result?;
        self.route_outgoing(outgoing).await;
        self.publish_signing_state();
        Ok(Some(session_id))
    }

    async fn cancel_signing(&mut self) {
        let session_id = self.sessions.active_signing().map(|s| s.session_id());
        let outgoing = self.sessions.cancel_signing(&mut self.keystore);
        self.route_outgoing(outgoing).await;
        if let Some(session_id) = session_id {
            if let Err(e) = self.store.purge_signing(&session_id).await {
                error!(error = %e, "could not purge cancelled session");
            }
        }
        self.publish_signing_state();
    }

    async fn cancel_device(&mut self, device: DeviceId) -> Result<(), CoordinatorError> {
        if !self.registry.is_connected(&device) {
            return Err(RegistryError::NotConnected(device).into());
        }
        self.send_to_device(device, CoordinatorToDevice::Cancel)
            .await;
        Ok(())
    }

    async fn start_upgrade(&mut self, image: Vec<u8>) -> Result<SessionId, CoordinatorError> {
        let targets = self.registry.devices_needing_upgrade();
        let (session_id, outgoing) = self.sessions.start_upgrade(image, targets)?;
        self.route_outgoing(outgoing).await;
        Ok(session_id)
    }

    async fn rename_key(&mut self, key_id: KeyId, name: String) -> Result<(), CoordinatorError> {
        self.keystore.rename_key(&key_id, &name)?;
        let key = self.keystore.get_key(&key_id)?.clone();
        self.store.upsert_key(&key).await?;
        self.events.publish_key_list(self.keystore.keys_snapshot());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Device messages
    // ------------------------------------------------------------------

    async fn handle_device_message(&mut self, port: PortId, message: DeviceToCoordinator) {
        debug!(%port, gist = message.gist(), "device message");
        match &message {
            DeviceToCoordinator::Announce {
                device_id,
                firmware_digest,
            } => {
                self.on_announce(*device_id, port, *firmware_digest).await;
            }
            DeviceToCoordinator::NeedName { .. } => {
                // the device list already shows it as unnamed; nothing to do
                // beyond refreshing observers
                self.events.publish_device_list(self.registry.snapshot());
            }
            DeviceToCoordinator::SetName { device_id, name } => {
                self.on_set_name(*device_id, name.clone()).await;
            }
            DeviceToCoordinator::NonceBatch {
                device_id,
                commitments,
            } => {
                if let Err(e) = self
                    .keystore
                    .finish_replenish(*device_id, commitments.clone())
                {
                    warn!(device = %device_id, error = %e, "nonce batch rejected");
                }
            }
            _ => self.on_protocol_message(&message).await,
        }
    }

    async fn on_announce(
        &mut self,
        device: DeviceId,
        port: PortId,
        firmware_digest: crate::types::FirmwareDigest,
    ) {
        match self.registry.announce(device, port, firmware_digest) {
            Ok(_) => {
                self.send_to_device(device, CoordinatorToDevice::AnnounceAck)
                    .await;
                self.persist_device(device).await;
                self.events.publish_device_list(self.registry.snapshot());
                self.maybe_replenish(device).await;
            }
            Err(e) => warn!(device = %device, error = %e, "announce rejected"),
        }
    }

    async fn on_set_name(&mut self, device: DeviceId, name: String) {
        match self.registry.finish_naming(device, &name) {
            Ok(_) => {
                self.persist_device(device).await;
                self.events.publish_device_list(self.registry.snapshot());
            }
            Err(e) => warn!(device = %device, error = %e, "name confirmation rejected"),
        }
    }

    async fn on_protocol_message(&mut self, message: &DeviceToCoordinator) {
        let result =
            self.sessions
                .handle_message(message, &mut self.keystore, self.combiner.as_ref());
        let (outgoing, events) = match result {
            Ok(pair) => pair,
            Err(e) => {
                // stale or malformed contributions are logged, never fatal
                warn!(gist = message.gist(), error = %e, "contribution rejected");
                return;
            }
        };
        self.route_outgoing(outgoing).await;

        let mut signing_dirty = false;
        for event in events {
            match &event {
                SessionEvent::KeyGenerated(key) => {
                    if let Err(e) = self.store.upsert_key(key).await {
                        error!(key = %key.key_id, error = %e, "could not persist new key");
                    }
                    self.events.publish_key_list(self.keystore.keys_snapshot());
                }
                SessionEvent::SignatureReady { session_id, .. } => {
                    if let Err(e) = self.store.purge_signing(session_id).await {
                        error!(error = %e, "could not purge finished session");
                    }
                    self.persist_nonce_counters().await;
                }
                SessionEvent::Signing(snapshot) => {
                    // a failed session consumed its nonces and cannot resume
                    if snapshot.status == SessionStatus::Failed {
                        if let Err(e) = self.store.purge_signing(&snapshot.session_id).await {
                            error!(error = %e, "could not purge failed session");
                        }
                        self.persist_nonce_counters().await;
                    }
                    signing_dirty = !snapshot.status.is_terminal();
                }
                _ => {}
            }
            self.events.publish_session_event(event);
        }

        // keep the persisted description in step with collected shares
        if signing_dirty {
            if let Some(session) = self.sessions.active_signing() {
                if let Err(e) = self.store.persist_signing(&session.to_persisted()).await {
                    error!(error = %e, "could not persist signing progress");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn maybe_replenish(&mut self, device: DeviceId) {
        if !self.keystore.needs_replenishment(&device) {
            return;
        }
        match self.keystore.begin_replenish(device) {
            Ok(count) => {
                info!(device = %device, count, "requesting nonce replenishment");
                self.send_to_device(device, CoordinatorToDevice::ReplenishNonces { count })
                    .await;
            }
            Err(e) => debug!(device = %device, error = %e, "replenishment deferred"),
        }
    }

    async fn persist_device(&mut self, device: DeviceId) {
        let record = DeviceRecord {
            device_id: device,
            label: self.registry.committed_label(&device).map(String::from),
            nonce_counter: self.keystore.nonce_counter(&device),
        };
        if let Err(e) = self.store.upsert_device(&record).await {
            error!(device = %device, error = %e, "could not persist device record");
        }
    }

    async fn persist_nonce_counters(&mut self) {
        let devices = self.registry.connected_devices();
        for device in devices {
            self.persist_device(device).await;
        }
    }

    fn publish_signing_state(&self) {
        if let Some(snapshot) = self.sessions.signing_snapshot() {
            self.events.publish_session_event(SessionEvent::Signing(snapshot));
        }
    }

    async fn send_to_device(&mut self, device: DeviceId, message: CoordinatorToDevice) {
        let Some(port) = self.registry.port_of(&device).cloned() else {
            warn!(device = %device, gist = message.gist(), "device not connected, dropping message");
            return;
        };
        self.send_to_port(&port, message).await;
    }

    async fn send_to_port(&mut self, port: &PortId, message: CoordinatorToDevice) {
        let Some(outbox) = self.outboxes.get(port) else {
            warn!(%port, gist = message.gist(), "no driver for port, dropping message");
            return;
        };
        if outbox.send(message).await.is_err() {
            warn!(%port, "port driver gone, removing outbox");
            self.outboxes.remove(port);
        }
    }

    async fn route_outgoing(&mut self, outgoing: Vec<Outgoing>) {
        for Outgoing { to, message } in outgoing {
            match to {
                Destination::Device(device) => self.send_to_device(device, message).await,
                Destination::Devices(devices) => {
                    // devices sharing a port get one copy over the shared bus
                    let mut ports = BTreeSet::new();
                    for device in devices {
                        if let Some(port) = self.registry.port_of(&device) {
                            ports.insert(port.clone());
                        } else {
                            warn!(device = %device, "device not connected, skipping");
                        }
                    }
                    for port in ports {
                        self.send_to_port(&port, message.clone()).await;
                    }
                }
            }
        }
    }
}
