//! Per-role device supervisor.
//!
//! Consumers hold a `DeviceHandle`; the supervisor keeps the underlying
//! device reachable, initialized, and substitutable by model. All
//! transitions are published as `DeviceAvailability` (and the legacy
//! `Connectivity`) events.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};

use super::intent::{CaptureRequest, IntentQueue, RequestAction};
use super::registry::{DeviceModel, ModelRegistry};
use super::scratch::ScratchArea;
use super::transport::{BleTransport, TransportEvent};
use super::{AvailabilityState, DeviceRole};
use crate::config::BluetoothConfig;
use crate::event::{
    Clock, ConnectivityChange, DeviceAvailability, DeviceChanged, EventBus, Payload, ScaleChange,
};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub enum DeviceCommand {
    /// `None` forgets the device entirely.
    AssignAddress(Option<String>),
    Capture,
    Release,
    /// Ordered-drain path; releases if captured, then exits the loop.
    Shutdown,
}

/// Observable snapshot kept current by the supervisor.
#[derive(Debug, Clone)]
pub struct SharedDeviceState {
    pub address: Option<String>,
    pub name: Option<String>,
    pub model: DeviceModel,
    pub availability: AvailabilityState,
    pub ready: bool,
}

impl SharedDeviceState {
    fn new() -> Self {
        Self {
            address: None,
            name: None,
            model: DeviceModel::GenericScale,
            availability: AvailabilityState::Initial,
            ready: false,
        }
    }
}

/// The stable, role-keyed handle consumers hold. Survives disconnects,
/// reconnects, and model changes.
#[derive(Clone)]
pub struct DeviceHandle {
    role: DeviceRole,
    cmd_tx: Sender<DeviceCommand>,
    shared: Arc<Mutex<SharedDeviceState>>,
}

impl DeviceHandle {
    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn assign_address(&self, address: Option<String>) -> Result<()> {
        self.send(DeviceCommand::AssignAddress(address))
    }

    pub fn capture(&self) -> Result<()> {
        self.send(DeviceCommand::Capture)
    }

    pub fn release(&self) -> Result<()> {
        self.send(DeviceCommand::Release)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(DeviceCommand::Shutdown)
    }

    pub fn is_ready(&self) -> bool {
        self.snapshot().ready
    }

    pub fn availability(&self) -> AvailabilityState {
        self.snapshot().availability
    }

    pub fn snapshot(&self) -> SharedDeviceState {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn send(&self, cmd: DeviceCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| Error::Transport(format!("{:?} supervisor is gone", self.role)))
    }
}

pub struct DeviceSupervisor {
    role: DeviceRole,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    transport: Box<dyn BleTransport>,
    transport_rx: Receiver<TransportEvent>,
    cmd_rx: Receiver<DeviceCommand>,
    registry: ModelRegistry,
    scratch: ScratchArea,
    cfg: BluetoothConfig,
    shared: Arc<Mutex<SharedDeviceState>>,

    queue: IntentQueue,
    address: Option<String>,
    name: Option<String>,
    model: DeviceModel,
    ready: bool,
    willful_disconnect: bool,
    /// Reconnect-after-loss retries indefinitely; a user-initiated
    /// capture gets one bounded attempt.
    reconnecting: bool,
    retry_count: u32,
    connect_deadline: Option<f64>,
    reconnect_pause_until: Option<f64>,
    last_published: Option<AvailabilityState>,
    shutting_down: bool,
}

pub struct SupervisorParts {
    pub supervisor: DeviceSupervisor,
    pub handle: DeviceHandle,
}

impl DeviceSupervisor {
    pub fn new(
        role: DeviceRole,
        bus: EventBus,
        transport: Box<dyn BleTransport>,
        transport_rx: Receiver<TransportEvent>,
        cfg: BluetoothConfig,
    ) -> SupervisorParts {
        let (cmd_tx, cmd_rx) = crossbeam::channel::unbounded();
        let shared = Arc::new(Mutex::new(SharedDeviceState::new()));
        let clock = bus.clock().clone();
        let scratch = ScratchArea::new(cfg.id_file_directory.clone(), &cfg.id_file_suffix);
        let supervisor = Self {
            role,
            bus,
            clock,
            transport,
            transport_rx,
            cmd_rx,
            registry: ModelRegistry::standard(),
            scratch,
            cfg,
            shared: Arc::clone(&shared),
            queue: IntentQueue::default(),
            address: None,
            name: None,
            model: DeviceModel::GenericScale,
            ready: false,
            willful_disconnect: false,
            reconnecting: false,
            retry_count: 0,
            connect_deadline: None,
            reconnect_pause_until: None,
            last_published: None,
            shutting_down: false,
        };
        let handle = DeviceHandle {
            role,
            cmd_tx,
            shared,
        };
        SupervisorParts { supervisor, handle }
    }

    /// Blocking supervisor loop; runs until `Shutdown` completes.
    pub fn run(mut self) {
        let cmd_rx = self.cmd_rx.clone();
        let transport_rx = self.transport_rx.clone();
        loop {
            let now = self.clock.wall();
            crossbeam::select! {
                recv(cmd_rx) -> cmd => match cmd {
                    Ok(cmd) => self.on_command(cmd, now),
                    Err(_) => break,
                },
                recv(transport_rx) -> evt => match evt {
                    Ok(evt) => self.on_transport_event(evt, now),
                    Err(_) => break,
                },
                default(Duration::from_millis(100)) => self.on_tick(now),
            }
            if self.shutting_down && self.queue.pending.is_none() {
                break;
            }
        }
        tracing::info!("{:?} supervisor stopped", self.role);
    }

    // === Inputs (also driven directly by tests) ===

    pub fn on_command(&mut self, cmd: DeviceCommand, now: f64) {
        match cmd {
            DeviceCommand::AssignAddress(address) => self.assign_address(address, now),
            DeviceCommand::Capture => self.request(CaptureRequest::Capture, now),
            DeviceCommand::Release => self.request(CaptureRequest::Release, now),
            DeviceCommand::Shutdown => {
                self.shutting_down = true;
                self.request(CaptureRequest::Release, now);
            }
        }
    }

    pub fn on_transport_event(&mut self, event: TransportEvent, now: f64) {
        match event {
            TransportEvent::ConnectDone { address, result } => {
                if Some(&address) != self.address.as_ref() {
                    return;
                }
                self.connect_deadline = None;
                match result {
                    Ok(()) => self.connected(now),
                    Err(reason) => self.connect_failed(&reason, now),
                }
            }
            TransportEvent::DisconnectDone { address } => {
                if Some(&address) != self.address.as_ref() {
                    return;
                }
                self.disconnected_cleanly(now);
            }
            TransportEvent::Disconnected { address } => {
                if Some(&address) != self.address.as_ref() {
                    return;
                }
                if self.willful_disconnect {
                    // Our own release; DisconnectDone handles it.
                    return;
                }
                self.unexpected_disconnect(now);
            }
            TransportEvent::Advertisement { address, name } => {
                self.on_advertisement(&address, &name, now);
            }
            TransportEvent::ScanFinished => {}
        }
    }

    pub fn on_tick(&mut self, now: f64) {
        if let Some(deadline) = self.connect_deadline
            && now >= deadline
            && self.queue.pending == Some(CaptureRequest::Capture)
        {
            if let Some(addr) = self.address.clone() {
                self.transport.cancel_connect(&addr);
            }
            self.connect_deadline = None;
            self.connect_failed("connect timeout", now);
        }

        if let Some(until) = self.reconnect_pause_until
            && now >= until
        {
            self.reconnect_pause_until = None;
            if self.queue.outstanding() == Some(CaptureRequest::Capture) {
                self.start_connect(now);
            }
        }
    }

    // === Command handling ===

    fn assign_address(&mut self, address: Option<String>, now: f64) {
        if address == self.address && address.is_some() {
            tracing::debug!("{:?}: address unchanged, no-op", self.role);
            return;
        }

        // Changing or clearing the address forces release and reverts
        // the model to generic.
        if self.queue.pending == Some(CaptureRequest::Capture) {
            if let Some(addr) = self.address.clone() {
                self.transport.cancel_connect(&addr);
            }
        } else if self.queue.connected == Some(CaptureRequest::Capture) {
            self.willful_disconnect = true;
            if let Some(addr) = self.address.clone() {
                self.transport.begin_disconnect(&addr);
            }
        }
        if let Some(old) = self.address.take() {
            let _ = self.scratch.remove(&old);
        }
        self.set_not_ready(now);
        self.revert_model(now);

        self.name = None;
        self.address = address;
        self.queue = IntentQueue {
            connected: Some(CaptureRequest::Release),
            pending: None,
            target: None,
        };
        self.connect_deadline = None;
        self.reconnect_pause_until = None;
        self.reconnecting = false;
        self.retry_count = 0;
        self.publish_availability(now, None);
    }

    fn request(&mut self, req: CaptureRequest, now: f64) {
        if req == CaptureRequest::Capture && self.address.is_none() {
            self.publish_availability_forced(now, Some("no address assigned".to_string()));
            tracing::warn!("{:?}: capture requested with no address", self.role);
            return;
        }
        match self.queue.request(req) {
            RequestAction::Coalesced => {
                tracing::debug!("{:?}: {req:?} coalesced", self.role);
            }
            RequestAction::Start(op) => {
                self.reconnecting = false;
                self.retry_count = 0;
                self.start_operation(op, now);
            }
            RequestAction::CancelInFlight => match self.queue.pending {
                Some(CaptureRequest::Capture) => {
                    // Cancel the capture at its next suspension point;
                    // the transport replies through ConnectDone.
                    if let Some(addr) = self.address.clone() {
                        self.transport.cancel_connect(&addr);
                    }
                    self.queue.pending = Some(CaptureRequest::Release);
                    self.publish_availability(now, None);
                }
                _ => {
                    // A release cannot be interrupted; the new target is
                    // picked up when it settles.
                    self.publish_availability(now, None);
                }
            },
        }
    }

    fn start_operation(&mut self, op: CaptureRequest, now: f64) {
        match op {
            CaptureRequest::Capture => self.start_connect(now),
            CaptureRequest::Release => {
                let Some(addr) = self.address.clone() else {
                    // Nothing to disconnect; released by definition.
                    self.queue.settle(CaptureRequest::Release);
                    self.publish_availability(now, None);
                    return;
                };
                self.willful_disconnect = true;
                self.queue.pending = Some(CaptureRequest::Release);
                self.transport.begin_disconnect(&addr);
                self.publish_availability(now, None);
            }
        }
    }

    fn start_connect(&mut self, now: f64) {
        let Some(addr) = self.address.clone() else {
            return;
        };
        self.willful_disconnect = false;
        self.queue.pending = Some(CaptureRequest::Capture);
        self.connect_deadline = Some(now + self.cfg.connect_timeout);
        if let Err(e) = self.scratch.persist(&addr) {
            tracing::warn!("{:?}: connection file error: {e}", self.role);
        }
        self.transport.begin_connect(&addr);
        self.publish_availability(now, None);
    }

    // === Transport outcomes ===

    fn connected(&mut self, now: f64) {
        self.queue.settle(CaptureRequest::Capture);
        self.reconnecting = false;
        self.retry_count = 0;
        self.publish_availability(now, None);

        if self.queue.outstanding() == Some(CaptureRequest::Release) {
            // A release raced the capture and lost; honor it now.
            self.start_operation(CaptureRequest::Release, now);
            return;
        }

        // Post-connect initialisation. Model-specific setup runs behind
        // the handle; generic devices are ready immediately.
        self.ready = true;
        self.update_shared();
        self.publish_availability_forced(now, None);
        tracing::info!("{:?} ready", self.role);
    }

    fn connect_failed(&mut self, reason: &str, now: f64) {
        self.queue.fail_pending();

        if self.queue.outstanding() != Some(CaptureRequest::Capture) {
            // Cancelled (release requested meanwhile) or target changed.
            self.queue.settle(CaptureRequest::Release);
            if let Some(addr) = &self.address {
                let _ = self.scratch.remove(addr);
            }
            self.publish_availability(now, Some(reason.to_string()));
            return;
        }

        if !self.reconnecting {
            // One bounded attempt for a user-initiated capture.
            self.queue.settle(CaptureRequest::Release);
            self.queue.target = None;
            if let Some(addr) = &self.address {
                let _ = self.scratch.remove(addr);
            }
            tracing::warn!("{:?}: capture failed: {reason}", self.role);
            self.publish_availability_forced(now, Some(reason.to_string()));
            return;
        }

        self.retry_count += 1;
        if self.retry_count < self.cfg.reconnect_retry_count {
            tracing::info!(
                "{:?}: reconnect attempt {} failed, retrying",
                self.role,
                self.retry_count
            );
            self.start_connect(now);
        } else {
            // Jitter the gap so a houseful of devices doesn't retry in
            // lockstep.
            let gap = self.cfg.reconnect_gap * (0.9 + 0.2 * rand::random::<f64>());
            tracing::warn!(
                "{:?}: {} reconnect attempts failed, pausing {:.1} s",
                self.role,
                self.retry_count,
                gap
            );
            self.retry_count = 0;
            self.reconnect_pause_until = Some(now + gap);
            self.publish_availability(now, Some(reason.to_string()));
        }
    }

    fn disconnected_cleanly(&mut self, now: f64) {
        self.queue.settle(CaptureRequest::Release);
        self.willful_disconnect = false;
        self.set_not_ready(now);
        self.revert_model(now);
        if let Some(addr) = &self.address {
            let _ = self.scratch.remove(addr);
        }
        self.publish_availability(now, None);

        if !self.shutting_down && self.queue.outstanding() == Some(CaptureRequest::Capture) {
            // A capture was queued behind the release.
            self.start_connect(now);
        }
    }

    fn unexpected_disconnect(&mut self, now: f64) {
        tracing::warn!("{:?}: unexpected disconnect", self.role);
        self.queue.settle(CaptureRequest::Release);
        self.set_not_ready(now);
        self.revert_model(now);
        self.publish_availability(now, None);

        // Keep trying to get the device back until told otherwise.
        if self.queue.target == Some(CaptureRequest::Capture) || self.queue.target.is_none() {
            self.queue.target = Some(CaptureRequest::Capture);
            self.reconnecting = true;
            self.retry_count = 0;
            self.start_connect(now);
        }
    }

    fn on_advertisement(&mut self, address: &str, name: &str, now: f64) {
        if Some(address) != self.address.as_deref() {
            return;
        }
        self.name = Some(name.to_string());
        if self.model != DeviceModel::GenericScale {
            return;
        }
        let Some((model, role)) = self.registry.classify(name) else {
            return;
        };
        if role != self.role {
            return;
        }
        let previous = self.model;
        self.model = model;
        self.update_shared();
        tracing::info!(
            "{:?}: adopted {} (was {})",
            self.role,
            model.as_str(),
            previous.as_str()
        );
        self.publish_model_change(previous, now);
    }

    // === Bookkeeping ===

    fn set_not_ready(&mut self, now: f64) {
        if self.ready {
            self.ready = false;
            self.update_shared();
            self.publish_availability_forced(now, None);
        }
    }

    fn revert_model(&mut self, now: f64) {
        if self.model != DeviceModel::GenericScale {
            let previous = self.model;
            self.model = DeviceModel::GenericScale;
            self.update_shared();
            self.publish_model_change(previous, now);
        }
    }

    fn availability_state(&self) -> AvailabilityState {
        let state = self.queue.availability();
        if state == AvailabilityState::Captured && self.ready {
            AvailabilityState::Ready
        } else {
            state
        }
    }

    fn publish_availability(&mut self, now: f64, reason: Option<String>) {
        let state = self.availability_state();
        if self.last_published == Some(state) && reason.is_none() {
            return;
        }
        self.publish_availability_inner(state, now, reason);
    }

    /// Ready/NotReady refinements repeat the underlying queue state, so
    /// they bypass the change filter.
    fn publish_availability_forced(&mut self, now: f64, reason: Option<String>) {
        let state = self.availability_state();
        self.publish_availability_inner(state, now, reason);
    }

    fn publish_availability_inner(
        &mut self,
        state: AvailabilityState,
        now: f64,
        reason: Option<String>,
    ) {
        self.last_published = Some(state);
        self.update_shared();
        self.bus.publish(
            self.sender_name().as_str(),
            now,
            Payload::DeviceAvailability(DeviceAvailability {
                role: self.role,
                state,
                id: self.address.clone(),
                name: self.name.clone(),
                reason,
            }),
        );
        self.bus.publish(
            self.sender_name().as_str(),
            now,
            Payload::Connectivity(ConnectivityChange {
                state: if state == AvailabilityState::Ready {
                    crate::event::ConnectivityState::Ready
                } else {
                    self.queue.connectivity()
                },
                id: self.address.clone(),
                name: self.name.clone(),
            }),
        );
    }

    fn publish_model_change(&self, previous: DeviceModel, now: f64) {
        self.bus.publish(
            self.sender_name().as_str(),
            now,
            Payload::DeviceChanged(DeviceChanged {
                role: self.role,
                id: self.address.clone(),
                previous_model: previous.as_str().to_string(),
                model: self.model.as_str().to_string(),
            }),
        );
        if self.role == DeviceRole::Scale {
            self.bus.publish(
                self.sender_name().as_str(),
                now,
                Payload::ScaleChange(ScaleChange {
                    id: self.address.clone(),
                    model: self.model.as_str().to_string(),
                }),
            );
        }
    }

    fn update_shared(&self) {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.address = self.address.clone();
        shared.name = self.name.clone();
        shared.model = self.model;
        shared.availability = self.availability_state();
        shared.ready = self.ready;
    }

    fn sender_name(&self) -> String {
        if self.model == DeviceModel::GenericScale {
            format!("ManagedDevice({})", self.role.as_str())
        } else {
            self.model.as_str().to_string()
        }
    }
}
