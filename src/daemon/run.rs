//! Daemon runner.
//!
//! The core is one thread multiplexing bus dispatch, sequencer
//! deadlines, and API requests. Device supervisors, the recorder, and
//! the outbound forwarder each run as supervised workers. The pipes to
//! transport worker processes are injected, never opened here.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};

use crate::api::{ApiRequest, ApiResponse};
use crate::config::Config;
use crate::device::{
    BleTransport, De1, De1Link, DeviceReport, DeviceRole, DeviceSupervisor, ScratchArea,
    TransportEvent,
};
use crate::event::{EventBus, EventKind, SystemClock};
use crate::profile::{FrameProfile, ProfileRegistry};
use crate::recorder::{HistoryStore, Recorder, into_shared};
use crate::scale::{ScaleProcessor, TareSink};
use crate::sequencer::{
    FlowSequencer, MachineState, ScaleLink, SequencerSettings,
};
use crate::supervise::{RestartPolicy, Supervisor};
use crate::{Result, api, ipc, outbound, telemetry};

use super::core::{Core, CoreSnapshots};

pub struct RoleTransport {
    pub transport: Box<dyn BleTransport>,
    pub events: Receiver<TransportEvent>,
}

/// Everything platform-specific the daemon needs injected. The BLE
/// stack binding and the worker-process pipes live outside this crate.
pub struct DaemonDeps {
    pub de1_link: Arc<dyn De1Link>,
    pub de1_transport: RoleTransport,
    pub scale_transport: RoleTransport,
    pub thermometer_transport: RoleTransport,
    pub scanner: Box<dyn BleTransport>,
    pub scanner_events: Receiver<TransportEvent>,
    /// Decoded inbound readings from every adapter, fanned in.
    pub reports: Receiver<DeviceReport>,
    pub tare_sink: Arc<dyn TareSink>,
    pub outbound_pipe: Option<Box<dyn Write + Send>>,
    pub inbound_pipe: Option<(Box<dyn Read + Send>, Box<dyn Write + Send>)>,
}

impl DaemonDeps {
    /// Stand-alone mode: no BLE stack, no worker processes. The daemon
    /// runs, serves nothing over pipes, and logs what it would do.
    pub fn disconnected() -> Self {
        struct NullTransport;
        impl BleTransport for NullTransport {
            fn begin_connect(&mut self, address: &str) {
                tracing::warn!("no BLE stack bound; cannot connect {address}");
            }
            fn cancel_connect(&mut self, _address: &str) {}
            fn begin_disconnect(&mut self, _address: &str) {}
            fn begin_scan(&mut self, seconds: f64) {
                tracing::warn!("no BLE stack bound; cannot scan for {seconds} s");
            }
            fn force_disconnect(&mut self, address: &str) {
                tracing::warn!("no BLE stack bound; cannot force-disconnect {address}");
            }
        }

        struct NullLink;
        impl De1Link for NullLink {
            fn request_state(&self, _state: MachineState) -> std::result::Result<(), String> {
                Err("no DE1 link bound".into())
            }
            fn upload_program(
                &self,
                _profile: &FrameProfile,
            ) -> std::result::Result<(), String> {
                Err("no DE1 link bound".into())
            }
            fn write_tank_threshold(&self, _celsius: f64) -> std::result::Result<(), String> {
                Err("no DE1 link bound".into())
            }
        }

        struct NullTare;
        impl TareSink for NullTare {
            fn tare(&self) -> std::result::Result<(), String> {
                Err("no scale link bound".into())
            }
        }

        fn silent<T>() -> Receiver<T> {
            let (tx, rx) = crossbeam::channel::unbounded();
            // Keep the sender alive forever so the channel never reads
            // as disconnected.
            std::mem::forget(tx);
            rx
        }

        fn role_transport() -> RoleTransport {
            RoleTransport {
                transport: Box::new(NullTransport),
                events: silent(),
            }
        }

        Self {
            de1_link: Arc::new(NullLink),
            de1_transport: role_transport(),
            scale_transport: role_transport(),
            thermometer_transport: role_transport(),
            scanner: Box::new(NullTransport),
            scanner_events: silent(),
            reports: silent(),
            tare_sink: Arc::new(NullTare),
            outbound_pipe: None,
            inbound_pipe: None,
        }
    }
}

pub fn run(config: Config) -> Result<()> {
    run_with(config, DaemonDeps::disconnected())
}

pub fn run_with(config: Config, mut deps: DaemonDeps) -> Result<()> {
    telemetry::init(&config.logging);

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGQUIT,
    ] {
        let _ = signal_hook::flag::register(signal, Arc::clone(&shutdown));
    }

    let clock = SystemClock::shared();
    let bus = EventBus::new(Arc::clone(&clock));

    // Drop whatever sessions a previous ungraceful exit left behind.
    let scratch = ScratchArea::new(
        config.bluetooth.id_file_directory.clone(),
        &config.bluetooth.id_file_suffix,
    );
    let scanner = &mut deps.scanner;
    match scratch.cleanup(&mut |addr| scanner.force_disconnect(addr)) {
        Ok(0) => {}
        Ok(n) => tracing::info!("cleaned up {n} stale Bluetooth session(s)"),
        Err(e) => tracing::warn!("Bluetooth scratch cleanup failed: {e}"),
    }

    let store = into_shared(HistoryStore::open(
        &config.database.filename,
        clock.wall(),
    )?);

    let mut supervisor = Supervisor::new(Arc::clone(&shutdown));

    // Per-role device supervisors.
    let de1_parts = DeviceSupervisor::new(
        DeviceRole::De1,
        bus.clone(),
        deps.de1_transport.transport,
        deps.de1_transport.events,
        config.bluetooth.clone(),
    );
    let scale_parts = DeviceSupervisor::new(
        DeviceRole::Scale,
        bus.clone(),
        deps.scale_transport.transport,
        deps.scale_transport.events,
        config.bluetooth.clone(),
    );
    let thermometer_parts = DeviceSupervisor::new(
        DeviceRole::Thermometer,
        bus.clone(),
        deps.thermometer_transport.transport,
        deps.thermometer_transport.events,
        config.bluetooth.clone(),
    );
    let (de1_sup, de1_handle) = (de1_parts.supervisor, de1_parts.handle);
    let (scale_sup, scale_handle) = (scale_parts.supervisor, scale_parts.handle);
    let (thermometer_sup, thermometer_handle) =
        (thermometer_parts.supervisor, thermometer_parts.handle);
    supervisor.spawn_once("device-de1", move || de1_sup.run());
    supervisor.spawn_once("device-scale", move || scale_sup.run());
    supervisor.spawn_once("device-thermometer", move || thermometer_sup.run());

    let de1 = Arc::new(De1::new(bus.clone(), Arc::clone(&deps.de1_link)));
    let scale_link = Arc::new(ScaleLink::new());

    // Recorder; a fresh subscription and recorder per (re)start.
    let snapshots = CoreSnapshots {
        de1: Arc::clone(&de1),
        de1_handle: de1_handle.clone(),
        scale_handle: scale_handle.clone(),
    };
    {
        let bus = bus.clone();
        let store = store.clone();
        let snapshots = snapshots.clone();
        let shutdown = Arc::clone(&shutdown);
        let window = config.de1.pre_sequence_window;
        supervisor.spawn("recorder", RestartPolicy::default(), move || {
            let sub = bus.subscribe("recorder", None);
            Recorder::new(store.clone(), Box::new(snapshots.clone()), window)
                .run(sub, Arc::clone(&shutdown));
        });
    }

    // Outbound notification forwarding, when a pipe was provided.
    if let Some(pipe) = deps.outbound_pipe.take() {
        let sub = bus.subscribe("outbound", None);
        let topic_root = config.mqtt.topic_root.clone();
        let shutdown_flag = Arc::clone(&shutdown);
        supervisor.spawn_once("outbound", move || {
            outbound::run_forwarder(sub, pipe, topic_root, shutdown_flag);
        });
    }

    // Inbound request pipe, when provided.
    let (api_tx, api_rx) = crossbeam::channel::unbounded::<(ApiRequest, Sender<ApiResponse>)>();
    if let Some((reader, writer)) = deps.inbound_pipe.take() {
        let api_tx = api_tx.clone();
        supervisor.spawn_once("inbound", move || {
            serve_requests(reader, writer, api_tx);
        });
    }

    let settings = SequencerSettings {
        stop_at_weight_adjust: config.de1.stop_at_weight_adjust,
        sequence_watchdog_timeout: config.de1.sequence_watchdog_timeout,
        stop_lead_time: de1.stop_lead_and_fall_time().0,
        fall_time: de1.stop_lead_and_fall_time().1,
    };
    let requester: Arc<dyn crate::sequencer::StateRequester> = Arc::clone(&de1) as _;
    let sequencer =
        FlowSequencer::with_settings(bus.clone(), requester, Arc::clone(&scale_link), settings);

    let scale_processor = ScaleProcessor::new(
        bus.clone(),
        Arc::clone(&scale_link),
        Arc::clone(&deps.tare_sink),
    );

    let mut core = Core {
        config,
        bus: bus.clone(),
        de1,
        de1_handle,
        scale_handle,
        thermometer_handle,
        sequencer,
        scale_link,
        scale_processor,
        profiles: ProfileRegistry::new(store),
        scanner: deps.scanner,
    };

    let core_sub = bus.subscribe(
        "core",
        Some(&[
            EventKind::StateUpdate,
            EventKind::ShotSample,
            EventKind::WeightAndFlow,
            EventKind::DeviceAvailability,
            EventKind::ScaleChange,
        ]),
    );

    let scan_registry = crate::device::ModelRegistry::standard();
    let scanner_events = deps.scanner_events;
    let reports = deps.reports;

    tracing::info!("core loop running");
    loop {
        crossbeam::select! {
            recv(core_sub.receiver()) -> env => {
                if let Ok(env) = env {
                    core.handle_envelope(&env);
                }
            }
            recv(reports) -> report => {
                if let Ok(report) = report {
                    core.handle_report(report, clock.wall());
                }
            }
            recv(scanner_events) -> evt => {
                if let Ok(TransportEvent::Advertisement { address, name }) = evt {
                    let role_candidates = scan_registry
                        .classify(&name)
                        .map(|(_, role)| vec![role])
                        .unwrap_or_default();
                    core.bus.publish(
                        "Scanner",
                        clock.wall(),
                        crate::event::Payload::ScanReport(crate::event::ScanReport {
                            address,
                            name: Some(name),
                            role_candidates,
                        }),
                    );
                }
            }
            recv(api_rx) -> msg => {
                if let Ok((request, respond)) = msg {
                    let response = api::dispatch(&mut core, &request);
                    let _ = respond.send(response);
                }
            }
            default(Duration::from_millis(100)) => {
                core.tick(clock.wall());
            }
        }
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
    }

    // Ordered drain: close any open sequence, release devices, then let
    // the workers flush and exit.
    tracing::info!("shutting down");
    core.sequencer.abort_for_shutdown(clock.wall());
    std::thread::sleep(Duration::from_millis(200));
    let _ = core.de1_handle.shutdown();
    let _ = core.scale_handle.shutdown();
    let _ = core.thermometer_handle.shutdown();
    drop(core_sub);
    supervisor.drain();
    tracing::info!("daemon stopped");
    Ok(())
}

/// Drive the framed request/response protocol over one pipe pair.
/// Requests are forwarded to the core loop; responses come back in
/// order.
pub fn serve_requests<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    api_tx: Sender<(ApiRequest, Sender<ApiResponse>)>,
) {
    loop {
        let request: ApiRequest = match ipc::read_frame(&mut reader) {
            Ok(Some(req)) => req,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("inbound frame error: {e}");
                break;
            }
        };
        let (respond_tx, respond_rx) = crossbeam::channel::bounded(1);
        if api_tx.send((request, respond_tx)).is_err() {
            break;
        }
        let Ok(response) = respond_rx.recv_timeout(Duration::from_secs(10)) else {
            tracing::error!("core did not answer a request in time");
            break;
        };
        if let Err(e) = ipc::write_frame(&mut writer, &response) {
            tracing::error!("inbound response write failed: {e}");
            break;
        }
    }
    tracing::info!("request server stopped");
}
