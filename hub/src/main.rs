mod session;
mod twin;

use anyhow::Result;
use bytes::Bytes;
use session::{DeviceSession, SessionHandle, SessionManager, SessionSink, HUB_ID};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use twin::{FirmwareCatalog, TwinStore};
use twinlink_engine::{CommandClient, CommandDispatcher, CommandReply, ReplyStatus, TwinError};
use twinlink_shared::schema::{
    FirmwareUpdateRequest, FirmwareUpdateResponse, RebootRequest, RebootResponse, SchemaRegistry,
};
use twinlink_shared::{
    envelope, limits, now_ms, AckCode, CommandResponse, CommandStatus, Envelope, Header,
    MessageType, TwinSnapshot,
};

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const THERMOSTAT_COMPONENT: &str = "thermostat";
const TARGET_TEMPERATURE: &str = "targetTemperature";
const CONFIG_COMPONENT: &str = "deviceConfig";
const REBOOT_COMMAND: &str = "reboot";
const UPDATE_FIRMWARE_COMMAND: &str = "updateFirmware";

const LATEST_FIRMWARE: &str = "2.1.0";

/// Setpoint seeded for a device the hub has never written to
const SEED_TARGET: f64 = 24.0;

struct HubConfig {
    listen_addr: String,
    /// When set, every connected device is told to reboot this long
    /// after the hub notices it
    reboot_after: Option<Duration>,
}

impl HubConfig {
    fn from_env() -> Self {
        let listen_addr = std::env::var("TWINLINK_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let reboot_after = match std::env::var("TWINLINK_REBOOT_AFTER_SECS") {
            Ok(raw) => match raw.parse::<u64>() {
                Ok(secs) => Some(Duration::from_secs(secs)),
                Err(_) => {
                    warn!("ignoring unparseable TWINLINK_REBOOT_AFTER_SECS: {}", raw);
                    None
                }
            },
            Err(_) => None,
        };

        Self {
            listen_addr,
            reboot_after,
        }
    }
}

struct Hub {
    sessions: SessionManager,
    twins: TwinStore,
    dispatcher: Arc<CommandDispatcher>,
    sequence_id: Arc<AtomicU64>,
    schemas: SchemaRegistry,
}

impl Hub {
    async fn new(catalog: FirmwareCatalog) -> Self {
        let dispatcher = Arc::new(CommandDispatcher::new());

        let catalog = Arc::new(catalog);
        dispatcher
            .register::<FirmwareUpdateRequest, FirmwareUpdateResponse, _, _>(
                CONFIG_COMPONENT,
                UPDATE_FIRMWARE_COMMAND,
                move |request| {
                    let catalog = catalog.clone();
                    async move { Ok(catalog.evaluate(&request)) }
                },
            )
            .await;

        Self {
            sessions: SessionManager::new(),
            twins: TwinStore::new(),
            dispatcher,
            sequence_id: Arc::new(AtomicU64::new(0)),
            schemas: SchemaRegistry::with_builtins(),
        }
    }

    fn next_seq(&self) -> u64 {
        self.sequence_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn outbound(&self, msg_type: MessageType, payload: envelope::Payload) -> Envelope {
        Envelope {
            header: Some(Header::new(HUB_ID, msg_type, self.next_seq())),
            payload: Some(payload),
        }
    }

    /// Register a newly identified device: set up its command client,
    /// send it the twin snapshot, and push any unacknowledged writes
    async fn register_device(&self, handle: SessionHandle) -> Result<()> {
        let device_id = handle.device_id.clone();

        let sink = SessionSink::new(handle.clone(), self.sequence_id.clone());
        let commands = Arc::new(CommandClient::new(Arc::new(sink)));
        self.sessions.register(handle.clone(), commands).await;
        let connected = self.sessions.count().await;
        info!(
            device = %device_id,
            connected,
            "device registered"
        );

        let entries = self.twins.reported_snapshot(&device_id).await;
        let snapshot = self.outbound(
            MessageType::MsgTwinSnapshot,
            envelope::Payload::TwinSnapshot(TwinSnapshot { entries }),
        );
        handle.send(&snapshot).await?;

        // First contact: give the device a starting setpoint
        if !self
            .twins
            .has_desired(&device_id, THERMOSTAT_COMPONENT, TARGET_TEMPERATURE)
            .await
        {
            let value_json = serde_json::Value::from(SEED_TARGET).to_string();
            let version = self
                .twins
                .set_desired(&device_id, THERMOSTAT_COMPONENT, TARGET_TEMPERATURE, &value_json)
                .await;
            info!(device = %device_id, version, value = %value_json, "seeded desired setpoint");
        }

        // Writes issued while the device was away go out again, oldest
        // version first
        for write in self.twins.pending_writes(&device_id).await {
            info!(
                device = %device_id,
                component = %write.component,
                name = %write.name,
                version = write.version,
                value = %write.value_json,
                "sending desired write"
            );
            let envelope = self.outbound(
                MessageType::MsgPropertyWrite,
                envelope::Payload::PropertyWrite(write),
            );
            handle.send(&envelope).await?;
        }

        Ok(())
    }

    /// Process one envelope received from a device
    async fn handle_device_message(&self, device_id: &str, envelope: Envelope) {
        match envelope.payload {
            Some(envelope::Payload::Telemetry(telemetry)) => {
                info!(
                    device = %device_id,
                    component = %telemetry.component,
                    metric = %telemetry.metric,
                    value = telemetry.value,
                    "telemetry"
                );
            }
            Some(envelope::Payload::PropertyAck(ack)) => {
                let code = AckCode::try_from(ack.code).unwrap_or(AckCode::AckUnknown);
                info!(
                    device = %device_id,
                    component = %ack.component,
                    name = %ack.name,
                    version = ack.version,
                    ?code,
                    value = %ack.value_json,
                    message = %ack.message,
                    "property ack"
                );
                self.twins.record_ack(device_id, &ack).await;
            }
            Some(envelope::Payload::ReportedUpdate(update)) => {
                debug!(device = %device_id, entries = update.entries.len(), "reported update");
                self.twins.update_reported(device_id, &update.entries).await;
            }
            Some(envelope::Payload::CommandRequest(request)) => {
                self.handle_device_command(device_id, request).await;
            }
            Some(envelope::Payload::CommandResponse(response)) => {
                self.handle_command_response(device_id, response).await;
            }
            _ => debug!(device = %device_id, "unhandled device payload"),
        }
    }

    /// Dispatch a device-issued command (e.g. a firmware check) and send
    /// the response back over the device's session
    async fn handle_device_command(
        &self,
        device_id: &str,
        request: twinlink_shared::CommandRequest,
    ) {
        match self.schemas.decode(&request.schema_id, &request.payload) {
            Ok(payload) => {
                debug!(device = %device_id, schema = %request.schema_id, ?payload, "device command")
            }
            Err(e) => {
                debug!(
                    device = %device_id,
                    schema = %request.schema_id,
                    "undecodable device command: {}",
                    e
                )
            }
        }

        let result = self
            .dispatcher
            .dispatch(&request.component, &request.name, Bytes::from(request.payload))
            .await;

        let response = match result {
            Ok(reply) => CommandResponse::completed(
                request.command_id,
                reply.schema_id,
                reply.payload.to_vec(),
            ),
            Err(e) => {
                warn!(
                    device = %device_id,
                    component = %request.component,
                    name = %request.name,
                    "device command failed: {}",
                    e
                );
                command_error_response(request.command_id, &e)
            }
        };

        let envelope = self.outbound(
            MessageType::MsgCommandResponse,
            envelope::Payload::CommandResponse(response),
        );
        if let Err(e) = self.sessions.send_to(device_id, &envelope).await {
            warn!(device = %device_id, "failed to send command response: {}", e);
        }
    }

    /// Resolve the reply to a command the hub issued earlier
    async fn handle_command_response(&self, device_id: &str, response: CommandResponse) {
        let Some(commands) = self.sessions.commands(device_id).await else {
            debug!(device = %device_id, "command response from unregistered device");
            return;
        };

        let status = CommandStatus::try_from(response.status).unwrap_or(CommandStatus::StatusUnknown);
        let status = match status {
            CommandStatus::StatusCompleted => ReplyStatus::Completed,
            CommandStatus::StatusRejected => ReplyStatus::Rejected,
            CommandStatus::StatusUnknownCommand => ReplyStatus::UnknownCommand,
            _ => ReplyStatus::Failed,
        };

        commands
            .complete(
                response.command_id,
                CommandReply {
                    status,
                    payload: Bytes::from(response.payload),
                    message: response.message,
                },
            )
            .await;
    }
}

/// Map a dispatch error onto the wire status taxonomy
fn command_error_response(command_id: u64, error: &TwinError) -> CommandResponse {
    match error {
        TwinError::UnknownCommand { .. } => {
            CommandResponse::unknown_command(command_id, error.to_string())
        }
        TwinError::Parse(_) => CommandResponse::rejected(command_id, error.to_string()),
        _ => CommandResponse::failed(command_id, error.to_string()),
    }
}

/// Pump one device session from accept to close
async fn run_session(hub: Arc<Hub>, stream: TcpStream, addr: SocketAddr) {
    let mut session = DeviceSession::new(stream, addr);
    let mut registered = false;

    while let Some(envelope) = session.recv().await {
        if envelope.header.is_none() {
            error!(%addr, "received envelope without header");
            continue;
        }

        // The first identified frame completes registration
        if !registered && !session.device_id().is_empty() {
            if let Err(e) = hub.register_device(session.handle()).await {
                warn!(device = %session.device_id(), "registration sends failed: {}", e);
            }
            registered = true;
        }

        hub.handle_device_message(session.device_id(), envelope).await;
    }

    let connected_for = session.handle.connected_at.elapsed();
    let device_id = session.device_id().to_string();
    if device_id.is_empty() {
        info!(%addr, "session closed before identification");
    } else {
        hub.sessions.unregister(&device_id).await;
        info!(device = %device_id, ?connected_for, "session closed");
    }
}

/// Once a device shows up, order it to reboot `after` from now
fn schedule_maintenance_reboot(hub: Arc<Hub>, after: Duration) {
    tokio::spawn(async move {
        let device_ids = loop {
            let ids = hub.sessions.connected_devices().await;
            if !ids.is_empty() {
                break ids;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        };

        for device_id in device_ids {
            let Some(commands) = hub.sessions.commands(&device_id).await else {
                continue;
            };

            let request = RebootRequest {
                when_to_reboot_ms: now_ms() + after.as_millis() as u64,
            };
            info!(device = %device_id, after_secs = after.as_secs(), "sending maintenance reboot");

            let result = commands
                .send_command::<_, RebootResponse>(
                    THERMOSTAT_COMPONENT,
                    REBOOT_COMMAND,
                    &request,
                    Duration::from_millis(limits::DEFAULT_COMMAND_DEADLINE_MS),
                )
                .await;
            match result {
                Ok(response) => {
                    info!(device = %device_id, status = %response.status, "reboot acknowledged")
                }
                Err(e) => warn!(device = %device_id, "reboot command failed: {}", e),
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = HubConfig::from_env();
    let catalog = FirmwareCatalog::new(LATEST_FIRMWARE, b"twinlink-image-2.1.0".to_vec());

    info!("Hub starting");
    info!("  listen: {}", config.listen_addr);
    info!("  latest firmware: {}", catalog.latest_version());

    let hub = Arc::new(Hub::new(catalog).await);

    // Sweep sessions that stopped sending traffic
    let sweeper = hub.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            for device_id in sweeper.sessions.remove_dead_sessions().await {
                warn!(device = %device_id, "session timed out");
            }
        }
    });

    if let Some(after) = config.reboot_after {
        schedule_maintenance_reboot(hub.clone(), after);
    }

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("Hub listening on {}", config.listen_addr);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("Connection from: {}", addr);

        let hub = hub.clone();
        tokio::spawn(async move {
            run_session(hub, stream, addr).await;
        });
    }
}
