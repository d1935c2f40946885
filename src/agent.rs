//! Agent message handling: routes hub traffic through the engine
//!
//! One instance owns the property router, the inbound command dispatcher,
//! and the outbound command client. The connection event loop feeds every
//! received envelope into [`Agent::handle_hub_message`]; envelopes are
//! processed one at a time, so writes to the same property keep their
//! delivery order.

use crate::hardware::FirmwareInstaller;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use twinlink_engine::{
    AckOutcome, CommandClient, CommandDispatcher, CommandReply, CommandSink, OutboundCommand,
    PropertyRouter, ReplyStatus, TwinError, WriteRequest,
};
use twinlink_shared::schema::{FirmwareUpdateRequest, FirmwareUpdateResponse, RebootRequest, RebootResponse};
use twinlink_shared::{
    envelope, limits, now_ms, CommandRequest, CommandResponse, CommandStatus, Envelope, Header,
    MessageType, PropertyAck, PropertyWrite, ReportedEntry, ReportedUpdate,
};

pub const THERMOSTAT_COMPONENT: &str = "thermostat";
pub const CONFIG_COMPONENT: &str = "deviceConfig";
pub const TARGET_TEMPERATURE: &str = "targetTemperature";
pub const TEMPERATURE_METRIC: &str = "temperature";
pub const REBOOT_COMMAND: &str = "reboot";
pub const UPDATE_FIRMWARE_COMMAND: &str = "updateFirmware";

const SERIAL_NUMBER: &str = "JAMESD1234";
const HARDWARE_VERSION: &str = "1.2.4";
const SENSOR_COUNT: u32 = 1;

/// Delivers outbound command frames through the connection manager
pub struct ConnectionSink {
    device_id: String,
    sequence_id: Arc<AtomicU64>,
    sender: mpsc::Sender<Envelope>,
}

impl ConnectionSink {
    pub fn new(
        device_id: String,
        sequence_id: Arc<AtomicU64>,
        sender: mpsc::Sender<Envelope>,
    ) -> Self {
        Self {
            device_id,
            sequence_id,
            sender,
        }
    }
}

#[async_trait::async_trait]
impl CommandSink for ConnectionSink {
    async fn deliver(&self, command: OutboundCommand) -> Result<()> {
        let seq = self.sequence_id.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = Envelope {
            header: Some(Header::new(
                &self.device_id,
                MessageType::MsgCommandRequest,
                seq,
            )),
            payload: Some(envelope::Payload::CommandRequest(CommandRequest {
                command_id: command.command_id,
                component: command.component,
                name: command.name,
                schema_id: command.schema_id,
                payload: command.payload.to_vec(),
            })),
        };

        self.sender
            .send(envelope)
            .await
            .map_err(|_| anyhow!("connection closed"))
    }
}

/// Everything the event loop needs to process one hub message
pub struct Agent {
    device_id: String,
    sequence_id: Arc<AtomicU64>,
    sender: mpsc::Sender<Envelope>,
    router: PropertyRouter,
    dispatcher: Arc<CommandDispatcher>,
    commands: Arc<CommandClient>,
    firmware: Arc<FirmwareInstaller>,
}

impl Agent {
    pub fn new(
        device_id: String,
        sequence_id: Arc<AtomicU64>,
        sender: mpsc::Sender<Envelope>,
        router: PropertyRouter,
        dispatcher: Arc<CommandDispatcher>,
        commands: Arc<CommandClient>,
        firmware: Arc<FirmwareInstaller>,
    ) -> Self {
        Self {
            device_id,
            sequence_id,
            sender,
            router,
            dispatcher,
            commands,
            firmware,
        }
    }

    fn next_seq(&self) -> u64 {
        self.sequence_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn send(&self, msg_type: MessageType, payload: envelope::Payload) -> Result<()> {
        let envelope = Envelope {
            header: Some(Header::new(&self.device_id, msg_type, self.next_seq())),
            payload: Some(payload),
        };
        self.sender
            .send(envelope)
            .await
            .map_err(|_| anyhow!("connection closed"))
    }

    /// Report the fixed identity properties plus the installed firmware
    pub async fn report_identity(&self) -> Result<()> {
        let entries = vec![
            reported_entry(CONFIG_COMPONENT, "serialNumber", json!(SERIAL_NUMBER)),
            reported_entry(CONFIG_COMPONENT, "hardwareVersion", json!(HARDWARE_VERSION)),
            reported_entry(CONFIG_COMPONENT, "sensorCount", json!(SENSOR_COUNT)),
            reported_entry(
                CONFIG_COMPONENT,
                "firmwareVersion",
                json!(self.firmware.installed_version().await),
            ),
        ];

        self.send(
            MessageType::MsgReportedUpdate,
            envelope::Payload::ReportedUpdate(ReportedUpdate { entries }),
        )
        .await
    }

    /// Process one envelope received from the hub
    pub async fn handle_hub_message(self: &Arc<Self>, envelope: Envelope) {
        let Some(header) = &envelope.header else {
            error!("received envelope without header");
            return;
        };

        let msg_type = MessageType::try_from(header.msg_type).unwrap_or(MessageType::MsgUnknown);
        debug!(seq = header.sequence_id, ?msg_type, "hub message");

        match envelope.payload {
            Some(envelope::Payload::PropertyWrite(write)) => {
                if let Err(e) = self.handle_property_write(write).await {
                    error!("failed to acknowledge property write: {}", e);
                }
            }
            Some(envelope::Payload::CommandRequest(request)) => {
                if let Err(e) = self.handle_command_request(request).await {
                    error!("failed to respond to command: {}", e);
                }
            }
            Some(envelope::Payload::CommandResponse(response)) => {
                self.handle_command_response(response).await;
            }
            Some(envelope::Payload::TwinSnapshot(snapshot)) => {
                info!(entries = snapshot.entries.len(), "twin snapshot received");
                self.spawn_firmware_check();
            }
            _ => debug!(?msg_type, "unhandled hub payload"),
        }
    }

    /// Reconcile one desired write and acknowledge it. An accepted write
    /// also becomes the device's reported value.
    async fn handle_property_write(&self, write: PropertyWrite) -> Result<()> {
        let value: serde_json::Value =
            serde_json::from_str(&write.value_json).unwrap_or_else(|e| {
                warn!(
                    component = %write.component,
                    name = %write.name,
                    "unparseable write value: {}",
                    e
                );
                serde_json::Value::Null
            });

        let request = WriteRequest {
            component: write.component.clone(),
            name: write.name.clone(),
            value,
            version: write.version,
        };

        let Some(ack) = self.router.route(&request).await else {
            warn!(
                component = %write.component,
                name = %write.name,
                "write to unknown property"
            );
            let ack = PropertyAck::rejected(&write, "null", "no such writable property");
            return self
                .send(MessageType::MsgPropertyAck, envelope::Payload::PropertyAck(ack))
                .await;
        };

        info!(
            component = %write.component,
            name = %write.name,
            version = write.version,
            outcome = ?ack.outcome,
            "property write reconciled"
        );

        let value_json = serde_json::Value::from(ack.outcome.value()).to_string();
        let accepted = matches!(ack.outcome, AckOutcome::Accepted { .. });

        let property_ack = match &ack.outcome {
            AckOutcome::Accepted { .. } => {
                PropertyAck::accepted(&write, value_json.as_str(), ack.outcome.message())
            }
            AckOutcome::Rejected { .. } => {
                PropertyAck::rejected(&write, value_json.as_str(), ack.outcome.message())
            }
            AckOutcome::Unchanged { .. } => {
                PropertyAck::unchanged(&write, value_json.as_str(), ack.outcome.message())
            }
        };
        self.send(
            MessageType::MsgPropertyAck,
            envelope::Payload::PropertyAck(property_ack),
        )
        .await?;

        if accepted {
            let update = ReportedUpdate {
                entries: vec![ReportedEntry {
                    component: write.component,
                    name: write.name,
                    value_json,
                }],
            };
            self.send(
                MessageType::MsgReportedUpdate,
                envelope::Payload::ReportedUpdate(update),
            )
            .await?;
        }

        Ok(())
    }

    /// Dispatch one hub-issued command and send back its response
    async fn handle_command_request(&self, request: CommandRequest) -> Result<()> {
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
                    component = %request.component,
                    name = %request.name,
                    "command failed: {}",
                    e
                );
                command_error_response(request.command_id, &e)
            }
        };

        self.send(
            MessageType::MsgCommandResponse,
            envelope::Payload::CommandResponse(response),
        )
        .await
    }

    /// Resolve the reply to a command this agent issued earlier
    async fn handle_command_response(&self, response: CommandResponse) {
        let status = CommandStatus::try_from(response.status).unwrap_or(CommandStatus::StatusUnknown);
        let status = match status {
            CommandStatus::StatusCompleted => ReplyStatus::Completed,
            CommandStatus::StatusRejected => ReplyStatus::Rejected,
            CommandStatus::StatusUnknownCommand => ReplyStatus::UnknownCommand,
            _ => ReplyStatus::Failed,
        };

        self.commands
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

    /// Ask the hub for newer firmware in the background
    fn spawn_firmware_check(self: &Arc<Self>) {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = agent.check_firmware().await {
                warn!("firmware check failed: {}", e);
            }
        });
    }

    async fn check_firmware(&self) -> Result<()> {
        let current = self.firmware.installed_version().await;
        info!(%current, "checking for firmware update");

        let request = FirmwareUpdateRequest {
            current_version: current.clone(),
        };
        let decision: FirmwareUpdateResponse = self
            .commands
            .send_command(
                CONFIG_COMPONENT,
                UPDATE_FIRMWARE_COMMAND,
                &request,
                Duration::from_millis(limits::DEFAULT_COMMAND_DEADLINE_MS),
            )
            .await?;

        if !decision.should_update {
            info!(%current, "firmware already current");
            return Ok(());
        }

        self.firmware.install(&decision.version, &decision.image).await?;
        info!(version = %decision.version, "firmware installed");

        self.send(
            MessageType::MsgReportedUpdate,
            envelope::Payload::ReportedUpdate(ReportedUpdate {
                entries: vec![reported_entry(
                    CONFIG_COMPONENT,
                    "firmwareVersion",
                    json!(decision.version),
                )],
            }),
        )
        .await
    }
}

/// Decide whether a reboot request fires now or is only scheduled
pub async fn handle_reboot(request: RebootRequest) -> Result<RebootResponse> {
    let now = now_ms();
    let status = if request.when_to_reboot_ms <= now {
        info!("reboot requested for the past, rebooting now");
        "rebooting now".to_string()
    } else {
        let delay_s = (request.when_to_reboot_ms - now) / 1000;
        info!(in_seconds = delay_s, "reboot scheduled");
        format!("scheduled in {}s", delay_s)
    };

    Ok(RebootResponse { status })
}

fn reported_entry(component: &str, name: &str, value: serde_json::Value) -> ReportedEntry {
    ReportedEntry {
        component: component.to_string(),
        name: name.to_string(),
        value_json: value.to_string(),
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
