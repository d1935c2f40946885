//! Periodic telemetry emission

use crate::agent::{TEMPERATURE_METRIC, THERMOSTAT_COMPONENT};
use crate::hardware::Thermostat;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, warn};
use twinlink_shared::{envelope, limits, now_ms, Envelope, Header, MessageType, Telemetry};

/// Stream thermostat temperature samples to the hub at a fixed interval.
///
/// A failed send is logged and the loop keeps ticking; frames queue on
/// the connection manager, which redelivers once the link is back.
pub async fn run_telemetry_loop(
    device_id: String,
    thermostat: Arc<Thermostat>,
    sequence_id: Arc<AtomicU64>,
    sender: mpsc::Sender<Envelope>,
) {
    let mut ticker = interval(Duration::from_millis(limits::TELEMETRY_INTERVAL_MS));

    loop {
        ticker.tick().await;

        let value = thermostat.sample().await;
        let seq = sequence_id.fetch_add(1, Ordering::SeqCst) + 1;

        let envelope = Envelope {
            header: Some(Header::new(&device_id, MessageType::MsgTelemetry, seq)),
            payload: Some(envelope::Payload::Telemetry(Telemetry {
                component: THERMOSTAT_COMPONENT.to_string(),
                metric: TEMPERATURE_METRIC.to_string(),
                value,
                sampled_at_ms: now_ms(),
            })),
        };

        if let Err(e) = sender.send(envelope).await {
            warn!("failed to queue telemetry: {}", e);
        } else {
            debug!(value, "telemetry sample queued");
        }
    }
}
