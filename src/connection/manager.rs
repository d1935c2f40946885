//! Connection manager with a persistent hub link and automatic reconnection

use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use twinlink_shared::codec::{self, FrameDecoder};
use twinlink_shared::limits;
use twinlink_shared::Envelope;
use tracing::warn;

/// Events emitted by the connection manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Successfully connected to the hub
    Connected,
    /// Disconnected from the hub
    Disconnected { reason: String },
    /// Received an envelope from the hub
    Received(Envelope),
}

/// Configuration for the hub connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Device ID this agent presents to the hub
    pub device_id: String,
    /// Hub address
    pub hub_addr: String,
    /// Reconnection delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            device_id: "therm-001".into(),
            hub_addr: "127.0.0.1:8080".into(),
            reconnect_delay: Duration::from_millis(limits::RECONNECT_DELAY_MS),
            max_reconnect_delay: Duration::from_millis(limits::MAX_RECONNECT_DELAY_MS),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Manages the persistent connection to the hub
pub struct ConnectionManager {
    config: ConnectionConfig,
    /// Channel to send envelopes to the hub
    outbound_tx: mpsc::Sender<Envelope>,
    /// Channel to receive connection events
    event_rx: mpsc::Receiver<ConnectionEvent>,
}

impl ConnectionManager {
    /// Create a new connection manager and start the connection loop
    pub fn new(config: ConnectionConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Envelope>(100);
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(100);

        let config_clone = config.clone();
        tokio::spawn(async move {
            connection_loop(config_clone, outbound_rx, event_tx).await;
        });

        Self {
            config,
            outbound_tx,
            event_rx,
        }
    }

    /// Send an envelope to the hub
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.outbound_tx
            .send(envelope)
            .await
            .map_err(|_| anyhow!("connection closed"))
    }

    /// Receive the next connection event
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    /// Get the device ID
    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    /// Get a clone of the sender for outbound messages
    pub fn sender(&self) -> mpsc::Sender<Envelope> {
        self.outbound_tx.clone()
    }
}

/// Main connection loop with exponential reconnect backoff
async fn connection_loop(
    config: ConnectionConfig,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    event_tx: mpsc::Sender<ConnectionEvent>,
) {
    let mut reconnect_delay = config.reconnect_delay;

    loop {
        match timeout(config.connect_timeout, TcpStream::connect(&config.hub_addr)).await {
            Ok(Ok(stream)) => {
                reconnect_delay = config.reconnect_delay;

                let _ = event_tx.send(ConnectionEvent::Connected).await;

                if let Err(reason) =
                    handle_connection(stream, &mut outbound_rx, &event_tx).await
                {
                    let _ = event_tx
                        .send(ConnectionEvent::Disconnected {
                            reason: reason.to_string(),
                        })
                        .await;
                }
            }
            Ok(Err(e)) => {
                warn!("connect to {} failed: {}", config.hub_addr, e);
            }
            Err(_) => {
                warn!("connect to {} timed out", config.hub_addr);
            }
        }

        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = std::cmp::min(reconnect_delay * 2, config.max_reconnect_delay);
    }
}

/// Pump one active connection until it drops
async fn handle_connection(
    stream: TcpStream,
    outbound_rx: &mut mpsc::Receiver<Envelope>,
    event_tx: &mpsc::Sender<ConnectionEvent>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            // Send outbound messages
            Some(envelope) = outbound_rx.recv() => {
                let encoded = codec::encode(&envelope)?;
                writer.write_all(&encoded).await?;
            }

            // Read incoming messages
            result = reader.read(&mut read_buf) => {
                match result {
                    Ok(0) => return Err(anyhow!("hub closed connection")),
                    Ok(n) => {
                        decoder.extend(&read_buf[..n]);

                        while let Some(envelope) = decoder.decode_next()? {
                            let _ = event_tx.send(ConnectionEvent::Received(envelope)).await;
                        }
                    }
                    Err(e) => return Err(anyhow!("read error: {}", e)),
                }
            }
        }
    }
}
