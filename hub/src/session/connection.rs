//! Individual device session handling

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::warn;
use twinlink_engine::{CommandSink, OutboundCommand};
use twinlink_shared::codec::{self, FrameDecoder};
use twinlink_shared::{envelope, limits, CommandRequest, Envelope, Header, MessageType};

/// Sender id the hub puts in its envelope headers
pub const HUB_ID: &str = "hub";

/// Handle to send messages to a specific device
#[derive(Clone)]
pub struct SessionHandle {
    pub device_id: String,
    pub addr: SocketAddr,
    writer: Arc<Mutex<WriteHalf<TcpStream>>>,
    pub connected_at: Instant,
    pub last_seen: Arc<Mutex<Instant>>,
}

impl SessionHandle {
    /// Send an envelope to this device
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let encoded = codec::encode(envelope)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        Ok(())
    }

    /// Check if the session is still alive (traffic seen recently)
    pub async fn is_alive(&self) -> bool {
        let last = *self.last_seen.lock().await;
        last.elapsed().as_millis() < limits::SESSION_TIMEOUT_MS as u128
    }

    /// Record that traffic arrived from this device
    pub async fn touch(&self) {
        *self.last_seen.lock().await = Instant::now();
    }
}

/// Active device session
pub struct DeviceSession {
    pub handle: SessionHandle,
    reader: ReadHalf<TcpStream>,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
}

impl DeviceSession {
    /// Create a new device session from a TCP stream
    pub fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let now = Instant::now();

        let handle = SessionHandle {
            device_id: String::new(), // Will be set on first message
            addr,
            writer: Arc::new(Mutex::new(writer)),
            connected_at: now,
            last_seen: Arc::new(Mutex::new(now)),
        };

        Self {
            handle,
            reader,
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 4096],
        }
    }

    /// Get a cloneable handle for sending messages
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Read the next envelope from this session.
    /// Returns None if the connection is closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            // First try to decode from existing buffer
            match self.decoder.decode_next() {
                Ok(Some(envelope)) => {
                    // Update device ID from header if not set
                    if self.handle.device_id.is_empty() {
                        if let Some(ref header) = envelope.header {
                            self.handle.device_id = header.device_id.clone();
                        }
                    }

                    // Any inbound frame counts as liveness
                    self.handle.touch().await;

                    return Some(envelope);
                }
                Ok(None) => {
                    // Need more data
                }
                Err(e) => {
                    warn!("decode error from {}: {}", self.handle.addr, e);
                    return None;
                }
            }

            // Read more data
            match self.reader.read(&mut self.read_buf).await {
                Ok(0) => return None, // Connection closed
                Ok(n) => {
                    self.decoder.extend(&self.read_buf[..n]);
                }
                Err(e) => {
                    warn!("read error from {}: {}", self.handle.addr, e);
                    return None;
                }
            }
        }
    }

    /// Get the device ID (may be empty until first message received)
    pub fn device_id(&self) -> &str {
        &self.handle.device_id
    }
}

/// Delivers outbound command frames to one device session
pub struct SessionSink {
    handle: SessionHandle,
    sequence_id: Arc<AtomicU64>,
}

impl SessionSink {
    pub fn new(handle: SessionHandle, sequence_id: Arc<AtomicU64>) -> Self {
        Self {
            handle,
            sequence_id,
        }
    }
}

#[async_trait::async_trait]
impl CommandSink for SessionSink {
    async fn deliver(&self, command: OutboundCommand) -> Result<()> {
        let seq = self.sequence_id.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = Envelope {
            header: Some(Header::new(HUB_ID, MessageType::MsgCommandRequest, seq)),
            payload: Some(envelope::Payload::CommandRequest(CommandRequest {
                command_id: command.command_id,
                component: command.component,
                name: command.name,
                schema_id: command.schema_id,
                payload: command.payload.to_vec(),
            })),
        };
        self.handle.send(&envelope).await
    }
}
