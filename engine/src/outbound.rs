//! Outbound commands to the counterpart endpoint
//!
//! [`CommandClient`] performs exactly one attempt per call: serialize the
//! request, hand the frame to the transport sink, then wait for the
//! correlated reply until the caller's deadline. Retrying is the caller's
//! policy; nothing here retries on its own.

use crate::error::TwinError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;
use twinlink_shared::now_ms;
use twinlink_shared::schema::Schema;

/// A serialized command handed to the transport
#[derive(Debug, Clone)]
pub struct OutboundCommand {
    pub command_id: u64,
    pub component: String,
    pub name: String,
    pub schema_id: String,
    pub payload: Bytes,
}

/// Reply status reported by the remote end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Completed,
    Failed,
    Rejected,
    UnknownCommand,
}

/// A reply correlated to an outbound command
#[derive(Debug, Clone)]
pub struct CommandReply {
    pub status: ReplyStatus,
    pub payload: Bytes,
    pub message: String,
}

/// Transport collaborator that delivers outbound command frames
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn deliver(&self, command: OutboundCommand) -> anyhow::Result<()>;
}

struct PendingReply {
    reply_tx: oneshot::Sender<CommandReply>,
    expires_at_ms: u64,
}

/// Issues commands to the counterpart and correlates replies by id
pub struct CommandClient {
    sink: Arc<dyn CommandSink>,
    command_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingReply>>,
}

impl CommandClient {
    pub fn new(sink: Arc<dyn CommandSink>) -> Self {
        Self {
            sink,
            command_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn next_command_id(&self) -> u64 {
        self.command_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Send one command and wait for its typed reply.
    ///
    /// The deadline is the caller's: once it elapses the call returns
    /// [`TwinError::Timeout`] and a reply arriving later is discarded. A
    /// zero deadline times out before the transport is even contacted.
    pub async fn send_command<Req, Resp>(
        &self,
        component: &str,
        name: &str,
        request: &Req,
        deadline: Duration,
    ) -> Result<Resp, TwinError>
    where
        Req: Schema,
        Resp: Schema,
    {
        if deadline.is_zero() {
            return Err(TwinError::Timeout(deadline));
        }

        let payload = request.to_bytes()?;
        let command_id = self.next_command_id();
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                command_id,
                PendingReply {
                    reply_tx,
                    expires_at_ms: now_ms() + deadline.as_millis() as u64,
                },
            );
        }

        let command = OutboundCommand {
            command_id,
            component: component.to_string(),
            name: name.to_string(),
            schema_id: Req::SCHEMA_ID.to_string(),
            payload,
        };

        if let Err(e) = self.sink.deliver(command).await {
            self.pending.lock().await.remove(&command_id);
            return Err(TwinError::Transport(e.to_string()));
        }

        let reply = match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                // Pending entry was dropped without a reply
                return Err(TwinError::Transport("reply channel closed".to_string()));
            }
            Err(_) => {
                self.pending.lock().await.remove(&command_id);
                return Err(TwinError::Timeout(deadline));
            }
        };

        match reply.status {
            ReplyStatus::Completed => Ok(Resp::from_bytes(&reply.payload)?),
            ReplyStatus::UnknownCommand => Err(TwinError::UnknownCommand {
                component: component.to_string(),
                name: name.to_string(),
            }),
            ReplyStatus::Failed | ReplyStatus::Rejected => {
                Err(TwinError::remote_failure(reply.message))
            }
        }
    }

    /// Resolve a pending command with a reply from the remote end.
    ///
    /// Replies for unknown ids, including commands that already timed
    /// out, are discarded.
    pub async fn complete(&self, command_id: u64, reply: CommandReply) {
        let entry = self.pending.lock().await.remove(&command_id);
        match entry {
            Some(pending) => {
                if pending.reply_tx.send(reply).is_err() {
                    debug!(command_id, "caller gone before reply arrived");
                }
            }
            None => debug!(command_id, "discarding reply for unknown command"),
        }
    }

    /// Drop pending entries whose deadline has passed. Normally the
    /// sender removes its own entry on timeout; this sweep catches
    /// entries orphaned by cancelled callers.
    pub async fn discard_expired(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let now = now_ms();
        let before = pending.len();
        pending.retain(|_, entry| entry.expires_at_ms > now);
        before - pending.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
