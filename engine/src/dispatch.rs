//! Inbound command dispatch
//!
//! Handlers are registered per (component, name) and invoked in the
//! calling task; there is no queue between receipt and execution. The
//! dispatcher decodes the request payload into the handler's typed
//! request, runs the handler, and encodes its typed response.

use crate::error::TwinError;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use twinlink_shared::schema::Schema;

/// Encoded reply produced by a dispatched handler
#[derive(Debug, Clone)]
pub struct DispatchReply {
    pub schema_id: &'static str,
    pub payload: Bytes,
}

type BoxedHandler =
    Arc<dyn Fn(Bytes) -> BoxFuture<'static, Result<DispatchReply, TwinError>> + Send + Sync>;

/// Dispatches inbound commands to their registered handlers
#[derive(Default)]
pub struct CommandDispatcher {
    handlers: RwLock<HashMap<(String, String), BoxedHandler>>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a typed handler for (component, name).
    ///
    /// One handler per command: registering the same (component, name)
    /// again silently replaces the previous handler, so the last
    /// registration wins.
    pub async fn register<Req, Resp, F, Fut>(
        &self,
        component: impl Into<String>,
        name: impl Into<String>,
        handler: F,
    ) where
        Req: Schema,
        Resp: Schema,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let boxed: BoxedHandler = Arc::new(move |payload: Bytes| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let request = Req::from_bytes(&payload)?;
                let response = (*handler)(request).await.map_err(TwinError::command_failed)?;
                let payload = response.to_bytes()?;
                Ok(DispatchReply {
                    schema_id: Resp::SCHEMA_ID,
                    payload,
                })
            })
        });

        let mut handlers = self.handlers.write().await;
        handlers.insert((component.into(), name.into()), boxed);
    }

    /// Dispatch one command to its handler.
    ///
    /// A command with no registered handler fails with
    /// [`TwinError::UnknownCommand`] and invokes nothing. A handler
    /// failure surfaces as [`TwinError::CommandFailed`] carrying the
    /// original cause; an undecodable payload as [`TwinError::Parse`].
    pub async fn dispatch(
        &self,
        component: &str,
        name: &str,
        payload: Bytes,
    ) -> Result<DispatchReply, TwinError> {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers
                .get(&(component.to_string(), name.to_string()))
                .cloned()
        };

        let handler = handler.ok_or_else(|| TwinError::UnknownCommand {
            component: component.to_string(),
            name: name.to_string(),
        })?;

        debug!(component, name, "dispatching command");
        (*handler)(payload).await
    }

    pub async fn is_registered(&self, component: &str, name: &str) -> bool {
        self.handlers
            .read()
            .await
            .contains_key(&(component.to_string(), name.to_string()))
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use twinlink_shared::schema::{RebootRequest, RebootResponse};

    #[tokio::test]
    async fn test_unknown_command_invokes_no_handler() {
        let dispatcher = CommandDispatcher::new();
        let invoked = Arc::new(AtomicBool::new(false));

        let flag = invoked.clone();
        dispatcher
            .register::<RebootRequest, RebootResponse, _, _>("thermostat", "reboot", move |_| {
                let flag = flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(RebootResponse {
                        status: "ok".to_string(),
                    })
                }
            })
            .await;

        let err = dispatcher
            .dispatch("thermostat", "selfDestruct", Bytes::new())
            .await
            .unwrap_err();

        match err {
            TwinError::UnknownCommand { component, name } => {
                assert_eq!(component, "thermostat");
                assert_eq!(name, "selfDestruct");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_typed_roundtrip_through_dispatch() {
        let dispatcher = CommandDispatcher::new();
        dispatcher
            .register::<RebootRequest, RebootResponse, _, _>(
                "thermostat",
                "reboot",
                |request: RebootRequest| async move {
                    Ok(RebootResponse {
                        status: format!("scheduled at {}", request.when_to_reboot_ms),
                    })
                },
            )
            .await;

        let payload = RebootRequest {
            when_to_reboot_ms: 12345,
        }
        .to_bytes()
        .unwrap();

        let reply = dispatcher
            .dispatch("thermostat", "reboot", payload)
            .await
            .unwrap();

        assert_eq!(reply.schema_id, RebootResponse::SCHEMA_ID);
        let response = RebootResponse::from_bytes(&reply.payload).unwrap();
        assert_eq!(response.status, "scheduled at 12345");
    }

    #[tokio::test]
    async fn test_handler_failure_keeps_original_cause() {
        let dispatcher = CommandDispatcher::new();
        dispatcher
            .register::<RebootRequest, RebootResponse, _, _>("thermostat", "reboot", |_| async {
                Err(anyhow::anyhow!("power supply locked"))
            })
            .await;

        let payload = RebootRequest { when_to_reboot_ms: 0 }.to_bytes().unwrap();
        let err = dispatcher
            .dispatch("thermostat", "reboot", payload)
            .await
            .unwrap_err();

        match &err {
            TwinError::CommandFailed { message, source } => {
                assert!(message.contains("power supply locked"));
                assert!(source.is_some(), "local failures keep their cause");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_payload_never_reaches_handler() {
        let dispatcher = CommandDispatcher::new();
        let invoked = Arc::new(AtomicBool::new(false));

        let flag = invoked.clone();
        dispatcher
            .register::<RebootRequest, RebootResponse, _, _>("thermostat", "reboot", move |_| {
                let flag = flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(RebootResponse {
                        status: "ok".to_string(),
                    })
                }
            })
            .await;

        let err = dispatcher
            .dispatch("thermostat", "reboot", Bytes::from_static(b"{broken"))
            .await
            .unwrap_err();

        assert!(matches!(err, TwinError::Parse(_)));
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_reregistration_replaces_handler() {
        let dispatcher = CommandDispatcher::new();

        dispatcher
            .register::<RebootRequest, RebootResponse, _, _>("thermostat", "reboot", |_| async {
                Ok(RebootResponse {
                    status: "first".to_string(),
                })
            })
            .await;
        dispatcher
            .register::<RebootRequest, RebootResponse, _, _>("thermostat", "reboot", |_| async {
                Ok(RebootResponse {
                    status: "second".to_string(),
                })
            })
            .await;

        assert_eq!(dispatcher.handler_count().await, 1);

        let payload = RebootRequest { when_to_reboot_ms: 0 }.to_bytes().unwrap();
        let reply = dispatcher
            .dispatch("thermostat", "reboot", payload)
            .await
            .unwrap();
        let response = RebootResponse::from_bytes(&reply.payload).unwrap();
        assert_eq!(response.status, "second");
    }
}
