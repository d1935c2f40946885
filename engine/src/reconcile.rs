//! Writable property reconciliation
//!
//! A desired write from the hub is a proposal, not a command: the device
//! validates it against its bounds, compares it to the current target, and
//! only then actuates. The acknowledgement always carries the value the
//! device actually holds afterwards, so a rejected proposal echoes the
//! last-known value rather than the refused one.

use crate::error::TwinError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Tolerance used when deciding whether a proposal matches the current
/// target; direct float equality is too strict after JSON roundtrips
const DEFAULT_TOLERANCE: f64 = 0.05;

/// Inclusive validation range for a numeric setpoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    min: f64,
    max: f64,
}

impl Bounds {
    /// Create bounds, refusing inverted or non-finite ranges
    pub fn new(min: f64, max: f64) -> Result<Self, TwinError> {
        if !min.is_finite() || !max.is_finite() || min >= max {
            return Err(TwinError::InvalidBounds { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Check one value against the range
    pub fn validate(&self, value: f64) -> Result<(), TwinError> {
        if self.contains(value) {
            Ok(())
        } else {
            Err(TwinError::OutOfRange {
                value,
                min: self.min,
                max: self.max,
            })
        }
    }
}

/// One desired property write to evaluate
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub component: String,
    pub name: String,
    pub value: serde_json::Value,
    pub version: u64,
}

/// Outcome of reconciling one write
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// The proposal was applied; carries the newly accepted value
    Accepted { value: f64, message: String },
    /// The proposal was refused; carries the device's last-known value
    Rejected { value: f64, message: String },
    /// The proposal matched the current target; nothing was actuated
    Unchanged { value: f64, message: String },
}

impl AckOutcome {
    pub fn value(&self) -> f64 {
        match self {
            Self::Accepted { value, .. }
            | Self::Rejected { value, .. }
            | Self::Unchanged { value, .. } => *value,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Accepted { message, .. }
            | Self::Rejected { message, .. }
            | Self::Unchanged { message, .. } => message,
        }
    }
}

/// Acknowledgement for one write: the outcome plus the echoed version
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileAck {
    pub version: u64,
    pub outcome: AckOutcome,
}

/// Actuation side of an accepted setpoint change
#[async_trait]
pub trait SetpointSink: Send + Sync {
    async fn apply(&self, value: f64) -> anyhow::Result<()>;
}

/// Reconciles desired writes against one numeric setpoint.
///
/// The compare-then-actuate sequence is a critical section: the target
/// lock is held across the actuation call, so concurrent writes to the
/// same property serialize instead of interleaving.
pub struct SetpointReconciler {
    bounds: Bounds,
    tolerance: f64,
    target: Mutex<f64>,
    sink: Arc<dyn SetpointSink>,
}

impl SetpointReconciler {
    pub fn new(bounds: Bounds, initial_target: f64, sink: Arc<dyn SetpointSink>) -> Self {
        Self {
            bounds,
            tolerance: DEFAULT_TOLERANCE,
            target: Mutex::new(initial_target),
            sink,
        }
    }

    /// Override the tolerance used to detect no-op writes
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// The current target setting
    pub async fn target(&self) -> f64 {
        *self.target.lock().await
    }

    /// Evaluate one write and produce its acknowledgement.
    ///
    /// Never fails: unparseable values and actuation errors are folded
    /// into a `Rejected` outcome so faults stop at this boundary. The
    /// returned ack always echoes the request's version.
    pub async fn reconcile(&self, request: &WriteRequest) -> ReconcileAck {
        let mut target = self.target.lock().await;
        let outcome = self.evaluate(&mut target, request).await;
        ReconcileAck {
            version: request.version,
            outcome,
        }
    }

    async fn evaluate(&self, target: &mut f64, request: &WriteRequest) -> AckOutcome {
        let current = *target;

        let proposed = match request.value.as_f64() {
            Some(value) => value,
            None => {
                warn!(
                    component = %request.component,
                    name = %request.name,
                    "write payload is not numeric"
                );
                return AckOutcome::Rejected {
                    value: current,
                    message: "proposed value is not numeric".to_string(),
                };
            }
        };

        if let Err(e) = self.bounds.validate(proposed) {
            debug!(%e, "write refused");
            return AckOutcome::Rejected {
                value: current,
                message: e.to_string(),
            };
        }

        if (proposed - current).abs() <= self.tolerance {
            return AckOutcome::Unchanged {
                value: current,
                message: format!("already at {}", current),
            };
        }

        if let Err(e) = self.sink.apply(proposed).await {
            warn!(proposed, "setpoint actuation failed: {:#}", e);
            return AckOutcome::Rejected {
                value: current,
                message: format!("actuation failed: {}", e),
            };
        }

        *target = proposed;
        AckOutcome::Accepted {
            value: proposed,
            message: format!("setpoint updated to {}", proposed),
        }
    }
}

/// A handler for writes to one writable property
#[async_trait]
pub trait PropertyHandler: Send + Sync {
    async fn handle_write(&self, request: &WriteRequest) -> ReconcileAck;
}

#[async_trait]
impl PropertyHandler for SetpointReconciler {
    async fn handle_write(&self, request: &WriteRequest) -> ReconcileAck {
        self.reconcile(request).await
    }
}

/// Routes property writes to the handler registered for (component, name)
#[derive(Default)]
pub struct PropertyRouter {
    handlers: HashMap<(String, String), Arc<dyn PropertyHandler>>,
}

impl PropertyRouter {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler; registering the same property again replaces
    /// the previous handler
    pub fn register(
        &mut self,
        component: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn PropertyHandler>,
    ) {
        self.handlers
            .insert((component.into(), name.into()), handler);
    }

    /// Route one write; `None` when no handler owns the property
    pub async fn route(&self, request: &WriteRequest) -> Option<ReconcileAck> {
        let key = (request.component.clone(), request.name.clone());
        let handler = self.handlers.get(&key)?;
        Some(handler.handle_write(request).await)
    }

    pub fn is_registered(&self, component: &str, name: &str) -> bool {
        self.handlers
            .contains_key(&(component.to_string(), name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct RecordingSink {
        applied: std::sync::Mutex<Vec<f64>>,
        fail: bool,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                applied: std::sync::Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                applied: std::sync::Mutex::new(Vec::new()),
                fail: true,
            })
        }

        fn applied(&self) -> Vec<f64> {
            self.applied.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SetpointSink for RecordingSink {
        async fn apply(&self, value: f64) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("sink offline");
            }
            self.applied.lock().unwrap().push(value);
            Ok(())
        }
    }

    fn thermostat_reconciler(sink: Arc<RecordingSink>) -> SetpointReconciler {
        SetpointReconciler::new(Bounds::new(-15.0, 33.5).unwrap(), 22.0, sink)
    }

    fn write(value: serde_json::Value, version: u64) -> WriteRequest {
        WriteRequest {
            component: "thermostat".to_string(),
            name: "targetTemperature".to_string(),
            value,
            version,
        }
    }

    #[tokio::test]
    async fn test_out_of_range_rejected_with_current_value() {
        let sink = RecordingSink::new();
        let reconciler = thermostat_reconciler(sink.clone());

        let ack = reconciler.reconcile(&write(json!(40.0), 5)).await;

        assert_eq!(ack.version, 5);
        match ack.outcome {
            AckOutcome::Rejected { value, message } => {
                assert_eq!(value, 22.0, "rejection must echo the current value");
                assert!(message.contains("out of range"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(sink.applied().is_empty(), "rejected write must not actuate");
        assert_eq!(reconciler.target().await, 22.0);
    }

    #[tokio::test]
    async fn test_below_range_rejected() {
        let sink = RecordingSink::new();
        let reconciler = thermostat_reconciler(sink.clone());

        let ack = reconciler.reconcile(&write(json!(-20.0), 1)).await;
        assert!(matches!(ack.outcome, AckOutcome::Rejected { value, .. } if value == 22.0));
        assert!(sink.applied().is_empty());
    }

    #[tokio::test]
    async fn test_accepted_write_actuates_once() {
        let sink = RecordingSink::new();
        let reconciler = thermostat_reconciler(sink.clone());

        let ack = reconciler.reconcile(&write(json!(25.0), 3)).await;

        assert_eq!(ack.version, 3);
        match ack.outcome {
            AckOutcome::Accepted { value, .. } => assert_eq!(value, 25.0),
            other => panic!("expected acceptance, got {:?}", other),
        }
        assert_eq!(sink.applied(), vec![25.0], "exactly one actuation");
        assert_eq!(reconciler.target().await, 25.0);
    }

    #[tokio::test]
    async fn test_matching_value_unchanged_without_actuation() {
        let sink = RecordingSink::new();
        let reconciler = thermostat_reconciler(sink.clone());

        let ack = reconciler.reconcile(&write(json!(22.0), 2)).await;

        match ack.outcome {
            AckOutcome::Unchanged { value, .. } => assert_eq!(value, 22.0),
            other => panic!("expected unchanged, got {:?}", other),
        }
        assert!(sink.applied().is_empty());
    }

    #[tokio::test]
    async fn test_value_within_tolerance_is_unchanged() {
        let sink = RecordingSink::new();
        let reconciler = thermostat_reconciler(sink.clone());

        let ack = reconciler.reconcile(&write(json!(22.03), 2)).await;
        assert!(matches!(ack.outcome, AckOutcome::Unchanged { .. }));
        assert!(sink.applied().is_empty());
    }

    #[tokio::test]
    async fn test_custom_tolerance() {
        let sink = RecordingSink::new();
        let reconciler = thermostat_reconciler(sink.clone()).with_tolerance(0.5);

        let ack = reconciler.reconcile(&write(json!(22.4), 1)).await;
        assert!(matches!(ack.outcome, AckOutcome::Unchanged { .. }));

        let ack = reconciler.reconcile(&write(json!(23.0), 2)).await;
        assert!(matches!(ack.outcome, AckOutcome::Accepted { .. }));
    }

    #[tokio::test]
    async fn test_repeated_write_accepts_then_reports_unchanged() {
        let sink = RecordingSink::new();
        let reconciler = thermostat_reconciler(sink.clone());

        let first = reconciler.reconcile(&write(json!(25.0), 3)).await;
        assert!(matches!(first.outcome, AckOutcome::Accepted { .. }));

        let second = reconciler.reconcile(&write(json!(25.0), 4)).await;
        assert_eq!(second.version, 4);
        assert!(matches!(second.outcome, AckOutcome::Unchanged { .. }));

        assert_eq!(sink.applied(), vec![25.0], "second write must not actuate");
    }

    #[tokio::test]
    async fn test_non_numeric_value_rejected() {
        let sink = RecordingSink::new();
        let reconciler = thermostat_reconciler(sink.clone());

        let ack = reconciler.reconcile(&write(json!("warm"), 9)).await;

        assert_eq!(ack.version, 9);
        match ack.outcome {
            AckOutcome::Rejected { value, message } => {
                assert_eq!(value, 22.0);
                assert!(message.contains("not numeric"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(sink.applied().is_empty());
    }

    #[tokio::test]
    async fn test_actuation_failure_rejects_and_keeps_target() {
        let sink = RecordingSink::failing();
        let reconciler = thermostat_reconciler(sink);

        let ack = reconciler.reconcile(&write(json!(25.0), 6)).await;

        match ack.outcome {
            AckOutcome::Rejected { value, message } => {
                assert_eq!(value, 22.0);
                assert!(message.contains("actuation failed"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(reconciler.target().await, 22.0);
    }

    #[tokio::test]
    async fn test_boundary_values_accepted() {
        let sink = RecordingSink::new();
        let reconciler = thermostat_reconciler(sink.clone());

        let ack = reconciler.reconcile(&write(json!(33.5), 1)).await;
        assert!(matches!(ack.outcome, AckOutcome::Accepted { value, .. } if value == 33.5));

        let ack = reconciler.reconcile(&write(json!(-15.0), 2)).await;
        assert!(matches!(ack.outcome, AckOutcome::Accepted { value, .. } if value == -15.0));
    }

    #[test]
    fn test_invalid_bounds_refused() {
        assert!(Bounds::new(10.0, 2.0).is_err());
        assert!(Bounds::new(5.0, 5.0).is_err());
        assert!(Bounds::new(f64::NAN, 5.0).is_err());
        assert!(Bounds::new(0.0, f64::INFINITY).is_err());
        assert!(Bounds::new(-15.0, 33.5).is_ok());
    }

    #[test]
    fn test_bounds_validate() {
        let bounds = Bounds::new(-15.0, 33.5).unwrap();
        assert!(bounds.validate(22.0).is_ok());
        assert!(matches!(
            bounds.validate(40.0),
            Err(TwinError::OutOfRange { value, .. }) if value == 40.0
        ));
    }

    #[tokio::test]
    async fn test_router_finds_registered_property() {
        let sink = RecordingSink::new();
        let mut router = PropertyRouter::new();
        router.register(
            "thermostat",
            "targetTemperature",
            Arc::new(thermostat_reconciler(sink)),
        );

        assert!(router.is_registered("thermostat", "targetTemperature"));

        let ack = router.route(&write(json!(25.0), 1)).await;
        assert!(ack.is_some());

        let unknown = WriteRequest {
            component: "thermostat".to_string(),
            name: "fanSpeed".to_string(),
            value: json!(3),
            version: 2,
        };
        assert!(router.route(&unknown).await.is_none());
    }
}
